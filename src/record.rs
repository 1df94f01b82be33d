//! Completed-request records and their free-list.
//!
//! A `Record` is filled by exactly one worker, handed to the aggregator
//! through the bounded queue, and recycled through the pool once consumed.
//! Recycling keeps the string allocations alive across iterations, so the
//! steady-state cost of a record is a pop and a push.

use std::sync::Mutex;
use std::time::Duration;

/// Outcome of one completed request attempt.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Record {
    /// Time spent on this request, 0 for failures that happen before send.
    pub elapsed: Duration,
    /// Status class, `"1xx"`..`"5xx"`; empty on transport error.
    pub code: String,
    /// Error message; empty on success.
    pub error: String,
    /// Cumulative connection bytes read, sampled at completion.
    pub read_bytes: i64,
    /// Cumulative connection bytes written, sampled at completion.
    pub write_bytes: i64,
}

impl Record {
    /// Mark this record as a success with the given status class.
    pub fn set_success(&mut self, elapsed: Duration, code: &str) {
        self.elapsed = elapsed;
        self.code.clear();
        self.code.push_str(code);
        self.error.clear();
    }

    /// Mark this record as a failure with the given message.
    pub fn set_error(&mut self, elapsed: Duration, error: &str) {
        self.elapsed = elapsed;
        self.code.clear();
        self.error.clear();
        self.error.push_str(error);
    }
}

/// Thread-safe free-list of records.
///
/// Capacity-bounded so a burst cannot pin memory forever; overflowing
/// records are simply dropped.
#[derive(Debug)]
pub struct RecordPool {
    free: Mutex<Vec<Record>>,
    cap: usize,
}

impl RecordPool {
    pub fn new(cap: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(cap.min(1024))),
            cap,
        }
    }

    /// Take a record, reusing a recycled one when available.
    pub fn get(&self) -> Record {
        self.free.lock().unwrap().pop().unwrap_or_default()
    }

    /// Return a consumed record to the free-list.
    pub fn put(&self, record: Record) {
        let mut free = self.free.lock().unwrap();
        if free.len() < self.cap {
            free.push(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_clears_error() {
        let mut r = Record::default();
        r.set_error(Duration::from_millis(5), "connection refused");
        r.set_success(Duration::from_millis(3), "2xx");

        assert_eq!(r.code, "2xx");
        assert_eq!(r.error, "");
        assert_eq!(r.elapsed, Duration::from_millis(3));
    }

    #[test]
    fn test_error_clears_code() {
        let mut r = Record::default();
        r.set_success(Duration::from_millis(3), "2xx");
        r.set_error(Duration::ZERO, "no such file");

        assert_eq!(r.code, "");
        assert_eq!(r.error, "no such file");
        assert_eq!(r.elapsed, Duration::ZERO);
    }

    #[test]
    fn test_pool_recycles() {
        let pool = RecordPool::new(4);
        let mut r = pool.get();
        r.set_success(Duration::from_millis(1), "2xx");
        pool.put(r);

        let r2 = pool.get();
        // Pooled records come back as-is; the worker overwrites every field.
        assert_eq!(r2.code, "2xx");
        assert!(pool.free.lock().unwrap().is_empty());
    }

    #[test]
    fn test_pool_bounded() {
        let pool = RecordPool::new(2);
        for _ in 0..5 {
            pool.put(Record::default());
        }
        assert_eq!(pool.free.lock().unwrap().len(), 2);
    }
}
