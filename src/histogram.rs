//! Fixed-size streaming histogram with online bin merging.
//!
//! Follows the Ben-Haim/Tom-Tov sketch: each bin is a (count, sum) pair
//! whose mean is the bin center. Inserting a value either folds it into a
//! bin with an identical center or adds a fresh bin; whenever the bin count
//! exceeds the cap, the two bins with the closest centers are merged into
//! their weighted mean. Bins are kept sorted by center so reports come out
//! in ascending order for free.

/// One histogram bin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bin {
    count: u64,
    sum: f64,
}

impl Bin {
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Bin center.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }

    fn merge(&mut self, other: &Bin) {
        self.count += other.count;
        self.sum += other.sum;
    }
}

/// Streaming histogram capped at `max_bins` bins.
#[derive(Debug, Clone)]
pub struct StreamingHistogram {
    bins: Vec<Bin>,
    max_bins: usize,
    total: u64,
}

impl StreamingHistogram {
    pub fn new(max_bins: usize) -> Self {
        Self {
            bins: Vec::with_capacity(max_bins + 1),
            max_bins,
            total: 0,
        }
    }

    /// Insert one observation.
    pub fn insert(&mut self, v: f64) {
        self.total += 1;
        let bin = Bin { count: 1, sum: v };
        let i = self.bins.partition_point(|b| b.mean() < v);
        if i < self.bins.len() && self.bins[i].mean() == v {
            self.bins[i].merge(&bin);
        } else {
            self.bins.insert(i, bin);
        }
        self.trim();
    }

    /// Bins in ascending center order.
    pub fn bins(&self) -> &[Bin] {
        &self.bins
    }

    /// Total number of observations inserted.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn reset(&mut self) {
        self.bins.clear();
        self.total = 0;
    }

    fn trim(&mut self) {
        while self.bins.len() > self.max_bins {
            let mut min_delta = f64::MAX;
            let mut min_i = 1;
            for j in 1..self.bins.len() {
                let delta = self.bins[j].mean() - self.bins[j - 1].mean();
                if j == 1 || delta < min_delta {
                    min_delta = delta;
                    min_i = j;
                }
            }
            let merged = self.bins.remove(min_i);
            self.bins[min_i - 1].merge(&merged);
        }
    }
}
