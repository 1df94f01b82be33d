//! Streaming aggregation of completed requests.
//!
//! A single consumer drains the record queue and feeds every latency
//! sample into the quantile sketch, the histogram and the running stats,
//! all under one mutex. A one-second ticker derives the rolling RPS view
//! that the chart server reads. Two read paths exist: `snapshot` deep
//! copies everything for the printer, `charts` copies the within-second
//! view.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::histogram::StreamingHistogram;
use crate::quantile::QuantileStream;
use crate::record::{Record, RecordPool};
use crate::stats::Stats;

/// The quantiles reported by every snapshot, ascending.
pub const QUANTILES: [f64; 7] = [0.50, 0.75, 0.90, 0.95, 0.99, 0.999, 0.9999];

// Allowed rank error per reported quantile.
const QUANTILE_TARGETS: [(f64, f64); 7] = [
    (0.50, 0.01),
    (0.75, 0.01),
    (0.90, 0.001),
    (0.95, 0.001),
    (0.99, 0.001),
    (0.999, 0.0001),
    (0.9999, 0.00001),
];

const HISTOGRAM_BINS: usize = 8;

struct ReportState {
    latency_stats: Stats,
    rps_stats: Stats,
    latency_quantile: QuantileStream,
    latency_histogram: StreamingHistogram,
    codes: HashMap<String, u64>,
    errors: HashMap<String, u64>,

    // Rolling one-second view. The temp accumulator collects samples for
    // the second in progress; on each tick it becomes the published view.
    latency_within_sec: Stats,
    latency_within_sec_temp: Stats,
    rps_within_sec: f64,
    no_data_within_sec: bool,

    read_bytes: i64,
    write_bytes: i64,
}

/// Aggregator over the record queue.
pub struct StreamReport {
    start: Instant,
    state: Mutex<ReportState>,
    done: CancellationToken,
}

/// Latency extremes in wall-clock units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySummary {
    pub min: Duration,
    pub mean: Duration,
    pub stddev: Duration,
    pub max: Duration,
}

/// RPS extremes, present once at least one per-second sample exists.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RpsSummary {
    pub min: f64,
    pub mean: f64,
    pub stddev: f64,
    pub max: f64,
}

/// Deep copy of the aggregator state for the printer.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotReport {
    pub elapsed: Duration,
    pub count: u64,
    pub codes: HashMap<String, u64>,
    pub errors: HashMap<String, u64>,
    /// Overall requests per second since the run started.
    pub rps: f64,
    /// MB/s read from the wire since the run started.
    pub read_throughput: f64,
    /// MB/s written to the wire since the run started.
    pub write_throughput: f64,
    pub latency: LatencySummary,
    pub rps_stats: Option<RpsSummary>,
    /// `(quantile, latency)` pairs for [`QUANTILES`], in order.
    pub percentiles: Vec<(f64, Duration)>,
    /// `(bin mean, bin count)` pairs in ascending mean order.
    pub histogram: Vec<(Duration, u64)>,
}

/// The within-second view consumed by the chart server.
#[derive(Debug, Clone, Copy)]
pub struct ChartsReport {
    pub rps: f64,
    /// Latency stats for the last whole second, in nanoseconds.
    pub latency: Stats,
}

impl StreamReport {
    pub fn new(start: Instant) -> Self {
        Self {
            start,
            state: Mutex::new(ReportState {
                latency_stats: Stats::new(),
                rps_stats: Stats::new(),
                latency_quantile: QuantileStream::targeted(&QUANTILE_TARGETS),
                latency_histogram: StreamingHistogram::new(HISTOGRAM_BINS),
                codes: HashMap::new(),
                errors: HashMap::new(),
                latency_within_sec: Stats::new(),
                latency_within_sec_temp: Stats::new(),
                rps_within_sec: 0.0,
                no_data_within_sec: false,
                read_bytes: 0,
                write_bytes: 0,
            }),
            done: CancellationToken::new(),
        }
    }

    /// Cancelled once the record queue has been fully drained.
    pub fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Consume the record queue until it closes.
    pub async fn collect(self: Arc<Self>, mut records: mpsc::Receiver<Record>, pool: Arc<RecordPool>) {
        let ticker_report = self.clone();
        let ticker = tokio::spawn(async move { ticker_report.run_ticker().await });

        while let Some(record) = records.recv().await {
            {
                let mut state = self.state.lock().unwrap();
                let cost = record.elapsed.as_nanos() as f64;
                state.latency_within_sec_temp.update(cost);
                state.latency_quantile.insert(cost);
                state.latency_histogram.insert(cost);
                state.latency_stats.update(cost);
                if !record.code.is_empty() {
                    *state.codes.entry(record.code.clone()).or_insert(0) += 1;
                }
                if !record.error.is_empty() {
                    *state.errors.entry(record.error.clone()).or_insert(0) += 1;
                }
                state.read_bytes = record.read_bytes;
                state.write_bytes = record.write_bytes;
            }
            pool.put(record);
        }

        debug!("record queue closed, aggregator shutting down");
        self.done.cancel();
        let _ = ticker.await;
    }

    async fn run_ticker(&self) {
        let mut last_count = 0u64;
        let mut last_time = Instant::now();
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + Duration::from_secs(1),
            Duration::from_secs(1),
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let mut state = self.state.lock().unwrap();
                    let delta = state.latency_stats.count() - last_count;
                    if delta > 0 {
                        let rps = delta as f64 / last_time.elapsed().as_secs_f64();
                        state.rps_stats.update(rps);
                        last_count = state.latency_stats.count();
                        last_time = Instant::now();

                        state.latency_within_sec = state.latency_within_sec_temp;
                        state.rps_within_sec = rps;
                        state.latency_within_sec_temp.reset();
                        state.no_data_within_sec = false;
                    } else {
                        // An idle second: skip the RPS sample so idle ticks
                        // don't drag the mean down, and flag the charts view.
                        state.no_data_within_sec = true;
                    }
                }
                _ = self.done.cancelled() => return,
            }
        }
    }

    /// Deep-copy the current state.
    pub fn snapshot(&self) -> SnapshotReport {
        let mut state = self.state.lock().unwrap();

        let elapsed = self.start.elapsed();
        let elapsed_secs = elapsed.as_secs_f64();
        let count = state.latency_stats.count();

        let latency = LatencySummary {
            min: Duration::from_nanos(state.latency_stats.min() as u64),
            mean: Duration::from_nanos(state.latency_stats.mean() as u64),
            stddev: Duration::from_nanos(state.latency_stats.stddev() as u64),
            max: Duration::from_nanos(state.latency_stats.max() as u64),
        };
        let rps_stats = if state.rps_stats.count() > 0 {
            Some(RpsSummary {
                min: state.rps_stats.min(),
                mean: state.rps_stats.mean(),
                stddev: state.rps_stats.stddev(),
                max: state.rps_stats.max(),
            })
        } else {
            None
        };

        let percentiles = QUANTILES
            .iter()
            .map(|&q| {
                let v = state.latency_quantile.query(q).max(0.0);
                (q, Duration::from_nanos(v as u64))
            })
            .collect();
        let histogram = state
            .latency_histogram
            .bins()
            .iter()
            .map(|bin| (Duration::from_nanos(bin.mean().max(0.0) as u64), bin.count()))
            .collect();

        SnapshotReport {
            elapsed,
            count,
            codes: state.codes.clone(),
            errors: state.errors.clone(),
            rps: if elapsed_secs > 0.0 {
                count as f64 / elapsed_secs
            } else {
                0.0
            },
            read_throughput: if elapsed_secs > 0.0 {
                state.read_bytes as f64 / 1024.0 / 1024.0 / elapsed_secs
            } else {
                0.0
            },
            write_throughput: if elapsed_secs > 0.0 {
                state.write_bytes as f64 / 1024.0 / 1024.0 / elapsed_secs
            } else {
                0.0
            },
            latency,
            rps_stats,
            percentiles,
            histogram,
        }
    }

    /// The last whole second, `None` when it carried no samples.
    pub fn charts(&self) -> Option<ChartsReport> {
        let state = self.state.lock().unwrap();
        if state.no_data_within_sec {
            None
        } else {
            Some(ChartsReport {
                rps: state.rps_within_sec,
                latency: state.latency_within_sec,
            })
        }
    }
}
