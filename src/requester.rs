//! Worker pool and run termination.
//!
//! `Requester::run` spawns one task per unit of concurrency, all sharing
//! the connection-pooled client and one bounded record queue. A single
//! cancellation token is armed by any of: SIGINT/SIGTERM, the duration
//! timer, or exhaustion of the request counter. Cancellation is
//! cooperative; requests already in flight run to completion and their
//! records are still delivered.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::Body;
use tokio::sync::mpsc;
use tokio_util::codec::{BytesCodec, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::client::{build_client, LoadClient};
use crate::config::{BodySource, RunConfig};
use crate::error::ConfigError;
use crate::limiter::RateLimiter;
use crate::record::{Record, RecordPool};

/// Drives the configured request load and emits a `Record` per attempt.
pub struct Requester {
    config: Arc<RunConfig>,
    client: Arc<LoadClient>,
    cancel: CancellationToken,
    pool: Arc<RecordPool>,
    tx: mpsc::Sender<Record>,
    read_bytes: Arc<AtomicI64>,
    write_bytes: Arc<AtomicI64>,
}

impl Requester {
    /// Build the client and the record queue for a run.
    ///
    /// The returned receiver is the aggregator's end of the queue.
    pub fn new(
        config: RunConfig,
        pool: Arc<RecordPool>,
    ) -> Result<(Self, mpsc::Receiver<Record>), ConfigError> {
        config.validate()?;

        let read_bytes = Arc::new(AtomicI64::new(0));
        let write_bytes = Arc::new(AtomicI64::new(0));
        let client = Arc::new(build_client(
            &config,
            read_bytes.clone(),
            write_bytes.clone(),
        )?);
        let (tx, rx) = mpsc::channel(config.record_queue_capacity());

        Ok((
            Self {
                config: Arc::new(config),
                client,
                cancel: CancellationToken::new(),
                pool,
                tx,
                read_bytes,
                write_bytes,
            },
            rx,
        ))
    }

    /// The shared termination context for this run.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the worker pool to completion.
    ///
    /// Returns once every worker has exited; dropping the last queue
    /// sender is what lets the aggregator finish draining and shut down.
    pub async fn run(self) {
        let Requester {
            config,
            client,
            cancel,
            pool,
            tx,
            read_bytes,
            write_bytes,
        } = self;

        spawn_signal_handler(cancel.clone());

        if let Some(duration) = config.duration {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => cancel.cancel(),
                    _ = cancel.cancelled() => {}
                }
            });
        }

        let semaphore = Arc::new(AtomicI64::new(config.requests.max(0)));
        let limiter = config.rate.map(|rate| Arc::new(RateLimiter::new(rate)));

        let mut workers = Vec::with_capacity(config.concurrency);
        for id in 0..config.concurrency {
            let ctx = WorkerContext {
                id,
                config: config.clone(),
                client: client.clone(),
                cancel: cancel.clone(),
                pool: pool.clone(),
                tx: tx.clone(),
                semaphore: semaphore.clone(),
                limiter: limiter.clone(),
                read_bytes: read_bytes.clone(),
                write_bytes: write_bytes.clone(),
            };
            workers.push(tokio::spawn(run_worker(ctx)));
        }
        drop(tx);

        for worker in workers {
            if let Err(e) = worker.await {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
            }
        }
        debug!("all workers joined");
    }
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => cancel.cancel(),
                _ = term.recv() => cancel.cancel(),
                _ = cancel.cancelled() => {}
            }
        }
        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => cancel.cancel(),
                _ = cancel.cancelled() => {}
            }
        }
    });
}

struct WorkerContext {
    id: usize,
    config: Arc<RunConfig>,
    client: Arc<LoadClient>,
    cancel: CancellationToken,
    pool: Arc<RecordPool>,
    tx: mpsc::Sender<Record>,
    semaphore: Arc<AtomicI64>,
    limiter: Option<Arc<RateLimiter>>,
    read_bytes: Arc<AtomicI64>,
    write_bytes: Arc<AtomicI64>,
}

async fn run_worker(ctx: WorkerContext) {
    debug!(worker = ctx.id, "worker starting");
    let bounded = ctx.config.requests > 0;

    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }

        if let Some(limiter) = &ctx.limiter {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                _ = limiter.acquire() => {}
            }
        }

        // Claim one unit of the request budget; a negative result means the
        // budget was already spent and the run is complete.
        if bounded && ctx.semaphore.fetch_sub(1, Ordering::AcqRel) <= 0 {
            ctx.cancel.cancel();
            break;
        }

        let mut record = ctx.pool.get();

        let body = match &ctx.config.body {
            BodySource::Empty => Body::empty(),
            BodySource::Bytes(bytes) => Body::from(bytes.clone()),
            BodySource::File(path) => match tokio::fs::File::open(path).await {
                Ok(file) => Body::wrap_stream(FramedRead::new(file, BytesCodec::new())),
                Err(e) => {
                    record.set_error(Duration::ZERO, &e.to_string());
                    record.read_bytes = ctx.read_bytes.load(Ordering::Relaxed);
                    record.write_bytes = ctx.write_bytes.load(Ordering::Relaxed);
                    if ctx.tx.send(record).await.is_err() {
                        break;
                    }
                    continue;
                }
            },
        };

        let req = ctx.client.request(body);
        let started = Instant::now();
        let result = ctx.client.issue(req).await;
        let elapsed = started.elapsed();

        match result {
            Ok(code) => record.set_success(elapsed, code),
            Err(error) => {
                debug!(worker = ctx.id, error = %error, "request failed");
                record.set_error(elapsed, &error);
            }
        }
        record.read_bytes = ctx.read_bytes.load(Ordering::Relaxed);
        record.write_bytes = ctx.write_bytes.load(Ordering::Relaxed);

        // A closed queue only happens at shutdown; exit quietly.
        if ctx.tx.send(record).await.is_err() {
            break;
        }
    }

    debug!(worker = ctx.id, "worker exiting");
}
