use std::process;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use plow::charts::{Charts, ChartsDataFn};
use plow::cli::{normalize_listen_addr, Opts};
use plow::error::ConfigError;
use plow::printer::Printer;
use plow::record::RecordPool;
use plow::report::StreamReport;
use plow::requester::Requester;
use plow::utils::format_duration;

#[tokio::main]
async fn main() {
    // Diagnostics go to stderr so stdout stays clean for reports.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let opts = Opts::parse();
    if let Err(e) = run(opts).await {
        eprintln!("plow: {}", e);
        process::exit(1);
    }
}

async fn run(opts: Opts) -> Result<(), ConfigError> {
    let config = opts.build_run_config()?;

    let pool = Arc::new(RecordPool::new(config.record_queue_capacity()));
    let (requester, records) = Requester::new(config.clone(), pool.clone())?;

    let mut desc = format!("Benchmarking {}", config.url);
    if config.requests > 0 {
        desc.push_str(&format!(" with {} request(s)", config.requests));
    }
    if let Some(duration) = config.duration {
        desc.push_str(&format!(" for {}", format_duration(duration)));
    }
    desc.push_str(&format!(" using {} connection(s).", config.concurrency));
    eprintln!("{}", desc);

    let listener = if opts.listen.is_empty() {
        None
    } else {
        let addr = normalize_listen_addr(&opts.listen);
        let listener = std::net::TcpListener::bind(&addr).map_err(|e| ConfigError::Bind {
            addr: addr.clone(),
            source: e,
        })?;
        if let Ok(local) = listener.local_addr() {
            eprintln!("@ Real-time charts is listening on http://{}", local);
        }
        Some(listener)
    };
    eprintln!();

    let report = Arc::new(StreamReport::new(Instant::now()));
    let done = report.done_token();

    tokio::spawn(requester.run());
    let collector = tokio::spawn(report.clone().collect(records, pool));

    if let Some(listener) = listener {
        let charts_report = report.clone();
        let data_fn: ChartsDataFn = Arc::new(move || charts_report.charts());
        let charts = Arc::new(Charts::new(data_fn, &desc));
        tokio::spawn(charts.serve(listener, opts.auto_open_browser));
    }

    let mut printer = Printer::new(
        config.requests,
        config.duration,
        !opts.clean(),
        opts.summary,
        opts.seconds,
        opts.json,
    );
    let snapshot_report = report.clone();
    printer
        .print_loop(move || snapshot_report.snapshot(), opts.interval, done)
        .await;

    let _ = collector.await;
    Ok(())
}
