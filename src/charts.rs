//! Real-time charts web UI.
//!
//! Serves one HTML page with a latency view and an RPS view, two embedded
//! JS assets, and the two JSON data endpoints the page polls once per
//! second. Data is pulled through a callback so the server knows nothing
//! about the aggregator beyond its within-second view.

use std::net::TcpListener as StdTcpListener;
use std::process::Child;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use serde::Serialize;
use tracing::{debug, error};

use crate::report::ChartsReport;

static ECHARTS_JS: &str = include_str!("../assets/echarts.min.js");
static JQUERY_JS: &str = include_str!("../assets/jquery.min.js");

const ASSETS_PATH: &str = "/echarts/statics/";
const API_PATH: &str = "/data/";
const TIME_FORMAT: &str = "%H:%M:%S";
const REFRESH_INTERVAL_MS: u64 = 1000;

const PAGE_TEMPLATE: &str = include_str!("../assets/index.html");

/// One poll response: a timestamp plus one value per chart series.
#[derive(Serialize)]
struct Metrics {
    time: String,
    values: Vec<Option<f64>>,
}

/// Callback yielding the last-second view, `None` when it had no samples.
pub type ChartsDataFn = Arc<dyn Fn() -> Option<ChartsReport> + Send + Sync>;

pub struct Charts {
    data_fn: ChartsDataFn,
    page: String,
}

impl Charts {
    pub fn new(data_fn: ChartsDataFn, desc: &str) -> Self {
        let page = PAGE_TEMPLATE
            .replace("{DESC}", desc)
            .replace("{INTERVAL}", &REFRESH_INTERVAL_MS.to_string());
        Self { data_fn, page }
    }

    /// Serve on an already-bound listener until the process exits.
    pub async fn serve(self: Arc<Self>, listener: StdTcpListener, auto_open_browser: bool) {
        if auto_open_browser {
            if let Ok(addr) = listener.local_addr() {
                let url = format!("http://{}", addr);
                tokio::task::spawn_blocking(move || {
                    if !open_browser(&url) {
                        debug!(url = %url, "no browser could be launched");
                    }
                });
            }
        }

        if let Err(e) = listener.set_nonblocking(true) {
            error!(error = %e, "charts listener setup failed");
            return;
        }
        let make_svc = make_service_fn(move |_conn| {
            let charts = self.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |req| {
                    let charts = charts.clone();
                    async move { charts.handle(req).await }
                }))
            }
        });
        match Server::from_tcp(listener) {
            Ok(builder) => {
                if let Err(e) = builder.serve(make_svc).await {
                    // The run keeps going without the charts UI.
                    error!(error = %e, "charts server error");
                }
            }
            Err(e) => error!(error = %e, "charts server failed to start"),
        }
    }

    async fn handle(&self, req: Request<Body>) -> Result<Response<Body>, hyper::Error> {
        let path = req.uri().path().to_string();

        if let Some(view) = path.strip_prefix(API_PATH) {
            let data = (self.data_fn)();
            let values: Vec<Option<f64>> = match view {
                "latency" => match &data {
                    // Nanosecond stats rendered in milliseconds.
                    Some(d) => vec![
                        Some(d.latency.min() / 1e6),
                        Some(d.latency.mean() / 1e6),
                        Some(d.latency.max() / 1e6),
                    ],
                    None => vec![None, None, None],
                },
                "rps" => match &data {
                    Some(d) => vec![Some(d.rps)],
                    None => vec![None],
                },
                _ => return Ok(not_found()),
            };
            let metrics = Metrics {
                time: Local::now().format(TIME_FORMAT).to_string(),
                values,
            };
            let body = serde_json::to_string(&metrics).unwrap_or_default();
            return Ok(Response::builder()
                .header("Content-Type", "application/json")
                .header("Access-Control-Allow-Origin", "*")
                .body(Body::from(body))
                .unwrap());
        }

        if path == "/" {
            return Ok(Response::builder()
                .header("Content-Type", "text/html")
                .body(Body::from(self.page.clone()))
                .unwrap());
        }

        if let Some(asset) = path.strip_prefix(ASSETS_PATH) {
            let content = match asset {
                "echarts.min.js" => ECHARTS_JS,
                "jquery.min.js" => JQUERY_JS,
                _ => return Ok(not_found()),
            };
            return Ok(Response::builder()
                .header("Content-Type", "application/javascript")
                .body(Body::from(content))
                .unwrap());
        }

        Ok(not_found())
    }
}

fn not_found() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::from("NotFound"))
        .unwrap()
}

/// Try to open `url` in a browser, returning whether anything launched.
pub fn open_browser(url: &str) -> bool {
    let mut candidates: Vec<Vec<String>> = Vec::new();
    if let Ok(exe) = std::env::var("BROWSER") {
        if !exe.is_empty() {
            candidates.push(vec![exe]);
        }
    }
    #[cfg(target_os = "macos")]
    candidates.push(vec!["/usr/bin/open".to_string()]);
    #[cfg(target_os = "windows")]
    candidates.push(vec![
        "cmd".to_string(),
        "/c".to_string(),
        "start".to_string(),
    ]);
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        // xdg-open is only for use in a desktop environment.
        if std::env::var("DISPLAY").map(|v| !v.is_empty()).unwrap_or(false) {
            candidates.push(vec!["xdg-open".to_string()]);
        }
    }
    for browser in ["chrome", "google-chrome", "chromium", "firefox"] {
        candidates.push(vec![browser.to_string()]);
    }

    for args in candidates {
        let mut cmd = std::process::Command::new(&args[0]);
        cmd.args(&args[1..]).arg(url);
        if let Ok(mut child) = cmd.spawn() {
            if appears_successful(&mut child, Duration::from_secs(3)) {
                return true;
            }
        }
    }
    false
}

// A launcher that is still running after the timeout, or that exited
// cleanly within it, is considered to have worked.
fn appears_successful(child: &mut Child, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return status.success(),
            Ok(None) => {
                if Instant::now() >= deadline {
                    return true;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(_) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Stats;

    fn charts_with(data: Option<ChartsReport>) -> Arc<Charts> {
        let data_fn: ChartsDataFn = Arc::new(move || data);
        Arc::new(Charts::new(data_fn, "Benchmarking http://test/"))
    }

    async fn get(charts: &Charts, path: &str) -> (StatusCode, String) {
        let req = Request::builder()
            .uri(format!("http://chart{}", path))
            .body(Body::empty())
            .unwrap();
        let resp = charts.handle(req).await.unwrap();
        let status = resp.status();
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        (status, String::from_utf8_lossy(&bytes).to_string())
    }

    #[tokio::test]
    async fn test_page_and_assets_served() {
        let charts = charts_with(None);
        let (status, body) = get(&charts, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("Benchmarking http://test/"));
        assert!(body.contains("/data/latency"));

        for asset in ["echarts.min.js", "jquery.min.js"] {
            let (status, body) = get(&charts, &format!("/echarts/statics/{}", asset)).await;
            assert_eq!(status, StatusCode::OK);
            assert!(!body.is_empty());
        }
    }

    #[tokio::test]
    async fn test_latency_data_in_milliseconds() {
        let mut latency = Stats::new();
        latency.update(2_000_000.0);
        latency.update(4_000_000.0);
        let charts = charts_with(Some(ChartsReport { rps: 42.5, latency }));

        let (status, body) = get(&charts, "/data/latency").await;
        assert_eq!(status, StatusCode::OK);
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["values"][0], 2.0);
        assert_eq!(parsed["values"][1], 3.0);
        assert_eq!(parsed["values"][2], 4.0);

        let (_, body) = get(&charts, "/data/rps").await;
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["values"][0], 42.5);
    }

    #[tokio::test]
    async fn test_idle_second_returns_nulls() {
        let charts = charts_with(None);
        let (_, body) = get(&charts, "/data/latency").await;
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["values"], serde_json::json!([null, null, null]));
    }

    #[tokio::test]
    async fn test_unknown_paths_are_404() {
        let charts = charts_with(None);
        for path in ["/nope", "/data/unknown", "/echarts/statics/other.js"] {
            let (status, _) = get(&charts, path).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "path {}", path);
        }
    }
}
