//! Command-line surface.
//!
//! Every flag also reads a `PLOW_`-prefixed environment variable, so
//! `PLOW_TIMEOUT=5s` is equivalent to `--timeout 5s`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;

use crate::config::{BodySource, RunConfig};
use crate::error::ConfigError;
use crate::utils::{format_duration, parse_duration_string};

/// A request-rate flag: either unbounded or `freq` requests per `per`.
#[derive(Debug, Clone, PartialEq)]
pub enum Rate {
    Infinity,
    PerDuration { freq: u64, per: Duration },
}

impl Rate {
    /// The limit in requests per second, `None` when unbounded.
    pub fn limit(&self) -> Option<f64> {
        match self {
            Rate::Infinity => None,
            Rate::PerDuration { freq, per } => Some(*freq as f64 / per.as_secs_f64()),
        }
    }
}

impl FromStr for Rate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || {
            format!(
                "--rate format \"{}\" doesn't match the \"freq/duration\" (i.e. 50/1s)",
                s
            )
        };

        if s == "infinity" {
            return Ok(Rate::Infinity);
        }

        let (freq_str, per_str) = match s.split_once('/') {
            Some((f, p)) => (f, p.to_string()),
            None => (s, "1s".to_string()),
        };

        let freq: u64 = freq_str.parse().map_err(|_| err())?;
        if freq == 0 {
            return Ok(Rate::Infinity);
        }

        // A bare unit means one of that unit: "10/ms" is 10 per millisecond.
        let per_str = match per_str.as_str() {
            "ns" | "us" | "µs" | "ms" | "s" | "m" | "h" => format!("1{}", per_str),
            _ => per_str,
        };
        let per = parse_duration_string(&per_str).map_err(|_| err())?;
        if per.is_zero() {
            return Err(err());
        }

        Ok(Rate::PerDuration { freq, per })
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rate::Infinity => write!(f, "infinity"),
            Rate::PerDuration { freq, per } => {
                write!(f, "{}/{}", freq, format_duration(*per))
            }
        }
    }
}

fn parse_rate(s: &str) -> Result<Rate, String> {
    s.parse()
}

/// A high-performance HTTP benchmarking tool with real-time web UI and
/// terminal displaying.
#[derive(Parser, Debug)]
#[command(name = "plow", version)]
pub struct Opts {
    /// Number of connections to run concurrently
    #[arg(short = 'c', long, default_value_t = 1, env = "PLOW_CONCURRENCY")]
    pub concurrency: usize,

    /// Number of requests per time unit, examples: --rate 50 --rate 10/ms
    #[arg(long, default_value = "infinity", env = "PLOW_RATE", value_parser = parse_rate)]
    pub rate: Rate,

    /// Number of requests to run, use -1 for unbounded
    #[arg(short = 'n', long, default_value_t = -1, env = "PLOW_REQUESTS", allow_hyphen_values = true)]
    pub requests: i64,

    /// Duration of test, examples: -d 10s -d 3m
    #[arg(short = 'd', long, env = "PLOW_DURATION", value_parser = parse_duration_string, value_name = "DURATION")]
    pub duration: Option<Duration>,

    /// Print snapshot result every interval, use 0 to print once at the end
    #[arg(short = 'i', long, default_value = "200ms", env = "PLOW_INTERVAL", value_parser = parse_duration_string)]
    pub interval: Duration,

    /// Use seconds as time unit to print
    #[arg(long, env = "PLOW_SECONDS")]
    pub seconds: bool,

    /// Print snapshot result as JSON
    #[arg(long, env = "PLOW_JSON")]
    pub json: bool,

    /// HTTP request body, if start the body with @, the rest should be a filename to read
    #[arg(short = 'b', long, default_value = "", env = "PLOW_BODY")]
    pub body: String,

    /// Stream the file specified by '--body @file' using chunked encoding instead of reading it into memory
    #[arg(long, env = "PLOW_STREAM")]
    pub stream: bool,

    /// HTTP method
    #[arg(short = 'm', long, default_value = "GET", env = "PLOW_METHOD")]
    pub method: String,

    /// Custom HTTP headers
    #[arg(short = 'H', long = "header", value_name = "K:V", env = "PLOW_HEADER")]
    pub headers: Vec<String>,

    /// Host header
    #[arg(long, env = "PLOW_HOST")]
    pub host: Option<String>,

    /// Content-Type header
    #[arg(short = 'T', long = "content", env = "PLOW_CONTENT")]
    pub content: Option<String>,

    /// Path to the client's TLS Certificate
    #[arg(long, env = "PLOW_CERT")]
    pub cert: Option<PathBuf>,

    /// Path to the client's TLS Certificate Private Key
    #[arg(long, env = "PLOW_KEY")]
    pub key: Option<PathBuf>,

    /// Controls whether a client verifies the server's certificate chain and host name
    #[arg(short = 'k', long, env = "PLOW_INSECURE")]
    pub insecure: bool,

    /// Listen addr to serve the real-time charts web UI, empty to disable
    #[arg(long, default_value = ":18888", env = "PLOW_LISTEN")]
    pub listen: String,

    /// Timeout for each http request
    #[arg(long, env = "PLOW_TIMEOUT", value_parser = parse_duration_string, value_name = "DURATION")]
    pub timeout: Option<Duration>,

    /// Timeout for dial addr
    #[arg(long = "dial-timeout", env = "PLOW_DIAL_TIMEOUT", value_parser = parse_duration_string, value_name = "DURATION")]
    pub dial_timeout: Option<Duration>,

    /// Timeout for full request writing
    #[arg(long = "req-timeout", env = "PLOW_REQ_TIMEOUT", value_parser = parse_duration_string, value_name = "DURATION")]
    pub req_timeout: Option<Duration>,

    /// Timeout for full response reading
    #[arg(long = "resp-timeout", env = "PLOW_RESP_TIMEOUT", value_parser = parse_duration_string, value_name = "DURATION")]
    pub resp_timeout: Option<Duration>,

    /// Socks5 proxy
    #[arg(long, value_name = "ip:port", env = "PLOW_SOCKS5")]
    pub socks5: Option<String>,

    /// Specify whether auto open browser to show Web charts
    #[arg(long = "auto-open-browser", env = "PLOW_AUTO_OPEN_BROWSER")]
    pub auto_open_browser: bool,

    /// Clean the histogram bar once its finished. Default is true
    #[arg(long, overrides_with = "no_clean")]
    pub clean: bool,

    /// Keep the histogram bar on the final print
    #[arg(long = "no-clean", overrides_with = "clean")]
    pub no_clean: bool,

    /// Only print the summary without realtime reports
    #[arg(long, env = "PLOW_SUMMARY")]
    pub summary: bool,

    /// Request url
    #[arg(required = true)]
    pub url: String,
}

impl Opts {
    /// Effective value of the `--[no-]clean` pair.
    pub fn clean(&self) -> bool {
        !self.no_clean
    }

    /// Resolve the body flag and freeze the run configuration.
    ///
    /// `-b @path` reads the file into memory unless `--stream` keeps it on
    /// disk to be re-opened and chunked per request.
    pub fn build_run_config(&self) -> Result<RunConfig, ConfigError> {
        let body = if let Some(path) = self.body.strip_prefix('@') {
            let path = PathBuf::from(path);
            if self.stream {
                // Fail early if the file is not there at all.
                std::fs::metadata(&path).map_err(|e| ConfigError::BodyFile {
                    path: path.clone(),
                    source: e,
                })?;
                BodySource::File(path)
            } else {
                let bytes = std::fs::read(&path).map_err(|e| ConfigError::BodyFile {
                    path: path.clone(),
                    source: e,
                })?;
                BodySource::Bytes(bytes.into())
            }
        } else if !self.body.is_empty() {
            BodySource::Bytes(self.body.clone().into_bytes().into())
        } else {
            BodySource::Empty
        };

        let config = RunConfig {
            url: self.url.clone(),
            method: self.method.clone(),
            headers: self.headers.clone(),
            body,
            cert: self.cert.clone(),
            key: self.key.clone(),
            insecure: self.insecure,
            max_conns: self.concurrency,
            do_timeout: self.timeout,
            read_timeout: self.resp_timeout,
            write_timeout: self.req_timeout,
            dial_timeout: self.dial_timeout,
            socks5: self.socks5.clone(),
            content_type: self.content.clone(),
            host: self.host.clone(),
            concurrency: self.concurrency,
            requests: self.requests,
            duration: self.duration,
            rate: self.rate.limit(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Expands a bare-port listen address like ":18888" to a bindable form.
pub fn normalize_listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_bare_number_is_per_second() {
        let r: Rate = "50".parse().unwrap();
        assert_eq!(r.limit(), Some(50.0));
        assert_eq!(r.to_string(), "50/1s");
    }

    #[test]
    fn test_rate_per_unit() {
        let r: Rate = "10/ms".parse().unwrap();
        assert_eq!(r.limit(), Some(10_000.0));

        let r: Rate = "120/m".parse().unwrap();
        assert_eq!(r.limit(), Some(2.0));
    }

    #[test]
    fn test_rate_per_duration() {
        let r: Rate = "50/2s".parse().unwrap();
        assert_eq!(r.limit(), Some(25.0));
    }

    #[test]
    fn test_rate_infinity_forms() {
        assert_eq!("infinity".parse::<Rate>().unwrap(), Rate::Infinity);
        assert_eq!("0".parse::<Rate>().unwrap(), Rate::Infinity);
        assert_eq!(Rate::Infinity.limit(), None);
        assert_eq!(Rate::Infinity.to_string(), "infinity");
    }

    #[test]
    fn test_rate_rejects_malformed() {
        assert!("abc".parse::<Rate>().is_err());
        assert!("10/xyz".parse::<Rate>().is_err());
        assert!("/1s".parse::<Rate>().is_err());
        assert!("1.5/s".parse::<Rate>().is_err());
    }

    #[test]
    fn test_rate_canonical_round_trip() {
        for s in ["50", "10/ms", "50/2s", "7/500ms", "infinity"] {
            let parsed: Rate = s.parse().unwrap();
            let canonical = parsed.to_string();
            let reparsed: Rate = canonical.parse().unwrap();
            assert_eq!(parsed, reparsed, "canonical form {} reparses", canonical);
            // Canonical forms are a fixed point.
            assert_eq!(canonical, reparsed.to_string());
        }
    }

    #[test]
    fn test_normalize_listen_addr() {
        assert_eq!(normalize_listen_addr(":18888"), "0.0.0.0:18888");
        assert_eq!(normalize_listen_addr("127.0.0.1:9000"), "127.0.0.1:9000");
    }
}
