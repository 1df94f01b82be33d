//! Immutable run configuration.

use std::path::PathBuf;
use std::time::Duration;

use hyper::body::Bytes;

use crate::error::ConfigError;

/// Where each request's body comes from.
#[derive(Debug, Clone, Default)]
pub enum BodySource {
    /// No body.
    #[default]
    Empty,
    /// In-memory bytes, shared by every request.
    Bytes(Bytes),
    /// A file opened and streamed per request (chunked encoding).
    File(PathBuf),
}

/// Everything a run needs, frozen before the first request is issued.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub url: String,
    pub method: String,
    /// Raw `K:V` header entries, order and duplicates preserved.
    pub headers: Vec<String>,
    pub body: BodySource,

    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub insecure: bool,

    /// Connection cap for the shared client; equals the concurrency level.
    pub max_conns: usize,
    /// Timeout for one full issue+drain cycle; unbounded when unset.
    pub do_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub dial_timeout: Option<Duration>,

    pub socks5: Option<String>,
    pub content_type: Option<String>,
    pub host: Option<String>,

    /// Number of concurrent workers.
    pub concurrency: usize,
    /// Total requests to run; negative means unbounded.
    pub requests: i64,
    /// Wall-clock cap for the run.
    pub duration: Option<Duration>,
    /// Request rate cap in req/s; unbounded when unset.
    pub rate: Option<f64>,
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.requests >= 0 && self.requests < self.concurrency as i64 {
            return Err(ConfigError::RequestsLessThanConcurrency);
        }
        if self.cert.is_some() != self.key.is_some() {
            return Err(ConfigError::CertWithoutKey);
        }
        Ok(())
    }

    /// Capacity of the record queue between workers and the aggregator.
    pub fn record_queue_capacity(&self) -> usize {
        (self.concurrency * 100).clamp(1, 8192)
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: "GET".to_string(),
            headers: Vec::new(),
            body: BodySource::Empty,
            cert: None,
            key: None,
            insecure: false,
            max_conns: 1,
            do_timeout: None,
            read_timeout: None,
            write_timeout: None,
            dial_timeout: None,
            socks5: None,
            content_type: None,
            host: None,
            concurrency: 1,
            requests: -1,
            duration: None,
            rate: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requests_must_cover_concurrency() {
        let config = RunConfig {
            concurrency: 4,
            requests: 2,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RequestsLessThanConcurrency)
        ));
    }

    #[test]
    fn test_zero_requests_rejected_for_any_concurrency() {
        let config = RunConfig {
            concurrency: 1,
            requests: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unbounded_requests_ok() {
        let config = RunConfig {
            concurrency: 8,
            requests: -1,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cert_requires_key() {
        let config = RunConfig {
            cert: Some(PathBuf::from("client.pem")),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::CertWithoutKey)));
    }

    #[test]
    fn test_record_queue_capacity_capped() {
        let small = RunConfig {
            concurrency: 2,
            ..Default::default()
        };
        assert_eq!(small.record_queue_capacity(), 200);

        let big = RunConfig {
            concurrency: 500,
            ..Default::default()
        };
        assert_eq!(big.record_queue_capacity(), 8192);
    }
}
