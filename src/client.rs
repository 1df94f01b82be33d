//! HTTP client provisioning and request issuing.
//!
//! One connection-pooled client is built per run, bound to the single
//! target host, with the byte-counting dialer installed underneath. The
//! header template is assembled once at startup; workers stamp it onto a
//! fresh request every iteration.

use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::HttpBody;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, HOST};
use hyper::{Body, Method, Request, Uri};
use url::Url;

use crate::config::RunConfig;
use crate::error::ConfigError;
use crate::transport::Dialer;

/// The shared, connection-reusing client plus the per-request template.
pub struct LoadClient {
    client: hyper::Client<Dialer, Body>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    do_timeout: Option<Duration>,
}

/// Classify a status code by its hundreds digit.
///
/// Codes outside 100..=599 have no class; callers record them as errors.
pub fn status_class(status: u16) -> Option<&'static str> {
    match status / 100 {
        1 => Some("1xx"),
        2 => Some("2xx"),
        3 => Some("3xx"),
        4 => Some("4xx"),
        5 => Some("5xx"),
        _ => None,
    }
}

/// Build the shared client and header template from the run configuration.
pub fn build_client(
    config: &RunConfig,
    read_bytes: Arc<AtomicI64>,
    write_bytes: Arc<AtomicI64>,
) -> Result<LoadClient, ConfigError> {
    let url = Url::parse(&config.url).map_err(|e| ConfigError::InvalidUrl(e.to_string()))?;
    let is_tls = match url.scheme() {
        "http" => false,
        "https" => true,
        other => {
            return Err(ConfigError::InvalidUrl(format!(
                "unsupported scheme: {}",
                other
            )))
        }
    };
    let host = url
        .host_str()
        .ok_or_else(|| ConfigError::InvalidUrl("missing host".to_string()))?
        .to_string();
    let port = url.port().unwrap_or(if is_tls { 443 } else { 80 });

    let tls = if is_tls {
        Some(build_tls_connector(config)?)
    } else {
        None
    };
    let dialer = Dialer::new(
        host,
        port,
        tls,
        config.socks5.clone(),
        config.dial_timeout,
        config.read_timeout,
        config.write_timeout,
        read_bytes,
        write_bytes,
    );
    let client = hyper::Client::builder()
        .pool_max_idle_per_host(config.max_conns)
        .build::<_, Body>(dialer);

    let uri: Uri = config
        .url
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| ConfigError::InvalidUrl(e.to_string()))?;
    let method = Method::from_bytes(config.method.as_bytes())
        .map_err(|_| ConfigError::InvalidUrl(format!("invalid method: {}", config.method)))?;
    let headers = build_headers(config, &url)?;

    Ok(LoadClient {
        client,
        method,
        uri,
        headers,
        do_timeout: config.do_timeout,
    })
}

fn build_headers(config: &RunConfig, url: &Url) -> Result<HeaderMap, ConfigError> {
    let mut headers = HeaderMap::new();

    // Host header: explicit override wins, otherwise the URL authority
    // (keeping a non-default port when the URL carries one).
    let host_value = match &config.host {
        Some(h) => h.clone(),
        None => match url.port() {
            Some(p) => format!("{}:{}", url.host_str().unwrap_or_default(), p),
            None => url.host_str().unwrap_or_default().to_string(),
        },
    };
    headers.insert(
        HOST,
        HeaderValue::from_str(&host_value)
            .map_err(|_| ConfigError::InvalidHeader(host_value.clone()))?,
    );

    if let Some(content_type) = &config.content_type {
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(content_type)
                .map_err(|_| ConfigError::InvalidHeader(content_type.clone()))?,
        );
    }

    for raw in &config.headers {
        let (name, value) = raw
            .split_once(':')
            .ok_or_else(|| ConfigError::InvalidHeader(raw.clone()))?;
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ConfigError::InvalidHeader(raw.clone()))?;
        let value = HeaderValue::from_str(value.trim_start())
            .map_err(|_| ConfigError::InvalidHeader(raw.clone()))?;
        // append keeps duplicate names, in flag order.
        headers.append(name, value);
    }

    Ok(headers)
}

fn build_tls_connector(config: &RunConfig) -> Result<tokio_native_tls::TlsConnector, ConfigError> {
    let mut builder = native_tls::TlsConnector::builder();
    if config.insecure {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    }
    if let (Some(cert), Some(key)) = (&config.cert, &config.key) {
        let cert_pem = std::fs::read(cert)
            .map_err(|e| ConfigError::Tls(format!("{}: {}", cert.display(), e)))?;
        let key_pem =
            std::fs::read(key).map_err(|e| ConfigError::Tls(format!("{}: {}", key.display(), e)))?;
        let identity = native_tls::Identity::from_pkcs8(&cert_pem, &key_pem)
            .map_err(|e| ConfigError::Tls(e.to_string()))?;
        builder.identity(identity);
    }
    let connector = builder
        .build()
        .map_err(|e| ConfigError::Tls(e.to_string()))?;
    Ok(tokio_native_tls::TlsConnector::from(connector))
}

impl LoadClient {
    /// Stamp the template onto a request carrying `body`.
    pub fn request(&self, body: Body) -> Request<Body> {
        let mut req = Request::new(body);
        *req.method_mut() = self.method.clone();
        *req.uri_mut() = self.uri.clone();
        *req.headers_mut() = self.headers.clone();
        req
    }

    /// Issue one request and drain its body.
    ///
    /// Returns the status class on success and the error message on
    /// failure. The whole issue+drain cycle is capped by the configured
    /// per-request timeout when one is set.
    pub async fn issue(&self, req: Request<Body>) -> Result<&'static str, String> {
        match self.do_timeout {
            Some(t) => match tokio::time::timeout(t, self.send_and_drain(req)).await {
                Ok(result) => result,
                Err(_) => Err("request timed out".to_string()),
            },
            None => self.send_and_drain(req).await,
        }
    }

    async fn send_and_drain(&self, req: Request<Body>) -> Result<&'static str, String> {
        let resp = self.client.request(req).await.map_err(|e| e.to_string())?;
        let status = resp.status().as_u16();
        let code = status_class(status);

        // Pull the whole payload so the byte counters see it.
        let mut body = resp.into_body();
        while let Some(chunk) = body.data().await {
            if let Err(e) = chunk {
                return Err(e.to_string());
            }
        }

        code.ok_or_else(|| format!("unexpected status code: {}", status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_class() {
        assert_eq!(status_class(100), Some("1xx"));
        assert_eq!(status_class(200), Some("2xx"));
        assert_eq!(status_class(204), Some("2xx"));
        assert_eq!(status_class(301), Some("3xx"));
        assert_eq!(status_class(404), Some("4xx"));
        assert_eq!(status_class(599), Some("5xx"));
        assert_eq!(status_class(600), None);
        assert_eq!(status_class(99), None);
    }

    fn headers_for(config: &RunConfig) -> Result<HeaderMap, ConfigError> {
        let url = Url::parse(&config.url).unwrap();
        build_headers(config, &url)
    }

    #[test]
    fn test_host_header_defaults_to_url_host() {
        let config = RunConfig {
            url: "http://example.com/path".to_string(),
            ..Default::default()
        };
        let headers = headers_for(&config).unwrap();
        assert_eq!(headers.get(HOST).unwrap(), "example.com");
    }

    #[test]
    fn test_host_header_keeps_explicit_port() {
        let config = RunConfig {
            url: "http://example.com:8080/".to_string(),
            ..Default::default()
        };
        let headers = headers_for(&config).unwrap();
        assert_eq!(headers.get(HOST).unwrap(), "example.com:8080");
    }

    #[test]
    fn test_host_header_override() {
        let config = RunConfig {
            url: "http://example.com/".to_string(),
            host: Some("other.example".to_string()),
            ..Default::default()
        };
        let headers = headers_for(&config).unwrap();
        assert_eq!(headers.get(HOST).unwrap(), "other.example");
    }

    #[test]
    fn test_custom_headers_preserve_duplicates() {
        let config = RunConfig {
            url: "http://example.com/".to_string(),
            headers: vec![
                "X-Tag: one".to_string(),
                "X-Tag: two".to_string(),
                "Accept: application/json".to_string(),
            ],
            ..Default::default()
        };
        let headers = headers_for(&config).unwrap();
        let tags: Vec<_> = headers.get_all("x-tag").iter().collect();
        assert_eq!(tags, vec!["one", "two"]);
        assert_eq!(headers.get("accept").unwrap(), "application/json");
    }

    #[test]
    fn test_malformed_header_rejected() {
        let config = RunConfig {
            url: "http://example.com/".to_string(),
            headers: vec!["not-a-header".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            headers_for(&config),
            Err(ConfigError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_content_type_set() {
        let config = RunConfig {
            url: "http://example.com/".to_string(),
            content_type: Some("application/json".to_string()),
            ..Default::default()
        };
        let headers = headers_for(&config).unwrap();
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
    }
}
