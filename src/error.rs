//! Startup error types.
//!
//! Configuration problems are fatal: they are reported on stderr and the
//! process exits with status 1. Per-request failures are not errors in this
//! sense; they are recorded as strings inside a `Record` and counted.

use std::path::PathBuf;

/// Errors that can occur while building a run from CLI flags.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// Custom headers must be `K:V` pairs.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("requests must greater than or equal concurrency")]
    RequestsLessThanConcurrency,

    #[error("must specify cert and key at the same time")]
    CertWithoutKey,

    #[error("failed to read body file {}: {}", path.display(), source)]
    BodyFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to load client certificate: {0}")]
    Tls(String),

    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
}
