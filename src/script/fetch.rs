//! Remote build script retrieval.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::error::{BuildError, Result};

pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP {0}")]
    Status(u16),
    #[error("timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed script: {0}")]
    Malformed(&'static str),
}

/// Retrieves the body of a remote build script.
pub trait ScriptFetcher {
    fn fetch(&self, url: &str) -> std::result::Result<Vec<u8>, FetchError>;
}

/// Reject bodies that cannot be a shell script.
pub fn check_script_body(body: &[u8]) -> std::result::Result<(), FetchError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(FetchError::Malformed("empty body"));
    }
    let text = std::str::from_utf8(body).map_err(|_| FetchError::Malformed("not UTF-8"))?;
    let head = text.trim_start().to_ascii_lowercase();
    if head.starts_with("<!doctype html") || head.starts_with("<html") {
        return Err(FetchError::Malformed("HTML page"));
    }
    Ok(())
}

/// Blocking HTTP(S) fetcher with a per-request timeout.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("stagehand/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BuildError::unavailable(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl ScriptFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> std::result::Result<Vec<u8>, FetchError> {
        info!(url = %url, "fetching remote build script");
        let response = self.client.get(url).send().map_err(classify)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let body = response.bytes().map_err(classify)?.to_vec();
        check_script_body(&body)?;
        debug!(url = %url, bytes = body.len(), "fetched remote build script");
        Ok(body)
    }
}

fn classify(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Transport(err.to_string())
    }
}
