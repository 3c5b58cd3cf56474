//! Source fetching.
//!
//! Downloads a recipe's source into memory with retry and exponential
//! backoff. Nothing touches the disk until the digest has been verified; the
//! verified bytes may then be written to the content-addressed download cache
//! with [`SourceFetcher::store_in_cache`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::{StatusCode, Url};
use thiserror::Error;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::consts::{
  DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, DEFAULT_FETCH_TIMEOUT, DEFAULT_MAX_DOWNLOAD_BYTES, DEFAULT_MAX_RETRIES,
};
use crate::error::ErrorKind;
use crate::verify::{Digest, digest_bytes};

/// Configuration for source downloads.
#[derive(Debug, Clone)]
pub struct FetchConfig {
  /// Timeout for a single attempt, covering connect and body transfer.
  pub timeout: Duration,
  /// Retries after the first attempt for transient failures.
  pub max_retries: u32,
  /// Delay before the first retry; doubled for each further retry.
  pub backoff_base: Duration,
  /// Upper bound for a single backoff delay.
  pub backoff_max: Duration,
  /// Largest accepted response body.
  pub max_bytes: u64,
}

impl Default for FetchConfig {
  fn default() -> Self {
    Self {
      timeout: DEFAULT_FETCH_TIMEOUT,
      max_retries: DEFAULT_MAX_RETRIES,
      backoff_base: DEFAULT_BACKOFF_BASE,
      backoff_max: DEFAULT_BACKOFF_MAX,
      max_bytes: DEFAULT_MAX_DOWNLOAD_BYTES,
    }
  }
}

impl FetchConfig {
  /// Delay before retry number `retry` (1-based).
  pub fn backoff_delay(&self, retry: u32) -> Duration {
    let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
    self.backoff_base.saturating_mul(factor).min(self.backoff_max)
  }
}

/// Downloaded source bytes plus their digest, computed with the expected
/// digest's algorithm while streaming.
#[derive(Debug)]
pub struct FetchResult {
  pub bytes: Vec<u8>,
  pub actual_digest: Digest,
  /// True when the bytes came from the download cache.
  pub from_cache: bool,
}

#[derive(Debug, Error)]
pub enum FetchError {
  #[error("invalid source url {url}: {message}")]
  InvalidUrl { url: String, message: String },

  #[error("timed out fetching {url} after {attempts} attempt(s)")]
  Timeout { url: String, attempts: u32 },

  #[error("source not found at {url} (HTTP {status})")]
  NotFound { url: String, status: u16 },

  #[error("HTTP {status} fetching {url}")]
  Http { url: String, status: u16 },

  #[error("network error fetching {url} after {attempts} attempt(s): {message}")]
  Network { url: String, attempts: u32, message: String },

  #[error("response from {url} exceeds {limit} bytes")]
  TooLarge { url: String, limit: u64 },

  #[error("failed to initialise HTTP client: {0}")]
  Client(String),

  #[error("fetch of {url} cancelled")]
  Cancelled { url: String },
}

impl FetchError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      FetchError::Timeout { .. } => ErrorKind::FetchTimeout,
      FetchError::NotFound { .. } => ErrorKind::FetchNotFound,
      FetchError::InvalidUrl { .. } => ErrorKind::InvalidRecipe,
      FetchError::Cancelled { .. } => ErrorKind::Cancelled,
      FetchError::Http { .. } | FetchError::Network { .. } | FetchError::TooLarge { .. } | FetchError::Client(_) => {
        ErrorKind::FetchNetwork
      }
    }
  }
}

/// Outcome of one failed attempt.
enum AttemptError {
  Transient { timeout: bool, message: String },
  Fatal(FetchError),
}

/// Resolves source URLs to bytes.
#[derive(Debug, Clone)]
pub struct SourceFetcher {
  client: reqwest::Client,
  config: FetchConfig,
  cache_dir: Option<PathBuf>,
}

impl SourceFetcher {
  pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
    let client = reqwest::Client::builder()
      .timeout(config.timeout)
      .user_agent(concat!("kiln/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| FetchError::Client(e.to_string()))?;

    Ok(Self {
      client,
      config,
      cache_dir: None,
    })
  }

  /// Consult and populate a download cache in `dir`.
  pub fn with_cache(mut self, dir: impl Into<PathBuf>) -> Self {
    self.cache_dir = Some(dir.into());
    self
  }

  pub fn config(&self) -> &FetchConfig {
    &self.config
  }

  /// Fetch `url`, hashing the body with `expected`'s algorithm.
  ///
  /// The digest is not compared here; that is the verifier's job. Transient
  /// failures (connection errors, timeouts, 5xx, 429) are retried with
  /// exponential backoff. Other 4xx responses fail immediately.
  pub async fn fetch(&self, url: &str, expected: &Digest, cancel: &CancellationToken) -> Result<FetchResult, FetchError> {
    let parsed = parse_source_url(url)?;

    if let Some(hit) = self.cached(expected).await {
      info!(url = %url, digest = %expected, "using cached source");
      return Ok(hit);
    }

    info!(url = %url, "fetching source");

    let mut attempts = 0;
    loop {
      attempts += 1;
      if cancel.is_cancelled() {
        return Err(FetchError::Cancelled { url: url.to_string() });
      }

      let (timeout, message) = match self.attempt(&parsed, expected, cancel).await {
        Ok(result) => {
          info!(url = %url, size = result.bytes.len(), attempts, "download complete");
          return Ok(result);
        }
        Err(AttemptError::Fatal(e)) => return Err(e),
        Err(AttemptError::Transient { timeout, message }) => (timeout, message),
      };

      if attempts > self.config.max_retries {
        return Err(if timeout {
          FetchError::Timeout {
            url: url.to_string(),
            attempts,
          }
        } else {
          FetchError::Network {
            url: url.to_string(),
            attempts,
            message,
          }
        });
      }

      let delay = self.config.backoff_delay(attempts);
      warn!(url = %url, attempt = attempts, error = %message, delay = ?delay, "fetch failed, retrying");

      tokio::select! {
        _ = cancel.cancelled() => return Err(FetchError::Cancelled { url: url.to_string() }),
        _ = tokio::time::sleep(delay) => {}
      }
    }
  }

  async fn attempt(&self, url: &Url, expected: &Digest, cancel: &CancellationToken) -> Result<FetchResult, AttemptError> {
    let cancelled = || AttemptError::Fatal(FetchError::Cancelled { url: url.to_string() });

    let mut response = tokio::select! {
      _ = cancel.cancelled() => return Err(cancelled()),
      response = self.client.get(url.clone()).send() => response.map_err(classify_transport)?,
    };

    let status = response.status();
    if !status.is_success() {
      return Err(classify_status(url, status));
    }

    let limit = self.config.max_bytes;
    if response.content_length().is_some_and(|len| len > limit) {
      return Err(AttemptError::Fatal(FetchError::TooLarge {
        url: url.to_string(),
        limit,
      }));
    }

    // Partial bytes are dropped with this buffer on any early return.
    let mut bytes = Vec::with_capacity(response.content_length().unwrap_or(0) as usize);
    let mut hasher = expected.algorithm().hasher();
    loop {
      let chunk = tokio::select! {
        _ = cancel.cancelled() => return Err(cancelled()),
        chunk = response.chunk() => chunk.map_err(classify_transport)?,
      };
      let Some(chunk) = chunk else { break };

      if bytes.len() as u64 + chunk.len() as u64 > limit {
        return Err(AttemptError::Fatal(FetchError::TooLarge {
          url: url.to_string(),
          limit,
        }));
      }
      hasher.update(&chunk);
      bytes.extend_from_slice(&chunk);
    }

    Ok(FetchResult {
      bytes,
      actual_digest: hasher.finalize(),
      from_cache: false,
    })
  }

  /// Path of the cache entry for `digest`, if caching is enabled.
  pub fn cache_path(&self, digest: &Digest) -> Option<PathBuf> {
    self
      .cache_dir
      .as_ref()
      .map(|dir| dir.join(format!("{}-{}", digest.algorithm(), digest.hex())))
  }

  /// Read a cache entry, ignoring it unless its content still hashes to `expected`.
  async fn cached(&self, expected: &Digest) -> Option<FetchResult> {
    let path = self.cache_path(expected)?;
    let bytes = fs::read(&path).await.ok()?;
    let actual = digest_bytes(expected.algorithm(), &bytes);
    if actual != *expected {
      debug!(path = ?path, expected = %expected, actual = %actual, "stale cache entry, re-downloading");
      let _ = fs::remove_file(&path).await;
      return None;
    }
    Some(FetchResult {
      bytes,
      actual_digest: actual,
      from_cache: true,
    })
  }

  /// Write verified bytes to the cache (temp file, then rename).
  ///
  /// Must only be called after the digest has been verified.
  pub async fn store_in_cache(&self, verified: &Digest, bytes: &[u8]) -> std::io::Result<Option<PathBuf>> {
    let Some(path) = self.cache_path(verified) else {
      return Ok(None);
    };
    if path.exists() {
      return Ok(Some(path));
    }
    let dir = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(dir).await?;

    let staged = tempfile::Builder::new().prefix(".download-").tempfile_in(dir)?;
    fs::write(staged.path(), bytes).await?;
    staged.persist(&path).map_err(|e| e.error)?;
    debug!(path = ?path, size = bytes.len(), "cached verified source");
    Ok(Some(path))
  }
}

/// Accept only absolute http(s) URLs.
pub fn parse_source_url(url: &str) -> Result<Url, FetchError> {
  let parsed = Url::parse(url).map_err(|e| FetchError::InvalidUrl {
    url: url.to_string(),
    message: e.to_string(),
  })?;
  match parsed.scheme() {
    "http" | "https" => Ok(parsed),
    other => Err(FetchError::InvalidUrl {
      url: url.to_string(),
      message: format!("unsupported scheme {other:?} (expected http or https)"),
    }),
  }
}

fn classify_transport(err: reqwest::Error) -> AttemptError {
  AttemptError::Transient {
    timeout: err.is_timeout(),
    message: err.to_string(),
  }
}

fn classify_status(url: &Url, status: StatusCode) -> AttemptError {
  if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
    return AttemptError::Transient {
      timeout: false,
      message: format!("HTTP {}", status),
    };
  }
  if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
    return AttemptError::Fatal(FetchError::NotFound {
      url: url.to_string(),
      status: status.as_u16(),
    });
  }
  AttemptError::Fatal(FetchError::Http {
    url: url.to_string(),
    status: status.as_u16(),
  })
}
