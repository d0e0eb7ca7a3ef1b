//! Typed failures for the credential and cache core.

use std::path::PathBuf;
use thiserror::Error;

/// A single upstream call that did not produce a usable payload.
#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
  /// Connection, TLS or timeout failure; no response was received
  #[error("request to {url} failed: {message}")]
  Transport { url: String, message: String },

  /// Upstream answered with a non-2xx status
  #[error("{url} returned {status}: {body}")]
  Status {
    url: String,
    status: u16,
    body: String,
  },

  /// Response arrived but could not be decoded
  #[error("unexpected response from {url}: {message}")]
  Decode { url: String, message: String },
}

impl UpstreamError {
  pub fn transport(url: impl Into<String>, err: &reqwest::Error) -> Self {
    let message = if err.is_timeout() {
      "timed out".to_string()
    } else {
      err.to_string()
    };
    Self::Transport {
      url: url.into(),
      message,
    }
  }

  pub fn decode(url: impl Into<String>, message: impl ToString) -> Self {
    Self::Decode {
      url: url.into(),
      message: message.to_string(),
    }
  }

  /// HTTP status, when upstream answered at all.
  pub fn status(&self) -> Option<u16> {
    match self {
      Self::Status { status, .. } => Some(*status),
      _ => None,
    }
  }

  /// Response body, when upstream answered with an error status.
  #[cfg(test)]
  pub fn body(&self) -> Option<&str> {
    match self {
      Self::Status { body, .. } => Some(body),
      _ => None,
    }
  }
}

#[derive(Debug, Error)]
pub enum Error {
  /// The refresh exchange did not complete; the previous credential is still live.
  #[error("credential refresh failed: {0}")]
  AuthRefresh(#[source] UpstreamError),

  /// The project list could not be bootstrapped.
  #[error("cache initialization failed: {0}")]
  CacheInit(#[source] UpstreamError),

  #[error(transparent)]
  Upstream(#[from] UpstreamError),

  #[error("invalid query: {0}")]
  InvalidQuery(String),

  /// A refreshed credential could not be written to durable storage.
  #[error("failed to persist credential to {}: {source}", .path.display())]
  Persist {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("no stored credential at {}; run `glq login` first", .0.display())]
  MissingCredential(PathBuf),

  #[error("failed to load credential from {}: {reason}", .path.display())]
  CredentialLoad { path: PathBuf, reason: String },

  #[error("cache registry misconfigured: {0}")]
  Registry(String),
}

impl Error {
  /// Status the HTTP layer should answer with for this failure.
  pub fn http_status(&self) -> u16 {
    match self {
      Self::AuthRefresh(_) | Self::MissingCredential(_) => 401,
      Self::InvalidQuery(_) => 400,
      Self::Upstream(e) => e.status().unwrap_or(502),
      _ => 500,
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
