//! OAuth credential lifecycle: load, expiry check, single-flight refresh.

mod oauth;
mod store;

pub use oauth::{authorization_url, OAuthClient, TokenExchange, TokenGrant};
pub use store::{CredentialStore, FileCredentialStore};

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result, UpstreamError};

/// OAuth token set. Replaced wholesale on refresh, never edited in place.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
  pub access_token: String,
  pub refresh_token: String,
  pub scope: String,
  pub issued_at: DateTime<Utc>,
  pub lifetime: Duration,
}

impl Credential {
  /// Saturates at the latest representable instant.
  pub fn expires_at(&self) -> DateTime<Utc> {
    self
      .issued_at
      .checked_add_signed(self.lifetime)
      .unwrap_or(DateTime::<Utc>::MAX_UTC)
  }

  pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
    now >= self.expires_at()
  }

  /// Short stable identifier for logs; never log the token itself.
  pub fn fingerprint(&self) -> String {
    let digest = Sha256::digest(self.access_token.as_bytes());
    hex::encode(&digest[..6])
  }
}

impl fmt::Debug for Credential {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Credential")
      .field("fingerprint", &self.fingerprint())
      .field("scope", &self.scope)
      .field("issued_at", &self.issued_at)
      .field("expires_at", &self.expires_at())
      .finish_non_exhaustive()
  }
}

/// Anything that can hand out the bearer token for upstream calls.
pub trait TokenSource: Send + Sync {
  fn access_token(&self) -> String;
}

/// Owns the single live credential and keeps it usable.
pub struct CredentialManager {
  live: RwLock<Credential>,
  /// Serializes refresh exchanges; a refresh token must not be spent twice.
  refresh_gate: Mutex<()>,
  exchange: Arc<dyn TokenExchange>,
  store: Arc<dyn CredentialStore>,
}

impl CredentialManager {
  pub fn new(
    credential: Credential,
    exchange: Arc<dyn TokenExchange>,
    store: Arc<dyn CredentialStore>,
  ) -> Self {
    Self {
      live: RwLock::new(credential),
      refresh_gate: Mutex::new(()),
      exchange,
      store,
    }
  }

  /// Start from the persisted credential. Fails if none was ever stored.
  pub async fn load(
    exchange: Arc<dyn TokenExchange>,
    store: Arc<dyn CredentialStore>,
  ) -> Result<Self> {
    let credential = store
      .load()
      .await?
      .ok_or_else(|| Error::MissingCredential(store.location().to_path_buf()))?;
    info!(credential = %credential.fingerprint(), expires_at = %credential.expires_at(), "credential loaded");
    Ok(Self::new(credential, exchange, store))
  }

  /// Complete the authorization-code flow and persist the first credential.
  pub async fn authorize(
    exchange: &dyn TokenExchange,
    store: &dyn CredentialStore,
    code: &str,
  ) -> Result<Credential> {
    let grant = exchange.exchange_code(code).await.map_err(Error::AuthRefresh)?;
    let credential = credential_from(grant)?;
    store.save(&credential).await?;
    info!(credential = %credential.fingerprint(), "authorization complete");
    Ok(credential)
  }

  pub fn current(&self) -> Credential {
    self
      .live
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn is_expired(&self) -> bool {
    self.is_expired_at(Utc::now())
  }

  pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
    self
      .live
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .is_expired_at(now)
  }

  fn install(&self, credential: Credential) {
    *self.live.write().unwrap_or_else(PoisonError::into_inner) = credential;
  }

  /// Return a credential that is not expired, refreshing it first if needed.
  ///
  /// Concurrent callers that find the token expired queue behind a single
  /// refresh exchange and all receive its result. On failure the previous
  /// credential stays live. If the new credential cannot be persisted it is
  /// still installed, since upstream may already have revoked the old
  /// refresh token, and [`Error::Persist`] is returned.
  #[instrument(skip(self))]
  pub async fn ensure_valid(&self) -> Result<Credential> {
    if !self.is_expired() {
      return Ok(self.current());
    }

    let _gate = self.refresh_gate.lock().await;

    let current = self.current();
    if !current.is_expired_at(Utc::now()) {
      debug!(credential = %current.fingerprint(), "credential refreshed by a concurrent caller");
      return Ok(current);
    }

    info!(credential = %current.fingerprint(), expired_at = %current.expires_at(), "access token expired, refreshing");
    let grant = self
      .exchange
      .refresh(&current.refresh_token)
      .await
      .map_err(|e| {
        warn!(error = %e, "token refresh failed, keeping previous credential");
        Error::AuthRefresh(e)
      })?;

    let fresh = credential_from(grant).map_err(|e| {
      warn!(error = %e, "token grant unusable, keeping previous credential");
      e
    })?;
    self.install(fresh.clone());
    self.store.save(&fresh).await?;

    info!(credential = %fresh.fingerprint(), expires_at = %fresh.expires_at(), "access token refreshed");
    Ok(fresh)
  }
}

fn credential_from(grant: TokenGrant) -> Result<Credential> {
  grant
    .into_credential(Utc::now())
    .map_err(|reason| Error::AuthRefresh(UpstreamError::decode("token grant", reason)))
}

impl TokenSource for CredentialManager {
  fn access_token(&self) -> String {
    self
      .live
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .access_token
      .clone()
  }
}
