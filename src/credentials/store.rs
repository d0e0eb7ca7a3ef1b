//! Durable storage for the live credential.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::oauth::lifetime_of;
use super::Credential;
use crate::error::{Error, Result};

/// Where the credential survives restarts.
#[async_trait]
pub trait CredentialStore: Send + Sync {
  /// Returns `None` when nothing has been stored yet.
  async fn load(&self) -> Result<Option<Credential>>;

  async fn save(&self, credential: &Credential) -> Result<()>;

  fn location(&self) -> &Path;
}

/// On-disk layout. `expires_in` holds the expiry instant in epoch seconds,
/// written as a string.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedCredential {
  access_token: String,
  refresh_token: String,
  #[serde(
    serialize_with = "epoch_as_string",
    deserialize_with = "epoch_from_string_or_number"
  )]
  expires_in: i64,
  #[serde(default)]
  scope: String,
  created_at: i64,
}

fn epoch_as_string<S: Serializer>(secs: &i64, serializer: S) -> Result<S::Ok, S::Error> {
  serializer.serialize_str(&secs.to_string())
}

fn epoch_from_string_or_number<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
  D: Deserializer<'de>,
{
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum Repr {
    Num(i64),
    Str(String),
  }

  match Repr::deserialize(deserializer)? {
    Repr::Num(n) => Ok(n),
    Repr::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
  }
}

impl From<&Credential> for PersistedCredential {
  fn from(c: &Credential) -> Self {
    Self {
      access_token: c.access_token.clone(),
      refresh_token: c.refresh_token.clone(),
      expires_in: c.expires_at().timestamp(),
      scope: c.scope.clone(),
      created_at: c.issued_at.timestamp(),
    }
  }
}

impl TryFrom<PersistedCredential> for Credential {
  type Error = String;

  fn try_from(p: PersistedCredential) -> Result<Self, Self::Error> {
    let issued_at = DateTime::<Utc>::from_timestamp(p.created_at, 0)
      .ok_or_else(|| format!("created_at out of range: {}", p.created_at))?;
    let lifetime = p
      .expires_in
      .checked_sub(p.created_at)
      .ok_or_else(|| format!("expires_in out of range: {}", p.expires_in))
      .and_then(|secs| lifetime_of(issued_at, secs))?;
    Ok(Credential {
      access_token: p.access_token,
      refresh_token: p.refresh_token,
      scope: p.scope,
      issued_at,
      lifetime,
    })
  }
}

/// JSON file store, written atomically via a sibling temp file.
pub struct FileCredentialStore {
  path: PathBuf,
}

impl FileCredentialStore {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  /// Default location: `$XDG_DATA_HOME/glq/credentials.json`.
  pub fn default_path() -> Option<PathBuf> {
    dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .map(|dir| dir.join("glq").join("credentials.json"))
  }

  fn persist_error(&self, source: io::Error) -> Error {
    Error::Persist {
      path: self.path.clone(),
      source,
    }
  }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
  async fn load(&self) -> Result<Option<Credential>> {
    let contents = match tokio::fs::read_to_string(&self.path).await {
      Ok(contents) => contents,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(e) => {
        return Err(Error::CredentialLoad {
          path: self.path.clone(),
          reason: e.to_string(),
        })
      }
    };

    let persisted: PersistedCredential =
      serde_json::from_str(&contents).map_err(|e| Error::CredentialLoad {
        path: self.path.clone(),
        reason: e.to_string(),
      })?;
    let credential = Credential::try_from(persisted).map_err(|reason| Error::CredentialLoad {
      path: self.path.clone(),
      reason,
    })?;

    debug!(path = %self.path.display(), credential = %credential.fingerprint(), "credential loaded");
    Ok(Some(credential))
  }

  async fn save(&self, credential: &Credential) -> Result<()> {
    if let Some(parent) = self.path.parent() {
      if !parent.as_os_str().is_empty() {
        tokio::fs::create_dir_all(parent)
          .await
          .map_err(|e| self.persist_error(e))?;
      }
    }

    let data = serde_json::to_vec_pretty(&PersistedCredential::from(credential))
      .map_err(|e| self.persist_error(e.into()))?;

    let tmp = self.path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &data)
      .await
      .map_err(|e| self.persist_error(e))?;

    // Tokens grant API access; keep them private to the owner.
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(|e| self.persist_error(e))?;
    }

    tokio::fs::rename(&tmp, &self.path)
      .await
      .map_err(|e| self.persist_error(e))?;

    debug!(path = %self.path.display(), credential = %credential.fingerprint(), "credential saved");
    Ok(())
  }

  fn location(&self) -> &Path {
    &self.path
  }
}
