//! Core traits and types for the caching system.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::UpstreamError;

/// Identifier of a tracked GitLab project. Used as the key in every store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "IdRepr")]
pub struct ProjectId(String);

impl ProjectId {
  pub fn new(id: impl AsRef<str>) -> Self {
    Self(id.as_ref().trim().to_string())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Read the `id` field of a project payload.
  pub fn of_payload(payload: &Value) -> Option<Self> {
    match payload.get("id")? {
      Value::Number(n) => Some(Self(n.to_string())),
      Value::String(s) if !s.trim().is_empty() => Some(Self::new(s)),
      _ => None,
    }
  }
}

impl fmt::Display for ProjectId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for ProjectId {
  fn from(s: &str) -> Self {
    Self::new(s)
  }
}

impl From<String> for ProjectId {
  fn from(s: String) -> Self {
    Self::new(s)
  }
}

impl From<u64> for ProjectId {
  fn from(n: u64) -> Self {
    Self(n.to_string())
  }
}

/// Classifier output carries ids either as JSON numbers or strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
  Num(u64),
  Str(String),
}

impl From<IdRepr> for ProjectId {
  fn from(repr: IdRepr) -> Self {
    match repr {
      IdRepr::Num(n) => n.into(),
      IdRepr::Str(s) => s.into(),
    }
  }
}

/// Entity family held by one cache store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
pub enum CacheKind {
  Project,
  Commit,
  Branch,
  Contributor,
  Member,
  Tree,
}

impl CacheKind {
  pub const ALL: [CacheKind; 6] = [
    CacheKind::Project,
    CacheKind::Commit,
    CacheKind::Branch,
    CacheKind::Contributor,
    CacheKind::Member,
    CacheKind::Tree,
  ];

  /// Name the store was historically exposed under; the classifier prompt still uses it.
  pub fn store_name(self) -> &'static str {
    match self {
      CacheKind::Project => "cacheProjectsById",
      CacheKind::Commit => "cacheCommitsById",
      CacheKind::Branch => "cacheBranchesById",
      CacheKind::Contributor => "cacheContributorsById",
      CacheKind::Member => "cacheMembersById",
      CacheKind::Tree => "cacheTreesById",
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      CacheKind::Project => "project",
      CacheKind::Commit => "commit",
      CacheKind::Branch => "branch",
      CacheKind::Contributor => "contributor",
      CacheKind::Member => "member",
      CacheKind::Tree => "tree",
    }
  }
}

impl fmt::Display for CacheKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for CacheKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let lower = s.trim().to_lowercase();
    let kind = match lower.as_str() {
      "project" | "projects" | "repository" | "repositories" => CacheKind::Project,
      "commit" | "commits" => CacheKind::Commit,
      "branch" | "branches" => CacheKind::Branch,
      "contributor" | "contributors" => CacheKind::Contributor,
      "member" | "members" => CacheKind::Member,
      "tree" | "trees" => CacheKind::Tree,
      _ => {
        return CacheKind::ALL
          .into_iter()
          .find(|k| k.store_name().eq_ignore_ascii_case(&lower))
          .ok_or_else(|| format!("unknown cache kind: {}", s));
      }
    };
    Ok(kind)
  }
}

impl TryFrom<String> for CacheKind {
  type Error = String;

  fn try_from(s: String) -> Result<Self, Self::Error> {
    s.parse()
  }
}

impl Serialize for CacheKind {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(self.store_name())
  }
}

/// One row of a cache query: absent `data` means never fetched or evicted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
  #[serde(rename = "cacheName")]
  pub kind: CacheKind,
  pub project_id: ProjectId,
  pub data: Option<Value>,
}

/// Authenticated upstream read for a single entity family.
#[async_trait]
pub trait EntityFetcher: Send + Sync {
  async fn fetch(&self, project_id: &ProjectId, access_token: &str)
    -> Result<Value, UpstreamError>;
}

/// Upstream project listing, used to bootstrap and to find what changed.
#[async_trait]
pub trait ProjectLister: Send + Sync {
  async fn fetch_all(&self, access_token: &str) -> Result<Vec<Value>, UpstreamError>;

  async fn fetch_updated_after(
    &self,
    since: DateTime<Utc>,
    access_token: &str,
  ) -> Result<Vec<Value>, UpstreamError>;
}
