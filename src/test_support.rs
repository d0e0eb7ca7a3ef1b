//! In-memory fakes for the upstream and storage seams.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::{CacheKind, CacheRegistry, EntityFetcher, ProjectId, ProjectLister};
use crate::credentials::{Credential, CredentialStore, TokenExchange, TokenGrant, TokenSource};
use crate::error::{Error, Result, UpstreamError};
use crate::handler::RepositoryAdmin;

fn server_error(what: &str) -> UpstreamError {
  UpstreamError::Status {
    url: format!("fake://{}", what),
    status: 500,
    body: "boom".to_string(),
  }
}

pub struct StaticToken(String);

impl StaticToken {
  pub fn new(token: &str) -> Self {
    Self(token.to_string())
  }
}

impl TokenSource for StaticToken {
  fn access_token(&self) -> String {
    self.0.clone()
  }
}

/// Returns `{"kind": .., "projectId": ..}` unless a payload or failure was configured.
pub struct FakeFetcher {
  kind: CacheKind,
  calls: AtomicUsize,
  fail_always: AtomicBool,
  failing: Mutex<HashSet<ProjectId>>,
  payloads: Mutex<HashMap<ProjectId, Value>>,
}

impl FakeFetcher {
  pub fn new(kind: CacheKind) -> Self {
    Self {
      kind,
      calls: AtomicUsize::new(0),
      fail_always: AtomicBool::new(false),
      failing: Mutex::new(HashSet::new()),
      payloads: Mutex::new(HashMap::new()),
    }
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  pub fn fail_for(&self, id: &str) {
    self.failing.lock().unwrap().insert(id.into());
  }

  pub fn fail_always(&self) {
    self.fail_always.store(true, Ordering::SeqCst);
  }

  pub fn set_payload(&self, id: &str, payload: Value) {
    self.payloads.lock().unwrap().insert(id.into(), payload);
  }
}

#[async_trait]
impl EntityFetcher for FakeFetcher {
  async fn fetch(
    &self,
    project_id: &ProjectId,
    _access_token: &str,
  ) -> std::result::Result<Value, UpstreamError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    tokio::task::yield_now().await;
    if self.fail_always.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(project_id)
    {
      return Err(server_error(self.kind.as_str()));
    }
    let configured = self.payloads.lock().unwrap().get(project_id).cloned();
    Ok(configured.unwrap_or_else(|| json!({"kind": self.kind.as_str(), "projectId": project_id})))
  }
}

#[derive(Default)]
pub struct FakeLister {
  projects: Mutex<Vec<Value>>,
  updated: Mutex<Vec<Value>>,
  fail_listing: AtomicBool,
  fail_updated: AtomicBool,
  updated_calls: AtomicUsize,
  last_since: Mutex<Option<DateTime<Utc>>>,
}

impl FakeLister {
  pub fn set_projects(&self, projects: Vec<Value>) {
    *self.projects.lock().unwrap() = projects;
  }

  pub fn set_updated(&self, projects: Vec<Value>) {
    *self.updated.lock().unwrap() = projects;
  }

  pub fn fail_listing(&self) {
    self.fail_listing.store(true, Ordering::SeqCst);
  }

  pub fn fail_updated(&self) {
    self.fail_updated.store(true, Ordering::SeqCst);
  }

  pub fn updated_calls(&self) -> usize {
    self.updated_calls.load(Ordering::SeqCst)
  }

  pub fn last_since(&self) -> Option<DateTime<Utc>> {
    *self.last_since.lock().unwrap()
  }
}

#[async_trait]
impl ProjectLister for FakeLister {
  async fn fetch_all(&self, _access_token: &str) -> std::result::Result<Vec<Value>, UpstreamError> {
    if self.fail_listing.load(Ordering::SeqCst) {
      return Err(server_error("projects"));
    }
    Ok(self.projects.lock().unwrap().clone())
  }

  async fn fetch_updated_after(
    &self,
    since: DateTime<Utc>,
    _access_token: &str,
  ) -> std::result::Result<Vec<Value>, UpstreamError> {
    self.updated_calls.fetch_add(1, Ordering::SeqCst);
    *self.last_since.lock().unwrap() = Some(since);
    tokio::task::yield_now().await;
    if self.fail_updated.load(Ordering::SeqCst) {
      return Err(server_error("projects?updated_after"));
    }
    Ok(self.updated.lock().unwrap().clone())
  }
}

pub type FakeFetchers = HashMap<CacheKind, Arc<FakeFetcher>>;

/// A registry wired to fakes, with handles to drive them.
pub fn fake_registry() -> (CacheRegistry, Arc<FakeLister>, FakeFetchers) {
  let lister = Arc::new(FakeLister::default());
  let fetchers: FakeFetchers = CacheKind::ALL
    .into_iter()
    .map(|kind| (kind, Arc::new(FakeFetcher::new(kind))))
    .collect();
  let dyn_fetchers = fetchers
    .iter()
    .map(|(kind, f)| (*kind, f.clone() as Arc<dyn EntityFetcher>))
    .collect();
  let registry = CacheRegistry::new(lister.clone(), dyn_fetchers).expect("all kinds registered");
  (registry, lister, fetchers)
}

/// Issues `access-N` tokens valid for two hours unless told otherwise.
#[derive(Default)]
pub struct FakeExchange {
  calls: AtomicUsize,
  delay: Mutex<Option<Duration>>,
  expires_in: Mutex<Option<i64>>,
  failure: Mutex<Option<UpstreamError>>,
  last_refresh_token: Mutex<Option<String>>,
  last_code: Mutex<Option<String>>,
}

impl FakeExchange {
  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  pub fn set_expires_in(&self, secs: i64) {
    *self.expires_in.lock().unwrap() = Some(secs);
  }

  pub fn fail_with_status(&self, status: u16, body: &str) {
    *self.failure.lock().unwrap() = Some(UpstreamError::Status {
      url: "fake://oauth/token".to_string(),
      status,
      body: body.to_string(),
    });
  }

  pub fn last_refresh_token(&self) -> Option<String> {
    self.last_refresh_token.lock().unwrap().clone()
  }

  pub fn last_code(&self) -> Option<String> {
    self.last_code.lock().unwrap().clone()
  }

  async fn grant(&self) -> std::result::Result<TokenGrant, UpstreamError> {
    let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }
    if let Some(err) = self.failure.lock().unwrap().clone() {
      return Err(err);
    }
    Ok(TokenGrant {
      access_token: format!("access-{}", n),
      refresh_token: format!("refresh-{}", n),
      scope: "api".to_string(),
      created_at: Some(Utc::now().timestamp()),
      expires_in: self.expires_in.lock().unwrap().unwrap_or(7200),
    })
  }
}

#[async_trait]
impl TokenExchange for FakeExchange {
  async fn exchange_code(&self, code: &str) -> std::result::Result<TokenGrant, UpstreamError> {
    *self.last_code.lock().unwrap() = Some(code.to_string());
    self.grant().await
  }

  async fn refresh(&self, refresh_token: &str) -> std::result::Result<TokenGrant, UpstreamError> {
    *self.last_refresh_token.lock().unwrap() = Some(refresh_token.to_string());
    self.grant().await
  }
}

#[derive(Default)]
pub struct MemoryCredentialStore {
  stored: Mutex<Option<Credential>>,
  saves: AtomicUsize,
  fail_saves: AtomicBool,
}

impl MemoryCredentialStore {
  pub fn stored(&self) -> Option<Credential> {
    self.stored.lock().unwrap().clone()
  }

  pub fn saves(&self) -> usize {
    self.saves.load(Ordering::SeqCst)
  }

  pub fn fail_saves(&self) {
    self.fail_saves.store(true, Ordering::SeqCst);
  }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
  async fn load(&self) -> Result<Option<Credential>> {
    Ok(self.stored())
  }

  async fn save(&self, credential: &Credential) -> Result<()> {
    if self.fail_saves.load(Ordering::SeqCst) {
      return Err(Error::Persist {
        path: self.location().to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
      });
    }
    self.saves.fetch_add(1, Ordering::SeqCst);
    *self.stored.lock().unwrap() = Some(credential.clone());
    Ok(())
  }

  fn location(&self) -> &Path {
    Path::new(":memory:")
  }
}

/// Records mutations and answers with configurable statuses.
pub struct FakeAdmin {
  pub update_status: Mutex<u16>,
  pub delete_status: Mutex<u16>,
  pub updates: Mutex<Vec<(ProjectId, Value)>>,
  pub deletes: Mutex<Vec<ProjectId>>,
  pub updated_after: Mutex<Vec<Value>>,
}

impl Default for FakeAdmin {
  fn default() -> Self {
    Self {
      update_status: Mutex::new(200),
      delete_status: Mutex::new(202),
      updates: Mutex::new(Vec::new()),
      deletes: Mutex::new(Vec::new()),
      updated_after: Mutex::new(Vec::new()),
    }
  }
}

/// Non-2xx statuses become errors, as `GitLabClient` reports them.
fn rejected(status: u16, id: &ProjectId) -> std::result::Result<u16, UpstreamError> {
  if (200..300).contains(&status) {
    return Ok(status);
  }
  Err(UpstreamError::Status {
    url: format!("fake://projects/{}", id),
    status,
    body: format!(r#"{{"message":"{} rejected"}}"#, status),
  })
}

#[async_trait]
impl RepositoryAdmin for FakeAdmin {
  async fn update_project(
    &self,
    id: &ProjectId,
    updates: &Value,
    _access_token: &str,
  ) -> std::result::Result<(u16, Value), UpstreamError> {
    self.updates.lock().unwrap().push((id.clone(), updates.clone()));
    let status = rejected(*self.update_status.lock().unwrap(), id)?;
    Ok((status, json!({"id": id, "updated": true})))
  }

  async fn delete_project(
    &self,
    id: &ProjectId,
    _access_token: &str,
  ) -> std::result::Result<u16, UpstreamError> {
    self.deletes.lock().unwrap().push(id.clone());
    rejected(*self.delete_status.lock().unwrap(), id)
  }

  async fn projects_updated_after(
    &self,
    _since: DateTime<Utc>,
    _access_token: &str,
  ) -> std::result::Result<Vec<Value>, UpstreamError> {
    Ok(self.updated_after.lock().unwrap().clone())
  }
}
