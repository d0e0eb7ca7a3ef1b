//! Cache orchestration: bootstrap, time-based refresh, targeted invalidation
//! and read queries across the per-kind stores.

use chrono::Utc;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use super::clock::RefreshClock;
use super::registry::CacheRegistry;
use super::traits::{CacheKind, CacheRecord, ProjectId};
use crate::credentials::TokenSource;
use crate::error::{Error, Result, UpstreamError};

const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 8;

/// Outcome of [`CacheOrchestrator::initialize_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitReport {
  /// Projects loaded into the project store
  pub projects: usize,
  /// Per-project, per-kind fetches that failed and were left absent
  pub failures: usize,
}

/// Outcome of refreshing every kind for one project.
#[derive(Debug)]
pub struct UpdateReport {
  pub project_id: ProjectId,
  pub updated: Vec<CacheKind>,
  pub failed: Vec<(CacheKind, UpstreamError)>,
}

impl UpdateReport {
  pub fn is_complete(&self) -> bool {
    self.failed.is_empty()
  }
}

/// Outcome of [`CacheOrchestrator::refresh_by_time`].
#[derive(Debug)]
pub enum RefreshOutcome {
  /// The interval has not elapsed, or another pass just completed
  NotDue,
  /// Upstream reported no changed projects; only the clock moved
  NothingUpdated,
  Refreshed {
    projects: usize,
    failed_projects: Vec<ProjectId>,
  },
  /// The changed-project listing failed; the clock was not advanced
  ListingFailed(UpstreamError),
}

/// Owns every cache store and the refresh clock.
///
/// All batch operations fan out with settle-independently semantics: every
/// fetch is attempted, a failing fetch never aborts its siblings, and the
/// outcome is reported per item. Concurrent writers to the same project and
/// kind are last-writer-wins.
pub struct CacheOrchestrator {
  registry: CacheRegistry,
  clock: RefreshClock,
  tokens: Arc<dyn TokenSource>,
  max_concurrent_fetches: usize,
}

impl CacheOrchestrator {
  pub fn new(registry: CacheRegistry, clock: RefreshClock, tokens: Arc<dyn TokenSource>) -> Self {
    Self {
      registry,
      clock,
      tokens,
      max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
    }
  }

  /// Bound the number of in-flight upstream fetches within a per-project fan-out.
  pub fn with_max_concurrent_fetches(mut self, limit: usize) -> Self {
    self.max_concurrent_fetches = limit.max(1);
    self
  }

  #[cfg(test)]
  pub fn registry(&self) -> &CacheRegistry {
    &self.registry
  }

  #[cfg(test)]
  pub fn clock(&self) -> &RefreshClock {
    &self.clock
  }

  /// Load the project list, then every other kind for every known project.
  ///
  /// Failing to list projects is fatal. Individual fetches in the second
  /// phase are not: they are logged, counted and leave the entry absent.
  #[instrument(skip(self))]
  pub async fn initialize_all(&self) -> Result<InitReport> {
    let started = Utc::now();
    let token = self.tokens.access_token();

    let projects = self
      .registry
      .lister()
      .fetch_all(&token)
      .await
      .map_err(|e| {
        error!(error = %e, "failed to load project list");
        Error::CacheInit(e)
      })?;

    let project_store = self.registry.store(CacheKind::Project);
    let mut ids = Vec::with_capacity(projects.len());
    for project in projects {
      match ProjectId::of_payload(&project) {
        Some(id) => {
          project_store.insert(id.clone(), project);
          ids.push(id);
        }
        None => warn!("project payload without an id, skipping"),
      }
    }
    info!(projects = ids.len(), "project cache initialized");

    let mut failures = 0;
    for kind in CacheKind::ALL {
      if kind == CacheKind::Project {
        continue;
      }
      for (id, result) in self.fetch_for_projects(kind, &ids, &token).await {
        match result {
          Ok(payload) => {
            self.registry.store(kind).insert(id, payload);
          }
          Err(e) => {
            failures += 1;
            warn!(%kind, project = %id, error = %e, "initial fetch failed, entry left absent");
          }
        }
      }
      debug!(%kind, entries = self.registry.store(kind).len(), "cache initialized");
    }

    self.clock.advance_to(started);
    info!(projects = ids.len(), failures, "all caches initialized");
    Ok(InitReport {
      projects: ids.len(),
      failures,
    })
  }

  async fn fetch_for_projects(
    &self,
    kind: CacheKind,
    ids: &[ProjectId],
    token: &str,
  ) -> Vec<(ProjectId, std::result::Result<Value, UpstreamError>)> {
    let fetcher = self.registry.fetcher(kind);
    stream::iter(ids.iter().cloned())
      .map(|id| async move {
        let result = fetcher.fetch(&id, token).await;
        (id, result)
      })
      .buffer_unordered(self.max_concurrent_fetches)
      .collect()
      .await
  }

  /// Re-fetch every kind for one project and overwrite what succeeded.
  ///
  /// A failed fetch leaves the previous entry in place: stale is preferred
  /// over absent.
  #[instrument(skip(self), fields(project = %id))]
  pub async fn update_all_by_id(&self, id: &ProjectId) -> UpdateReport {
    let token = self.tokens.access_token();
    let token = token.as_str();

    let fetches = CacheKind::ALL.into_iter().map(|kind| {
      let fetcher = self.registry.fetcher(kind);
      async move { (kind, fetcher.fetch(id, token).await) }
    });
    let results = join_all(fetches).await;

    let mut report = UpdateReport {
      project_id: id.clone(),
      updated: Vec::new(),
      failed: Vec::new(),
    };
    for (kind, result) in results {
      match result {
        Ok(payload) => {
          self.registry.store(kind).insert(id.clone(), payload);
          report.updated.push(kind);
        }
        Err(e) => {
          warn!(%kind, error = %e, "refresh failed, keeping previous entry");
          report.failed.push((kind, e));
        }
      }
    }
    debug!(
      updated = report.updated.len(),
      failed = report.failed.len(),
      "project caches updated"
    );
    report
  }

  /// Drop a project from every store. Returns how many entries were removed.
  #[instrument(skip(self), fields(project = %id))]
  pub fn remove_project_from_caches(&self, id: &ProjectId) -> usize {
    let mut removed = 0;
    for store in self.registry.stores() {
      if store.remove(id).is_some() {
        debug!(kind = %store.kind(), "entry removed");
        removed += 1;
      }
    }
    info!(removed, "project removed from caches");
    removed
  }

  pub fn update_needed(&self) -> bool {
    self.clock.is_due()
  }

  /// Refresh every project upstream reports as changed since the last pass.
  ///
  /// Runs at most one pass at a time; a caller that waited for another pass
  /// re-checks the clock and returns [`RefreshOutcome::NotDue`]. The clock is
  /// advanced once the fan-out has settled, whatever the per-project results.
  #[instrument(skip(self))]
  pub async fn refresh_by_time(&self) -> RefreshOutcome {
    let _pass = self.clock.begin_pass().await;
    if !self.clock.is_due() {
      debug!(interval = %self.clock.interval(), "refreshed by a concurrent pass");
      return RefreshOutcome::NotDue;
    }

    let since = self.clock.last_refresh();
    let token = self.tokens.access_token();
    let changed = match self
      .registry
      .lister()
      .fetch_updated_after(since, &token)
      .await
    {
      Ok(projects) => projects,
      Err(e) => {
        warn!(error = %e, %since, "failed to list updated projects, will retry next cycle");
        return RefreshOutcome::ListingFailed(e);
      }
    };

    if changed.is_empty() {
      self.clock.advance_to(Utc::now());
      debug!(%since, "no projects updated");
      return RefreshOutcome::NothingUpdated;
    }

    let ids: Vec<ProjectId> = changed
      .iter()
      .filter_map(|project| {
        let id = ProjectId::of_payload(project);
        if id.is_none() {
          warn!("updated project payload without an id, skipping");
        }
        id
      })
      .collect();

    let reports: Vec<UpdateReport> = stream::iter(ids)
      .map(|id| async move { self.update_all_by_id(&id).await })
      .buffer_unordered(self.max_concurrent_fetches)
      .collect()
      .await;

    let failed_projects: Vec<ProjectId> = reports
      .iter()
      .filter(|r| !r.is_complete())
      .map(|r| r.project_id.clone())
      .collect();
    for id in &failed_projects {
      warn!(project = %id, "project refresh incomplete");
    }

    self.clock.advance_to(Utc::now());
    info!(
      projects = reports.len(),
      failed = failed_projects.len(),
      "cache refresh pass complete"
    );
    RefreshOutcome::Refreshed {
      projects: reports.len(),
      failed_projects,
    }
  }

  /// Answer a read query across one or more stores.
  ///
  /// With no ids (or a single empty id) every entry of every requested store
  /// is returned. Otherwise one record per id and kind, with `data: None`
  /// where nothing is cached.
  pub fn get_info_from_caches(
    &self,
    kinds: &[CacheKind],
    ids: &[ProjectId],
  ) -> Result<Vec<CacheRecord>> {
    if kinds.is_empty() {
      return Err(Error::InvalidQuery(
        "at least one cache kind is required".to_string(),
      ));
    }

    let mut unique: Vec<CacheKind> = Vec::with_capacity(kinds.len());
    for kind in kinds {
      if !unique.contains(kind) {
        unique.push(*kind);
      }
    }

    let dump = ids.is_empty() || (ids.len() == 1 && ids[0].is_empty());
    let mut records = Vec::new();

    if dump {
      for kind in unique {
        records.extend(
          self
            .registry
            .store(kind)
            .snapshot()
            .into_iter()
            .map(|(project_id, data)| CacheRecord {
              kind,
              project_id,
              data: Some(data),
            }),
        );
      }
    } else {
      for id in ids {
        for kind in &unique {
          records.push(CacheRecord {
            kind: *kind,
            project_id: id.clone(),
            data: self.registry.store(*kind).get(id),
          });
        }
      }
    }

    Ok(records)
  }
}
