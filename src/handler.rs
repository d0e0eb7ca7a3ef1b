//! Dispatch of classified operations against the cache and upstream.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheKind, CacheOrchestrator, ProjectId, RefreshOutcome};
use crate::credentials::CredentialManager;
use crate::error::{Error, Result, UpstreamError};

const UNSUPPORTED_MESSAGE: &str = "Operation not supported or missing details";

/// Project mutations and the changed-since listing.
///
/// A non-2xx answer is an [`UpstreamError::Status`]. The statuses returned on
/// success let callers tell an applied change (200) from a scheduled one (202).
#[async_trait]
pub trait RepositoryAdmin: Send + Sync {
  /// Returns the upstream status together with its response body.
  async fn update_project(
    &self,
    id: &ProjectId,
    updates: &Value,
    access_token: &str,
  ) -> std::result::Result<(u16, Value), UpstreamError>;

  async fn delete_project(
    &self,
    id: &ProjectId,
    access_token: &str,
  ) -> std::result::Result<u16, UpstreamError>;

  async fn projects_updated_after(
    &self,
    since: DateTime<Utc>,
    access_token: &str,
  ) -> std::result::Result<Vec<Value>, UpstreamError>;
}

/// A request already classified into one of the supported operations.
///
/// Decodes from `{"operation": NAME, "parameters": {...}}`. Unknown names and
/// known names with missing or malformed parameters become `Unsupported`.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
  MoreInfo {
    caches: Vec<CacheKind>,
    project_ids: Vec<ProjectId>,
  },
  UpdateRepository {
    project_id: ProjectId,
    updates: Value,
  },
  DeleteRepository {
    project_id: ProjectId,
  },
  UpdatedAfter {
    updated_at: String,
  },
  AppInfo {
    message: Value,
  },
  Unsupported,
}

#[derive(Deserialize)]
struct RawOperation {
  #[serde(default)]
  operation: String,
  #[serde(default)]
  parameters: Value,
  #[serde(default)]
  message: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoreInfoParams {
  caches: Vec<CacheKind>,
  #[serde(default)]
  project_ids: Vec<ProjectId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateParams {
  project_id: ProjectId,
  updates: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteParams {
  project_id: ProjectId,
}

#[derive(Deserialize)]
struct UpdatedAfterParams {
  updated_at: String,
}

impl From<RawOperation> for Operation {
  fn from(raw: RawOperation) -> Self {
    let params = raw.parameters;
    let decoded = match raw.operation.as_str() {
      "MORE_INFO_OPERATION" => serde_json::from_value::<MoreInfoParams>(params)
        .map(|p| Operation::MoreInfo {
          caches: p.caches,
          project_ids: p.project_ids,
        }),
      "UPDATE_REPOSITORY" => {
        serde_json::from_value::<UpdateParams>(params).map(|p| Operation::UpdateRepository {
          project_id: p.project_id,
          updates: p.updates,
        })
      }
      "DELETE_REPOSITORY" => serde_json::from_value::<DeleteParams>(params)
        .map(|p| Operation::DeleteRepository {
          project_id: p.project_id,
        }),
      "UPDATE_AFTER_REPOSITORY" => serde_json::from_value::<UpdatedAfterParams>(params)
        .map(|p| Operation::UpdatedAfter {
          updated_at: p.updated_at,
        }),
      "APP_INFO" => {
        // The message may sit at the top level or inside the parameters.
        let message = match raw.message {
          Value::Null => params.get("message").cloned().unwrap_or(Value::Null),
          message => message,
        };
        return Operation::AppInfo { message };
      }
      _ => return Operation::Unsupported,
    };

    decoded.unwrap_or_else(|e| {
      debug!(operation = %raw.operation, error = %e, "operation parameters rejected");
      Operation::Unsupported
    })
  }
}

impl<'de> Deserialize<'de> for Operation {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
    RawOperation::deserialize(deserializer).map(Operation::from)
  }
}

impl Operation {
  pub fn name(&self) -> &'static str {
    match self {
      Operation::MoreInfo { .. } => "MORE_INFO_OPERATION",
      Operation::UpdateRepository { .. } => "UPDATE_REPOSITORY",
      Operation::DeleteRepository { .. } => "DELETE_REPOSITORY",
      Operation::UpdatedAfter { .. } => "UPDATE_AFTER_REPOSITORY",
      Operation::AppInfo { .. } => "APP_INFO",
      Operation::Unsupported => "UNSUPPORTED",
    }
  }
}

/// The fields reported for each project changed since a given date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSummary {
  pub id: Value,
  #[serde(default)]
  pub name: Option<String>,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub visibility: Option<String>,
  #[serde(default)]
  pub updated_at: Option<String>,
}

/// Accepts RFC 3339 timestamps or bare `YYYY-MM-DD` dates (midnight UTC).
fn parse_since(value: &str) -> Result<DateTime<Utc>> {
  let value = value.trim();
  if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
    return Ok(ts.with_timezone(&Utc));
  }
  NaiveDate::parse_from_str(value, "%Y-%m-%d")
    .ok()
    .and_then(|d| d.and_hms_opt(0, 0, 0))
    .map(|dt| dt.and_utc())
    .ok_or_else(|| Error::InvalidQuery(format!("unrecognised date: {:?}", value)))
}

pub struct RequestHandler {
  credentials: Arc<CredentialManager>,
  cache: Arc<CacheOrchestrator>,
  admin: Arc<dyn RepositoryAdmin>,
}

impl RequestHandler {
  pub fn new(
    credentials: Arc<CredentialManager>,
    cache: Arc<CacheOrchestrator>,
    admin: Arc<dyn RepositoryAdmin>,
  ) -> Self {
    Self {
      credentials,
      cache,
      admin,
    }
  }

  /// Make the credential and caches current, then run the operation.
  ///
  /// A refreshed credential that could not be saved is still used; the
  /// response then carries a `warning` field saying so.
  #[instrument(skip_all, fields(operation = op.name()))]
  pub async fn handle(&self, op: Operation) -> Result<Value> {
    let (credential, warning) = match self.credentials.ensure_valid().await {
      Ok(credential) => (credential, None),
      Err(Error::Persist { path, source }) => {
        warn!(path = %path.display(), error = %source, "refreshed credential not persisted");
        let warning = format!(
          "refreshed credential was not persisted to {}: {}",
          path.display(),
          source
        );
        (self.credentials.current(), Some(warning))
      }
      Err(e) => return Err(e),
    };

    if self.cache.update_needed() {
      match self.cache.refresh_by_time().await {
        RefreshOutcome::Refreshed {
          projects,
          failed_projects,
        } if !failed_projects.is_empty() => {
          warn!(projects, failed = ?failed_projects, "cache refresh left stale entries")
        }
        RefreshOutcome::Refreshed { projects, .. } => debug!(projects, "cache refresh finished"),
        RefreshOutcome::ListingFailed(e) => warn!(error = %e, "cache refresh skipped"),
        outcome => debug!(?outcome, "cache refresh finished"),
      }
    }

    let response = self.dispatch(op, &credential.access_token).await?;
    Ok(match warning {
      Some(warning) => with_warning(response, warning),
      None => response,
    })
  }

  async fn dispatch(&self, op: Operation, token: &str) -> Result<Value> {
    match op {
      Operation::MoreInfo {
        caches,
        project_ids,
      } => {
        let records = self.cache.get_info_from_caches(&caches, &project_ids)?;
        Ok(json!(records))
      }
      Operation::UpdateRepository {
        project_id,
        updates,
      } => {
        let (status, body) = self
          .admin
          .update_project(&project_id, &updates, token)
          .await?;
        let mut response = json!({ "status": status, "body": body });
        if status == 200 {
          let report = self.cache.update_all_by_id(&project_id).await;
          info!(project = %project_id, refreshed = report.updated.len(), "repository updated");
          response["message"] = json!("Repository updated successfully");
        }
        Ok(response)
      }
      Operation::DeleteRepository { project_id } => {
        let status = self.admin.delete_project(&project_id, token).await?;
        let mut response = json!({ "status": status });
        if status == 202 {
          let removed = self.cache.remove_project_from_caches(&project_id);
          info!(project = %project_id, removed, "repository deleted");
          response["message"] = json!("Repository deleted successfully");
        }
        Ok(response)
      }
      Operation::UpdatedAfter { updated_at } => {
        let since = parse_since(&updated_at)?;
        let projects = self.admin.projects_updated_after(since, token).await?;
        let summaries = projects
          .into_iter()
          .map(serde_json::from_value::<ProjectSummary>)
          .collect::<std::result::Result<Vec<_>, _>>()
          .map_err(|e| UpstreamError::decode("projects?updated_after", e))?;
        Ok(json!(summaries))
      }
      Operation::AppInfo { message } => Ok(json!({ "message": message })),
      Operation::Unsupported => Ok(json!({ "message": UNSUPPORTED_MESSAGE })),
    }
  }
}

/// Objects gain a `warning` field; anything else is wrapped under `data`.
fn with_warning(response: Value, warning: String) -> Value {
  match response {
    Value::Object(mut fields) => {
      fields.insert("warning".to_string(), Value::String(warning));
      Value::Object(fields)
    }
    other => json!({ "data": other, "warning": warning }),
  }
}
