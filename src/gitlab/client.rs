use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, RequestBuilder};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::cache::{CacheKind, EntityFetcher, ProjectId, ProjectLister};
use crate::error::UpstreamError;
use crate::handler::RepositoryAdmin;

const PER_PAGE: &str = "100";
const NO_QUERY: &[(&str, &str)] = &[];
const RECURSIVE: &[(&str, &str)] = &[("recursive", "true")];

/// GitLab REST API client for the project-scoped endpoints.
#[derive(Clone)]
pub struct GitLabClient {
  http: reqwest::Client,
  api_url: String,
}

impl GitLabClient {
  pub fn new(http: reqwest::Client, api_url: &str) -> Self {
    Self {
      http,
      api_url: api_url.trim_end_matches('/').to_string(),
    }
  }

  /// `{api_url}/projects[/{id}]/{segments..}`. The id is one path segment, so
  /// a `group/name` path is sent as `group%2Fname`.
  fn projects_url(&self, id: Option<&ProjectId>, segments: &[&str]) -> Result<String, UpstreamError> {
    let mut url = Url::parse(&self.api_url).map_err(|e| UpstreamError::decode(&self.api_url, e))?;
    {
      let mut path = url
        .path_segments_mut()
        .map_err(|_| UpstreamError::decode(&self.api_url, "not a base URL"))?;
      path.pop_if_empty().push("projects");
      if let Some(id) = id {
        path.push(id.as_str());
      }
      path.extend(segments);
    }
    Ok(url.into())
  }

  fn request(&self, method: Method, url: &str, access_token: &str) -> RequestBuilder {
    self.http.request(method, url).bearer_auth(access_token)
  }

  /// Send a request and return the status and raw body, failing on non-2xx.
  async fn send(&self, builder: RequestBuilder, url: &str) -> Result<Response, UpstreamError> {
    let response = builder
      .send()
      .await
      .map_err(|e| UpstreamError::transport(url, &e))?;

    let status = response.status();
    let content_type = response
      .headers()
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let next_page = response
      .headers()
      .get("x-next-page")
      .and_then(|v| v.to_str().ok())
      .map(str::trim)
      .filter(|v| !v.is_empty())
      .map(String::from);
    let body = response
      .text()
      .await
      .map_err(|e| UpstreamError::transport(url, &e))?;

    if !status.is_success() {
      return Err(UpstreamError::Status {
        url: url.to_string(),
        status: status.as_u16(),
        body,
      });
    }

    Ok(Response {
      status: status.as_u16(),
      content_type,
      next_page,
      body,
    })
  }

  async fn get_json(&self, url: &str, access_token: &str) -> Result<Value, UpstreamError> {
    let response = self
      .send(self.request(Method::GET, url, access_token), url)
      .await?;
    response.json(url)
  }

  /// Follow `x-next-page` until exhausted, concatenating the pages.
  async fn get_all_pages(
    &self,
    url: &str,
    query: &[(&str, &str)],
    access_token: &str,
  ) -> Result<Vec<Value>, UpstreamError> {
    let mut items = Vec::new();
    let mut page = "1".to_string();

    loop {
      let mut page_url = Url::parse(url).map_err(|e| UpstreamError::decode(url, e))?;
      page_url
        .query_pairs_mut()
        .extend_pairs(query)
        .append_pair("per_page", PER_PAGE)
        .append_pair("page", &page);
      let page_url = page_url.to_string();

      let response = self
        .send(self.request(Method::GET, &page_url, access_token), &page_url)
        .await?;
      let next_page = response.next_page.clone();

      match response.json(&page_url)? {
        Value::Array(values) => items.extend(values),
        other => {
          return Err(UpstreamError::decode(
            &page_url,
            format!("expected a JSON array, got {}", json_type(&other)),
          ))
        }
      }

      match next_page {
        Some(next) if next != page => page = next,
        _ => break,
      }
    }

    debug!(url, items = items.len(), "fetched all pages");
    Ok(items)
  }

  /// Fetch the payload cached for one entity family of a project.
  pub async fn fetch_entity(
    &self,
    kind: CacheKind,
    id: &ProjectId,
    access_token: &str,
  ) -> Result<Value, UpstreamError> {
    let (segments, query): (&[&str], _) = match kind {
      CacheKind::Project => {
        return self
          .get_json(&self.projects_url(Some(id), &[])?, access_token)
          .await
      }
      CacheKind::Commit => (&["repository", "commits"], NO_QUERY),
      CacheKind::Branch => (&["repository", "branches"], NO_QUERY),
      CacheKind::Contributor => (&["repository", "contributors"], NO_QUERY),
      CacheKind::Member => (&["members", "all"], NO_QUERY),
      CacheKind::Tree => (&["repository", "tree"], RECURSIVE),
    };
    let url = self.projects_url(Some(id), segments)?;
    let items = self.get_all_pages(&url, query, access_token).await?;
    Ok(Value::Array(items))
  }
}

struct Response {
  status: u16,
  content_type: Option<String>,
  next_page: Option<String>,
  body: String,
}

impl Response {
  fn json(&self, url: &str) -> Result<Value, UpstreamError> {
    let is_json = self
      .content_type
      .as_deref()
      .is_some_and(|ct| ct.contains("application/json"));
    if !is_json {
      return Err(UpstreamError::decode(
        url,
        format!(
          "expected application/json, got {}",
          self.content_type.as_deref().unwrap_or("no content type")
        ),
      ));
    }
    serde_json::from_str(&self.body).map_err(|e| UpstreamError::decode(url, e))
  }
}

fn json_type(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "a boolean",
    Value::Number(_) => "a number",
    Value::String(_) => "a string",
    Value::Array(_) => "an array",
    Value::Object(_) => "an object",
  }
}

#[async_trait]
impl ProjectLister for GitLabClient {
  async fn fetch_all(&self, access_token: &str) -> Result<Vec<Value>, UpstreamError> {
    let url = self.projects_url(None, &[])?;
    self
      .get_all_pages(&url, &[("membership", "true")], access_token)
      .await
  }

  async fn fetch_updated_after(
    &self,
    since: DateTime<Utc>,
    access_token: &str,
  ) -> Result<Vec<Value>, UpstreamError> {
    let url = self.projects_url(None, &[])?;
    let since = since.to_rfc3339_opts(SecondsFormat::Secs, true);
    self
      .get_all_pages(
        &url,
        &[
          ("membership", "true"),
          ("updated_after", since.as_str()),
          ("order_by", "updated_at"),
          ("sort", "desc"),
        ],
        access_token,
      )
      .await
  }
}

#[async_trait]
impl RepositoryAdmin for GitLabClient {
  async fn update_project(
    &self,
    id: &ProjectId,
    updates: &Value,
    access_token: &str,
  ) -> Result<(u16, Value), UpstreamError> {
    let url = self.projects_url(Some(id), &[])?;
    let builder = self.request(Method::PUT, &url, access_token).json(updates);
    let response = self.send(builder, &url).await?;
    let body = response.json(&url)?;
    Ok((response.status, body))
  }

  async fn delete_project(&self, id: &ProjectId, access_token: &str) -> Result<u16, UpstreamError> {
    let url = self.projects_url(Some(id), &[])?;
    let response = self
      .send(self.request(Method::DELETE, &url, access_token), &url)
      .await?;
    Ok(response.status)
  }

  async fn projects_updated_after(
    &self,
    since: DateTime<Utc>,
    access_token: &str,
  ) -> Result<Vec<Value>, UpstreamError> {
    self.fetch_updated_after(since, access_token).await
  }
}

/// The fetcher registered for one [`CacheKind`].
pub struct KindFetcher {
  client: GitLabClient,
  kind: CacheKind,
}

impl KindFetcher {
  pub fn new(client: GitLabClient, kind: CacheKind) -> Self {
    Self { client, kind }
  }
}

#[async_trait]
impl EntityFetcher for KindFetcher {
  async fn fetch(&self, project_id: &ProjectId, access_token: &str) -> Result<Value, UpstreamError> {
    self
      .client
      .fetch_entity(self.kind, project_id, access_token)
      .await
  }
}
