//! GitLab REST API access: entity fetchers, project listing and mutations.

mod client;

pub use client::{GitLabClient, KindFetcher};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheKind, CacheRegistry, EntityFetcher};
use crate::config::GitLabConfig;
use crate::error::Result;

/// Shared HTTP client for GitLab and its OAuth endpoints.
pub fn http_client(config: &GitLabConfig) -> reqwest::Result<reqwest::Client> {
  reqwest::Client::builder()
    .timeout(Duration::from_secs(config.timeout_secs))
    .user_agent(concat!("glq/", env!("CARGO_PKG_VERSION")))
    .build()
}

/// Wire every cache kind to its GitLab endpoint.
pub fn registry(client: &GitLabClient) -> Result<CacheRegistry> {
  let fetchers: HashMap<CacheKind, Arc<dyn EntityFetcher>> = CacheKind::ALL
    .into_iter()
    .map(|kind| {
      let fetcher: Arc<dyn EntityFetcher> = Arc::new(KindFetcher::new(client.clone(), kind));
      (kind, fetcher)
    })
    .collect();
  CacheRegistry::new(Arc::new(client.clone()), fetchers)
}
