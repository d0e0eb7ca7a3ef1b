//! OAuth2 token endpoint client (authorization-code and refresh grants).

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::Credential;
use crate::config::OAuthConfig;
use crate::error::UpstreamError;

/// A validated token endpoint response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
  pub access_token: String,
  pub refresh_token: String,
  pub scope: String,
  /// Seconds since the epoch, as reported by the server
  pub created_at: Option<i64>,
  /// Lifetime in seconds
  pub expires_in: i64,
}

impl TokenGrant {
  /// Build the credential this grant describes. Grants without `created_at`
  /// are stamped with `now`. Fails when the expiry instant is out of range.
  pub fn into_credential(self, now: DateTime<Utc>) -> Result<Credential, String> {
    let issued_at = issued_at(self.created_at).unwrap_or(now);
    let lifetime = lifetime_of(issued_at, self.expires_in)?;
    Ok(Credential {
      access_token: self.access_token,
      refresh_token: self.refresh_token,
      scope: self.scope,
      issued_at,
      lifetime,
    })
  }
}

fn issued_at(created_at: Option<i64>) -> Option<DateTime<Utc>> {
  created_at.and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
}

/// Lifetime of a token issued at `issued_at`, provided its expiry is representable.
pub(super) fn lifetime_of(issued_at: DateTime<Utc>, secs: i64) -> Result<Duration, String> {
  Duration::try_seconds(secs)
    .filter(|lifetime| issued_at.checked_add_signed(*lifetime).is_some())
    .ok_or_else(|| format!("expires_in out of range: {}", secs))
}

/// Raw token endpoint payload; every field is checked before use.
#[derive(Debug, Deserialize)]
struct TokenResponse {
  access_token: Option<String>,
  refresh_token: Option<String>,
  expires_in: Option<i64>,
  #[serde(default)]
  scope: Option<String>,
  #[serde(default)]
  created_at: Option<i64>,
}

impl TokenResponse {
  fn validate(self) -> Result<TokenGrant, String> {
    let access_token = self
      .access_token
      .filter(|t| !t.is_empty())
      .ok_or("missing access_token")?;
    let refresh_token = self
      .refresh_token
      .filter(|t| !t.is_empty())
      .ok_or("missing refresh_token")?;
    let expires_in = self
      .expires_in
      .filter(|secs| *secs > 0)
      .ok_or("missing or non-positive expires_in")?;
    lifetime_of(issued_at(self.created_at).unwrap_or_else(Utc::now), expires_in)?;
    Ok(TokenGrant {
      access_token,
      refresh_token,
      scope: self.scope.unwrap_or_default(),
      created_at: self.created_at,
      expires_in,
    })
  }
}

/// Exchanges with the upstream authorization server.
#[async_trait]
pub trait TokenExchange: Send + Sync {
  /// Trade an authorization code for the first token set.
  async fn exchange_code(&self, code: &str) -> Result<TokenGrant, UpstreamError>;

  /// Trade a refresh token for a new token set.
  async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, UpstreamError>;
}

/// Token endpoint client.
pub struct OAuthClient {
  http: reqwest::Client,
  client_id: String,
  client_secret: String,
  redirect_uri: String,
  token_url: String,
}

impl OAuthClient {
  pub fn new(http: reqwest::Client, config: &OAuthConfig, client_secret: String) -> Self {
    Self {
      http,
      client_id: config.client_id.clone(),
      client_secret,
      redirect_uri: config.redirect_uri.clone(),
      token_url: config.token_url.clone(),
    }
  }

  async fn post_grant(&self, grant: &[(&str, &str)]) -> Result<TokenGrant, UpstreamError> {
    let mut form: Vec<(&str, &str)> = vec![
      ("client_id", self.client_id.as_str()),
      ("client_secret", self.client_secret.as_str()),
      ("redirect_uri", self.redirect_uri.as_str()),
    ];
    form.extend_from_slice(grant);

    let response = self
      .http
      .post(&self.token_url)
      .form(&form)
      .send()
      .await
      .map_err(|e| UpstreamError::transport(&self.token_url, &e))?;

    let status = response.status();
    let body = response
      .text()
      .await
      .map_err(|e| UpstreamError::transport(&self.token_url, &e))?;

    if !status.is_success() {
      return Err(UpstreamError::Status {
        url: self.token_url.clone(),
        status: status.as_u16(),
        body,
      });
    }

    let parsed: TokenResponse =
      serde_json::from_str(&body).map_err(|e| UpstreamError::decode(&self.token_url, e))?;
    parsed
      .validate()
      .map_err(|msg| UpstreamError::decode(&self.token_url, msg))
  }
}

#[async_trait]
impl TokenExchange for OAuthClient {
  async fn exchange_code(&self, code: &str) -> Result<TokenGrant, UpstreamError> {
    debug!(url = %self.token_url, "exchanging authorization code");
    self
      .post_grant(&[("grant_type", "authorization_code"), ("code", code)])
      .await
  }

  async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, UpstreamError> {
    debug!(url = %self.token_url, "requesting token refresh");
    self
      .post_grant(&[
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
      ])
      .await
  }
}

/// URL the user visits to grant access and obtain an authorization code.
pub fn authorization_url(config: &OAuthConfig) -> Result<Url, url::ParseError> {
  let scope = config.scopes.join(" ");
  Url::parse_with_params(
    &config.authorization_url,
    &[
      ("client_id", config.client_id.as_str()),
      ("redirect_uri", config.redirect_uri.as_str()),
      ("response_type", "code"),
      ("scope", scope.as_str()),
    ],
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use mockito::Matcher;

  fn oauth_config(base: &str) -> OAuthConfig {
    OAuthConfig {
      client_id: "client-1".to_string(),
      redirect_uri: "http://localhost:3000/oauth/callback".to_string(),
      authorization_url: format!("{}/oauth/authorize", base),
      token_url: format!("{}/oauth/token", base),
      scopes: vec!["api".to_string(), "read_repository".to_string()],
    }
  }

  #[test]
  fn test_authorization_url_params() {
    let url = authorization_url(&oauth_config("https://gitlab.example")).unwrap();
    assert_eq!(url.path(), "/oauth/authorize");
    let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    assert!(pairs.contains(&("client_id".into(), "client-1".into())));
    assert!(pairs.contains(&("response_type".into(), "code".into())));
    assert!(pairs.contains(&("scope".into(), "api read_repository".into())));
    assert!(pairs.contains(&(
      "redirect_uri".into(),
      "http://localhost:3000/oauth/callback".into()
    )));
  }

  #[test]
  fn test_grant_without_created_at_uses_now() {
    let now = Utc::now();
    let grant = TokenGrant {
      access_token: "a".into(),
      refresh_token: "r".into(),
      scope: "api".into(),
      created_at: None,
      expires_in: 7200,
    };
    let credential = grant.into_credential(now).unwrap();
    assert_eq!(credential.issued_at, now);
    assert_eq!(credential.expires_at(), now + Duration::seconds(7200));
  }

  #[test]
  fn test_validate_rejects_incomplete_payload() {
    let response: TokenResponse =
      serde_json::from_str(r#"{"access_token":"a","expires_in":7200}"#).unwrap();
    assert_eq!(response.validate().unwrap_err(), "missing refresh_token");
  }

  #[test]
  fn test_validate_rejects_unrepresentable_lifetime() {
    let response: TokenResponse = serde_json::from_str(
      r#"{"access_token":"a","refresh_token":"r","expires_in":10000000000000000}"#,
    )
    .unwrap();
    assert!(response.validate().unwrap_err().contains("out of range"));

    let response: TokenResponse = serde_json::from_str(
      r#"{"access_token":"a","refresh_token":"r","expires_in":10000000000000,"created_at":1700000000}"#,
    )
    .unwrap();
    assert!(response.validate().unwrap_err().contains("out of range"));
  }

  #[test]
  fn test_overflowing_grant_not_converted() {
    let grant = TokenGrant {
      access_token: "a".into(),
      refresh_token: "r".into(),
      scope: "api".into(),
      created_at: None,
      expires_in: 10_000_000_000_000,
    };
    assert!(grant.into_credential(Utc::now()).is_err());
  }

  #[tokio::test]
  async fn test_refresh_posts_refresh_grant() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
      .mock("POST", "/oauth/token")
      .match_body(Matcher::AllOf(vec![
        Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
        Matcher::UrlEncoded("refresh_token".into(), "r1".into()),
        Matcher::UrlEncoded("client_id".into(), "client-1".into()),
        Matcher::UrlEncoded("client_secret".into(), "shh".into()),
      ]))
      .with_status(200)
      .with_header("content-type", "application/json")
      .with_body(
        r#"{"access_token":"a2","token_type":"Bearer","expires_in":7200,"refresh_token":"r2","scope":"api","created_at":1700000000}"#,
      )
      .create_async()
      .await;

    let client = OAuthClient::new(
      reqwest::Client::new(),
      &oauth_config(&server.url()),
      "shh".to_string(),
    );
    let grant = client.refresh("r1").await.unwrap();
    mock.assert_async().await;

    assert_eq!(
      grant,
      TokenGrant {
        access_token: "a2".into(),
        refresh_token: "r2".into(),
        scope: "api".into(),
        created_at: Some(1_700_000_000),
        expires_in: 7200,
      }
    );
  }

  #[tokio::test]
  async fn test_refresh_rejection_carries_status_and_body() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
      .mock("POST", "/oauth/token")
      .with_status(400)
      .with_body(r#"{"error":"invalid_grant"}"#)
      .create_async()
      .await;

    let client = OAuthClient::new(
      reqwest::Client::new(),
      &oauth_config(&server.url()),
      "shh".to_string(),
    );
    let err = client.refresh("stale").await.unwrap_err();
    assert_eq!(err.status(), Some(400));
    assert!(err.body().unwrap().contains("invalid_grant"));
  }

  #[tokio::test]
  async fn test_malformed_grant_is_decode_error() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
      .mock("POST", "/oauth/token")
      .with_status(200)
      .with_body(r#"{"token_type":"Bearer"}"#)
      .create_async()
      .await;

    let client = OAuthClient::new(
      reqwest::Client::new(),
      &oauth_config(&server.url()),
      "shh".to_string(),
    );
    let err = client.exchange_code("code-1").await.unwrap_err();
    assert!(matches!(err, UpstreamError::Decode { .. }));
  }
}
