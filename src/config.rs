use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub gitlab: GitLabConfig,
  pub oauth: OAuthConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  /// Where the OAuth credential is persisted (defaults to the user data dir)
  pub credentials_path: Option<PathBuf>,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitLabConfig {
  #[serde(default = "default_api_url")]
  pub api_url: String,
  /// Per-request timeout for upstream calls
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for GitLabConfig {
  fn default() -> Self {
    Self {
      api_url: default_api_url(),
      timeout_secs: default_timeout_secs(),
    }
  }
}

fn default_api_url() -> String {
  "https://gitlab.com/api/v4".to_string()
}

fn default_timeout_secs() -> u64 {
  5
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
  pub client_id: String,
  pub redirect_uri: String,
  #[serde(default = "default_authorization_url")]
  pub authorization_url: String,
  #[serde(default = "default_token_url")]
  pub token_url: String,
  #[serde(default = "default_scopes")]
  pub scopes: Vec<String>,
}

fn default_authorization_url() -> String {
  "https://gitlab.com/oauth/authorize".to_string()
}

fn default_token_url() -> String {
  "https://gitlab.com/oauth/token".to_string()
}

fn default_scopes() -> Vec<String> {
  vec!["api".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Minimum time between time-based refresh passes
  #[serde(default = "default_update_interval")]
  pub update_interval_minutes: u64,
  /// Upper bound on in-flight fetches when fanning out across projects
  #[serde(default = "default_max_concurrent_fetches")]
  pub max_concurrent_fetches: usize,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      update_interval_minutes: default_update_interval(),
      max_concurrent_fetches: default_max_concurrent_fetches(),
    }
  }
}

fn default_update_interval() -> u64 {
  10
}

fn default_max_concurrent_fetches() -> usize {
  8
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// Default filter when RUST_LOG is unset
  #[serde(default = "default_log_level")]
  pub level: String,
  /// When set, logs are also written to a daily rolling file here
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      directory: None,
    }
  }
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./glq.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/glq/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/glq/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("glq.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("glq").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
    let config = Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;
    config
      .update_interval()
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))?;
    Ok(config)
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Get the OAuth client secret from environment variables.
  ///
  /// Checks GLQ_CLIENT_SECRET first, then GITLAB_CLIENT_SECRET as fallback.
  pub fn client_secret() -> Result<String> {
    std::env::var("GLQ_CLIENT_SECRET")
      .or_else(|_| std::env::var("GITLAB_CLIENT_SECRET"))
      .map_err(|_| {
        eyre!(
          "OAuth client secret not found. Set GLQ_CLIENT_SECRET or GITLAB_CLIENT_SECRET environment variable."
        )
      })
  }

  pub fn update_interval(&self) -> Result<chrono::Duration> {
    let minutes = self.cache.update_interval_minutes;
    i64::try_from(minutes)
      .ok()
      .and_then(chrono::Duration::try_minutes)
      .ok_or_else(|| eyre!("cache.update_interval_minutes is out of range: {}", minutes))
  }
}
