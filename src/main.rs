mod cache;
mod config;
mod credentials;
mod error;
mod gitlab;
mod handler;
mod logging;
#[cfg(test)]
mod test_support;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use cache::{CacheOrchestrator, RefreshClock};
use config::Config;
use credentials::{authorization_url, CredentialManager, CredentialStore, FileCredentialStore, OAuthClient};
use gitlab::GitLabClient;
use handler::{Operation, RequestHandler};

#[derive(Parser, Debug)]
#[command(name = "glq")]
#[command(about = "Answer structured GitLab queries from an in-memory entity cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/glq/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print the URL a user visits to grant access
  AuthorizeUrl,
  /// Exchange an authorization code and store the resulting credential
  Login {
    #[arg(long)]
    code: String,
  },
  /// Load the caches, then answer operations (one JSON object per stdin line
  /// unless one is given as an argument)
  Run {
    operation: Option<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log)?;

  match args.command {
    Command::AuthorizeUrl => {
      println!("{}", authorization_url(&config.oauth)?);
      Ok(())
    }
    Command::Login { code } => login(&config, &code).await,
    Command::Run { operation } => run(&config, operation.as_deref()).await,
  }
}

fn credential_store(config: &Config) -> Result<Arc<FileCredentialStore>> {
  let path = config
    .credentials_path
    .clone()
    .or_else(FileCredentialStore::default_path)
    .ok_or_else(|| eyre!("Cannot determine credential location. Set credentials_path in the config."))?;
  Ok(Arc::new(FileCredentialStore::new(path)))
}

fn oauth_client(config: &Config, http: reqwest::Client) -> Result<Arc<OAuthClient>> {
  Ok(Arc::new(OAuthClient::new(
    http,
    &config.oauth,
    Config::client_secret()?,
  )))
}

async fn login(config: &Config, code: &str) -> Result<()> {
  let http = gitlab::http_client(&config.gitlab)?;
  let exchange = oauth_client(config, http)?;
  let store = credential_store(config)?;

  let credential = CredentialManager::authorize(exchange.as_ref(), store.as_ref(), code).await?;
  println!(
    "Credential {} saved to {} (expires {})",
    credential.fingerprint(),
    store.location().display(),
    credential.expires_at()
  );
  Ok(())
}

async fn run(config: &Config, operation: Option<&str>) -> Result<()> {
  let http = gitlab::http_client(&config.gitlab)?;
  let exchange = oauth_client(config, http.clone())?;
  let store = credential_store(config)?;

  let credentials = Arc::new(CredentialManager::load(exchange, store).await?);
  match credentials.ensure_valid().await {
    // Same as per request: keep going with the live, unsaved credential.
    Err(e @ error::Error::Persist { .. }) => warn!(error = %e, "continuing with unsaved credential"),
    other => {
      other?;
    }
  }

  let gitlab = GitLabClient::new(http, &config.gitlab.api_url);
  let cache = Arc::new(
    CacheOrchestrator::new(
      gitlab::registry(&gitlab)?,
      RefreshClock::new(config.update_interval()?),
      credentials.clone(),
    )
    .with_max_concurrent_fetches(config.cache.max_concurrent_fetches),
  );

  let report = cache.initialize_all().await?;
  info!(projects = report.projects, failures = report.failures, "caches initialized");

  let handler = RequestHandler::new(credentials, cache, Arc::new(gitlab));

  if let Some(operation) = operation {
    println!("{}", answer(&handler, operation).await);
    return Ok(());
  }

  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  while let Some(line) = lines.next_line().await? {
    if line.trim().is_empty() {
      continue;
    }
    println!("{}", answer(&handler, &line).await);
  }
  Ok(())
}

/// Decode and handle one operation, rendering failures as JSON too.
async fn answer(handler: &RequestHandler, input: &str) -> Value {
  let op: Operation = match serde_json::from_str(input) {
    Ok(op) => op,
    Err(e) => return json!({ "error": format!("malformed operation: {}", e), "status": 400 }),
  };

  match handler.handle(op).await {
    Ok(response) => response,
    Err(e) => {
      error!(error = %e, "operation failed");
      json!({ "error": e.to_string(), "status": e.http_status() })
    }
  }
}
