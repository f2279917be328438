use anyhow::{Context, Result};
use clap::Parser;
use reqwest::Url;
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::{DEFAULT_LOGIN_PATH, DEFAULT_LOGOUT_PATH, DEFAULT_REFRESH_PATH};

/// Default profile bootstrap route
pub const DEFAULT_PROFILE_PATH: &str = "/api/user/profile";

/// Auction session client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Marketplace API base URL
    #[arg(short = 'u', long, env = "API_BASE_URL", default_value = "http://localhost:8000")]
    pub base_url: String,

    /// Path to the SQLite file holding the persisted session
    #[arg(short = 'd', long, env = "SESSION_DB_FILE")]
    pub db_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// Profile cache lifetime in seconds
    #[arg(long, env = "PROFILE_CACHE_TTL", default_value = "300")]
    pub profile_cache_ttl: u64,

    /// Adopt this access token before making any call (as after a login)
    #[arg(short = 't', long)]
    pub token: Option<String>,

    /// Protected paths to fetch concurrently after the profile bootstrap
    #[arg(short = 'g', long = "get")]
    pub get: Vec<String>,

    /// Log out when done
    #[arg(long)]
    pub logout: bool,
}

#[derive(Clone, Debug)]
pub struct Config {
    // API
    pub api_base_url: String,

    // Session persistence
    pub session_db_file: PathBuf,

    // HTTP client
    pub http_max_connections: usize,
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Routes
    pub login_path: String,
    pub refresh_path: String,
    pub logout_path: String,
    pub profile_path: String,

    // Profile bootstrap
    pub profile_cache_ttl: u64,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Clone, Debug, PartialEq)]
pub enum LogFormat {
    Text,
    Json,
}

impl Config {
    /// Build configuration with priority: CLI > ENV > defaults
    ///
    /// Call `dotenvy::dotenv()` before parsing so `.env` values count as ENV.
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let session_db_file = match args.db_file.as_deref() {
            Some(path) => expand_tilde(path),
            None => default_session_db_path()?,
        };

        Ok(Config {
            api_base_url: args.base_url.clone(),
            session_db_file,

            http_max_connections: env_or("HTTP_MAX_CONNECTIONS", 20),
            http_connect_timeout: env_or("HTTP_CONNECT_TIMEOUT", 10),
            http_request_timeout: args.http_timeout,

            login_path: std::env::var("LOGIN_PATH").unwrap_or_else(|_| DEFAULT_LOGIN_PATH.to_string()),
            refresh_path: std::env::var("REFRESH_PATH")
                .unwrap_or_else(|_| DEFAULT_REFRESH_PATH.to_string()),
            logout_path: std::env::var("LOGOUT_PATH")
                .unwrap_or_else(|_| DEFAULT_LOGOUT_PATH.to_string()),
            profile_path: std::env::var("PROFILE_PATH")
                .unwrap_or_else(|_| DEFAULT_PROFILE_PATH.to_string()),

            profile_cache_ttl: args.profile_cache_ttl,

            log_level: args.log_level.clone(),
            log_format: parse_log_format(&args.log_format),
        })
    }

    /// Defaults for embedding and tests: everything but the base URL
    pub fn for_base_url(base_url: &str) -> Self {
        Config {
            api_base_url: base_url.to_string(),
            session_db_file: PathBuf::from("session.sqlite3"),
            http_max_connections: 20,
            http_connect_timeout: 10,
            http_request_timeout: 30,
            login_path: DEFAULT_LOGIN_PATH.to_string(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            logout_path: DEFAULT_LOGOUT_PATH.to_string(),
            profile_path: DEFAULT_PROFILE_PATH.to_string(),
            profile_cache_ttl: 300,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let url = self.base_url()?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("API_BASE_URL must be http or https: {}", self.api_base_url);
        }

        for (name, path) in [
            ("LOGIN_PATH", &self.login_path),
            ("REFRESH_PATH", &self.refresh_path),
            ("LOGOUT_PATH", &self.logout_path),
            ("PROFILE_PATH", &self.profile_path),
        ] {
            if !path.starts_with('/') {
                anyhow::bail!("{} must start with '/': {}", name, path);
            }
        }

        if self.http_request_timeout == 0 {
            anyhow::bail!("HTTP_REQUEST_TIMEOUT must be greater than zero");
        }

        Ok(())
    }

    pub fn base_url(&self) -> Result<Url> {
        Url::parse(&self.api_base_url)
            .with_context(|| format!("Invalid API_BASE_URL: {}", self.api_base_url))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.http_request_timeout)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.http_connect_timeout)
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// `<data dir>/auction-session/session.sqlite3`
fn default_session_db_path() -> Result<PathBuf> {
    let data_dir = dirs::data_local_dir().context("Could not find data directory")?;
    Ok(data_dir.join("auction-session").join("session.sqlite3"))
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Parse log format from string
fn parse_log_format(s: &str) -> LogFormat {
    match s.to_lowercase().as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    }
}
