use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "settings.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_url: String,
    pub mailbox: MailboxConfig,
    pub oauth: OAuthConfig,
    pub retry: RetryConfig,
    pub services: ServicesConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    pub api_base: String,
    pub page_size: u32,
    pub request_timeout_secs: u64,
    /// host:port dialled to decide whether the machine is online.
    pub connectivity_probe: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
    /// Installed-app client secret JSON used by `login`.
    pub secret_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub factor: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub classify_endpoint: String,
    pub draft_endpoint: String,
    pub timeout_secs: u64,
    /// Language of the canned reply used when draft generation fails ("en" or "fr").
    pub language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub foreground_interval_secs: u64,
    pub background_interval_secs: u64,
    pub auth_failure_threshold: u32,
    pub session_ttl_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite:mailpilot.db?mode=rwc".to_string(),
            mailbox: MailboxConfig::default(),
            oauth: OAuthConfig::default(),
            retry: RetryConfig::default(),
            services: ServicesConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            api_base: "https://gmail.googleapis.com/gmail/v1/users/me".to_string(),
            page_size: 20,
            request_timeout_secs: 30,
            connectivity_probe: "gmail.googleapis.com:443".to_string(),
        }
    }
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            secret_path: "credentials.json".to_string(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            factor: 2,
        }
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            classify_endpoint: String::new(),
            draft_endpoint: String::new(),
            timeout_secs: 20,
            language: "en".to_string(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            foreground_interval_secs: 60,
            background_interval_secs: 300,
            auth_failure_threshold: 3,
            session_ttl_days: crate::models::SESSION_TTL_DAYS,
        }
    }
}

impl MailboxConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl ServicesConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Reads `path`; a missing file yields the defaults, a malformed one is an error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }
}
