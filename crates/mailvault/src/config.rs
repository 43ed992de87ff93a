//! Archive configuration and Gmail client credentials
//!
//! The archive config lives in `~/.config/mailvault/config.json`. Gmail
//! OAuth client credentials are loaded (in order of priority) from:
//! 1. The secret store, key `client-credentials/gmail`
//! 2. JSON file (Google Cloud Console format) in the config directory
//! 3. Runtime environment variables (fallback)

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::{Account, ProviderKind};
use crate::providers::RetryPolicy;
use crate::secrets::{SecretStore, client_credentials_key};

/// Archive config filename in the config directory
const CONFIG_FILE: &str = "config.json";

/// Credentials filename in the config directory
const CREDENTIALS_FILE: &str = "google-credentials.json";

const CLIENT_ID_VAR: &str = "MAILVAULT_GMAIL_CLIENT_ID";
const CLIENT_SECRET_VAR: &str = "MAILVAULT_GMAIL_CLIENT_SECRET";

/// Top-level archive configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default = "default_archive_root")]
    pub archive_root: PathBuf,
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub sync: SyncSettings,
}

fn default_archive_root() -> PathBuf {
    config::default_archive_root().unwrap_or_else(|| PathBuf::from("mailvault-archive"))
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            archive_root: default_archive_root(),
            accounts: Vec::new(),
            sync: SyncSettings::default(),
        }
    }
}

impl ArchiveConfig {
    /// Load `config.json`, or defaults when it does not exist yet
    pub fn load() -> Result<Self> {
        if !config::config_exists(CONFIG_FILE) {
            return Ok(Self::default());
        }
        config::load_json(CONFIG_FILE)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        config::load_json_file(path)
    }

    pub fn save(&self) -> Result<()> {
        config::save_json(CONFIG_FILE, self)
    }

    /// Reject configurations the engine cannot run safely
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for account in &self.accounts {
            let address = account.address.trim();
            if address.is_empty() {
                bail!("Account address must not be empty");
            }
            if !seen.insert(address.to_lowercase()) {
                bail!("Account {} is configured more than once", address);
            }
            if account.provider == ProviderKind::Imap && account.imap.is_none() {
                bail!("IMAP account {} has no server settings", address);
            }
        }
        if self.sync.batch_size == 0 {
            bail!("sync.batch_size must be at least 1");
        }
        Ok(())
    }

    /// Directory holding the index database
    pub fn index_dir(&self) -> PathBuf {
        self.archive_root.join("index")
    }
}

/// Tuning for sync passes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Messages per fetch/commit batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Concurrent fetches per account (Gmail)
    #[serde(default = "default_fetch_workers")]
    pub fetch_workers: usize,
    /// Attempts per message for transient failures
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
}

fn default_batch_size() -> usize {
    50
}

fn default_fetch_workers() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    100
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            fetch_workers: default_fetch_workers(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
        }
    }
}

impl SyncSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.base_backoff_ms))
    }
}

/// OAuth credentials for Gmail API access
#[derive(Debug, Clone, PartialEq)]
pub struct GmailCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Google Cloud Console credential file format (installed app)
#[derive(Deserialize)]
struct GoogleCredentialFile {
    installed: Option<InstalledCredentials>,
    web: Option<InstalledCredentials>,
}

#[derive(Deserialize)]
struct InstalledCredentials {
    client_id: String,
    client_secret: String,
}

impl GmailCredentials {
    /// Load credentials: secret store, then credentials file, then environment
    pub fn load(secrets: &dyn SecretStore) -> Result<Self> {
        if let Some(json) = secrets.get_string(&client_credentials_key("gmail"))? {
            return Self::from_json(&json);
        }

        if config::config_exists(CREDENTIALS_FILE) {
            let creds: GoogleCredentialFile = config::load_json(CREDENTIALS_FILE)?;
            return Self::from_credential_file(creds);
        }

        Self::from_env()
    }

    /// Load credentials from a specific JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let creds: GoogleCredentialFile = config::load_json_file(path)?;
        Self::from_credential_file(creds)
    }

    fn from_credential_file(creds: GoogleCredentialFile) -> Result<Self> {
        // Desktop ("installed") and "web" client types
        let installed = creds
            .installed
            .or(creds.web)
            .context("Credentials file missing 'installed' or 'web' section")?;

        Ok(Self {
            client_id: installed.client_id,
            client_secret: installed.client_secret,
        })
    }

    /// Parse credentials from JSON string (Google Cloud Console format)
    pub fn from_json(json: &str) -> Result<Self> {
        let creds: GoogleCredentialFile =
            serde_json::from_str(json).context("Failed to parse credentials JSON")?;
        Self::from_credential_file(creds)
    }

    pub fn from_env() -> Result<Self> {
        let client_id = std::env::var(CLIENT_ID_VAR)
            .with_context(|| format!("{} environment variable not set", CLIENT_ID_VAR))?;
        let client_secret = std::env::var(CLIENT_SECRET_VAR)
            .with_context(|| format!("{} environment variable not set", CLIENT_SECRET_VAR))?;

        Ok(Self {
            client_id,
            client_secret,
        })
    }
}
