//! Account model: one remote mailbox archived under a unique address

use serde::{Deserialize, Serialize};

/// Which protocol family an account syncs through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// History-cursor REST API with OAuth
    Gmail,
    /// Per-folder UID sync
    Imap,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Gmail => "gmail",
            ProviderKind::Imap => "imap",
        }
    }
}

/// Connection parameters for IMAP accounts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImapSettings {
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    /// Login name, when it differs from the account address
    #[serde(default)]
    pub username: Option<String>,
    /// Folders never listed (trash and spam by default)
    #[serde(default = "default_excluded_folders")]
    pub exclude_folders: Vec<String>,
}

fn default_imap_port() -> u16 {
    993
}

fn default_excluded_folders() -> Vec<String> {
    vec!["[Gmail]/Trash".to_string(), "[Gmail]/Spam".to_string()]
}

impl ImapSettings {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_imap_port(),
            username: None,
            exclude_folders: default_excluded_folders(),
        }
    }

    pub fn is_excluded(&self, folder: &str) -> bool {
        self.exclude_folders.iter().any(|f| f == folder)
    }
}

/// A configured account
///
/// The address is the identity key for everything archived under it and
/// must not change once messages exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub address: String,
    pub provider: ProviderKind,
    #[serde(default)]
    pub imap: Option<ImapSettings>,
}

impl Account {
    pub fn gmail(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            provider: ProviderKind::Gmail,
            imap: None,
        }
    }

    pub fn imap(address: impl Into<String>, settings: ImapSettings) -> Self {
        Self {
            address: address.into(),
            provider: ProviderKind::Imap,
            imap: Some(settings),
        }
    }

    /// Secret-store key holding this account's credential
    pub fn credential_key(&self) -> String {
        match self.provider {
            ProviderKind::Gmail => crate::secrets::oauth_token_key(&self.address),
            ProviderKind::Imap => crate::secrets::imap_password_key(&self.address),
        }
    }
}
