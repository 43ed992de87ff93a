//! Secret storage for OAuth tokens, IMAP passwords and client credentials
//!
//! Keys are namespaced by purpose: `oauth-token/<address>`,
//! `imap-password/<address>`, `client-credentials/<provider>`.

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

const SECRETS_FILE: &str = "secrets.json";

pub fn oauth_token_key(address: &str) -> String {
    format!("oauth-token/{}", address)
}

pub fn imap_password_key(address: &str) -> String {
    format!("imap-password/{}", address)
}

pub fn client_credentials_key(provider: &str) -> String {
    format!("client-credentials/{}", provider)
}

/// OS-level or file-backed secret storage
pub trait SecretStore: Send + Sync {
    /// Returns `Ok(None)` when the key has never been set
    fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn set_secret(&self, key: &str, value: &[u8]) -> Result<()>;

    fn get_string(&self, key: &str) -> Result<Option<String>> {
        match self.get_secret(key)? {
            Some(bytes) => Ok(Some(
                String::from_utf8(bytes).with_context(|| format!("Secret {} is not UTF-8", key))?,
            )),
            None => Ok(None),
        }
    }
}

/// In-process secret store
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let secrets = self.secrets.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(secrets.get(key).cloned())
    }

    fn set_secret(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut secrets = self.secrets.lock().unwrap_or_else(PoisonError::into_inner);
        secrets.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

/// Secrets kept in an owner-only JSON file (values base64-encoded)
pub struct FileSecretStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSecretStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    /// Store at ~/.config/mailvault/secrets.json
    pub fn open_default() -> Result<Self> {
        let path = config::config_path(SECRETS_FILE).context("Could not determine config directory")?;
        Ok(Self::new(path))
    }

    fn load(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        config::load_json_file(&self.path)
    }
}

impl SecretStore for FileSecretStore {
    fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let secrets = self.load()?;
        secrets
            .get(key)
            .map(|encoded| {
                STANDARD
                    .decode(encoded)
                    .with_context(|| format!("Secret {} is not valid base64", key))
            })
            .transpose()
    }

    fn set_secret(&self, key: &str, value: &[u8]) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut secrets = self.load()?;
        secrets.insert(key.to_string(), STANDARD.encode(value));
        config::save_json_private(&self.path, &secrets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_store_missing_key() {
        let store = MemorySecretStore::new();
        assert_eq!(store.get_secret("imap-password/a@x.com").unwrap(), None);
        store.set_secret("imap-password/a@x.com", b"hunter2").unwrap();
        assert_eq!(
            store.get_string("imap-password/a@x.com").unwrap().as_deref(),
            Some("hunter2")
        );
    }

    #[test]
    fn test_file_store_persists_binary_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("secrets.json");

        let store = FileSecretStore::new(&path);
        store.set_secret(&oauth_token_key("a@x.com"), &[0, 159, 146, 150]).unwrap();
        store.set_secret(&imap_password_key("b@y.com"), b"pw").unwrap();

        let reopened = FileSecretStore::new(&path);
        assert_eq!(
            reopened.get_secret("oauth-token/a@x.com").unwrap(),
            Some(vec![0, 159, 146, 150])
        );
        assert_eq!(reopened.get_string("imap-password/b@y.com").unwrap().as_deref(), Some("pw"));
        assert_eq!(reopened.get_secret("client-credentials/gmail").unwrap(), None);
    }
}
