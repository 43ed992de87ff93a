//! Mail providers
//!
//! A provider lists what is new since a checkpoint, fetches raw bytes for
//! listed ids, and derives the next checkpoint from what the caller has
//! durably settled. Two implementations exist: Gmail (history cursor) and
//! IMAP (per-folder UID marks).

pub mod gmail;
pub mod imap;
mod retry;

pub use retry::RetryPolicy;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::config::GmailCredentials;
use crate::error::ProviderError;
use crate::models::{Account, Checkpoint, ProviderKind};
use crate::secrets::SecretStore;

/// Raw message returned by a fetch
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedMessage {
    pub provider_id: String,
    pub raw: Vec<u8>,
    /// Provider labels or folder names
    pub labels: Vec<String>,
}

/// Result of listing new messages
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enumeration {
    /// Provider ids to fetch, oldest first
    pub ids: Vec<String>,
    /// Labels known at listing time, keyed by provider id
    pub labels: HashMap<String, BTreeSet<String>>,
    /// True when the listing ignored any checkpoint
    pub full: bool,
}

/// One fetch outcome, keyed by provider id
pub type FetchResult = (String, Result<FetchedMessage, ProviderError>);

pub trait MailProvider: Send {
    fn account(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    /// Fails with `ProviderError::Auth` when credentials need attention
    fn authenticate(&mut self) -> Result<(), ProviderError>;

    /// List messages added since `checkpoint` (all of them when `None`)
    ///
    /// Fails with `CheckpointExpired` when the checkpoint can no longer be
    /// used; the caller then clears it and lists again from scratch.
    fn enumerate_new(&mut self, checkpoint: Option<&Checkpoint>) -> Result<Enumeration, ProviderError>;

    fn fetch(&mut self, provider_id: &str) -> Result<FetchedMessage, ProviderError>;

    /// Labels the message currently carries on the server
    ///
    /// Only meaningful for ids from the latest listing.
    fn current_labels(&mut self, provider_id: &str) -> Result<BTreeSet<String>, ProviderError> {
        self.fetch(provider_id)
            .map(|message| message.labels.into_iter().collect())
    }

    /// Fetch several ids, retrying transient failures per message
    ///
    /// Results come back in the order of `ids`.
    fn fetch_batch(&mut self, ids: &[String], retry: &RetryPolicy) -> Vec<FetchResult> {
        ids.iter()
            .map(|id| {
                let result = retry.run(&format!("fetch {}", id), || self.fetch(id));
                (id.clone(), result)
            })
            .collect()
    }

    /// Checkpoint covering exactly the settled prefix of the last listing
    ///
    /// `None` means the stored checkpoint must not move.
    fn checkpoint_through(&self, settled: &HashSet<String>) -> Option<Checkpoint>;
}

/// Build the provider for a configured account
pub fn open_provider(
    account: &Account,
    secrets: Arc<dyn SecretStore>,
    fetch_workers: usize,
) -> Result<Box<dyn MailProvider>, ProviderError> {
    match account.provider {
        ProviderKind::Gmail => {
            let credentials = GmailCredentials::load(secrets.as_ref())
                .map_err(|e| ProviderError::Config(format!("{:#}", e)))?;
            let auth = gmail::GmailAuth::new(credentials, secrets, account.address.clone());
            let client = gmail::GmailClient::new(auth);
            Ok(Box::new(gmail::GmailProvider::new(
                account.address.clone(),
                client,
                fetch_workers,
            )))
        }
        ProviderKind::Imap => {
            let settings = account.imap.clone().ok_or_else(|| {
                ProviderError::Config(format!("IMAP account {} has no server settings", account.address))
            })?;
            Ok(Box::new(imap::ImapProvider::native(
                account.address.clone(),
                settings,
                secrets,
            )))
        }
    }
}
