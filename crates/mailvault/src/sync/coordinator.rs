//! One account's sync pass
//!
//! Idle → Listing → Fetching (fetch, resolve, skip-if-indexed, parse,
//! store, index) → Checkpointing → Idle, once per batch. A cancelled pass
//! ends Paused; an auth, config or storage failure ends Failed and is
//! returned as a [`SyncError`].

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Instant;

use log::{debug, error, info, warn};

use super::{CancellationToken, index_entry};
use crate::config::SyncSettings;
use crate::error::{ProviderError, SyncError};
use crate::identity::{self, Source};
use crate::models::Checkpoint;
use crate::parser;
use crate::providers::{FetchedMessage, MailProvider, RetryPolicy};
use crate::storage::{ArchiveStore, MailIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Listing,
    Fetching,
    Checkpointing,
    /// Stopped by the operator; the next run resumes
    Paused,
    /// Stopped by an account-level error
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncOptions {
    /// Ids fetched and persisted between checkpoint updates
    pub batch_size: usize,
    pub retry: RetryPolicy,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from(&SyncSettings::default())
    }
}

impl From<&SyncSettings> for SyncOptions {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            batch_size: settings.batch_size.max(1),
            retry: settings.retry_policy(),
        }
    }
}

/// Counters reported after every message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncProgress {
    pub processed: usize,
    pub total: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedMessage {
    pub provider_id: String,
    pub reason: String,
}

/// Outcome of one pass
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub account: String,
    /// Ids returned by the listing
    pub listed: usize,
    /// New records written
    pub archived: usize,
    /// Already archived, or vanished before fetch
    pub skipped: usize,
    pub failed: Vec<FailedMessage>,
    /// `Idle` for a completed pass, `Paused` after cancellation
    pub state: SyncState,
    pub checkpoint_advanced: bool,
    pub duration_ms: u64,
}

impl SyncReport {
    fn new(account: &str) -> Self {
        Self {
            account: account.to_string(),
            listed: 0,
            archived: 0,
            skipped: 0,
            failed: Vec::new(),
            state: SyncState::Idle,
            checkpoint_advanced: false,
            duration_ms: 0,
        }
    }
}

type ProgressFn = Box<dyn Fn(&SyncProgress) + Send + Sync>;

/// Drives sync passes against a shared archive and index
pub struct SyncCoordinator {
    store: Arc<ArchiveStore>,
    index: Arc<MailIndex>,
    options: SyncOptions,
    progress: Option<ProgressFn>,
}

/// Accounts with a pass in flight in this process
fn running_accounts() -> &'static Mutex<HashSet<String>> {
    static RUNNING: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    RUNNING.get_or_init(Default::default)
}

struct AccountLock(String);

impl AccountLock {
    fn acquire(account: &str) -> Result<Self, SyncError> {
        let mut running = running_accounts()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !running.insert(account.to_string()) {
            return Err(SyncError::AlreadyRunning(account.to_string()));
        }
        Ok(Self(account.to_string()))
    }
}

impl Drop for AccountLock {
    fn drop(&mut self) {
        running_accounts()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.0);
    }
}

impl SyncCoordinator {
    pub fn new(store: Arc<ArchiveStore>, index: Arc<MailIndex>, options: SyncOptions) -> Self {
        Self {
            store,
            index,
            options,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: impl Fn(&SyncProgress) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    /// Run one pass for the provider's account
    ///
    /// Per-message failures end up in the report; only account-level
    /// errors are returned.
    pub fn run(
        &self,
        provider: &mut dyn MailProvider,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let account = provider.account().to_string();
        let _lock = AccountLock::acquire(&account)?;

        let result = self.run_locked(provider, &account, cancel);
        if let Err(e) = &result {
            transition(&account, SyncState::Failed);
            error!("{}: sync aborted: {}", account, e);
        }
        result
    }

    fn run_locked(
        &self,
        provider: &mut dyn MailProvider,
        account: &str,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let start = Instant::now();
        let mut report = SyncReport::new(account);

        transition(account, SyncState::Listing);
        provider
            .authenticate()
            .map_err(|e| SyncError::from_provider(account, e))?;

        let mut checkpoint = self.index.get_checkpoint(account).map_err(SyncError::Storage)?;
        let listing = match provider.enumerate_new(checkpoint.as_ref()) {
            Ok(listing) => listing,
            Err(ProviderError::CheckpointExpired) if checkpoint.is_some() => {
                warn!("{}: checkpoint expired, reconciling with a full listing", account);
                self.index.clear_checkpoint(account).map_err(SyncError::Storage)?;
                checkpoint = None;
                provider
                    .enumerate_new(None)
                    .map_err(|e| SyncError::from_provider(account, e))?
            }
            Err(e) => return Err(SyncError::from_provider(account, e)),
        };

        report.listed = listing.ids.len();
        info!(
            "{} ({}): {} listing, {} candidates",
            account,
            provider.kind().as_str(),
            if listing.full { "full" } else { "incremental" },
            listing.ids.len()
        );
        let mut progress = SyncProgress {
            total: listing.ids.len(),
            ..Default::default()
        };
        let mut settled: HashSet<String> = HashSet::new();

        'batches: for chunk in listing.ids.chunks(self.options.batch_size) {
            if cancel.is_cancelled() {
                report.state = SyncState::Paused;
                break;
            }
            transition(account, SyncState::Fetching);

            // Skip anything already indexed regardless of what the checkpoint says
            let mut to_fetch = Vec::with_capacity(chunk.len());
            for provider_id in chunk {
                let email_id = identity::resolve(account, &Source::Native(provider_id), None, &[]);
                if self.index.contains(&email_id).map_err(SyncError::Storage)? {
                    if let Some(labels) = listing.labels.get(provider_id) {
                        self.index
                            .merge_labels(&email_id, labels)
                            .map_err(SyncError::Storage)?;
                    }
                    report.skipped += 1;
                    settled.insert(provider_id.clone());
                    progress.processed += 1;
                    self.report_progress(&progress);
                } else {
                    to_fetch.push(provider_id.clone());
                }
            }

            let results = if to_fetch.is_empty() {
                Vec::new()
            } else {
                provider.fetch_batch(&to_fetch, &self.options.retry)
            };

            for (provider_id, result) in results {
                if cancel.is_cancelled() {
                    report.state = SyncState::Paused;
                    break 'batches;
                }

                match result {
                    Ok(fetched) => {
                        if self.persist(account, fetched, listing.labels.get(&provider_id))? {
                            report.archived += 1;
                        } else {
                            report.skipped += 1;
                        }
                        settled.insert(provider_id);
                    }
                    Err(ProviderError::NotFound(_)) => {
                        debug!("{}: {} vanished before fetch, skipping", account, provider_id);
                        report.skipped += 1;
                        settled.insert(provider_id);
                    }
                    Err(e @ ProviderError::Auth(_)) => return Err(SyncError::from_provider(account, e)),
                    Err(e) => {
                        warn!("{}: failed to archive {}: {}", account, provider_id, e);
                        report.failed.push(FailedMessage {
                            provider_id,
                            reason: e.to_string(),
                        });
                        progress.failed += 1;
                    }
                }
                progress.processed += 1;
                self.report_progress(&progress);
            }

            self.checkpoint(provider, account, &settled, &mut checkpoint, &mut report)?;
        }

        // nothing listed: the cursor may still move (e.g. a newer history id)
        if listing.ids.is_empty() {
            if cancel.is_cancelled() {
                report.state = SyncState::Paused;
            } else {
                self.checkpoint(provider, account, &settled, &mut checkpoint, &mut report)?;
            }
        }

        if report.state == SyncState::Paused {
            info!(
                "{}: paused after {} of {} messages; checkpoint deferred to the next run",
                account, progress.processed, progress.total
            );
        } else {
            transition(account, SyncState::Idle);
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "{}: listed {}, archived {}, skipped {}, failed {} in {}ms",
            account,
            report.listed,
            report.archived,
            report.skipped,
            report.failed.len(),
            report.duration_ms
        );
        Ok(report)
    }

    /// Store and index one fetched message; false when it was already indexed
    fn persist(
        &self,
        account: &str,
        fetched: FetchedMessage,
        listed_labels: Option<&BTreeSet<String>>,
    ) -> Result<bool, SyncError> {
        let parsed = parser::parse(&fetched.raw);
        let email_id = identity::resolve(
            account,
            &Source::Native(&fetched.provider_id),
            parsed.message_id.as_deref(),
            &fetched.raw,
        );

        let mut labels: BTreeSet<String> = fetched.labels.into_iter().collect();
        labels.extend(listed_labels.into_iter().flatten().cloned());
        labels.extend(parsed.gmail_labels.iter().cloned());

        if self.index.contains(&email_id).map_err(SyncError::Storage)? {
            self.index
                .merge_labels(&email_id, &labels)
                .map_err(SyncError::Storage)?;
            return Ok(false);
        }

        if parsed.degraded {
            warn!(
                "{}: {} archived with degraded parsing",
                account, fetched.provider_id
            );
        }

        let saved = self
            .store
            .save(account, parsed.date, &email_id, &fetched.raw)
            .map_err(SyncError::Storage)?;
        let entry = index_entry(account, &fetched.provider_id, email_id, &parsed, &saved, labels);
        self.index
            .commit_messages(std::slice::from_ref(&entry))
            .map_err(SyncError::Storage)?;

        debug!(
            "{}: archived {} as {}{}",
            account,
            fetched.provider_id,
            saved.relative_path,
            if saved.reused { " (file already present)" } else { "" }
        );
        Ok(true)
    }

    fn checkpoint(
        &self,
        provider: &dyn MailProvider,
        account: &str,
        settled: &HashSet<String>,
        current: &mut Option<Checkpoint>,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        transition(account, SyncState::Checkpointing);
        let Some(next) = provider.checkpoint_through(settled) else {
            return Ok(());
        };
        if current.as_ref() == Some(&next) {
            return Ok(());
        }

        self.index
            .set_checkpoint(account, &next)
            .map_err(SyncError::Storage)?;
        *current = Some(next);
        report.checkpoint_advanced = true;
        Ok(())
    }

    fn report_progress(&self, progress: &SyncProgress) {
        if let Some(callback) = &self.progress {
            callback(progress);
        }
    }
}

fn transition(account: &str, state: SyncState) {
    debug!("{}: -> {:?}", account, state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProviderKind;
    use crate::providers::Enumeration;
    use std::collections::HashMap;

    struct OneMessage {
        account: String,
        auth_error: bool,
    }

    impl MailProvider for OneMessage {
        fn account(&self) -> &str {
            &self.account
        }

        fn kind(&self) -> ProviderKind {
            ProviderKind::Gmail
        }

        fn authenticate(&mut self) -> Result<(), ProviderError> {
            if self.auth_error {
                return Err(ProviderError::Auth("revoked".into()));
            }
            Ok(())
        }

        fn enumerate_new(&mut self, _: Option<&Checkpoint>) -> Result<Enumeration, ProviderError> {
            Ok(Enumeration {
                ids: vec!["m1".into()],
                labels: HashMap::new(),
                full: true,
            })
        }

        fn fetch(&mut self, provider_id: &str) -> Result<FetchedMessage, ProviderError> {
            Ok(FetchedMessage {
                provider_id: provider_id.to_string(),
                raw: b"Subject: hi\r\nMessage-ID: <m1@x>\r\n\r\nhello\r\n".to_vec(),
                labels: vec!["INBOX".into()],
            })
        }

        fn checkpoint_through(&self, settled: &HashSet<String>) -> Option<Checkpoint> {
            settled.contains("m1").then(|| Checkpoint::cursor("h1"))
        }
    }

    fn coordinator(dir: &std::path::Path) -> SyncCoordinator {
        let store = Arc::new(ArchiveStore::open(dir).unwrap());
        let index = Arc::new(MailIndex::open_in_memory().unwrap());
        SyncCoordinator::new(store, index, SyncOptions::default())
    }

    #[test]
    fn test_account_lock_is_exclusive() {
        let first = AccountLock::acquire("lock-test@x.com").unwrap();
        assert!(matches!(
            AccountLock::acquire("lock-test@x.com"),
            Err(SyncError::AlreadyRunning(_))
        ));
        AccountLock::acquire("other-lock-test@x.com").unwrap();
        drop(first);
        AccountLock::acquire("lock-test@x.com").unwrap();
    }

    #[test]
    fn test_auth_failure_aborts_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut provider = OneMessage {
            account: "auth-test@x.com".into(),
            auth_error: true,
        };
        let result = coordinator(dir.path()).run(&mut provider, &CancellationToken::new());
        assert!(matches!(result, Err(SyncError::Auth { .. })));
    }

    #[test]
    fn test_cancelled_before_start_is_paused() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut provider = OneMessage {
            account: "cancel-test@x.com".into(),
            auth_error: false,
        };
        let report = coordinator.run(&mut provider, &cancel).unwrap();
        assert_eq!(report.state, SyncState::Paused);
        assert_eq!(report.archived, 0);
        assert!(!report.checkpoint_advanced);
        assert_eq!(coordinator.index.get_checkpoint("cancel-test@x.com").unwrap(), None);
    }

    #[test]
    fn test_progress_is_reported_per_message() {
        let dir = tempfile::tempdir().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let coordinator =
            coordinator(dir.path()).with_progress(move |p| sink.lock().unwrap().push(*p));

        let mut provider = OneMessage {
            account: "progress-test@x.com".into(),
            auth_error: false,
        };
        let report = coordinator.run(&mut provider, &CancellationToken::new()).unwrap();
        assert_eq!(report.archived, 1);
        assert_eq!(report.state, SyncState::Idle);
        assert!(report.checkpoint_advanced);

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![SyncProgress {
                processed: 1,
                total: 1,
                failed: 0
            }]
        );
    }
}
