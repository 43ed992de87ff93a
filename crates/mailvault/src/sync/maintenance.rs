//! Batch maintenance: importing external `.eml` files, reindexing the
//! archive after parser changes, comparing an account with its server and
//! refreshing label sets

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use log::{debug, info, warn};
use walkdir::WalkDir;

use super::{CancellationToken, index_entry};
use crate::error::{ProviderError, SyncError};
use crate::identity::{self, IMPORTED_PREFIX, Source, sha256_hex};
use crate::models::{EmailId, MessageRecord};
use crate::parser::{self, ParsedMessage};
use crate::providers::{MailProvider, RetryPolicy};
use crate::storage::{ArchiveStore, IndexEntry, MailIndex};

/// Records per index transaction for batch operations
pub const COMMIT_INTERVAL: usize = 10;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportReport {
    pub imported: usize,
    /// Already archived (or repeated within the import)
    pub skipped: usize,
    pub failed: Vec<(PathBuf, String)>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReindexReport {
    pub reindexed: usize,
    /// Unreadable files, or files whose bytes no longer match their hash
    pub failed: usize,
    pub cancelled: bool,
}

/// Remote-versus-local comparison for one account
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncCheckReport {
    pub account: String,
    pub on_server: usize,
    /// Indexed messages that came from the provider
    pub indexed: usize,
    /// Listed by the server but not archived, oldest first
    pub missing_locally: Vec<String>,
    /// Archived but no longer listed by the server
    pub missing_on_server: Vec<String>,
}

impl SyncCheckReport {
    pub fn in_sync(&self) -> bool {
        self.missing_locally.is_empty() && self.missing_on_server.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelReport {
    /// Archived messages the server still lists
    pub checked: usize,
    pub updated: usize,
    pub failed: usize,
    pub cancelled: bool,
}

/// Archive every `.eml` file below `dir` under `account`
///
/// Identity comes from the Message-ID header, or the content hash when
/// there is none, so importing the same export twice is a no-op. Labels
/// from an `X-Gmail-Labels` header are kept.
pub fn import_files(
    store: &ArchiveStore,
    index: &MailIndex,
    account: &str,
    dir: &Path,
    cancel: &CancellationToken,
) -> Result<ImportReport> {
    let mut report = ImportReport::default();
    let mut pending: Vec<IndexEntry> = Vec::new();
    let mut pending_slots: HashMap<EmailId, usize> = HashMap::new();

    for path in eml_files(dir) {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }

        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Skipping unreadable {}: {}", path.display(), e);
                report.failed.push((path, e.to_string()));
                continue;
            }
        };

        let parsed = parser::parse(&raw);
        let canonical = identity::canonical_id(&Source::Imported, parsed.message_id.as_deref(), &raw);
        let email_id = identity::email_id_for(account, &canonical);
        let labels: BTreeSet<String> = parsed.gmail_labels.iter().cloned().collect();

        if let Some(&slot) = pending_slots.get(&email_id) {
            pending[slot].record.labels.extend(labels);
            report.skipped += 1;
            continue;
        }
        if index.contains(&email_id)? {
            index.merge_labels(&email_id, &labels)?;
            report.skipped += 1;
            continue;
        }

        let saved = store.save(account, parsed.date, &email_id, &raw)?;
        debug!("Imported {} as {}", path.display(), saved.relative_path);
        pending_slots.insert(email_id.clone(), pending.len());
        pending.push(index_entry(account, &canonical, email_id, &parsed, &saved, labels));

        if pending.len() >= COMMIT_INTERVAL {
            report.imported += index.commit_messages(&pending)?;
            pending.clear();
            pending_slots.clear();
        }
    }

    if !pending.is_empty() {
        report.imported += index.commit_messages(&pending)?;
    }

    info!(
        "{}: imported {} messages from {} ({} skipped, {} failed)",
        account,
        report.imported,
        dir.display(),
        report.skipped,
        report.failed.len()
    );
    Ok(report)
}

fn eml_files(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping unreadable import entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("eml"))
        })
        .collect()
}

/// Re-parse archived files whose search data is stale (all files with `force`)
///
/// Identity, content hash and path never change; a file whose bytes no
/// longer match its hash is left for verification.
pub fn reindex(
    store: &ArchiveStore,
    index: &MailIndex,
    force: bool,
    cancel: &CancellationToken,
) -> Result<ReindexReport> {
    let mut report = ReindexReport::default();
    let mut pending = Vec::new();

    for candidate in index.reindex_candidates(force)? {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }

        let raw = match store.read(&candidate.file_path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Cannot reindex {}: {:#}", candidate.email_id, e);
                report.failed += 1;
                continue;
            }
        };
        if sha256_hex(&raw) != candidate.content_hash {
            warn!(
                "{} no longer matches its content hash; leaving it for verification",
                candidate.file_path
            );
            report.failed += 1;
            continue;
        }
        let Some(record) = index.get_message(&candidate.email_id)? else {
            continue;
        };

        pending.push(refreshed(record, &parser::parse(&raw)));
        if pending.len() >= COMMIT_INTERVAL {
            report.reindexed += index.update_parsed(&pending)?;
            pending.clear();
        }
    }

    if !pending.is_empty() {
        report.reindexed += index.update_parsed(&pending)?;
    }

    info!(
        "Reindexed {} messages ({} failed{})",
        report.reindexed,
        report.failed,
        if report.cancelled { ", cancelled" } else { "" }
    );
    Ok(report)
}

/// Compare the server's full listing with the index without changing either
///
/// Imported messages have no server counterpart and are left out.
pub fn sync_check(index: &MailIndex, provider: &mut dyn MailProvider) -> Result<SyncCheckReport> {
    let account = provider.account().to_string();
    provider
        .authenticate()
        .map_err(|e| SyncError::from_provider(&account, e))?;
    let listing = provider
        .enumerate_new(None)
        .map_err(|e| SyncError::from_provider(&account, e))?;

    let indexed: BTreeSet<String> = index
        .provider_ids(&account)?
        .into_iter()
        .filter(|id| !id.starts_with(IMPORTED_PREFIX))
        .collect();
    let listed: HashSet<&str> = listing.ids.iter().map(String::as_str).collect();

    let report = SyncCheckReport {
        on_server: listing.ids.len(),
        indexed: indexed.len(),
        missing_locally: listing
            .ids
            .iter()
            .filter(|id| !indexed.contains(id.as_str()))
            .cloned()
            .collect(),
        missing_on_server: indexed
            .iter()
            .filter(|id| !listed.contains(id.as_str()))
            .cloned()
            .collect(),
        account,
    };

    if report.in_sync() {
        info!(
            "{} ({}): archive matches the server ({} messages)",
            report.account,
            provider.kind().as_str(),
            report.on_server
        );
    } else {
        info!(
            "{} ({}): {} on server, {} archived, {} not archived, {} gone from server",
            report.account,
            provider.kind().as_str(),
            report.on_server,
            report.indexed,
            report.missing_locally.len(),
            report.missing_on_server.len()
        );
    }
    Ok(report)
}

/// Replace the label set of every archived message with what the server
/// reports now
///
/// Messages the server no longer lists keep their labels.
pub fn update_labels(
    index: &MailIndex,
    provider: &mut dyn MailProvider,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<LabelReport> {
    let account = provider.account().to_string();
    provider
        .authenticate()
        .map_err(|e| SyncError::from_provider(&account, e))?;
    let listing = provider
        .enumerate_new(None)
        .map_err(|e| SyncError::from_provider(&account, e))?;

    let mut report = LabelReport::default();
    for provider_id in &listing.ids {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }
        let Some(email_id) = index.find_by_provider_id(&account, provider_id)? else {
            continue;
        };
        report.checked += 1;

        let labels = retry.run(&format!("labels of {}", provider_id), || {
            provider.current_labels(provider_id)
        });
        match labels {
            Ok(labels) => {
                if index.replace_labels(&email_id, &labels)? {
                    debug!("{}: labels of {} now {:?}", account, provider_id, labels);
                    report.updated += 1;
                }
            }
            Err(ProviderError::NotFound(_)) => {
                debug!("{}: {} vanished before its labels were read", account, provider_id)
            }
            Err(e @ ProviderError::Auth(_)) => return Err(SyncError::from_provider(&account, e).into()),
            Err(e) => {
                warn!("{}: cannot read labels of {}: {}", account, provider_id, e);
                report.failed += 1;
            }
        }
    }

    info!(
        "{}: refreshed labels of {} messages ({} changed, {} failed{})",
        account,
        report.checked,
        report.updated,
        report.failed,
        if report.cancelled { ", cancelled" } else { "" }
    );
    Ok(report)
}

fn refreshed(record: MessageRecord, parsed: &ParsedMessage) -> IndexEntry {
    let mut labels = record.labels.clone();
    labels.extend(parsed.gmail_labels.iter().cloned());

    IndexEntry {
        record: MessageRecord {
            message_id_header: parsed.message_id.clone(),
            subject: parsed.subject.clone(),
            sender: parsed.sender.clone(),
            recipients: parsed.recipients.clone(),
            date: parsed.date,
            snippet: parsed.snippet(),
            has_attachments: parsed.has_attachments(),
            labels,
            parse_degraded: parsed.degraded,
            ..record
        },
        body: parsed.body.clone(),
        attachments: parsed.attachments.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Checkpoint, ProviderKind};
    use crate::providers::{Enumeration, FetchedMessage};
    use crate::storage::test_entry;
    use std::collections::BTreeMap;

    fn write(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).unwrap();
    }

    /// Server listing every id in `labels`, in key order
    struct Listed {
        labels: BTreeMap<String, BTreeSet<String>>,
        unreadable: HashSet<String>,
    }

    impl Listed {
        fn new(messages: &[(&str, &[&str])]) -> Self {
            Self {
                labels: messages
                    .iter()
                    .map(|(id, labels)| (id.to_string(), labels.iter().map(|l| l.to_string()).collect()))
                    .collect(),
                unreadable: HashSet::new(),
            }
        }
    }

    impl MailProvider for Listed {
        fn account(&self) -> &str {
            "a@x.com"
        }

        fn kind(&self) -> ProviderKind {
            ProviderKind::Gmail
        }

        fn authenticate(&mut self) -> Result<(), ProviderError> {
            Ok(())
        }

        fn enumerate_new(&mut self, checkpoint: Option<&Checkpoint>) -> Result<Enumeration, ProviderError> {
            assert!(checkpoint.is_none());
            Ok(Enumeration {
                ids: self.labels.keys().cloned().collect(),
                full: true,
                ..Default::default()
            })
        }

        fn fetch(&mut self, provider_id: &str) -> Result<FetchedMessage, ProviderError> {
            if self.unreadable.contains(provider_id) {
                return Err(ProviderError::PermissionDenied(provider_id.to_string()));
            }
            let labels = self
                .labels
                .get(provider_id)
                .ok_or_else(|| ProviderError::NotFound(provider_id.to_string()))?;
            Ok(FetchedMessage {
                provider_id: provider_id.to_string(),
                raw: Vec::new(),
                labels: labels.iter().cloned().collect(),
            })
        }

        fn checkpoint_through(&self, _: &HashSet<String>) -> Option<Checkpoint> {
            None
        }
    }

    #[test]
    fn test_sync_check_reports_both_directions() {
        let index = MailIndex::open_in_memory().unwrap();
        index
            .commit_messages(&[
                test_entry("a@x.com", "m1", "one"),
                test_entry("a@x.com", "m2", "two"),
                test_entry("a@x.com", "local:note@x", "imported"),
                test_entry("b@x.com", "m9", "other account"),
            ])
            .unwrap();
        let mut server = Listed::new(&[("m2", &["INBOX"]), ("m3", &["INBOX"])]);

        let report = sync_check(&index, &mut server).unwrap();
        assert_eq!(report.account, "a@x.com");
        assert_eq!(report.on_server, 2);
        assert_eq!(report.indexed, 2);
        assert_eq!(report.missing_locally, vec!["m3"]);
        assert_eq!(report.missing_on_server, vec!["m1"]);
        assert!(!report.in_sync());
        assert_eq!(index.stats().unwrap().messages, 4);
    }

    #[test]
    fn test_update_labels_replaces_changed_sets() {
        let index = MailIndex::open_in_memory().unwrap();
        let moved = test_entry("a@x.com", "m1", "moved");
        let same = test_entry("a@x.com", "m2", "unchanged");
        let locked = test_entry("a@x.com", "m4", "unreadable");
        index
            .commit_messages(&[moved.clone(), same.clone(), locked.clone()])
            .unwrap();
        let mut server = Listed::new(&[
            ("m1", &["Archive", "Receipts"]),
            ("m2", &["INBOX"]),
            ("m3", &["INBOX"]),
            ("m4", &["Archive"]),
        ]);
        server.unreadable.insert("m4".to_string());

        let report = update_labels(
            &index,
            &mut server,
            &RetryPolicy::immediate(2),
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(
            report,
            LabelReport {
                checked: 3,
                updated: 1,
                failed: 1,
                cancelled: false
            }
        );

        let labels: Vec<_> = index.labels(&moved.record.email_id).unwrap().into_iter().collect();
        assert_eq!(labels, vec!["Archive", "Receipts"]);
        assert_eq!(index.labels(&same.record.email_id).unwrap(), same.record.labels);
        assert_eq!(index.labels(&locked.record.email_id).unwrap(), locked.record.labels);
    }

    #[test]
    fn test_import_dedups_by_message_id_and_merges_labels() {
        let archive = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        write(
            source.path(),
            "a.eml",
            "Message-ID: <same@x>\r\nX-Gmail-Labels: Inbox\r\nSubject: one\r\n\r\nbody\r\n",
        );
        write(
            source.path(),
            "b.eml",
            "Message-ID: <same@x>\r\nX-Gmail-Labels: Archived\r\nSubject: one\r\n\r\nbody again\r\n",
        );
        write(source.path(), "notes.txt", "not mail");

        let store = ArchiveStore::open(archive.path()).unwrap();
        let index = MailIndex::open_in_memory().unwrap();
        let cancel = CancellationToken::new();

        let report = import_files(&store, &index, "me@x.com", source.path(), &cancel).unwrap();
        assert_eq!(report.imported, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(store.list_files().unwrap().len(), 1);

        let email_id = identity::email_id_for("me@x.com", "local:same@x");
        let labels: Vec<_> = index.labels(&email_id).unwrap().into_iter().collect();
        assert_eq!(labels, vec!["Archived", "Inbox"]);

        let again = import_files(&store, &index, "me@x.com", source.path(), &cancel).unwrap();
        assert_eq!(again.imported, 0);
        assert_eq!(again.skipped, 2);
    }

    #[test]
    fn test_import_commits_in_batches() {
        let archive = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        for i in 0..(COMMIT_INTERVAL + 3) {
            write(
                source.path(),
                &format!("{:02}.eml", i),
                &format!("Subject: note {}\r\n\r\nbody {}\r\n", i, i),
            );
        }

        let store = ArchiveStore::open(archive.path()).unwrap();
        let index = MailIndex::open_in_memory().unwrap();
        let report =
            import_files(&store, &index, "me@x.com", source.path(), &CancellationToken::new()).unwrap();
        assert_eq!(report.imported, COMMIT_INTERVAL + 3);
        assert_eq!(index.stats().unwrap().messages, (COMMIT_INTERVAL + 3) as u64);
    }

    #[test]
    fn test_reindex_refreshes_stale_rows_only() {
        let archive = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        write(
            source.path(),
            "a.eml",
            "Message-ID: <r@x>\r\nSubject: Hello\r\n\r\nbody\r\n",
        );

        let store = ArchiveStore::open(archive.path()).unwrap();
        let index = MailIndex::open_in_memory().unwrap();
        let cancel = CancellationToken::new();
        import_files(&store, &index, "me@x.com", source.path(), &cancel).unwrap();

        assert_eq!(reindex(&store, &index, false, &cancel).unwrap().reindexed, 0);
        let forced = reindex(&store, &index, true, &cancel).unwrap();
        assert_eq!(forced.reindexed, 1);
        assert_eq!(forced.failed, 0);

        let email_id = identity::email_id_for("me@x.com", "local:r@x");
        assert_eq!(index.get_message(&email_id).unwrap().unwrap().subject, "Hello");
    }

    #[test]
    fn test_reindex_skips_corrupted_files() {
        let archive = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        write(source.path(), "a.eml", "Subject: Hello\r\n\r\nbody\r\n");

        let store = ArchiveStore::open(archive.path()).unwrap();
        let index = MailIndex::open_in_memory().unwrap();
        let cancel = CancellationToken::new();
        import_files(&store, &index, "me@x.com", source.path(), &cancel).unwrap();

        let path = store.list_files().unwrap().remove(0);
        fs::write(store.absolute(&path), "tampered").unwrap();

        let report = reindex(&store, &index, true, &cancel).unwrap();
        assert_eq!(report.reindexed, 0);
        assert_eq!(report.failed, 1);
    }
}
