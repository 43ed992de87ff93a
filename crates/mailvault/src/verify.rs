//! Index-versus-archive audit
//!
//! The audit walks `file_manifest`, checks every file against its recorded
//! hash and reports where the manifest and the message table disagree. It
//! also checks the search projection against the message table.
//!
//! [`VerificationEngine::verify`] only reads. [`VerificationEngine::repair`]
//! additionally drops index rows whose file is gone for good, clears the
//! checkpoint of their accounts so the next sync fetches them again,
//! rewrites disagreeing manifest rows and reports archive files no row
//! points at. Files are never deleted or rewritten; a hash mismatch is
//! always left for the operator.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use log::{info, warn};
use rayon::prelude::*;

use crate::models::EmailId;
use crate::storage::{ArchiveStore, MailIndex, ManifestAgreement, ManifestEntry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityIssue {
    /// The indexed file is gone, but identical bytes exist at `found_at`
    MissingFile {
        email_id: EmailId,
        path: String,
        found_at: String,
    },
    HashMismatch {
        email_id: EmailId,
        path: String,
        expected: String,
        actual: String,
    },
    /// The indexed file is gone and nothing in the archive matches it
    OrphanIndexRow { email_id: EmailId, path: String },
    /// An archive file no index row refers to (repair mode only)
    OrphanFile { path: String },
    /// `file_manifest` and `messages` disagree about a message
    ManifestDrift {
        email_id: EmailId,
        path: String,
        agreement: ManifestAgreement,
    },
    /// The search projection has a different number of rows than `messages`
    SearchRowCount { messages: u64, search_rows: u64 },
    /// Messages whose search data was built from other content
    StaleSearchData { count: u64 },
}

impl fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityIssue::MissingFile {
                email_id,
                path,
                found_at,
            } => write!(f, "{}: {} missing, same content at {}", email_id, path, found_at),
            IntegrityIssue::HashMismatch {
                email_id,
                path,
                expected,
                actual,
            } => write!(
                f,
                "{}: {} hash mismatch (expected {}, found {})",
                email_id, path, expected, actual
            ),
            IntegrityIssue::OrphanIndexRow { email_id, path } => {
                write!(f, "{}: {} missing, index row orphaned", email_id, path)
            }
            IntegrityIssue::OrphanFile { path } => write!(f, "{} is not indexed", path),
            IntegrityIssue::ManifestDrift {
                email_id,
                path,
                agreement,
            } => write!(f, "{}: {} manifest drift ({:?})", email_id, path, agreement),
            IntegrityIssue::SearchRowCount {
                messages,
                search_rows,
            } => write!(
                f,
                "search index holds {} rows for {} messages",
                search_rows, messages
            ),
            IntegrityIssue::StaleSearchData { count } => {
                write!(f, "{} messages need reindexing", count)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerifyReport {
    /// Manifest and message rows examined
    pub checked: usize,
    pub issues: Vec<IntegrityIssue>,
    /// Index rows removed or rewritten by repair
    pub repaired: usize,
    /// Accounts whose checkpoint repair cleared
    pub resync: BTreeSet<String>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

pub struct VerificationEngine {
    store: Arc<ArchiveStore>,
    index: Arc<MailIndex>,
}

impl VerificationEngine {
    pub fn new(store: Arc<ArchiveStore>, index: Arc<MailIndex>) -> Self {
        Self { store, index }
    }

    /// Report drift without changing anything
    pub fn verify(&self) -> Result<VerifyReport> {
        self.audit(false)
    }

    /// Report drift, drop unrecoverable index rows and list unindexed files
    pub fn repair(&self) -> Result<VerifyReport> {
        self.audit(true)
    }

    fn audit(&self, repair: bool) -> Result<VerifyReport> {
        let entries = self.index.manifest_entries()?;
        let hashes: Vec<Option<String>> = entries
            .par_iter()
            .map(|entry| self.store.hash_file(&entry.file_path))
            .collect::<Result<_>>()?;

        let indexed: HashSet<&str> = entries.iter().map(|e| e.file_path.as_str()).collect();
        let unindexed: Vec<String> = self
            .store
            .list_files()?
            .into_iter()
            .filter(|path| !indexed.contains(path.as_str()))
            .collect();

        let mut report = VerifyReport {
            checked: entries.len(),
            ..Default::default()
        };
        let mut lost: Vec<&ManifestEntry> = Vec::new();
        let mut drifted: Vec<&ManifestEntry> = Vec::new();

        // only needed to tell a moved file from a lost one
        let unindexed_by_hash = if hashes.iter().any(Option::is_none) {
            self.hash_unindexed(&unindexed)?
        } else {
            HashMap::new()
        };

        for (entry, actual) in entries.iter().zip(hashes) {
            match actual {
                Some(actual) if actual == entry.content_hash => {}
                Some(actual) => report.issues.push(IntegrityIssue::HashMismatch {
                    email_id: entry.email_id.clone(),
                    path: entry.file_path.clone(),
                    expected: entry.content_hash.clone(),
                    actual,
                }),
                None => match unindexed_by_hash.get(&entry.content_hash) {
                    Some(found_at) => report.issues.push(IntegrityIssue::MissingFile {
                        email_id: entry.email_id.clone(),
                        path: entry.file_path.clone(),
                        found_at: found_at.clone(),
                    }),
                    None => {
                        report.issues.push(IntegrityIssue::OrphanIndexRow {
                            email_id: entry.email_id.clone(),
                            path: entry.file_path.clone(),
                        });
                        lost.push(entry);
                        continue;
                    }
                },
            }

            if entry.agreement != ManifestAgreement::Agrees {
                report.issues.push(IntegrityIssue::ManifestDrift {
                    email_id: entry.email_id.clone(),
                    path: entry.file_path.clone(),
                    agreement: entry.agreement,
                });
                drifted.push(entry);
            }
        }

        let health = self.index.search_health()?;
        if health.search_rows != health.messages {
            report.issues.push(IntegrityIssue::SearchRowCount {
                messages: health.messages,
                search_rows: health.search_rows,
            });
        }
        if health.stale > 0 {
            report
                .issues
                .push(IntegrityIssue::StaleSearchData { count: health.stale });
        }

        if repair {
            for entry in lost {
                if self.index.remove_message(&entry.email_id)? {
                    info!(
                        "Removed index row for {} (file {} is gone)",
                        entry.email_id, entry.file_path
                    );
                    report.repaired += 1;
                    report.resync.insert(entry.account.clone());
                }
            }
            for entry in drifted {
                if self.index.reconcile_manifest(&entry.email_id)? {
                    report.repaired += 1;
                    if entry.agreement == ManifestAgreement::NoRecord {
                        report.resync.insert(entry.account.clone());
                    }
                }
            }
            for account in &report.resync {
                self.index.clear_checkpoint(account)?;
                info!("{}: checkpoint cleared; next sync re-lists the mailbox", account);
            }
            report
                .issues
                .extend(unindexed.into_iter().map(|path| IntegrityIssue::OrphanFile { path }));
        }

        for issue in &report.issues {
            warn!("Integrity: {}", issue);
        }
        info!(
            "Verified {} messages: {} issues, {} repaired",
            report.checked,
            report.issues.len(),
            report.repaired
        );
        Ok(report)
    }

    fn hash_unindexed(&self, paths: &[String]) -> Result<HashMap<String, String>> {
        let hashed: Vec<(String, Option<String>)> = paths
            .par_iter()
            .map(|path| self.store.hash_file(path).map(|hash| (path.clone(), hash)))
            .collect::<Result<_>>()?;
        Ok(hashed
            .into_iter()
            .filter_map(|(path, hash)| hash.map(|h| (h, path)))
            .collect())
    }
}
