//! Mailvault - provider-agnostic email sync and archival engine
//!
//! This crate provides:
//! - Gmail (history cursor) and IMAP (per-folder UID) providers behind one trait
//! - Deterministic message identity and cross-folder deduplication
//! - A tolerant raw-message parser
//! - An append-only file archive plus a SQLite/FTS5 index
//! - A resumable, cancellable sync coordinator
//! - Integrity verification of the index against the archive
//! - A read-only search surface
//!
//! Everything here is synchronous and has no UI dependencies; the
//! `vaultsync` binary drives it.

pub mod config;
pub mod error;
pub mod identity;
pub mod models;
pub mod parser;
pub mod providers;
pub mod search;
pub mod secrets;
pub mod storage;
pub mod sync;
pub mod verify;

pub use config::{ArchiveConfig, GmailCredentials, SyncSettings};
pub use error::{ProviderError, SyncError, TransientKind};
pub use models::{Account, Checkpoint, EmailAddress, EmailId, ImapSettings, MessageRecord, ProviderKind};
pub use parser::{ParsedMessage, parse};
pub use providers::{Enumeration, FetchedMessage, MailProvider, RetryPolicy, open_provider};
pub use search::{ParsedQuery, SearchHit, parse_query, search_messages};
pub use secrets::{FileSecretStore, MemorySecretStore, SecretStore};
pub use storage::{ArchiveStore, IndexStats, MailIndex};
pub use sync::{
    CancellationToken, ImportReport, LabelReport, ReindexReport, SyncCheckReport, SyncCoordinator,
    SyncOptions, SyncProgress, SyncReport, SyncState, import_files, reindex, sync_check,
    update_labels,
};
pub use verify::{IntegrityIssue, VerificationEngine, VerifyReport};
