//! Sync engine: resumable fetch-and-persist passes plus batch maintenance
//!
//! Every operation here is idempotent and can be safely re-run after a
//! crash or a cancellation.

mod cancel;
mod coordinator;
mod maintenance;

pub use cancel::CancellationToken;
pub use coordinator::{
    FailedMessage, SyncCoordinator, SyncOptions, SyncProgress, SyncReport, SyncState,
};
pub use maintenance::{
    COMMIT_INTERVAL, ImportReport, LabelReport, ReindexReport, SyncCheckReport, import_files,
    reindex, sync_check, update_labels,
};

use std::collections::BTreeSet;

use crate::models::{EmailId, MessageRecord};
use crate::parser::ParsedMessage;
use crate::storage::{IndexEntry, SavedFile};

/// Index entry for a freshly archived message
pub(crate) fn index_entry(
    account: &str,
    provider_id: &str,
    email_id: EmailId,
    parsed: &ParsedMessage,
    saved: &SavedFile,
    labels: BTreeSet<String>,
) -> IndexEntry {
    IndexEntry {
        record: MessageRecord {
            email_id,
            account: account.to_string(),
            provider_id: provider_id.to_string(),
            message_id_header: parsed.message_id.clone(),
            subject: parsed.subject.clone(),
            sender: parsed.sender.clone(),
            recipients: parsed.recipients.clone(),
            date: parsed.date,
            snippet: parsed.snippet(),
            has_attachments: parsed.has_attachments(),
            labels,
            content_hash: saved.content_hash.clone(),
            file_path: saved.relative_path.clone(),
            size: saved.size,
            parse_degraded: parsed.degraded,
        },
        body: parsed.body.clone(),
        attachments: parsed.attachments.clone(),
    }
}
