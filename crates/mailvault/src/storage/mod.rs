//! Durable storage: raw message files plus the shared SQLite index

mod archive;
mod index;

pub use archive::{ArchiveStore, SavedFile};
pub use index::{
    IndexEntry, IndexStats, MailIndex, ManifestAgreement, ManifestEntry, ReindexCandidate,
    SearchHealth,
};

#[cfg(test)]
pub(crate) use index::tests::entry as test_entry;
