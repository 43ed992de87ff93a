//! Stable message identity and cross-folder deduplication
//!
//! `email_id` is the first 24 hex digits of
//! `SHA-256(account + ":" + canonical_id)`. Computing it never consults the
//! index, so reruns and separate processes always agree.

use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};

use crate::models::EmailId;

/// Width of an email id in hex digits
pub const EMAIL_ID_LEN: usize = 24;

/// Canonical id prefix of imported messages
pub const IMPORTED_PREFIX: &str = "local:";

/// Where a message came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source<'a> {
    /// A remote provider's own message id
    Native(&'a str),
    /// A file imported from outside any provider
    Imported,
}

/// SHA-256 of `bytes` as lowercase hex
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Canonical id used for identity derivation
pub fn canonical_id(source: &Source<'_>, message_id_header: Option<&str>, raw: &[u8]) -> String {
    match source {
        Source::Native(id) => (*id).to_string(),
        Source::Imported => match message_id_header.map(normalize_message_id) {
            Some(header) if !header.is_empty() => format!("{}{}", IMPORTED_PREFIX, header),
            _ => format!("{}sha256:{}", IMPORTED_PREFIX, sha256_hex(raw)),
        },
    }
}

/// Derive the email id for a message
pub fn resolve(
    account: &str,
    source: &Source<'_>,
    message_id_header: Option<&str>,
    raw: &[u8],
) -> EmailId {
    email_id_for(account, &canonical_id(source, message_id_header, raw))
}

pub fn email_id_for(account: &str, canonical_id: &str) -> EmailId {
    let digest = sha256_hex(format!("{}:{}", account, canonical_id).as_bytes());
    EmailId(digest[..EMAIL_ID_LEN].to_string())
}

/// Strip whitespace and angle brackets from a Message-ID value
pub fn normalize_message_id(value: &str) -> String {
    value
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_string()
}

/// Outcome of observing one listed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// First sighting; this provider id owns the record
    Canonical,
    /// Same Message-ID already seen; its folder was merged into the owner
    Folded { canonical: String },
}

#[derive(Debug)]
struct ArenaEntry {
    provider_id: String,
    labels: BTreeSet<String>,
}

/// Per-pass dedup arena
///
/// Entries are owned by a vector; lookups by Message-ID and provider id
/// go through index maps.
#[derive(Debug, Default)]
pub struct DedupArena {
    entries: Vec<ArenaEntry>,
    by_header: HashMap<String, usize>,
    by_provider: HashMap<String, usize>,
}

impl DedupArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a listed message seen under `label`
    pub fn observe(&mut self, provider_id: &str, message_id_header: Option<&str>, label: &str) -> Observation {
        let header = message_id_header
            .map(normalize_message_id)
            .filter(|h| !h.is_empty());

        if let Some(&slot) = self.by_provider.get(provider_id) {
            self.entries[slot].labels.insert(label.to_string());
            return self.observation_for(slot, provider_id);
        }

        if let Some(header) = &header
            && let Some(&slot) = self.by_header.get(header)
        {
            self.entries[slot].labels.insert(label.to_string());
            self.by_provider.insert(provider_id.to_string(), slot);
            return self.observation_for(slot, provider_id);
        }

        let slot = self.entries.len();
        self.entries.push(ArenaEntry {
            provider_id: provider_id.to_string(),
            labels: BTreeSet::from([label.to_string()]),
        });
        self.by_provider.insert(provider_id.to_string(), slot);
        if let Some(header) = header {
            self.by_header.insert(header, slot);
        }
        Observation::Canonical
    }

    fn observation_for(&self, slot: usize, provider_id: &str) -> Observation {
        let owner = &self.entries[slot].provider_id;
        if owner == provider_id {
            Observation::Canonical
        } else {
            Observation::Folded {
                canonical: owner.clone(),
            }
        }
    }

    /// Provider id of the record that owns `provider_id`
    pub fn canonical_for(&self, provider_id: &str) -> Option<&str> {
        self.by_provider
            .get(provider_id)
            .map(|&slot| self.entries[slot].provider_id.as_str())
    }

    /// Union of labels collected for the record owning `provider_id`
    pub fn labels_for(&self, provider_id: &str) -> Option<&BTreeSet<String>> {
        self.by_provider
            .get(provider_id)
            .map(|&slot| &self.entries[slot].labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_is_deterministic() {
        let a = resolve("a@x.com", &Source::Native("m1"), Some("<x@y>"), b"one");
        let b = resolve("a@x.com", &Source::Native("m1"), None, b"different bytes");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), EMAIL_ID_LEN);
        assert_eq!(a, email_id_for("a@x.com", "m1"));
    }

    #[test]
    fn test_resolve_matches_known_digest() {
        let expected = &sha256_hex(b"a@x.com:m1")[..EMAIL_ID_LEN];
        assert_eq!(resolve("a@x.com", &Source::Native("m1"), None, b"").as_str(), expected);
    }

    #[test]
    fn test_accounts_do_not_share_ids() {
        let a = resolve("a@x.com", &Source::Native("m1"), None, b"");
        let b = resolve("b@x.com", &Source::Native("m1"), None, b"");
        assert_ne!(a, b);
    }

    #[test]
    fn test_imported_canonical_ids() {
        assert_eq!(
            canonical_id(&Source::Imported, Some(" <abc@host> "), b"raw"),
            "local:abc@host"
        );
        assert_eq!(
            canonical_id(&Source::Imported, None, b"raw"),
            format!("local:sha256:{}", sha256_hex(b"raw"))
        );
        assert_eq!(
            canonical_id(&Source::Imported, Some("<>"), b"raw"),
            format!("local:sha256:{}", sha256_hex(b"raw"))
        );
    }

    #[test]
    fn test_arena_folds_duplicate_headers() {
        let mut arena = DedupArena::new();
        assert_eq!(arena.observe("INBOX:1", Some("<m@x>"), "INBOX"), Observation::Canonical);
        assert_eq!(arena.observe("INBOX:2", None, "INBOX"), Observation::Canonical);
        assert_eq!(
            arena.observe("Work:9", Some("m@x"), "Work"),
            Observation::Folded {
                canonical: "INBOX:1".to_string()
            }
        );

        let labels: Vec<_> = arena.labels_for("INBOX:1").unwrap().iter().cloned().collect();
        assert_eq!(labels, vec!["INBOX", "Work"]);
        assert_eq!(arena.canonical_for("Work:9"), Some("INBOX:1"));
    }

    #[test]
    fn test_messages_without_header_never_fold() {
        let mut arena = DedupArena::new();
        arena.observe("INBOX:1", None, "INBOX");
        assert_eq!(arena.observe("Work:1", None, "Work"), Observation::Canonical);
    }
}
