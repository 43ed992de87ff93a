//! SQLite index: message metadata, hash manifest, sync checkpoints and an
//! FTS5 projection for search
//!
//! A message row, its manifest entry, its labels and its full-text row are
//! always written in the same transaction.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use rusqlite_migration::{M, Migrations};

use crate::models::{Checkpoint, EmailAddress, EmailId, FolderMark, MessageRecord};

/// Database file inside the index directory
const DB_FILE: &str = "mailvault.sqlite3";

/// sync_state scope for history cursors
const CURSOR_SCOPE: &str = "";
/// sync_state scope prefix for per-folder marks
const FOLDER_SCOPE_PREFIX: &str = "folder:";

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        r#"
        CREATE TABLE messages (
            email_id TEXT PRIMARY KEY,
            account TEXT NOT NULL,
            provider_id TEXT NOT NULL,
            message_id_header TEXT,
            subject TEXT NOT NULL DEFAULT '',
            sender TEXT NOT NULL DEFAULT '',
            sender_email TEXT NOT NULL DEFAULT '',
            recipients TEXT NOT NULL DEFAULT '[]',  -- JSON array of addresses
            email_date INTEGER,                     -- unix seconds
            snippet TEXT NOT NULL DEFAULT '',
            has_attachments INTEGER NOT NULL DEFAULT 0,
            content_hash TEXT NOT NULL,
            file_path TEXT NOT NULL,
            size INTEGER NOT NULL,
            parse_degraded INTEGER NOT NULL DEFAULT 0,
            archived_at TEXT NOT NULL,
            indexed_hash TEXT
        );

        CREATE UNIQUE INDEX idx_messages_provider ON messages(account, provider_id);
        CREATE INDEX idx_messages_date ON messages(email_date DESC);
        CREATE INDEX idx_messages_header ON messages(message_id_header);

        CREATE TABLE message_labels (
            email_id TEXT NOT NULL,
            label TEXT NOT NULL,
            PRIMARY KEY (email_id, label),
            FOREIGN KEY (email_id) REFERENCES messages(email_id) ON DELETE CASCADE
        );

        CREATE INDEX idx_message_labels_label ON message_labels(label);

        -- Expected content of every archived file, kept apart from messages
        -- so the two can be checked against each other
        CREATE TABLE file_manifest (
            file_path TEXT PRIMARY KEY,
            email_id TEXT NOT NULL UNIQUE,
            account TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            size INTEGER NOT NULL,
            recorded_at TEXT NOT NULL
        );

        CREATE TABLE sync_state (
            account TEXT NOT NULL,
            scope TEXT NOT NULL,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (account, scope)
        );

        -- rowid matches messages.rowid
        CREATE VIRTUAL TABLE messages_fts USING fts5(
            subject, sender, recipients, body, labels, attachments,
            tokenize = 'porter unicode61'
        );
        "#,
    )])
}

/// Everything needed to index one archived message
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub record: MessageRecord,
    pub body: String,
    pub attachments: Vec<String>,
}

/// How a manifest row lines up with the message row for the same email id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestAgreement {
    Agrees,
    /// Manifest row without a message row
    NoRecord,
    /// Message row without a manifest row
    NoManifestRow,
    /// Both exist but name a different path or hash
    Differs,
}

/// One expected file in the archive
///
/// Path and hash come from `file_manifest` when it has a row, otherwise
/// from `messages`.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    pub email_id: EmailId,
    pub account: String,
    pub file_path: String,
    pub content_hash: String,
    pub size: u64,
    pub agreement: ManifestAgreement,
}

/// A message whose index data may be stale
#[derive(Debug, Clone, PartialEq)]
pub struct ReindexCandidate {
    pub email_id: EmailId,
    pub file_path: String,
    pub content_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexStats {
    pub messages: u64,
    /// Messages whose search data matches their content hash
    pub indexed: u64,
    pub degraded: u64,
    pub per_account: BTreeMap<String, u64>,
}

/// Consistency of the search projection with the message table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchHealth {
    pub messages: u64,
    pub search_rows: u64,
    /// Messages whose search data was built from other content
    pub stale: u64,
}

/// Shared index store
///
/// One connection behind a mutex; every write is its own transaction, so
/// passes for different accounts can share it.
pub struct MailIndex {
    conn: Mutex<Connection>,
}

impl MailIndex {
    /// Open the index stored in directory `dir` (created if needed)
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create index directory {}", dir.display()))?;
        let conn = Connection::open(dir.join(DB_FILE))
            .with_context(|| format!("Failed to open index at {}", dir.display()))?;
        Self::init(conn)
    }

    /// In-memory index, for tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run index migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // === Messages ===

    /// Commit entries in one transaction
    ///
    /// Entries whose email id is already indexed only contribute their
    /// labels. Returns the number of new rows.
    pub fn commit_messages(&self, entries: &[IndexEntry]) -> Result<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut inserted = 0;

        for entry in entries {
            let record = &entry.record;
            let recipients = serde_json::to_string(&record.recipients)?;
            let changed = tx.execute(
                r#"
                INSERT OR IGNORE INTO messages (
                    email_id, account, provider_id, message_id_header, subject, sender,
                    sender_email, recipients, email_date, snippet, has_attachments,
                    content_hash, file_path, size, parse_degraded, archived_at, indexed_hash
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?12)
                "#,
                params![
                    record.email_id.as_str(),
                    record.account,
                    record.provider_id,
                    record.message_id_header,
                    record.subject,
                    record.sender_display(),
                    record.sender.as_ref().map(|s| s.email.as_str()).unwrap_or_default(),
                    recipients,
                    record.date.map(|d| d.timestamp()),
                    record.snippet,
                    record.has_attachments,
                    record.content_hash,
                    record.file_path,
                    record.size as i64,
                    record.parse_degraded,
                    Utc::now().to_rfc3339(),
                ],
            )?;

            if changed == 0 {
                merge_labels_tx(&tx, &record.email_id, &record.labels)?;
                continue;
            }

            let rowid = tx.last_insert_rowid();
            tx.execute(
                r#"
                INSERT OR REPLACE INTO file_manifest
                    (file_path, email_id, account, content_hash, size, recorded_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    record.file_path,
                    record.email_id.as_str(),
                    record.account,
                    record.content_hash,
                    record.size as i64,
                    Utc::now().to_rfc3339(),
                ],
            )
            .with_context(|| format!("Failed to record manifest entry for {}", record.file_path))?;

            for label in &record.labels {
                tx.execute(
                    "INSERT OR IGNORE INTO message_labels (email_id, label) VALUES (?1, ?2)",
                    params![record.email_id.as_str(), label],
                )?;
            }

            tx.execute(
                r#"
                INSERT INTO messages_fts (rowid, subject, sender, recipients, body, labels, attachments)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    rowid,
                    record.subject,
                    record.sender_display(),
                    record.recipients_display(),
                    entry.body,
                    join_labels(&record.labels),
                    entry.attachments.join(" "),
                ],
            )?;

            inserted += 1;
        }

        tx.commit()?;
        Ok(inserted)
    }

    pub fn contains(&self, email_id: &EmailId) -> Result<bool> {
        let conn = self.lock();
        let found = conn
            .query_row(
                "SELECT 1 FROM messages WHERE email_id = ?1",
                params![email_id.as_str()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Add labels to an indexed message; returns true if any were new
    pub fn merge_labels(&self, email_id: &EmailId, labels: &BTreeSet<String>) -> Result<bool> {
        if labels.is_empty() {
            return Ok(false);
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let changed = merge_labels_tx(&tx, email_id, labels)?;
        tx.commit()?;
        Ok(changed)
    }

    pub fn labels(&self, email_id: &EmailId) -> Result<BTreeSet<String>> {
        let conn = self.lock();
        labels_of(&conn, email_id)
    }

    pub fn get_message(&self, email_id: &EmailId) -> Result<Option<MessageRecord>> {
        let conn = self.lock();
        let record = conn
            .query_row(
                &format!("SELECT {} FROM messages WHERE email_id = ?1", RECORD_COLUMNS),
                params![email_id.as_str()],
                record_from_row,
            )
            .optional()?;

        match record {
            Some(mut record) => {
                record.labels = labels_of(&conn, &record.email_id)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub fn find_by_provider_id(&self, account: &str, provider_id: &str) -> Result<Option<EmailId>> {
        let conn = self.lock();
        let id = conn
            .query_row(
                "SELECT email_id FROM messages WHERE account = ?1 AND provider_id = ?2",
                params![account, provider_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(id.map(EmailId))
    }

    /// Provider ids of every message indexed for `account`
    pub fn provider_ids(&self, account: &str) -> Result<BTreeSet<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT provider_id FROM messages WHERE account = ?1")?;
        let ids = stmt
            .query_map(params![account], |row| row.get(0))?
            .collect::<rusqlite::Result<BTreeSet<String>>>()?;
        Ok(ids)
    }

    /// Replace the label set of an indexed message; returns true if it changed
    pub fn replace_labels(&self, email_id: &EmailId, labels: &BTreeSet<String>) -> Result<bool> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        if labels_of(&tx, email_id)? == *labels {
            return Ok(false);
        }

        tx.execute(
            "DELETE FROM message_labels WHERE email_id = ?1",
            params![email_id.as_str()],
        )?;
        merge_labels_tx(&tx, email_id, labels)?;
        tx.execute(
            r#"
            UPDATE messages_fts SET labels = ?2
            WHERE rowid = (SELECT rowid FROM messages WHERE email_id = ?1)
            "#,
            params![email_id.as_str(), join_labels(labels)],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Delete a message with its labels, manifest entry and search row
    ///
    /// Returns true if either the message row or its manifest row existed.
    pub fn remove_message(&self, email_id: &EmailId) -> Result<bool> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM messages_fts WHERE rowid = (SELECT rowid FROM messages WHERE email_id = ?1)",
            params![email_id.as_str()],
        )?;
        let removed = tx.execute(
            "DELETE FROM messages WHERE email_id = ?1",
            params![email_id.as_str()],
        )?;
        let unlisted = tx.execute(
            "DELETE FROM file_manifest WHERE email_id = ?1",
            params![email_id.as_str()],
        )?;
        tx.commit()?;
        Ok(removed + unlisted > 0)
    }

    /// Every manifest row, plus message rows the manifest lacks
    pub fn manifest_entries(&self) -> Result<Vec<ManifestEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT f.email_id, f.account, f.file_path, f.content_hash, f.size,
                   CASE
                       WHEN m.email_id IS NULL THEN 1
                       WHEN m.file_path = f.file_path AND m.content_hash = f.content_hash THEN 0
                       ELSE 3
                   END
            FROM file_manifest f
            LEFT JOIN messages m ON m.email_id = f.email_id
            UNION ALL
            SELECT m.email_id, m.account, m.file_path, m.content_hash, m.size, 2
            FROM messages m
            WHERE NOT EXISTS (SELECT 1 FROM file_manifest f WHERE f.email_id = m.email_id)
            ORDER BY 3
            "#,
        )?;
        let entries = stmt
            .query_map([], |row| {
                Ok(ManifestEntry {
                    email_id: EmailId(row.get(0)?),
                    account: row.get(1)?,
                    file_path: row.get(2)?,
                    content_hash: row.get(3)?,
                    size: row.get::<_, i64>(4)? as u64,
                    agreement: match row.get::<_, i64>(5)? {
                        0 => ManifestAgreement::Agrees,
                        1 => ManifestAgreement::NoRecord,
                        2 => ManifestAgreement::NoManifestRow,
                        _ => ManifestAgreement::Differs,
                    },
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Rewrite the manifest row of `email_id` from its message row
    ///
    /// Drops the manifest row when there is no message. Returns false when
    /// neither row exists.
    pub fn reconcile_manifest(&self, email_id: &EmailId) -> Result<bool> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM file_manifest WHERE email_id = ?1",
            params![email_id.as_str()],
        )?;
        let written = tx.execute(
            r#"
            INSERT OR REPLACE INTO file_manifest
                (file_path, email_id, account, content_hash, size, recorded_at)
            SELECT file_path, email_id, account, content_hash, size, ?2
            FROM messages WHERE email_id = ?1
            "#,
            params![email_id.as_str(), Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(removed + written > 0)
    }

    pub fn search_health(&self) -> Result<SearchHealth> {
        let conn = self.lock();
        let (messages, stale): (i64, i64) = conn.query_row(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(indexed_hash IS NULL OR indexed_hash != content_hash), 0)
            FROM messages
            "#,
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let search_rows: i64 =
            conn.query_row("SELECT COUNT(*) FROM messages_fts", [], |row| row.get(0))?;

        Ok(SearchHealth {
            messages: messages as u64,
            search_rows: search_rows as u64,
            stale: stale as u64,
        })
    }

    /// Messages whose search data was built from different content (or all, with `force`)
    pub fn reindex_candidates(&self, force: bool) -> Result<Vec<ReindexCandidate>> {
        let conn = self.lock();
        let sql = if force {
            "SELECT email_id, file_path, content_hash FROM messages ORDER BY rowid"
        } else {
            r#"
            SELECT email_id, file_path, content_hash FROM messages
            WHERE indexed_hash IS NULL OR indexed_hash != content_hash
            ORDER BY rowid
            "#
        };
        let mut stmt = conn.prepare(sql)?;
        let candidates = stmt
            .query_map([], |row| {
                Ok(ReindexCandidate {
                    email_id: EmailId(row.get(0)?),
                    file_path: row.get(1)?,
                    content_hash: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(candidates)
    }

    /// Refresh parsed metadata and search rows for existing messages
    ///
    /// Identity, content hash and file path are left untouched.
    pub fn update_parsed(&self, entries: &[IndexEntry]) -> Result<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut updated = 0;

        for entry in entries {
            let record = &entry.record;
            let changed = tx.execute(
                r#"
                UPDATE messages SET
                    message_id_header = ?2, subject = ?3, sender = ?4, sender_email = ?5,
                    recipients = ?6, email_date = ?7, snippet = ?8, has_attachments = ?9,
                    parse_degraded = ?10, indexed_hash = content_hash
                WHERE email_id = ?1
                "#,
                params![
                    record.email_id.as_str(),
                    record.message_id_header,
                    record.subject,
                    record.sender_display(),
                    record.sender.as_ref().map(|s| s.email.as_str()).unwrap_or_default(),
                    serde_json::to_string(&record.recipients)?,
                    record.date.map(|d| d.timestamp()),
                    record.snippet,
                    record.has_attachments,
                    record.parse_degraded,
                ],
            )?;
            if changed == 0 {
                continue;
            }

            merge_labels_tx(&tx, &record.email_id, &record.labels)?;
            let labels = labels_of(&tx, &record.email_id)?;
            let rowid: i64 = tx.query_row(
                "SELECT rowid FROM messages WHERE email_id = ?1",
                params![record.email_id.as_str()],
                |row| row.get(0),
            )?;
            tx.execute("DELETE FROM messages_fts WHERE rowid = ?1", params![rowid])?;
            tx.execute(
                r#"
                INSERT INTO messages_fts (rowid, subject, sender, recipients, body, labels, attachments)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    rowid,
                    record.subject,
                    record.sender_display(),
                    record.recipients_display(),
                    entry.body,
                    join_labels(&labels),
                    entry.attachments.join(" "),
                ],
            )?;
            updated += 1;
        }

        tx.commit()?;
        Ok(updated)
    }

    pub fn stats(&self) -> Result<IndexStats> {
        let conn = self.lock();
        let (messages, indexed, degraded): (i64, i64, i64) = conn.query_row(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(indexed_hash = content_hash), 0),
                   COALESCE(SUM(parse_degraded), 0)
            FROM messages
            "#,
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let mut stmt = conn.prepare("SELECT account, COUNT(*) FROM messages GROUP BY account")?;
        let per_account = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64)))?
            .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;

        Ok(IndexStats {
            messages: messages as u64,
            indexed: indexed as u64,
            degraded: degraded as u64,
            per_account,
        })
    }

    // === Checkpoints ===

    pub fn get_checkpoint(&self, account: &str) -> Result<Option<Checkpoint>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT scope, value FROM sync_state WHERE account = ?1")?;
        let rows = stmt
            .query_map(params![account], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut cursor = None;
        let mut folders = BTreeMap::new();
        for (scope, value) in rows {
            if scope == CURSOR_SCOPE {
                cursor = Some(value);
            } else if let Some(folder) = scope.strip_prefix(FOLDER_SCOPE_PREFIX) {
                let mark: FolderMark = serde_json::from_str(&value)
                    .with_context(|| format!("Corrupt checkpoint for {} folder {}", account, folder))?;
                folders.insert(folder.to_string(), mark);
            }
        }

        if !folders.is_empty() {
            return Ok(Some(Checkpoint::FolderUids { folders }));
        }
        Ok(cursor.map(|cursor| Checkpoint::HistoryCursor { cursor }))
    }

    /// Replace the stored checkpoint for `account`
    pub fn set_checkpoint(&self, account: &str, checkpoint: &Checkpoint) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM sync_state WHERE account = ?1", params![account])?;

        let now = Utc::now().to_rfc3339();
        match checkpoint {
            Checkpoint::HistoryCursor { cursor } => {
                tx.execute(
                    "INSERT INTO sync_state (account, scope, value, updated_at) VALUES (?1, ?2, ?3, ?4)",
                    params![account, CURSOR_SCOPE, cursor, now],
                )?;
            }
            Checkpoint::FolderUids { folders } => {
                for (folder, mark) in folders {
                    tx.execute(
                        "INSERT INTO sync_state (account, scope, value, updated_at) VALUES (?1, ?2, ?3, ?4)",
                        params![
                            account,
                            format!("{}{}", FOLDER_SCOPE_PREFIX, folder),
                            serde_json::to_string(mark)?,
                            now
                        ],
                    )?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    pub fn clear_checkpoint(&self, account: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM sync_state WHERE account = ?1", params![account])?;
        Ok(())
    }
}

const RECORD_COLUMNS: &str = "email_id, account, provider_id, message_id_header, subject, \
     sender, sender_email, recipients, email_date, snippet, has_attachments, content_hash, \
     file_path, size, parse_degraded";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    let sender: String = row.get(5)?;
    let sender_email: String = row.get(6)?;
    let recipients: String = row.get(7)?;
    let date: Option<i64> = row.get(8)?;

    Ok(MessageRecord {
        email_id: EmailId(row.get(0)?),
        account: row.get(1)?,
        provider_id: row.get(2)?,
        message_id_header: row.get(3)?,
        subject: row.get(4)?,
        sender: if sender_email.is_empty() && sender.is_empty() {
            None
        } else {
            Some(EmailAddress::parse(&sender))
        },
        recipients: serde_json::from_str(&recipients).unwrap_or_default(),
        date: date.and_then(|ts| DateTime::from_timestamp(ts, 0)),
        snippet: row.get(9)?,
        has_attachments: row.get(10)?,
        labels: BTreeSet::new(),
        content_hash: row.get(11)?,
        file_path: row.get(12)?,
        size: row.get::<_, i64>(13)? as u64,
        parse_degraded: row.get(14)?,
    })
}

fn labels_of(conn: &Connection, email_id: &EmailId) -> Result<BTreeSet<String>> {
    let mut stmt = conn.prepare("SELECT label FROM message_labels WHERE email_id = ?1")?;
    let labels = stmt
        .query_map(params![email_id.as_str()], |row| row.get(0))?
        .collect::<rusqlite::Result<BTreeSet<String>>>()?;
    Ok(labels)
}

fn merge_labels_tx(tx: &Transaction<'_>, email_id: &EmailId, labels: &BTreeSet<String>) -> Result<bool> {
    let mut added = false;
    for label in labels {
        added |= tx.execute(
            r#"
            INSERT OR IGNORE INTO message_labels (email_id, label)
            SELECT email_id, ?2 FROM messages WHERE email_id = ?1
            "#,
            params![email_id.as_str(), label],
        )? > 0;
    }

    if added {
        let all = labels_of(tx, email_id)?;
        tx.execute(
            r#"
            UPDATE messages_fts SET labels = ?2
            WHERE rowid = (SELECT rowid FROM messages WHERE email_id = ?1)
            "#,
            params![email_id.as_str(), join_labels(&all)],
        )?;
    }
    Ok(added)
}

fn join_labels(labels: &BTreeSet<String>) -> String {
    labels.iter().cloned().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn entry(account: &str, provider_id: &str, subject: &str) -> IndexEntry {
        let email_id = crate::identity::email_id_for(account, provider_id);
        IndexEntry {
            record: MessageRecord {
                email_id: email_id.clone(),
                account: account.to_string(),
                provider_id: provider_id.to_string(),
                message_id_header: Some(format!("{}@example.com", provider_id)),
                subject: subject.to_string(),
                sender: Some(EmailAddress::with_name("Alice", "alice@example.com")),
                recipients: vec![EmailAddress::new("bob@example.com")],
                date: DateTime::from_timestamp(1_700_000_000, 0),
                snippet: format!("snippet for {}", subject),
                has_attachments: false,
                labels: BTreeSet::from(["INBOX".to_string()]),
                content_hash: format!("hash-{}", provider_id),
                file_path: format!("accounts/{}/emails/unknown/{}.eml", account, email_id.short()),
                size: 10,
                parse_degraded: false,
            },
            body: format!("body of {}", subject),
            attachments: Vec::new(),
        }
    }

    #[test]
    fn test_commit_and_get_message() {
        let index = MailIndex::open_in_memory().unwrap();
        let e = entry("a@x.com", "m1", "Hello");
        assert_eq!(index.commit_messages(&[e.clone()]).unwrap(), 1);

        assert!(index.contains(&e.record.email_id).unwrap());
        let stored = index.get_message(&e.record.email_id).unwrap().unwrap();
        assert_eq!(stored, e.record);
        assert_eq!(
            index.find_by_provider_id("a@x.com", "m1").unwrap(),
            Some(e.record.email_id.clone())
        );
    }

    #[test]
    fn test_commit_is_idempotent_and_unions_labels() {
        let index = MailIndex::open_in_memory().unwrap();
        let e = entry("a@x.com", "m1", "Hello");
        index.commit_messages(&[e.clone()]).unwrap();

        let mut again = e.clone();
        again.record.labels = BTreeSet::from(["Work".to_string()]);
        assert_eq!(index.commit_messages(&[again]).unwrap(), 0);

        let labels: Vec<_> = index.labels(&e.record.email_id).unwrap().into_iter().collect();
        assert_eq!(labels, vec!["INBOX", "Work"]);
        assert_eq!(index.stats().unwrap().messages, 1);
    }

    #[test]
    fn test_merge_labels_reports_changes() {
        let index = MailIndex::open_in_memory().unwrap();
        let e = entry("a@x.com", "m1", "Hello");
        index.commit_messages(&[e.clone()]).unwrap();

        let inbox = BTreeSet::from(["INBOX".to_string()]);
        assert!(!index.merge_labels(&e.record.email_id, &inbox).unwrap());
        let sent = BTreeSet::from(["Sent".to_string()]);
        assert!(index.merge_labels(&e.record.email_id, &sent).unwrap());

        // unknown ids are ignored rather than creating label rows
        let ghost = EmailId::new("ffffffffffffffffffffffff");
        assert!(!index.merge_labels(&ghost, &sent).unwrap());
    }

    #[test]
    fn test_remove_message_cascades() {
        let index = MailIndex::open_in_memory().unwrap();
        let e = entry("a@x.com", "m1", "Hello");
        index.commit_messages(&[e.clone()]).unwrap();

        assert!(index.remove_message(&e.record.email_id).unwrap());
        assert!(!index.contains(&e.record.email_id).unwrap());
        assert!(index.labels(&e.record.email_id).unwrap().is_empty());
        assert!(index.manifest_entries().unwrap().is_empty());
        assert!(!index.remove_message(&e.record.email_id).unwrap());

        let conn = index.lock();
        let fts_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages_fts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fts_rows, 0);
    }

    #[test]
    fn test_manifest_disagreement_and_reconcile() {
        let index = MailIndex::open_in_memory().unwrap();
        let a = entry("a@x.com", "m1", "One");
        let b = entry("a@x.com", "m2", "Two");
        let c = entry("a@x.com", "m3", "Three");
        index.commit_messages(&[a.clone(), b.clone(), c.clone()]).unwrap();
        let agreement = |id: &EmailId| {
            index
                .manifest_entries()
                .unwrap()
                .into_iter()
                .find(|e| e.email_id == *id)
                .map(|e| e.agreement)
        };
        assert_eq!(agreement(&a.record.email_id), Some(ManifestAgreement::Agrees));

        {
            let conn = index.lock();
            conn.execute(
                "DELETE FROM messages WHERE email_id = ?1",
                params![a.record.email_id.as_str()],
            )
            .unwrap();
            conn.execute(
                "DELETE FROM file_manifest WHERE email_id = ?1",
                params![b.record.email_id.as_str()],
            )
            .unwrap();
            conn.execute(
                "UPDATE file_manifest SET content_hash = 'other' WHERE email_id = ?1",
                params![c.record.email_id.as_str()],
            )
            .unwrap();
        }
        assert_eq!(agreement(&a.record.email_id), Some(ManifestAgreement::NoRecord));
        assert_eq!(agreement(&b.record.email_id), Some(ManifestAgreement::NoManifestRow));
        assert_eq!(agreement(&c.record.email_id), Some(ManifestAgreement::Differs));

        for e in [&a, &b, &c] {
            assert!(index.reconcile_manifest(&e.record.email_id).unwrap());
        }
        assert_eq!(agreement(&a.record.email_id), None);
        assert_eq!(agreement(&b.record.email_id), Some(ManifestAgreement::Agrees));
        assert_eq!(agreement(&c.record.email_id), Some(ManifestAgreement::Agrees));
    }

    #[test]
    fn test_search_health() {
        let index = MailIndex::open_in_memory().unwrap();
        let e = entry("a@x.com", "m1", "Hello");
        index.commit_messages(&[e.clone(), entry("a@x.com", "m2", "Bye")]).unwrap();
        assert_eq!(
            index.search_health().unwrap(),
            SearchHealth {
                messages: 2,
                search_rows: 2,
                stale: 0
            }
        );

        {
            let conn = index.lock();
            conn.execute("DELETE FROM messages_fts WHERE rowid = 1", []).unwrap();
            conn.execute("UPDATE messages SET indexed_hash = NULL WHERE rowid = 2", [])
                .unwrap();
        }
        assert_eq!(
            index.search_health().unwrap(),
            SearchHealth {
                messages: 2,
                search_rows: 1,
                stale: 1
            }
        );
    }

    #[test]
    fn test_replace_labels() {
        let index = MailIndex::open_in_memory().unwrap();
        let e = entry("a@x.com", "m1", "Hello");
        index.commit_messages(&[e.clone()]).unwrap();
        assert_eq!(
            index.provider_ids("a@x.com").unwrap(),
            BTreeSet::from(["m1".to_string()])
        );

        let archived = BTreeSet::from(["Archive".to_string()]);
        assert!(index.replace_labels(&e.record.email_id, &archived).unwrap());
        assert!(!index.replace_labels(&e.record.email_id, &archived).unwrap());
        assert_eq!(index.labels(&e.record.email_id).unwrap(), archived);

        let conn = index.lock();
        let labels: String = conn
            .query_row("SELECT labels FROM messages_fts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(labels, "Archive");
    }

    #[test]
    fn test_history_cursor_round_trip() {
        let index = MailIndex::open_in_memory().unwrap();
        assert_eq!(index.get_checkpoint("a@x.com").unwrap(), None);

        index.set_checkpoint("a@x.com", &Checkpoint::cursor("h42")).unwrap();
        assert_eq!(
            index.get_checkpoint("a@x.com").unwrap(),
            Some(Checkpoint::cursor("h42"))
        );

        index.clear_checkpoint("a@x.com").unwrap();
        assert_eq!(index.get_checkpoint("a@x.com").unwrap(), None);
    }

    #[test]
    fn test_folder_checkpoint_uses_per_folder_rows() {
        let index = MailIndex::open_in_memory().unwrap();
        let mut folders = BTreeMap::new();
        folders.insert("INBOX".to_string(), FolderMark { uid: 10, validity: 1 });
        folders.insert("Sent".to_string(), FolderMark { uid: 3, validity: 9 });
        let checkpoint = Checkpoint::FolderUids { folders };

        index.set_checkpoint("b@y.com", &checkpoint).unwrap();
        assert_eq!(index.get_checkpoint("b@y.com").unwrap(), Some(checkpoint));

        let conn = index.lock();
        let rows: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sync_state WHERE account = 'b@y.com'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(rows, 2);
    }

    #[test]
    fn test_reindex_candidates_and_update() {
        let index = MailIndex::open_in_memory().unwrap();
        let e = entry("a@x.com", "m1", "Old subject");
        index.commit_messages(&[e.clone()]).unwrap();

        assert!(index.reindex_candidates(false).unwrap().is_empty());
        assert_eq!(index.reindex_candidates(true).unwrap().len(), 1);

        index
            .lock()
            .execute("UPDATE messages SET indexed_hash = NULL", [])
            .unwrap();
        assert_eq!(index.stats().unwrap().indexed, 0);
        assert_eq!(index.reindex_candidates(false).unwrap().len(), 1);

        let mut refreshed = e.clone();
        refreshed.record.subject = "New subject".to_string();
        refreshed.record.content_hash = "ignored".to_string();
        assert_eq!(index.update_parsed(&[refreshed]).unwrap(), 1);

        let stored = index.get_message(&e.record.email_id).unwrap().unwrap();
        assert_eq!(stored.subject, "New subject");
        assert_eq!(stored.content_hash, e.record.content_hash);
        assert!(index.reindex_candidates(false).unwrap().is_empty());
    }

    #[test]
    fn test_stats_per_account() {
        let index = MailIndex::open_in_memory().unwrap();
        index
            .commit_messages(&[
                entry("a@x.com", "m1", "one"),
                entry("a@x.com", "m2", "two"),
                entry("b@y.com", "INBOX:1", "three"),
            ])
            .unwrap();

        let stats = index.stats().unwrap();
        assert_eq!(stats.messages, 3);
        assert_eq!(stats.indexed, 3);
        assert_eq!(stats.per_account.get("a@x.com"), Some(&2));
        assert_eq!(stats.per_account.get("b@y.com"), Some(&1));
    }
}
