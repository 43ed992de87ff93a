//! Read-only query surface over the index
//!
//! Gmail-style queries (`from:`, `to:`, `subject:`, `label:`,
//! `has:attachment`, `before:`, `after:`) compile to an FTS5 MATCH
//! expression plus SQL filters. Results carry the archive path so a viewer
//! can load the raw message itself.

mod query_parser;

pub use query_parser::{ParsedQuery, parse_query};

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

use crate::models::EmailId;
use crate::storage::MailIndex;

/// One matching message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub email_id: EmailId,
    pub account: String,
    /// Relative to the archive root
    pub file_path: String,
    pub subject: String,
    pub sender: String,
    pub date: Option<DateTime<Utc>>,
    pub snippet: String,
    pub has_attachments: bool,
    pub labels: Vec<String>,
}

/// Parse `query` and search, newest first
///
/// # Example
/// ```ignore
/// let hits = search_messages(&index, "from:alice has:attachment", None, 50, 0)?;
/// ```
pub fn search_messages(
    index: &MailIndex,
    query: &str,
    account: Option<&str>,
    limit: usize,
    offset: usize,
) -> Result<Vec<SearchHit>> {
    index.search(&parse_query(query), account, limit, offset)
}

/// FTS5 MATCH expression for the text parts of a query
fn match_expression(query: &ParsedQuery) -> Option<String> {
    let mut clauses: Vec<String> = query.terms.iter().map(|t| phrase(t)).collect();
    for (column, values) in [
        ("sender", &query.from),
        ("recipients", &query.to),
        ("subject", &query.subject),
    ] {
        clauses.extend(values.iter().map(|v| format!("{} : {}", column, phrase(v))));
    }

    if clauses.is_empty() {
        None
    } else {
        Some(clauses.join(" AND "))
    }
}

/// Quote a value as an FTS5 string
fn phrase(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

impl MailIndex {
    pub fn search(
        &self,
        query: &ParsedQuery,
        account: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SearchHit>> {
        let mut sql = String::from(
            r#"
            SELECT m.email_id, m.account, m.file_path, m.subject, m.sender,
                   m.email_date, m.snippet, m.has_attachments
            FROM messages m
            WHERE 1 = 1
            "#,
        );
        let mut params: Vec<Value> = Vec::new();

        if let Some(expression) = match_expression(query) {
            sql.push_str(" AND m.rowid IN (SELECT rowid FROM messages_fts WHERE messages_fts MATCH ?)");
            params.push(Value::Text(expression));
        }
        if let Some(account) = account {
            sql.push_str(" AND m.account = ?");
            params.push(Value::Text(account.to_string()));
        }
        for label in &query.labels {
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM message_labels l \
                 WHERE l.email_id = m.email_id AND l.label = ? COLLATE NOCASE)",
            );
            params.push(Value::Text(label.clone()));
        }
        if let Some(has) = query.has_attachment {
            sql.push_str(" AND m.has_attachments = ?");
            params.push(Value::Integer(has as i64));
        }
        if let Some(before) = query.before {
            sql.push_str(" AND m.email_date < ?");
            params.push(Value::Integer(before.timestamp()));
        }
        if let Some(after) = query.after {
            sql.push_str(" AND m.email_date >= ?");
            params.push(Value::Integer(after.timestamp()));
        }
        sql.push_str(" ORDER BY m.email_date DESC, m.rowid DESC LIMIT ? OFFSET ?");
        params.push(Value::Integer(limit as i64));
        params.push(Value::Integer(offset as i64));

        let mut hits = {
            let conn = self.lock();
            let mut stmt = conn.prepare(&sql)?;
            stmt.query_map(rusqlite::params_from_iter(params), |row| {
                Ok(SearchHit {
                    email_id: EmailId(row.get(0)?),
                    account: row.get(1)?,
                    file_path: row.get(2)?,
                    subject: row.get(3)?,
                    sender: row.get(4)?,
                    date: row
                        .get::<_, Option<i64>>(5)?
                        .and_then(|ts| DateTime::from_timestamp(ts, 0)),
                    snippet: row.get(6)?,
                    has_attachments: row.get(7)?,
                    labels: Vec::new(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };

        for hit in &mut hits {
            hit.labels = self.labels(&hit.email_id)?.into_iter().collect();
        }
        Ok(hits)
    }
}
