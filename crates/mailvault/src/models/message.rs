//! Archived message records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Deterministic internal identifier of an archived message
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EmailId(pub String);

impl EmailId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form used in archive file names
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for EmailId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EmailId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An email address with optional display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    pub name: Option<String>,
    pub email: String,
}

impl EmailAddress {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            email: email.into(),
        }
    }

    /// Parse a single mailbox like `"Doe, John" <john@example.com>`
    pub fn parse(s: &str) -> Self {
        let s = s.trim();

        if let Some(angle_start) = s.rfind('<')
            && let Some(angle_end) = s.rfind('>')
            && angle_start < angle_end
        {
            let name = s[..angle_start].trim().trim_matches('"').trim();
            let email = s[angle_start + 1..angle_end].trim();
            return Self {
                name: if name.is_empty() {
                    None
                } else {
                    Some(name.to_string())
                },
                email: email.to_string(),
            };
        }

        Self {
            name: None,
            email: s.to_string(),
        }
    }

    /// Parse an address-list header value, splitting on commas outside
    /// quotes and angle brackets
    pub fn parse_list(s: &str) -> Vec<Self> {
        let mut out = Vec::new();
        let mut current = String::new();
        let mut in_quotes = false;
        let mut in_angle = false;

        for c in s.chars() {
            match c {
                '"' => in_quotes = !in_quotes,
                '<' if !in_quotes => in_angle = true,
                '>' if !in_quotes => in_angle = false,
                ',' if !in_quotes && !in_angle => {
                    if !current.trim().is_empty() {
                        out.push(Self::parse(&current));
                    }
                    current.clear();
                    continue;
                }
                _ => {}
            }
            current.push(c);
        }
        if !current.trim().is_empty() {
            out.push(Self::parse(&current));
        }
        out
    }

    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }
}

/// Metadata row for one archived message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub email_id: EmailId,
    pub account: String,
    /// Identifier assigned by the remote (or the `local:` canonical id for imports)
    pub provider_id: String,
    /// Message-ID header; may be absent or shared by distinct messages
    pub message_id_header: Option<String>,
    pub subject: String,
    pub sender: Option<EmailAddress>,
    pub recipients: Vec<EmailAddress>,
    pub date: Option<DateTime<Utc>>,
    pub snippet: String,
    pub has_attachments: bool,
    /// Grows by union only
    pub labels: BTreeSet<String>,
    /// SHA-256 of the raw bytes, fixed once set
    pub content_hash: String,
    /// Path relative to the archive root, fixed once set
    pub file_path: String,
    pub size: u64,
    pub parse_degraded: bool,
}

impl MessageRecord {
    pub fn sender_display(&self) -> String {
        self.sender
            .as_ref()
            .map(EmailAddress::display)
            .unwrap_or_default()
    }

    pub fn recipients_display(&self) -> String {
        self.recipients
            .iter()
            .map(EmailAddress::display)
            .collect::<Vec<_>>()
            .join(", ")
    }
}
