//! Raw message parsing into searchable metadata
//!
//! [`parse`] never fails. Header fields go through the crate's own
//! unfolding and encoded-word decoder; MIME structure (body text,
//! attachments) comes from `mail-parser`. When the structure cannot be
//! recovered the result is a text-only record flagged `degraded`.

pub mod charset;
pub mod headers;

use chrono::{DateTime, Utc};
use log::debug;
use mail_parser::decoders::base64::base64_decode;
use mail_parser::decoders::html::html_to_text;
use mail_parser::decoders::quoted_printable::quoted_printable_decode;
use mail_parser::{Encoding, Message, MessageParser, MessagePart, MimeHeaders, PartType};

use crate::identity::normalize_message_id;
use crate::models::EmailAddress;

/// Characters kept for the listing snippet
pub const SNIPPET_CHARS: usize = 200;

/// Structured view of one raw message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedMessage {
    pub subject: String,
    pub sender: Option<EmailAddress>,
    /// To, Cc and Bcc in header order
    pub recipients: Vec<EmailAddress>,
    pub date: Option<DateTime<Utc>>,
    /// Message-ID without angle brackets
    pub message_id: Option<String>,
    /// Plain text body (HTML reduced to text when no plain part exists)
    pub body: String,
    pub attachments: Vec<String>,
    /// Labels carried in an `X-Gmail-Labels` header (Takeout exports)
    pub gmail_labels: Vec<String>,
    pub degraded: bool,
}

impl ParsedMessage {
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    /// Whitespace-collapsed body prefix
    pub fn snippet(&self) -> String {
        collapse_whitespace(&self.body)
            .chars()
            .take(SNIPPET_CHARS)
            .collect()
    }
}

/// Parse raw message bytes
pub fn parse(raw: &[u8]) -> ParsedMessage {
    let (fields, body_offset) = headers::header_fields(raw);
    let header = |name: &str| headers::find(&fields, name).map(|h| headers::decode_value(&h.value));

    let mut parsed = ParsedMessage {
        subject: header("subject")
            .map(|s| collapse_whitespace(&s))
            .unwrap_or_default(),
        sender: header("from").and_then(|v| EmailAddress::parse_list(&v).into_iter().next()),
        recipients: ["to", "cc", "bcc"]
            .iter()
            .filter_map(|name| header(name))
            .flat_map(|v| EmailAddress::parse_list(&v))
            .collect(),
        date: header("date").and_then(|v| parse_date(&v)),
        message_id: header("message-id")
            .map(|v| normalize_message_id(&v))
            .filter(|id| !id.is_empty()),
        gmail_labels: header("x-gmail-labels")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        ..Default::default()
    };

    let message = if fields.is_empty() {
        None
    } else {
        MessageParser::default().parse(raw)
    };

    match message {
        Some(message) => {
            parsed.body = body_text(&message, raw);
            parsed.attachments = message
                .attachments()
                .filter_map(|part| part.attachment_name().map(str::to_string))
                .collect();
            if parsed.date.is_none() {
                parsed.date = message
                    .date()
                    .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0));
            }
        }
        None => {
            debug!("MIME structure unreadable ({} bytes); keeping text only", raw.len());
            parsed.body = charset::decode(&raw[body_offset..], None);
            parsed.degraded = true;
        }
    }

    parsed
}

/// Every inline text/plain part joined by newlines; HTML parts reduced to
/// text only when there is no plain part
fn body_text(message: &Message<'_>, raw: &[u8]) -> String {
    let plain: Vec<String> = message
        .text_bodies()
        .filter(|part| matches!(part.body, PartType::Text(_)))
        .map(|part| part_text(part, raw))
        .collect();
    if !plain.is_empty() {
        return plain.join("\n");
    }

    message
        .html_bodies()
        .map(|part| match part.body {
            PartType::Html(_) => html_to_text(&part_text(part, raw)),
            _ => part_text(part, raw),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Decode one text part from its raw bytes through the charset chain
///
/// Falls back to the parser's own decoding when the transfer encoding is
/// broken.
fn part_text(part: &MessagePart<'_>, raw: &[u8]) -> String {
    let encoded = raw.get(part.raw_body_offset() as usize..part.raw_end_offset() as usize);
    let bytes = encoded.and_then(|bytes| match part.encoding {
        Encoding::Base64 => base64_decode(bytes),
        Encoding::QuotedPrintable => quoted_printable_decode(bytes),
        Encoding::None => Some(bytes.to_vec()),
    });

    match bytes {
        Some(bytes) => {
            let declared = part.content_type().and_then(|ct| ct.attribute("charset"));
            charset::decode(&bytes, declared)
        }
        None => part.text_contents().unwrap_or_default().to_string(),
    }
}

/// RFC 2822 date, tolerating trailing comments like `(PST)`
fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let value = match value.find('(') {
        Some(idx) => &value[..idx],
        None => value,
    };
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
