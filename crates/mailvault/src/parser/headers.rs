//! Header block splitting and RFC 2047 encoded-word decoding
//!
//! Folded lines are unfolded before any decoding happens, and runs of
//! adjacent encoded-words in the same charset are joined at the byte level
//! before the charset is applied. A multi-byte character split across two
//! encoded-words on separate physical lines therefore decodes correctly.

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};

use super::charset;

const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// One unfolded header field with its undecoded value
#[derive(Debug, Clone, PartialEq)]
pub struct RawHeader {
    pub name: String,
    pub value: Vec<u8>,
}

/// Split the header block into unfolded fields
///
/// Returns the fields and the byte offset where the body starts. Input
/// without any recognizable field is treated as all body (offset 0).
pub fn header_fields(raw: &[u8]) -> (Vec<RawHeader>, usize) {
    let mut fields: Vec<RawHeader> = Vec::new();
    let mut offset = 0;
    let mut body_offset = raw.len();

    while offset < raw.len() {
        let end = raw[offset..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|p| offset + p + 1)
            .unwrap_or(raw.len());
        let mut line = &raw[offset..end];
        while let [rest @ .., b'\r' | b'\n'] = line {
            line = rest;
        }

        if line.is_empty() {
            body_offset = end;
            break;
        }

        if matches!(line[0], b' ' | b'\t') {
            if let Some(last) = fields.last_mut() {
                last.value.extend_from_slice(line);
            }
        } else if let Some(colon) = line.iter().position(|&b| b == b':')
            && colon > 0
            && line[..colon].iter().all(|b| b.is_ascii_graphic())
        {
            let name = String::from_utf8_lossy(&line[..colon]).into_owned();
            let value = trim_leading_ws(&line[colon + 1..]).to_vec();
            fields.push(RawHeader { name, value });
        }
        // anything else (mbox "From " lines, junk) is skipped

        offset = end;
    }

    if fields.is_empty() {
        return (fields, 0);
    }
    (fields, body_offset)
}

/// First field named `name` (case-insensitive)
pub fn find<'a>(fields: &'a [RawHeader], name: &str) -> Option<&'a RawHeader> {
    fields.iter().find(|f| f.name.eq_ignore_ascii_case(name))
}

fn trim_leading_ws(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !matches!(b, b' ' | b'\t'))
        .unwrap_or(bytes.len());
    &bytes[start..]
}

#[derive(Debug)]
enum Piece {
    Text(Vec<u8>),
    Encoded { charset: String, bytes: Vec<u8> },
}

/// Decode an unfolded header value to text
pub fn decode_value(value: &[u8]) -> String {
    let mut merged: Vec<Piece> = Vec::new();

    for piece in tokenize(value) {
        match piece {
            Piece::Text(text) => merged.push(Piece::Text(text)),
            Piece::Encoded { charset, bytes } => {
                // whitespace between two encoded-words is not part of the text
                if let Some(Piece::Text(gap)) = merged.last()
                    && gap.iter().all(|b| b.is_ascii_whitespace())
                    && matches!(merged.iter().rev().nth(1), Some(Piece::Encoded { .. }))
                {
                    merged.pop();
                }
                if let Some(Piece::Encoded {
                    charset: previous,
                    bytes: joined,
                }) = merged.last_mut()
                    && previous.eq_ignore_ascii_case(&charset)
                {
                    joined.extend_from_slice(&bytes);
                    continue;
                }
                merged.push(Piece::Encoded { charset, bytes });
            }
        }
    }

    let mut out = String::new();
    for piece in merged {
        match piece {
            Piece::Text(text) => out.push_str(&charset::decode(&text, None)),
            Piece::Encoded { charset, bytes } => {
                out.push_str(&charset::decode(&bytes, Some(&charset)))
            }
        }
    }
    out
}

fn tokenize(value: &[u8]) -> Vec<Piece> {
    let mut pieces = Vec::new();
    let mut text_start = 0;
    let mut i = 0;

    while i < value.len() {
        if value[i..].starts_with(b"=?")
            && let Some((end, charset, bytes)) = encoded_word(value, i)
        {
            if text_start < i {
                pieces.push(Piece::Text(value[text_start..i].to_vec()));
            }
            pieces.push(Piece::Encoded { charset, bytes });
            i = end;
            text_start = end;
            continue;
        }
        i += 1;
    }
    if text_start < value.len() {
        pieces.push(Piece::Text(value[text_start..].to_vec()));
    }
    pieces
}

/// Parse `=?charset?enc?payload?=` at `start`; returns (end, charset, bytes)
fn encoded_word(value: &[u8], start: usize) -> Option<(usize, String, Vec<u8>)> {
    let rest = &value[start + 2..];
    let charset_end = rest.iter().position(|&b| b == b'?')?;
    let charset = &rest[..charset_end];
    if charset.is_empty() || charset.iter().any(|b| b.is_ascii_whitespace()) {
        return None;
    }

    let rest = &rest[charset_end + 1..];
    let (encoding, rest) = match rest {
        [enc, b'?', rest @ ..] => (enc.to_ascii_uppercase(), rest),
        _ => return None,
    };

    let payload_end = rest.windows(2).position(|w| w == b"?=")?;
    let payload = &rest[..payload_end];
    if payload.iter().any(|b| b.is_ascii_whitespace()) {
        return None;
    }

    let bytes = match encoding {
        b'Q' => decode_q(payload),
        b'B' => LENIENT_BASE64.decode(payload).ok()?,
        _ => return None,
    };

    // RFC 2231 language suffix: charset*lang
    let charset = String::from_utf8_lossy(charset);
    let charset = charset.split('*').next().unwrap_or_default().to_string();

    let end = start + 2 + charset_end + 1 + 2 + payload_end + 2;
    Some((end, charset, bytes))
}

fn decode_q(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    let mut i = 0;
    while i < payload.len() {
        match payload[i] {
            b'_' => out.push(b' '),
            b'=' => match (hex_value(payload.get(i + 1)), hex_value(payload.get(i + 2))) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 3;
                    continue;
                }
                _ => out.push(b'='),
            },
            b => out.push(b),
        }
        i += 1;
    }
    out
}

fn hex_value(byte: Option<&u8>) -> Option<u8> {
    match byte? {
        b @ b'0'..=b'9' => Some(b - b'0'),
        b @ b'a'..=b'f' => Some(b - b'a' + 10),
        b @ b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
