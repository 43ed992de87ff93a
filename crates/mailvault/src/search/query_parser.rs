//! Gmail-style query parser
//!
//! Supported operators:
//! - `from:alice@example.com`, `to:team@example.com`, `subject:meeting`
//! - `label:Receipts` (`in:` is an alias)
//! - `has:attachment`
//! - `before:2024/12/01`, `after:2024-01-01`
//!
//! Values may be quoted (`from:"Alice Smith"`). Anything else, including
//! unknown `key:value` pairs, is a free-text term; `"quoted phrases"` stay
//! together.

use chrono::{DateTime, NaiveDate, Utc};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedQuery {
    /// Free-text terms and phrases
    pub terms: Vec<String>,
    pub from: Vec<String>,
    pub to: Vec<String>,
    pub subject: Vec<String>,
    pub labels: Vec<String>,
    pub has_attachment: Option<bool>,
    /// Exclusive upper bound
    pub before: Option<DateTime<Utc>>,
    /// Inclusive lower bound
    pub after: Option<DateTime<Utc>>,
}

impl ParsedQuery {
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
            && self.from.is_empty()
            && self.to.is_empty()
            && self.subject.is_empty()
            && self.labels.is_empty()
            && self.has_attachment.is_none()
            && self.before.is_none()
            && self.after.is_none()
    }

    /// Whether any full-text condition applies
    pub fn has_text(&self) -> bool {
        !(self.terms.is_empty() && self.from.is_empty() && self.to.is_empty() && self.subject.is_empty())
    }
}

const OPERATORS: [&str; 8] = [
    "from", "to", "subject", "label", "in", "has", "before", "after",
];

/// One whitespace-separated piece of the query
#[derive(Debug, PartialEq)]
struct Token {
    key: Option<String>,
    value: String,
}

pub fn parse_query(input: &str) -> ParsedQuery {
    let mut query = ParsedQuery::default();

    for token in tokenize(input) {
        let Some(key) = token.key else {
            query.terms.push(token.value);
            continue;
        };

        match key.as_str() {
            "from" => query.from.push(token.value),
            "to" => query.to.push(token.value),
            "subject" => query.subject.push(token.value),
            "label" | "in" => query.labels.push(token.value),
            "has" if token.value.eq_ignore_ascii_case("attachment") => {
                query.has_attachment = Some(true)
            }
            "before" | "after" => match parse_date(&token.value) {
                Some(date) if key == "before" => query.before = Some(date),
                Some(date) => query.after = Some(date),
                None => query.terms.push(format!("{}:{}", key, token.value)),
            },
            _ => query.terms.push(format!("{}:{}", key, token.value)),
        }
    }

    query
}

fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        let Some(&first) = chars.peek() else {
            break;
        };

        if first == '"' {
            chars.next();
            let phrase = take_quoted(&mut chars);
            if !phrase.trim().is_empty() {
                tokens.push(Token {
                    key: None,
                    value: phrase,
                });
            }
            continue;
        }

        let mut word = String::new();
        while let Some(c) = chars.next_if(|c| !c.is_whitespace() && *c != ':') {
            word.push(c);
        }

        let is_operator = OPERATORS.contains(&word.to_lowercase().as_str());
        if chars.peek() == Some(&':') && is_operator {
            chars.next();
            let value = match chars.peek() {
                Some('"') => {
                    chars.next();
                    take_quoted(&mut chars)
                }
                _ => take_word(&mut chars),
            };
            if value.is_empty() {
                // `from:` with nothing after it
                tokens.push(Token {
                    key: None,
                    value: format!("{}:", word),
                });
            } else {
                tokens.push(Token {
                    key: Some(word.to_lowercase()),
                    value,
                });
            }
        } else {
            word.push_str(&take_word(&mut chars));
            tokens.push(Token {
                key: None,
                value: word,
            });
        }
    }

    tokens
}

fn take_quoted(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut value = String::new();
    for c in chars.by_ref() {
        if c == '"' {
            break;
        }
        value.push(c);
    }
    value
}

fn take_word(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut value = String::new();
    while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
        value.push(c);
    }
    value
}

/// YYYY/MM/DD or YYYY-MM-DD, as midnight UTC
fn parse_date(input: &str) -> Option<DateTime<Utc>> {
    ["%Y/%m/%d", "%Y-%m-%d"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(input, format).ok())
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terms_and_phrases() {
        let query = parse_query("budget \"quarterly report\"  draft");
        assert_eq!(query.terms, vec!["budget", "quarterly report", "draft"]);
        assert!(!query.is_empty());
    }

    #[test]
    fn test_field_operators() {
        let query = parse_query("from:\"Alice Smith\" to:bob subject:invoice label:Receipts in:Work");
        assert_eq!(query.from, vec!["Alice Smith"]);
        assert_eq!(query.to, vec!["bob"]);
        assert_eq!(query.subject, vec!["invoice"]);
        assert_eq!(query.labels, vec!["Receipts", "Work"]);
        assert!(query.terms.is_empty());
    }

    #[test]
    fn test_operator_keys_are_case_insensitive() {
        let query = parse_query("FROM:alice Has:Attachment");
        assert_eq!(query.from, vec!["alice"]);
        assert_eq!(query.has_attachment, Some(true));
    }

    #[test]
    fn test_dates() {
        let query = parse_query("after:2024/01/01 before:2024-12-31");
        assert_eq!(query.after.unwrap().format("%Y-%m-%d").to_string(), "2024-01-01");
        assert_eq!(query.before.unwrap().format("%Y-%m-%d").to_string(), "2024-12-31");
    }

    #[test]
    fn test_unparseable_values_become_terms() {
        let query = parse_query("before:someday has:drive foo:bar");
        assert_eq!(query.terms, vec!["before:someday", "has:drive", "foo:bar"]);
        assert!(query.before.is_none());
        assert!(query.has_attachment.is_none());
    }

    #[test]
    fn test_operator_without_value() {
        let query = parse_query("from: hello");
        assert!(query.from.is_empty());
        assert_eq!(query.terms, vec!["from:", "hello"]);
    }

    #[test]
    fn test_email_in_free_text() {
        let query = parse_query("alice@example.com re:lunch");
        assert_eq!(query.terms, vec!["alice@example.com", "re:lunch"]);
    }

    #[test]
    fn test_empty() {
        assert!(parse_query("").is_empty());
        assert!(parse_query("   \"\" ").is_empty());
        assert!(!parse_query("has:attachment").has_text());
    }
}
