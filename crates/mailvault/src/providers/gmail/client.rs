//! Gmail API HTTP client
//!
//! Uses synchronous HTTP (ureq) so it can run on plain worker threads.
//! Every failure is mapped onto the provider error taxonomy.

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use serde::de::DeserializeOwned;

use super::api::{
    HistoryResponse, ListLabelsResponse, ListMessagesResponse, ProfileResponse, RawMessageResponse,
};
use super::{GmailAuth, GmailTransport, HistoryPage, MessagePage, RawMessage};
use crate::error::{ProviderError, TransientKind};

/// Gmail's `raw` field is base64url, padding optional
const RAW_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Map an HTTP status onto the error taxonomy
pub fn classify_status(code: u16, what: &str) -> ProviderError {
    let message = format!("{}: HTTP {}", what, code);
    match code {
        401 => ProviderError::Auth(message),
        403 => ProviderError::PermissionDenied(message),
        404 => ProviderError::NotFound(message),
        408 => ProviderError::transient(TransientKind::Timeout, message),
        429 => ProviderError::transient(TransientKind::RateLimited, message),
        500 | 502 | 503 | 504 => ProviderError::transient(TransientKind::Unavailable, message),
        _ => ProviderError::Malformed(format!("{}: unexpected HTTP status {}", what, code)),
    }
}

pub(crate) fn classify_ureq(err: ureq::Error, what: &str) -> ProviderError {
    match err {
        ureq::Error::StatusCode(code) => classify_status(code, what),
        ureq::Error::Timeout(_) => {
            ProviderError::transient(TransientKind::Timeout, format!("{}: timed out", what))
        }
        ureq::Error::Io(e) => {
            ProviderError::transient(TransientKind::ConnectionReset, format!("{}: {}", what, e))
        }
        ureq::Error::ConnectionFailed | ureq::Error::HostNotFound => ProviderError::transient(
            TransientKind::Unavailable,
            format!("{}: could not connect", what),
        ),
        other => ProviderError::Malformed(format!("{}: {}", what, other)),
    }
}

/// Gmail API client
pub struct GmailClient {
    auth: GmailAuth,
}

impl GmailClient {
    const BASE_URL: &'static str = "https://gmail.googleapis.com/gmail/v1";

    /// Maximum page size accepted by `users/me/messages`
    const PAGE_SIZE: usize = 500;

    pub fn new(auth: GmailAuth) -> Self {
        Self { auth }
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str, what: &str) -> Result<T, ProviderError> {
        let access_token = self.auth.get_access_token()?;

        let mut response = ureq::get(url)
            .header("Authorization", &format!("Bearer {}", access_token))
            .call()
            .map_err(|e| classify_ureq(e, what))?;

        response
            .body_mut()
            .read_json()
            .map_err(|e| ProviderError::Malformed(format!("{}: {}", what, e)))
    }
}

impl GmailTransport for GmailClient {
    fn authenticate(&self) -> Result<(), ProviderError> {
        self.auth.get_access_token().map(|_| ())
    }

    fn current_history_id(&self) -> Result<String, ProviderError> {
        let url = format!("{}/users/me/profile", Self::BASE_URL);
        let profile: ProfileResponse = self.get_json(&url, "get profile")?;
        Ok(profile.history_id)
    }

    fn list_messages(&self, page_token: Option<&str>) -> Result<MessagePage, ProviderError> {
        let mut url = format!(
            "{}/users/me/messages?maxResults={}",
            Self::BASE_URL,
            Self::PAGE_SIZE
        );
        if let Some(token) = page_token {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
        }

        let list: ListMessagesResponse = self.get_json(&url, "list messages")?;
        Ok(MessagePage {
            ids: list
                .messages
                .unwrap_or_default()
                .into_iter()
                .map(|m| m.id)
                .collect(),
            next_page_token: list.next_page_token,
        })
    }

    fn list_history(
        &self,
        start_history_id: &str,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, ProviderError> {
        let mut url = format!(
            "{}/users/me/history?startHistoryId={}&historyTypes=messageAdded",
            Self::BASE_URL,
            urlencoding::encode(start_history_id)
        );
        if let Some(token) = page_token {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
        }

        let history: HistoryResponse = match self.get_json(&url, "list history") {
            Ok(history) => history,
            // startHistoryId too old or invalid
            Err(ProviderError::NotFound(_)) => return Err(ProviderError::CheckpointExpired),
            Err(e) => return Err(e),
        };

        let added = history
            .history
            .unwrap_or_default()
            .into_iter()
            .flat_map(|record| record.messages_added.unwrap_or_default())
            .map(|added| added.message.id)
            .collect();

        Ok(HistoryPage {
            added,
            history_id: history.history_id,
            next_page_token: history.next_page_token,
        })
    }

    fn get_raw(&self, id: &str) -> Result<RawMessage, ProviderError> {
        let url = format!(
            "{}/users/me/messages/{}?format=raw",
            Self::BASE_URL,
            urlencoding::encode(id)
        );
        let what = format!("get message {}", id);

        let message: RawMessageResponse = match self.get_json(&url, &what) {
            Ok(message) => message,
            Err(ProviderError::NotFound(_)) => return Err(ProviderError::NotFound(id.to_string())),
            Err(e) => return Err(e),
        };

        let encoded = message
            .raw
            .ok_or_else(|| ProviderError::Malformed(format!("{}: response has no raw body", what)))?;
        let raw = decode_raw(&encoded).map_err(|e| ProviderError::Malformed(format!("{}: {}", what, e)))?;

        Ok(RawMessage {
            raw,
            label_ids: message.label_ids.unwrap_or_default(),
        })
    }

    fn get_label_ids(&self, id: &str) -> Result<Vec<String>, ProviderError> {
        let url = format!(
            "{}/users/me/messages/{}?format=minimal",
            Self::BASE_URL,
            urlencoding::encode(id)
        );
        let what = format!("get labels of {}", id);

        match self.get_json::<RawMessageResponse>(&url, &what) {
            Ok(message) => Ok(message.label_ids.unwrap_or_default()),
            Err(ProviderError::NotFound(_)) => Err(ProviderError::NotFound(id.to_string())),
            Err(e) => Err(e),
        }
    }

    fn list_labels(&self) -> Result<Vec<(String, String)>, ProviderError> {
        let url = format!("{}/users/me/labels", Self::BASE_URL);
        let labels: ListLabelsResponse = self.get_json(&url, "list labels")?;
        Ok(labels
            .labels
            .unwrap_or_default()
            .into_iter()
            .map(|label| (label.id, label.name))
            .collect())
    }
}

fn decode_raw(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    RAW_BASE64.decode(compact)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(classify_status(401, "x"), ProviderError::Auth(_)));
        assert!(matches!(classify_status(403, "x"), ProviderError::PermissionDenied(_)));
        assert!(matches!(classify_status(404, "x"), ProviderError::NotFound(_)));
        assert!(matches!(
            classify_status(429, "x"),
            ProviderError::Transient {
                kind: TransientKind::RateLimited,
                ..
            }
        ));
        assert!(classify_status(503, "x").is_retriable());
        assert!(!classify_status(418, "x").is_retriable());
    }

    #[test]
    fn test_decode_raw_base64url() {
        // "Subject: ?>\r\n" contains bytes that differ between the two alphabets
        let raw = b"Subject: ?>\r\n\r\n\xfb\xff";
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw);
        assert_eq!(decode_raw(&encoded).unwrap(), raw);

        let padded = base64::engine::general_purpose::URL_SAFE.encode(raw);
        assert_eq!(decode_raw(&padded).unwrap(), raw);
    }
}
