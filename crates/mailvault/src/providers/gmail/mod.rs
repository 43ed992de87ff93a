//! Gmail API provider
//!
//! This module provides:
//! - OAuth2 access-token management backed by the secret store
//! - A ureq-based REST client
//! - The history-cursor sync provider, generic over its transport so the
//!   listing and checkpoint logic can be exercised without a network

mod auth;
mod client;
mod provider;

pub use auth::{GmailAuth, StoredToken};
pub use client::{GmailClient, classify_status};
pub use provider::GmailProvider;

use crate::error::ProviderError;

/// One page of message ids from a full listing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePage {
    pub ids: Vec<String>,
    pub next_page_token: Option<String>,
}

/// One page of the change log
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryPage {
    /// Ids of messages added, in change-log order
    pub added: Vec<String>,
    /// Latest history id known to the server
    pub history_id: Option<String>,
    pub next_page_token: Option<String>,
}

/// Raw RFC 822 bytes plus label ids
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub raw: Vec<u8>,
    pub label_ids: Vec<String>,
}

/// Calls the provider needs from the Gmail REST API
pub trait GmailTransport: Send + Sync {
    fn authenticate(&self) -> Result<(), ProviderError>;

    /// Current mailbox history id (`users/me/profile`)
    fn current_history_id(&self) -> Result<String, ProviderError>;

    fn list_messages(&self, page_token: Option<&str>) -> Result<MessagePage, ProviderError>;

    /// Fails with `CheckpointExpired` when `start_history_id` is too old
    fn list_history(
        &self,
        start_history_id: &str,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, ProviderError>;

    fn get_raw(&self, id: &str) -> Result<RawMessage, ProviderError>;

    /// Current label ids of one message
    fn get_label_ids(&self, id: &str) -> Result<Vec<String>, ProviderError> {
        self.get_raw(id).map(|message| message.label_ids)
    }

    /// (label id, label name) pairs
    fn list_labels(&self) -> Result<Vec<(String, String)>, ProviderError>;
}

/// Gmail API response types
pub mod api {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ListMessagesResponse {
        pub messages: Option<Vec<MessageRef>>,
        pub next_page_token: Option<String>,
        pub result_size_estimate: Option<u32>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessageRef {
        pub id: String,
        pub thread_id: Option<String>,
    }

    /// Message fetched with `format=raw`
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct RawMessageResponse {
        pub id: String,
        pub label_ids: Option<Vec<String>>,
        /// base64url-encoded RFC 822 message
        pub raw: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryResponse {
        pub history: Option<Vec<HistoryRecord>>,
        pub next_page_token: Option<String>,
        pub history_id: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryRecord {
        pub id: String,
        pub messages_added: Option<Vec<MessageAdded>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct MessageAdded {
        pub message: MessageRef,
    }

    #[derive(Debug, Deserialize)]
    pub struct ListLabelsResponse {
        pub labels: Option<Vec<LabelInfo>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct LabelInfo {
        pub id: String,
        pub name: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ProfileResponse {
        pub email_address: String,
        pub messages_total: Option<u64>,
        pub history_id: String,
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_history_response_shape() {
            let json = r#"{
                "history": [
                    {"id": "101", "messagesAdded": [{"message": {"id": "m4", "threadId": "t4"}}]},
                    {"id": "102"}
                ],
                "historyId": "102"
            }"#;
            let response: HistoryResponse = serde_json::from_str(json).unwrap();
            let history = response.history.unwrap();
            assert_eq!(history.len(), 2);
            assert_eq!(history[0].messages_added.as_ref().unwrap()[0].message.id, "m4");
            assert!(history[1].messages_added.is_none());
            assert_eq!(response.history_id.as_deref(), Some("102"));
        }
    }
}
