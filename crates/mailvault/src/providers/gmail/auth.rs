//! Gmail OAuth2 access tokens
//!
//! Tokens live in the secret store under `oauth-token/<address>`. This
//! module only refreshes them; obtaining the first token (the consent flow)
//! happens elsewhere and ends with [`GmailAuth::store_token`].

use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::client::classify_ureq;
use crate::config::GmailCredentials;
use crate::error::ProviderError;
use crate::secrets::{SecretStore, oauth_token_key};

/// Refresh when fewer than this many seconds of validity remain
const EXPIRY_BUFFER_SECS: i64 = 300;

/// Token data as kept in the secret store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix seconds
    pub expires_at: Option<i64>,
}

impl StoredToken {
    fn is_fresh(&self, now: i64) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at > now + EXPIRY_BUFFER_SECS)
    }
}

/// Token response from Google
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

pub struct GmailAuth {
    credentials: GmailCredentials,
    secrets: Arc<dyn SecretStore>,
    address: String,
    cached: Mutex<Option<StoredToken>>,
}

impl GmailAuth {
    const TOKEN_URL: &'static str = "https://oauth2.googleapis.com/token";

    pub fn new(credentials: GmailCredentials, secrets: Arc<dyn SecretStore>, address: impl Into<String>) -> Self {
        Self {
            credentials,
            secrets,
            address: address.into(),
            cached: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Persist a token obtained by the consent flow
    pub fn store_token(&self, token: &StoredToken) -> Result<(), ProviderError> {
        let json = serde_json::to_vec(token)
            .map_err(|e| ProviderError::Config(format!("Failed to encode token: {}", e)))?;
        self.secrets
            .set_secret(&oauth_token_key(&self.address), &json)
            .map_err(|e| ProviderError::Config(format!("Failed to store token: {:#}", e)))?;
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        Ok(())
    }

    fn load_token(&self) -> Result<StoredToken, ProviderError> {
        let key = oauth_token_key(&self.address);
        let bytes = self
            .secrets
            .get_secret(&key)
            .map_err(|e| ProviderError::Config(format!("Failed to read secret store: {:#}", e)))?
            .ok_or_else(|| {
                ProviderError::Auth(format!(
                    "no OAuth token for {}; run the consent flow first",
                    self.address
                ))
            })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ProviderError::Auth(format!("stored token for {} is unreadable: {}", self.address, e)))
    }

    /// A valid access token, refreshing it if close to expiry
    pub fn get_access_token(&self) -> Result<String, ProviderError> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);

        let token = match cached.take() {
            Some(token) => token,
            None => self.load_token()?,
        };

        if token.is_fresh(chrono::Utc::now().timestamp()) {
            let access_token = token.access_token.clone();
            *cached = Some(token);
            return Ok(access_token);
        }

        let refresh_token = token.refresh_token.clone().ok_or_else(|| {
            ProviderError::Auth(format!(
                "access token for {} expired and no refresh token is stored",
                self.address
            ))
        })?;

        debug!("Refreshing Gmail access token for {}", self.address);
        let response = self.refresh_access_token(&refresh_token)?;
        let refreshed = StoredToken {
            access_token: response.access_token,
            refresh_token: response.refresh_token.or(Some(refresh_token)),
            expires_at: response
                .expires_in
                .map(|secs| chrono::Utc::now().timestamp() + secs),
        };

        let json = serde_json::to_vec(&refreshed)
            .map_err(|e| ProviderError::Config(format!("Failed to encode token: {}", e)))?;
        self.secrets
            .set_secret(&oauth_token_key(&self.address), &json)
            .map_err(|e| ProviderError::Config(format!("Failed to store token: {:#}", e)))?;
        info!("Refreshed Gmail access token for {}", self.address);

        let access_token = refreshed.access_token.clone();
        *cached = Some(refreshed);
        Ok(access_token)
    }

    fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenResponse, ProviderError> {
        let result = ureq::post(Self::TOKEN_URL).send_form([
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ]);

        let mut response = match result {
            Ok(response) => response,
            // invalid_grant: revoked or expired refresh token
            Err(ureq::Error::StatusCode(400 | 401)) => {
                return Err(ProviderError::Auth(format!(
                    "refresh token for {} was rejected; re-authentication required",
                    self.address
                )));
            }
            Err(e) => return Err(classify_ureq(e, "token refresh")),
        };

        response
            .body_mut()
            .read_json()
            .map_err(|e| ProviderError::Malformed(format!("token refresh: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::MemorySecretStore;

    fn auth_with(secrets: Arc<dyn SecretStore>) -> GmailAuth {
        let credentials = GmailCredentials {
            client_id: "id".into(),
            client_secret: "secret".into(),
        };
        GmailAuth::new(credentials, secrets, "a@x.com")
    }

    #[test]
    fn test_missing_token_is_auth_error() {
        let auth = auth_with(Arc::new(MemorySecretStore::new()));
        assert!(matches!(auth.get_access_token(), Err(ProviderError::Auth(_))));
    }

    #[test]
    fn test_fresh_token_is_used_without_refresh() {
        let secrets: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());
        let token = StoredToken {
            access_token: "ya29.fresh".into(),
            refresh_token: Some("1//refresh".into()),
            expires_at: Some(chrono::Utc::now().timestamp() + 3600),
        };
        secrets
            .set_secret("oauth-token/a@x.com", &serde_json::to_vec(&token).unwrap())
            .unwrap();

        let auth = auth_with(secrets);
        assert_eq!(auth.get_access_token().unwrap(), "ya29.fresh");
    }

    #[test]
    fn test_expired_token_without_refresh_token() {
        let auth = auth_with(Arc::new(MemorySecretStore::new()));
        auth.store_token(&StoredToken {
            access_token: "old".into(),
            refresh_token: None,
            expires_at: Some(0),
        })
        .unwrap();
        assert!(matches!(auth.get_access_token(), Err(ProviderError::Auth(_))));
    }

    #[test]
    fn test_freshness_buffer() {
        let token = StoredToken {
            access_token: "t".into(),
            refresh_token: None,
            expires_at: Some(1_000),
        };
        assert!(token.is_fresh(1_000 - EXPIRY_BUFFER_SECS - 1));
        assert!(!token.is_fresh(1_000 - EXPIRY_BUFFER_SECS));
    }
}
