//! Encrypted OAuth token storage and access-token refresh.
//!
//! Tokens are sealed with AES-256-GCM before they reach the datastore; the
//! stored form is base64(nonce || ciphertext). The key comes from process
//! configuration only.

use std::time::Duration;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::ServiceConfig;
use crate::connection_store::{Connection, ConnectionStore};

const NONCE_LEN: usize = 12;
const EXPIRY_BUFFER_SECS: i64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("malformed ciphertext")]
    Malformed,
    #[error("token refresh failed: {0}")]
    Refresh(String),
    #[error("store error: {0}")]
    Store(#[from] crate::connection_store::ConnectionStoreError),
}

#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Encrypt)?;
        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(combined))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, VaultError> {
        let combined = STANDARD.decode(encoded).map_err(|_| VaultError::Malformed)?;
        if combined.len() <= NONCE_LEN {
            return Err(VaultError::Malformed);
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| VaultError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| VaultError::Decrypt)
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    expires_in: i64,
}

pub struct CredentialVault {
    cipher: TokenCipher,
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    token_url: String,
    revoke_url: String,
}

impl CredentialVault {
    pub fn new(config: &ServiceConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            cipher: TokenCipher::new(&config.token_encryption_key),
            http,
            client_id: config.google_client_id.clone(),
            client_secret: config.google_client_secret.clone(),
            token_url: config.google_token_url.clone(),
            revoke_url: config.google_revoke_url.clone(),
        }
    }

    pub fn cipher(&self) -> &TokenCipher {
        &self.cipher
    }

    /// Decrypts the connection's access token, refreshing it through the
    /// OAuth refresh grant first when it is within a minute of expiry. A
    /// successful refresh is persisted before the token is handed out.
    pub async fn access_token(
        &self,
        store: &dyn ConnectionStore,
        connection: &mut Connection,
    ) -> Result<String, VaultError> {
        let buffered_now = Utc::now() + chrono::Duration::seconds(EXPIRY_BUFFER_SECS);
        if connection.access_token_expires_at > buffered_now {
            return self.cipher.decrypt(&connection.access_token_enc);
        }

        debug!("access token expired for {}, refreshing", connection.mail_address);
        let refresh_token = self.cipher.decrypt(&connection.refresh_token_enc)?;

        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|err| VaultError::Refresh(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(VaultError::Refresh(format!("HTTP {}: {}", status, body)));
        }

        let refreshed: RefreshResponse = response
            .json()
            .await
            .map_err(|err| VaultError::Refresh(err.to_string()))?;

        let expires_at = Utc::now() + chrono::Duration::seconds(refreshed.expires_in);
        let access_token_enc = self.cipher.encrypt(&refreshed.access_token)?;
        store.update_access_token(connection.user_id, &access_token_enc, expires_at)?;
        connection.access_token_enc = access_token_enc;
        connection.access_token_expires_at = expires_at;

        Ok(refreshed.access_token)
    }

    /// Best-effort revocation with the provider; failures are logged, not
    /// propagated, so disconnect can proceed.
    pub async fn revoke(&self, store: &dyn ConnectionStore, connection: &mut Connection) {
        let token = match self.access_token(store, connection).await {
            Ok(token) => token,
            Err(err) => {
                warn!(
                    "skipping revocation for {}: {}",
                    connection.mail_address, err
                );
                return;
            }
        };
        let result = self
            .http
            .post(&self.revoke_url)
            .form(&[("token", token.as_str())])
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                debug!("revoked token for {}", connection.mail_address);
            }
            Ok(response) => {
                warn!(
                    "token revocation for {} returned {}",
                    connection.mail_address,
                    response.status()
                );
            }
            Err(err) => {
                warn!("token revocation for {} failed: {}", connection.mail_address, err);
            }
        }
    }
}
