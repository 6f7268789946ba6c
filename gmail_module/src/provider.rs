//! Narrow capability interface for the mail provider.
//!
//! The pipeline only ever talks to the provider through this trait, so the
//! real Gmail client can be swapped for a fake in tests.

use async_trait::async_trait;

use crate::types::{HistoryDelta, InboundEmail};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("start cursor {0} is unknown or expired")]
    StaleCursor(u64),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("rate limited, retry after {0}s")]
    RateLimited(u64),
    #[error("http error: {0}")]
    Http(String),
    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

/// A reply envelope handed to the provider. The provider implementation is
/// responsible for serializing it into whatever wire format it needs.
#[derive(Debug, Clone)]
pub struct OutgoingReply {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Thread the reply belongs to on the provider side.
    pub thread_id: String,
    /// RFC 822 Message-ID of the message being replied to, if known.
    pub in_reply_to: Option<String>,
}

#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Message-added deltas since `start_cursor`, plus the provider's new
    /// cursor value. Returns `ProviderError::StaleCursor` when the provider
    /// no longer recognizes the requested cursor.
    async fn fetch_history(
        &self,
        access_token: &str,
        start_cursor: u64,
    ) -> Result<HistoryDelta, ProviderError>;

    /// The provider's current cursor, used to establish a baseline.
    async fn current_cursor(&self, access_token: &str) -> Result<u64, ProviderError>;

    async fn fetch_message(
        &self,
        access_token: &str,
        message_id: &str,
    ) -> Result<InboundEmail, ProviderError>;

    /// Create a draft reply in the original thread. Returns the draft id.
    async fn create_draft(
        &self,
        access_token: &str,
        reply: &OutgoingReply,
    ) -> Result<String, ProviderError>;

    /// Send a reply in the original thread. Returns the sent message id.
    async fn send_message(
        &self,
        access_token: &str,
        reply: &OutgoingReply,
    ) -> Result<String, ProviderError>;
}
