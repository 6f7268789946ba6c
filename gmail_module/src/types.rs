//! Serde types for the Gmail REST API plus the parsed message shape the
//! pipeline consumes.

use serde::{Deserialize, Serialize};

/// Result of a history fetch: the message-added refs and the cursor to
/// persist for the next sync.
#[derive(Debug, Clone)]
pub struct HistoryDelta {
    pub messages: Vec<MessageRef>,
    pub new_cursor: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRef {
    pub id: String,
    #[serde(rename = "threadId", default)]
    pub thread_id: String,
}

/// An inbound message reduced to the fields the pipeline evaluates.
#[derive(Debug, Clone)]
pub struct InboundEmail {
    pub id: String,
    pub thread_id: String,
    /// Bare sender address, lowercased (extracted from `Name <addr>` forms).
    pub sender: String,
    pub subject: String,
    pub body: String,
    /// RFC 822 Message-ID header of the original, for threading replies.
    pub rfc822_message_id: Option<String>,
}

// --- Gmail REST response shapes -------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HistoryResponse {
    #[serde(default)]
    pub history: Option<Vec<HistoryRecord>>,
    /// Gmail serializes history ids as strings.
    pub history_id: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HistoryRecord {
    #[serde(default)]
    pub messages_added: Vec<HistoryMessage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HistoryMessage {
    pub message: MessageRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProfileResponse {
    pub history_id: String,
    #[serde(default)]
    #[allow(dead_code)]
    pub email_address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GmailMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    pub payload: Option<MessagePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MessagePart {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    pub body: Option<PartBody>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PartBody {
    pub data: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct RawMessage {
    pub raw: String,
    #[serde(rename = "threadId")]
    pub thread_id: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct DraftRequest {
    pub message: RawMessage,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DraftResponse {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SendResponse {
    pub id: String,
}
