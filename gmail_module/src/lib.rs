pub mod client;
pub mod mime;
pub mod provider;
pub mod types;

pub use client::GmailClient;
pub use provider::{MailProvider, OutgoingReply, ProviderError};
pub use types::{HistoryDelta, InboundEmail, MessageRef};
