//! Gmail REST client implementing the `MailProvider` capability.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use tracing::debug;

use crate::mime;
use crate::provider::{MailProvider, OutgoingReply, ProviderError};
use crate::types::{
    DraftRequest, DraftResponse, GmailMessage, HistoryDelta, HistoryResponse, InboundEmail,
    MessageRef, ProfileResponse, RawMessage, SendResponse,
};

const DEFAULT_BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct GmailClient {
    http: Client,
    base_url: String,
}

impl GmailClient {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Base URL override, used by tests to point at a local server.
    pub fn with_base_url(base_url: &str) -> Self {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        access_token: &str,
        url: &str,
        stale_cursor: Option<u64>,
    ) -> Result<T, ProviderError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|err| ProviderError::Http(err.to_string()))?;
        let response = check_status(response, stale_cursor).await?;
        response
            .json()
            .await
            .map_err(|err| ProviderError::InvalidResponse(err.to_string()))
    }
}

impl Default for GmailClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MailProvider for GmailClient {
    async fn fetch_history(
        &self,
        access_token: &str,
        start_cursor: u64,
    ) -> Result<HistoryDelta, ProviderError> {
        let url = format!(
            "{}/users/me/history?startHistoryId={}&historyTypes=messageAdded",
            self.base_url, start_cursor
        );
        let response: HistoryResponse = self
            .get_json(access_token, &url, Some(start_cursor))
            .await?;

        let messages: Vec<MessageRef> = response
            .history
            .unwrap_or_default()
            .into_iter()
            .flat_map(|record| record.messages_added)
            .map(|added| added.message)
            .collect();

        let new_cursor = response
            .history_id
            .as_deref()
            .and_then(|value| value.parse::<u64>().ok())
            .ok_or_else(|| {
                ProviderError::InvalidResponse("history response missing historyId".to_string())
            })?;

        debug!(
            "gmail history fetch from {}: {} new messages, cursor {}",
            start_cursor,
            messages.len(),
            new_cursor
        );
        Ok(HistoryDelta {
            messages,
            new_cursor,
        })
    }

    async fn current_cursor(&self, access_token: &str) -> Result<u64, ProviderError> {
        let url = format!("{}/users/me/profile", self.base_url);
        let profile: ProfileResponse = self.get_json(access_token, &url, None).await?;
        profile.history_id.parse::<u64>().map_err(|_| {
            ProviderError::InvalidResponse(format!(
                "profile historyId is not numeric: {}",
                profile.history_id
            ))
        })
    }

    async fn fetch_message(
        &self,
        access_token: &str,
        message_id: &str,
    ) -> Result<InboundEmail, ProviderError> {
        let url = format!(
            "{}/users/me/messages/{}?format=full",
            self.base_url, message_id
        );
        let message: GmailMessage = self.get_json(access_token, &url, None).await?;
        Ok(mime::parse_inbound(message))
    }

    async fn create_draft(
        &self,
        access_token: &str,
        reply: &OutgoingReply,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/users/me/drafts", self.base_url);
        let request = DraftRequest {
            message: RawMessage {
                raw: mime::build_raw_reply(reply),
                thread_id: reply.thread_id.clone(),
            },
        };
        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(&request)
            .send()
            .await
            .map_err(|err| ProviderError::Http(err.to_string()))?;
        let response = check_status(response, None).await?;
        let draft: DraftResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::InvalidResponse(err.to_string()))?;
        Ok(draft.id)
    }

    async fn send_message(
        &self,
        access_token: &str,
        reply: &OutgoingReply,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/users/me/messages/send", self.base_url);
        let request = RawMessage {
            raw: mime::build_raw_reply(reply),
            thread_id: reply.thread_id.clone(),
        };
        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(&request)
            .send()
            .await
            .map_err(|err| ProviderError::Http(err.to_string()))?;
        let response = check_status(response, None).await?;
        let sent: SendResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::InvalidResponse(err.to_string()))?;
        Ok(sent.id)
    }
}

/// Map Gmail error statuses onto the provider error taxonomy. A 404 on a
/// history fetch means the start cursor is unknown or expired.
async fn check_status(
    response: Response,
    stale_cursor: Option<u64>,
) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::NOT_FOUND {
        if let Some(cursor) = stale_cursor {
            return Err(ProviderError::StaleCursor(cursor));
        }
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(ProviderError::Authentication(
            "invalid or expired access token".to_string(),
        ));
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .unwrap_or(60);
        return Err(ProviderError::RateLimited(retry_after));
    }

    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::Http(format!("status {}: {}", status, body)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_history_collects_added_messages() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/users/me/history")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("startHistoryId".into(), "100".into()),
                mockito::Matcher::UrlEncoded("historyTypes".into(), "messageAdded".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{
                    "historyId": "120",
                    "history": [
                        {"messagesAdded": [{"message": {"id": "m1", "threadId": "t1"}}]},
                        {"messagesAdded": [{"message": {"id": "m2", "threadId": "t2"}}]}
                    ]
                }"#,
            )
            .create_async()
            .await;

        let client = GmailClient::with_base_url(&server.url());
        let delta = client.fetch_history("tok", 100).await.expect("history");
        assert_eq!(delta.new_cursor, 120);
        assert_eq!(delta.messages.len(), 2);
        assert_eq!(delta.messages[0].id, "m1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn fetch_history_maps_404_to_stale_cursor() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/users/me/history")
            .match_query(mockito::Matcher::Any)
            .with_status(404)
            .with_body(r#"{"error": {"code": 404}}"#)
            .create_async()
            .await;

        let client = GmailClient::with_base_url(&server.url());
        let err = client.fetch_history("tok", 99).await.unwrap_err();
        assert!(matches!(err, ProviderError::StaleCursor(99)));
    }

    #[tokio::test]
    async fn create_draft_posts_thread_scoped_raw_message() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/users/me/drafts")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "message": {"threadId": "t9"}
            })))
            .with_status(200)
            .with_body(r#"{"id": "draft-1"}"#)
            .create_async()
            .await;

        let client = GmailClient::with_base_url(&server.url());
        let reply = OutgoingReply {
            to: "a@b.com".to_string(),
            subject: "Re: hi".to_string(),
            body: "hello".to_string(),
            thread_id: "t9".to_string(),
            in_reply_to: None,
        };
        let id = client.create_draft("tok", &reply).await.expect("draft");
        assert_eq!(id, "draft-1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn current_cursor_parses_profile() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/users/me/profile")
            .with_status(200)
            .with_body(r#"{"historyId": "4321", "emailAddress": "me@example.com"}"#)
            .create_async()
            .await;

        let client = GmailClient::with_base_url(&server.url());
        assert_eq!(client.current_cursor("tok").await.unwrap(), 4321);
    }
}
