//! Reply text generation via an external chat-completion capability.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ServiceConfig;

const DEFAULT_INSTRUCTIONS: &str = "Reply to the email below professionally and concisely.";

#[derive(Debug, Clone)]
pub struct GeneratedReply {
    pub text: String,
    pub tokens_used: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("generation not configured: {0}")]
    NotConfigured(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("generation failed: {0}")]
    Api(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// One call per message; failures fail the message, there is no retry.
    async fn generate(
        &self,
        sender: &str,
        subject: &str,
        body: &str,
        custom_instructions: Option<&str>,
    ) -> Result<GeneratedReply, GeneratorError>;
}

pub fn build_prompt(
    sender: &str,
    subject: &str,
    body: &str,
    custom_instructions: Option<&str>,
) -> String {
    let instructions = custom_instructions
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .unwrap_or(DEFAULT_INSTRUCTIONS);
    format!(
        "{instructions}\n\nFrom: {sender}\nSubject: {subject}\n\n{body}"
    )
}

pub struct OpenAiGenerator {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
}

impl OpenAiGenerator {
    pub fn new(config: &ServiceConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            api_url: config.openai_api_url.clone(),
            api_key: config.openai_api_key.clone(),
            model: config.generator_model.clone(),
            max_tokens: config.generator_max_tokens,
        }
    }
}

#[async_trait]
impl ReplyGenerator for OpenAiGenerator {
    async fn generate(
        &self,
        sender: &str,
        subject: &str,
        body: &str,
        custom_instructions: Option<&str>,
    ) -> Result<GeneratedReply, GeneratorError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| GeneratorError::NotConfigured("OPENAI_API_KEY not set".to_string()))?;

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: build_prompt(sender, subject, body, custom_instructions),
            }],
            max_completion_tokens: self.max_tokens,
        };

        debug!("calling generation API with model {}", self.model);

        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&request)
            .send()
            .await
            .map_err(|err| GeneratorError::Http(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GeneratorError::Api(format!("{}: {}", status, body)));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|err| GeneratorError::InvalidResponse(err.to_string()))?;

        let text = chat
            .choices
            .first()
            .map(|choice| choice.message.content.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| GeneratorError::InvalidResponse("empty completion".to_string()))?;

        Ok(GeneratedReply {
            text,
            tokens_used: chat.usage.map(|usage| usage.total_tokens).unwrap_or(0),
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_completion_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    total_tokens: i64,
}
