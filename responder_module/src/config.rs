//! Process configuration resolved from the environment at startup.

use std::env;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::rules::ReplyMode;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing {0}")]
    MissingVar(&'static str),
    #[error("invalid {0}: {1}")]
    InvalidVar(&'static str, String),
}

/// Everything the gateway and dispatcher need, resolved once at process
/// start. Secrets never come from request input.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub database_url: Option<String>,
    pub token_encryption_key: [u8; 32],
    pub google_client_id: String,
    pub google_client_secret: String,
    pub google_token_url: String,
    pub google_revoke_url: String,
    pub push_audience: String,
    pub push_issuers: Vec<String>,
    pub jwks_url: String,
    pub rate_limit_per_minute: u32,
    pub default_reply_mode: ReplyMode,
    pub service_api_token: String,
    pub openai_api_key: Option<String>,
    pub openai_api_url: String,
    pub generator_model: String,
    pub generator_max_tokens: u32,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = non_empty_var("GATEWAY_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = non_empty_var("GATEWAY_PORT")
            .map(|value| {
                value
                    .parse::<u16>()
                    .map_err(|_| ConfigError::InvalidVar("GATEWAY_PORT", value.clone()))
            })
            .transpose()?
            .unwrap_or(9200);

        let key_b64 =
            non_empty_var("TOKEN_ENCRYPTION_KEY").ok_or(ConfigError::MissingVar("TOKEN_ENCRYPTION_KEY"))?;
        let key_bytes = STANDARD
            .decode(key_b64.trim())
            .map_err(|err| ConfigError::InvalidVar("TOKEN_ENCRYPTION_KEY", err.to_string()))?;
        let token_encryption_key: [u8; 32] = key_bytes.try_into().map_err(|_| {
            ConfigError::InvalidVar("TOKEN_ENCRYPTION_KEY", "must decode to 32 bytes".to_string())
        })?;

        let default_reply_mode = non_empty_var("DEFAULT_REPLY_MODE")
            .map(|value| {
                value
                    .parse::<ReplyMode>()
                    .map_err(|_| ConfigError::InvalidVar("DEFAULT_REPLY_MODE", value.clone()))
            })
            .transpose()?
            .unwrap_or(ReplyMode::Draft);

        Ok(Self {
            host,
            port,
            database_url: non_empty_var("DATABASE_URL"),
            token_encryption_key,
            google_client_id: non_empty_var("GOOGLE_CLIENT_ID")
                .ok_or(ConfigError::MissingVar("GOOGLE_CLIENT_ID"))?,
            google_client_secret: non_empty_var("GOOGLE_CLIENT_SECRET")
                .ok_or(ConfigError::MissingVar("GOOGLE_CLIENT_SECRET"))?,
            google_token_url: non_empty_var("GOOGLE_TOKEN_URL")
                .unwrap_or_else(|| "https://oauth2.googleapis.com/token".to_string()),
            google_revoke_url: non_empty_var("GOOGLE_REVOKE_URL")
                .unwrap_or_else(|| "https://oauth2.googleapis.com/revoke".to_string()),
            push_audience: non_empty_var("PUSH_AUDIENCE")
                .ok_or(ConfigError::MissingVar("PUSH_AUDIENCE"))?,
            push_issuers: non_empty_var("PUSH_ISSUERS")
                .map(|value| {
                    value
                        .split(',')
                        .map(|issuer| issuer.trim().to_string())
                        .filter(|issuer| !issuer.is_empty())
                        .collect()
                })
                .unwrap_or_else(|| vec!["https://accounts.google.com".to_string()]),
            jwks_url: non_empty_var("PUSH_JWKS_URL")
                .unwrap_or_else(|| "https://www.googleapis.com/oauth2/v3/certs".to_string()),
            rate_limit_per_minute: non_empty_var("RATE_LIMIT_PER_MINUTE")
                .and_then(|value| value.parse::<u32>().ok())
                .filter(|value| *value > 0)
                .unwrap_or(100),
            default_reply_mode,
            service_api_token: non_empty_var("SERVICE_API_TOKEN")
                .ok_or(ConfigError::MissingVar("SERVICE_API_TOKEN"))?,
            openai_api_key: non_empty_var("OPENAI_API_KEY"),
            openai_api_url: non_empty_var("OPENAI_API_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string()),
            generator_model: non_empty_var("GENERATOR_MODEL")
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            generator_max_tokens: non_empty_var("GENERATOR_MAX_TOKENS")
                .and_then(|value| value.parse::<u32>().ok())
                .filter(|value| *value > 0)
                .unwrap_or(500),
        })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}
