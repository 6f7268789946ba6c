//! Fakes and fixtures shared by the pipeline tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use gmail_module::{
    HistoryDelta, InboundEmail, MailProvider, MessageRef, OutgoingReply, ProviderError,
};
use responder_module::config::ServiceConfig;
use responder_module::connection_store::{Connection, ConnectionStore, MemoryConnectionStore};
use responder_module::credential_vault::CredentialVault;
use responder_module::dispatcher::Dispatcher;
use responder_module::generator::{GeneratedReply, GeneratorError, ReplyGenerator};
use responder_module::notification_queue::MemoryNotificationQueue;
use responder_module::processing_log::MemoryProcessingLog;
use responder_module::rule_store::MemoryRuleStore;
use responder_module::rules::ReplyMode;

pub enum HistoryStep {
    Deliver(HistoryDelta),
    Stale,
}

#[derive(Default)]
pub struct FakeProvider {
    pub history_plan: Mutex<VecDeque<HistoryStep>>,
    pub messages: Mutex<HashMap<String, InboundEmail>>,
    pub current_cursor: AtomicU64,
    pub history_calls: AtomicUsize,
    pub drafts: Mutex<Vec<OutgoingReply>>,
    pub sent: Mutex<Vec<OutgoingReply>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan_delivery(&self, message_ids: &[&str], new_cursor: u64) {
        let messages = message_ids
            .iter()
            .map(|id| MessageRef {
                id: id.to_string(),
                thread_id: format!("thread-{id}"),
            })
            .collect();
        self.history_plan
            .lock()
            .unwrap()
            .push_back(HistoryStep::Deliver(HistoryDelta {
                messages,
                new_cursor,
            }));
    }

    pub fn plan_stale(&self) {
        self.history_plan
            .lock()
            .unwrap()
            .push_back(HistoryStep::Stale);
    }

    pub fn add_message(&self, id: &str, sender: &str, subject: &str, body: &str) {
        self.messages.lock().unwrap().insert(
            id.to_string(),
            InboundEmail {
                id: id.to_string(),
                thread_id: format!("thread-{id}"),
                sender: sender.to_string(),
                subject: subject.to_string(),
                body: body.to_string(),
                rfc822_message_id: Some(format!("<{id}@mail.example.com>")),
            },
        );
    }
}

#[async_trait]
impl MailProvider for FakeProvider {
    async fn fetch_history(
        &self,
        _access_token: &str,
        start_cursor: u64,
    ) -> Result<HistoryDelta, ProviderError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        let step = self.history_plan.lock().unwrap().pop_front();
        match step {
            Some(HistoryStep::Deliver(delta)) => Ok(delta),
            Some(HistoryStep::Stale) => Err(ProviderError::StaleCursor(start_cursor)),
            None => Ok(HistoryDelta {
                messages: Vec::new(),
                new_cursor: start_cursor,
            }),
        }
    }

    async fn current_cursor(&self, _access_token: &str) -> Result<u64, ProviderError> {
        Ok(self.current_cursor.load(Ordering::SeqCst))
    }

    async fn fetch_message(
        &self,
        _access_token: &str,
        message_id: &str,
    ) -> Result<InboundEmail, ProviderError> {
        self.messages
            .lock()
            .unwrap()
            .get(message_id)
            .cloned()
            .ok_or_else(|| ProviderError::InvalidResponse(format!("no message {message_id}")))
    }

    async fn create_draft(
        &self,
        _access_token: &str,
        reply: &OutgoingReply,
    ) -> Result<String, ProviderError> {
        let mut drafts = self.drafts.lock().unwrap();
        drafts.push(reply.clone());
        Ok(format!("draft-{}", drafts.len()))
    }

    async fn send_message(
        &self,
        _access_token: &str,
        reply: &OutgoingReply,
    ) -> Result<String, ProviderError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push(reply.clone());
        Ok(format!("sent-{}", sent.len()))
    }
}

#[derive(Default)]
pub struct FakeGenerator {
    pub calls: AtomicUsize,
    pub fail_for_sender: Mutex<Option<String>>,
}

impl FakeGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, sender: &str) {
        *self.fail_for_sender.lock().unwrap() = Some(sender.to_string());
    }
}

#[async_trait]
impl ReplyGenerator for FakeGenerator {
    async fn generate(
        &self,
        sender: &str,
        _subject: &str,
        _body: &str,
        custom_instructions: Option<&str>,
    ) -> Result<GeneratedReply, GeneratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_for_sender
            .lock()
            .unwrap()
            .as_deref()
            .is_some_and(|failing| failing == sender)
        {
            return Err(GeneratorError::Api("model unavailable".to_string()));
        }
        let text = match custom_instructions {
            Some(instructions) => format!("[{instructions}] Thanks for reaching out."),
            None => "Thanks for reaching out.".to_string(),
        };
        Ok(GeneratedReply {
            text,
            tokens_used: 50,
        })
    }
}

pub fn test_config() -> ServiceConfig {
    ServiceConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        database_url: None,
        token_encryption_key: [9u8; 32],
        google_client_id: "cid".to_string(),
        google_client_secret: "secret".to_string(),
        google_token_url: "http://127.0.0.1:1/token".to_string(),
        google_revoke_url: "http://127.0.0.1:1/revoke".to_string(),
        push_audience: "aud".to_string(),
        push_issuers: vec!["https://accounts.google.com".to_string()],
        jwks_url: "http://127.0.0.1:1/certs".to_string(),
        rate_limit_per_minute: 100,
        default_reply_mode: ReplyMode::Draft,
        service_api_token: "svc".to_string(),
        openai_api_key: None,
        openai_api_url: "http://127.0.0.1:1/v1/chat/completions".to_string(),
        generator_model: "gpt-4o-mini".to_string(),
        generator_max_tokens: 500,
    }
}

pub struct Pipeline {
    pub provider: Arc<FakeProvider>,
    pub generator: Arc<FakeGenerator>,
    pub connections: Arc<MemoryConnectionStore>,
    pub rules: Arc<MemoryRuleStore>,
    pub queue: Arc<MemoryNotificationQueue>,
    pub log: Arc<MemoryProcessingLog>,
    pub dispatcher: Arc<Dispatcher>,
    pub user_id: Uuid,
}

/// Fully in-memory pipeline with one connected user. The stored access
/// token has a far-future expiry so the vault never goes to the network.
pub fn build_pipeline(mail_address: &str, default_reply_mode: ReplyMode) -> Pipeline {
    let config = test_config();
    let vault = Arc::new(CredentialVault::new(&config));

    let provider = Arc::new(FakeProvider::new());
    let generator = Arc::new(FakeGenerator::new());
    let connections = Arc::new(MemoryConnectionStore::new());
    let rules = Arc::new(MemoryRuleStore::new());
    let queue = Arc::new(MemoryNotificationQueue::new());
    let log = Arc::new(MemoryProcessingLog::new());

    let user_id = Uuid::new_v4();
    let connection = Connection {
        user_id,
        mail_address: mail_address.to_string(),
        access_token_enc: vault.cipher().encrypt("access-token").expect("encrypt"),
        refresh_token_enc: vault.cipher().encrypt("refresh-token").expect("encrypt"),
        access_token_expires_at: Utc::now() + chrono::Duration::hours(2),
        last_history_id: Some(100),
        default_reply_mode,
        auto_reply_enabled: true,
        last_synced_at: None,
    };
    connections.upsert(&connection).expect("upsert");

    let dispatcher = Arc::new(Dispatcher {
        provider: provider.clone(),
        generator: generator.clone(),
        vault,
        connections: connections.clone(),
        rules: rules.clone(),
        queue: queue.clone(),
        log: log.clone(),
    });

    Pipeline {
        provider,
        generator,
        connections,
        rules,
        queue,
        log,
        dispatcher,
        user_id,
    }
}
