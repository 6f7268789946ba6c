//! Background dispatch of queued notifications, plus the synchronous
//! manual-pull path. Both drive history sync and the event processor the
//! same way; only the entry point differs.

use std::sync::Arc;

use chrono::Utc;
use gmail_module::MailProvider;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::connection_store::{Connection, ConnectionStore};
use crate::credential_vault::{CredentialVault, VaultError};
use crate::generator::ReplyGenerator;
use crate::history_sync::{sync_new_messages, SyncError};
use crate::notification_queue::NotificationQueue;
use crate::processing_log::{
    DailyStatsDelta, ProcessingLog, ProcessingLogEntry, ProcessingLogError,
};
use crate::processor::{EventProcessor, MessageOutcome};
use crate::rule_store::RuleStore;

pub struct Dispatcher {
    pub provider: Arc<dyn MailProvider>,
    pub generator: Arc<dyn ReplyGenerator>,
    pub vault: Arc<CredentialVault>,
    pub connections: Arc<dyn ConnectionStore>,
    pub rules: Arc<dyn RuleStore>,
    pub queue: Arc<dyn NotificationQueue>,
    pub log: Arc<dyn ProcessingLog>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageResult {
    pub message_id: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PullSummary {
    pub total: usize,
    pub processed: usize,
    pub skipped: usize,
    pub results: Vec<MessageResult>,
}

#[derive(Debug, thiserror::Error)]
pub enum PullError {
    #[error("no connection for user")]
    NoConnection,
    #[error(transparent)]
    Token(#[from] VaultError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Log(#[from] ProcessingLogError),
    #[error("store error: {0}")]
    Store(#[from] crate::connection_store::ConnectionStoreError),
    #[error("rule store error: {0}")]
    Rules(#[from] crate::rule_store::RuleStoreError),
    #[error("queue error: {0}")]
    Queue(#[from] crate::notification_queue::NotificationQueueError),
}

impl Dispatcher {
    /// Fire-and-forget: submits the entry to a detached task and returns
    /// without awaiting the outcome. The webhook handler calls this after
    /// the response status is already decided.
    pub fn dispatch_entry(self: &Arc<Self>, entry_id: Uuid) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            dispatcher.process_entry(entry_id).await;
        });
    }

    /// Drives one queue entry to `completed` or `failed`. Per-message
    /// failures are isolated; only sync or store failures fail the entry.
    pub async fn process_entry(&self, entry_id: Uuid) {
        let entry = match self.queue.get(entry_id) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                warn!("queue entry {} vanished before dispatch", entry_id);
                return;
            }
            Err(err) => {
                error!("failed to load queue entry {}: {}", entry_id, err);
                return;
            }
        };

        if let Err(err) = self.queue.mark_processing(entry_id) {
            error!("failed to mark entry {} processing: {}", entry_id, err);
            return;
        }

        match self.run_entry(entry.user_id).await {
            Ok(batch_size) => {
                info!(
                    "entry {} completed, {} messages evaluated",
                    entry_id, batch_size
                );
                if let Err(err) = self.queue.mark_completed(entry_id) {
                    error!("failed to mark entry {} completed: {}", entry_id, err);
                }
            }
            Err(err) => {
                warn!("entry {} failed: {}", entry_id, err);
                if let Err(mark_err) = self.queue.mark_failed(entry_id, &err.to_string()) {
                    error!("failed to mark entry {} failed: {}", entry_id, mark_err);
                }
            }
        }
    }

    async fn run_entry(&self, user_id: Uuid) -> Result<usize, PullError> {
        let mut connection = self
            .connections
            .find_by_user(user_id)?
            .ok_or(PullError::NoConnection)?;

        if !connection.auto_reply_enabled {
            info!(
                "auto-reply disabled for {}, acknowledging without processing",
                connection.mail_address
            );
            return Ok(0);
        }

        let summary = self.sync_and_process(&mut connection).await?;
        Ok(summary.total)
    }

    /// Synchronous pull for the manual endpoint. Runs regardless of the
    /// auto-reply flag since the user asked explicitly.
    pub async fn pull_now(&self, user_id: Uuid) -> Result<PullSummary, PullError> {
        let mut connection = self
            .connections
            .find_by_user(user_id)?
            .ok_or(PullError::NoConnection)?;
        self.sync_and_process(&mut connection).await
    }

    async fn sync_and_process(
        &self,
        connection: &mut Connection,
    ) -> Result<PullSummary, PullError> {
        let access_token = self
            .vault
            .access_token(self.connections.as_ref(), connection)
            .await?;

        let batch = sync_new_messages(
            self.provider.as_ref(),
            self.connections.as_ref(),
            connection,
            &access_token,
        )
        .await?;

        let rules = self.rules.active_rules(connection.user_id)?;
        let processor = EventProcessor {
            provider: self.provider.as_ref(),
            generator: self.generator.as_ref(),
            log: self.log.as_ref(),
        };

        let mut results = Vec::with_capacity(batch.messages.len());
        // Sequential on purpose: stats updates are read-modify-write per
        // user/day and must not race within a batch.
        for message_ref in &batch.messages {
            let email = match self
                .provider
                .fetch_message(&access_token, &message_ref.id)
                .await
            {
                Ok(email) => email,
                Err(err) => {
                    warn!("failed to fetch message {}: {}", message_ref.id, err);
                    self.record_fetch_failure(connection, &message_ref.id, &err.to_string())?;
                    results.push(MessageResult {
                        message_id: message_ref.id.clone(),
                        action: "failed".to_string(),
                        error: Some(err.to_string()),
                    });
                    continue;
                }
            };

            let outcome = processor
                .process_message(connection, &access_token, &rules, &email)
                .await?;
            results.push(MessageResult {
                message_id: email.id.clone(),
                action: outcome.as_action().to_string(),
                error: match outcome {
                    MessageOutcome::Failed(err) => Some(err),
                    _ => None,
                },
            });
        }

        let skipped = results
            .iter()
            .filter(|result| result.action == "ignored")
            .count();
        Ok(PullSummary {
            total: results.len(),
            processed: results.len() - skipped,
            skipped,
            results,
        })
    }

    fn record_fetch_failure(
        &self,
        connection: &Connection,
        message_id: &str,
        error: &str,
    ) -> Result<(), ProcessingLogError> {
        self.log.append(&ProcessingLogEntry {
            id: Uuid::new_v4(),
            user_id: connection.user_id,
            message_id: message_id.to_string(),
            sender: String::new(),
            subject: String::new(),
            matched_rule_id: None,
            action: "failed".to_string(),
            tokens_used: 0,
            latency_ms: 0,
            error: Some(error.to_string()),
            result_id: None,
            created_at: Utc::now(),
        })?;
        self.log.record_stats(
            connection.user_id,
            Utc::now().date_naive(),
            &DailyStatsDelta {
                processed: 1,
                failed: 1,
                ..Default::default()
            },
        )
    }

    /// Disconnect: best-effort provider revocation, then the connection
    /// and its queue entries go away.
    pub async fn disconnect(&self, user_id: Uuid) -> Result<(), PullError> {
        let mut connection = self
            .connections
            .find_by_user(user_id)?
            .ok_or(PullError::NoConnection)?;

        self.vault
            .revoke(self.connections.as_ref(), &mut connection)
            .await;
        self.queue.delete_for_user(user_id)?;
        self.connections.delete(user_id)?;
        info!("disconnected {}", connection.mail_address);
        Ok(())
    }
}
