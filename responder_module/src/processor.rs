//! Per-message state machine: rule match, generation, mail action, then
//! one log row and a stats update regardless of the branch taken.

use std::time::Instant;

use chrono::Utc;
use gmail_module::{InboundEmail, MailProvider, OutgoingReply};
use tracing::{info, warn};
use uuid::Uuid;

use gmail_module::mime::reply_subject;

use crate::connection_store::Connection;
use crate::generator::{GeneratedReply, ReplyGenerator};
use crate::processing_log::{DailyStatsDelta, ProcessingLog, ProcessingLogEntry, ProcessingLogError};
use crate::rules::{match_sender, ReplyMode, RuleAction, SenderRule};

/// Terminal state for one message, assigned exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    Ignored,
    RepliedDraft(String),
    RepliedSent(String),
    Failed(String),
}

impl MessageOutcome {
    pub fn as_action(&self) -> &'static str {
        match self {
            MessageOutcome::Ignored => "ignored",
            MessageOutcome::RepliedDraft(_) => "replied_draft",
            MessageOutcome::RepliedSent(_) => "replied_sent",
            MessageOutcome::Failed(_) => "failed",
        }
    }
}

pub struct EventProcessor<'a> {
    pub provider: &'a dyn MailProvider,
    pub generator: &'a dyn ReplyGenerator,
    pub log: &'a dyn ProcessingLog,
}

impl<'a> EventProcessor<'a> {
    /// Processes one message to a terminal state. Provider and generation
    /// failures land in the outcome; store failures propagate and fail the
    /// surrounding batch.
    pub async fn process_message(
        &self,
        connection: &Connection,
        access_token: &str,
        rules: &[SenderRule],
        email: &InboundEmail,
    ) -> Result<MessageOutcome, ProcessingLogError> {
        let started = Instant::now();
        let matched = match_sender(rules, &email.sender);

        let mut tokens_used = 0i64;
        let outcome = match matched.map(|rule| rule.action) {
            // Flagged senders are not replied to either; the matched rule id
            // in the log records which rule fired.
            Some(RuleAction::Ignore) | Some(RuleAction::Flag) => MessageOutcome::Ignored,
            Some(RuleAction::Reply) | None => {
                let custom = matched.and_then(|rule| rule.custom_instructions.as_deref());
                match self
                    .generator
                    .generate(&email.sender, &email.subject, &email.body, custom)
                    .await
                {
                    Err(err) => MessageOutcome::Failed(err.to_string()),
                    Ok(generated) => {
                        tokens_used = generated.tokens_used;
                        let mode = matched
                            .and_then(|rule| rule.reply_mode_override)
                            .unwrap_or(connection.default_reply_mode);
                        self.execute_reply(access_token, email, &generated, mode).await
                    }
                }
            }
        };

        let latency_ms = started.elapsed().as_millis() as i64;
        self.record(connection, email, matched, &outcome, tokens_used, latency_ms)?;

        info!(
            "processed message {} from {}: {}",
            email.id,
            email.sender,
            outcome.as_action()
        );
        Ok(outcome)
    }

    async fn execute_reply(
        &self,
        access_token: &str,
        email: &InboundEmail,
        generated: &GeneratedReply,
        mode: ReplyMode,
    ) -> MessageOutcome {
        let reply = OutgoingReply {
            to: email.sender.clone(),
            subject: reply_subject(&email.subject),
            body: generated.text.clone(),
            thread_id: email.thread_id.clone(),
            in_reply_to: email.rfc822_message_id.clone(),
        };

        match mode {
            ReplyMode::Draft => match self.provider.create_draft(access_token, &reply).await {
                Ok(draft_id) => MessageOutcome::RepliedDraft(draft_id),
                Err(err) => {
                    warn!("draft creation failed for message {}: {}", email.id, err);
                    MessageOutcome::Failed(err.to_string())
                }
            },
            ReplyMode::Send => match self.provider.send_message(access_token, &reply).await {
                Ok(sent_id) => MessageOutcome::RepliedSent(sent_id),
                Err(err) => {
                    warn!("send failed for message {}: {}", email.id, err);
                    MessageOutcome::Failed(err.to_string())
                }
            },
        }
    }

    fn record(
        &self,
        connection: &Connection,
        email: &InboundEmail,
        matched: Option<&SenderRule>,
        outcome: &MessageOutcome,
        tokens_used: i64,
        latency_ms: i64,
    ) -> Result<(), ProcessingLogError> {
        let (error, result_id) = match outcome {
            MessageOutcome::Failed(err) => (Some(err.clone()), None),
            MessageOutcome::RepliedDraft(id) | MessageOutcome::RepliedSent(id) => {
                (None, Some(id.clone()))
            }
            MessageOutcome::Ignored => (None, None),
        };

        self.log.append(&ProcessingLogEntry {
            id: Uuid::new_v4(),
            user_id: connection.user_id,
            message_id: email.id.clone(),
            sender: email.sender.clone(),
            subject: email.subject.clone(),
            matched_rule_id: matched.map(|rule| rule.id),
            action: outcome.as_action().to_string(),
            tokens_used,
            latency_ms,
            error,
            result_id,
            created_at: Utc::now(),
        })?;

        let delta = DailyStatsDelta {
            processed: 1,
            ignored: matches!(outcome, MessageOutcome::Ignored) as i64,
            failed: matches!(outcome, MessageOutcome::Failed(_)) as i64,
            drafts_created: matches!(outcome, MessageOutcome::RepliedDraft(_)) as i64,
            emails_sent: matches!(outcome, MessageOutcome::RepliedSent(_)) as i64,
            tokens_used,
            latency_ms,
        };
        self.log
            .record_stats(connection.user_id, Utc::now().date_naive(), &delta)
    }
}
