//! Append-only per-message processing log plus daily aggregate counters.

use std::collections::HashMap;
use std::env;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, Utc};
use postgres_native_tls::MakeTlsConnector;
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use uuid::Uuid;

use crate::connection_store::{build_pool, resolve_store_backend, PoolBuildError};

#[derive(Debug, Clone)]
pub struct ProcessingLogEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub message_id: String,
    pub sender: String,
    pub subject: String,
    pub matched_rule_id: Option<Uuid>,
    pub action: String,
    pub tokens_used: i64,
    pub latency_ms: i64,
    pub error: Option<String>,
    pub result_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DailyStats {
    pub total_processed: i64,
    pub total_ignored: i64,
    pub total_failed: i64,
    pub drafts_created: i64,
    pub emails_sent: i64,
    pub tokens_used: i64,
    pub avg_latency_ms: f64,
}

/// Increment applied per evaluated message. `processed` is 1 for every
/// message regardless of outcome; the latency feeds the running average.
#[derive(Debug, Clone, Default)]
pub struct DailyStatsDelta {
    pub processed: i64,
    pub ignored: i64,
    pub failed: i64,
    pub drafts_created: i64,
    pub emails_sent: i64,
    pub tokens_used: i64,
    pub latency_ms: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessingLogError {
    #[error("postgres error: {0}")]
    Postgres(#[from] postgres::Error),
    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("missing DATABASE_URL")]
    MissingDbUrl,
    #[error("lock poisoned")]
    LockPoisoned,
    #[error("config error: {0}")]
    Config(String),
}

pub trait ProcessingLog: Send + Sync {
    fn append(&self, entry: &ProcessingLogEntry) -> Result<(), ProcessingLogError>;
    fn record_stats(
        &self,
        user_id: Uuid,
        day: NaiveDate,
        delta: &DailyStatsDelta,
    ) -> Result<(), ProcessingLogError>;
    fn daily_stats(
        &self,
        user_id: Uuid,
        day: NaiveDate,
    ) -> Result<Option<DailyStats>, ProcessingLogError>;
}

#[derive(Clone)]
pub struct PostgresProcessingLog {
    pool: Option<Pool<PostgresConnectionManager<MakeTlsConnector>>>,
}

impl PostgresProcessingLog {
    pub fn from_env() -> Result<Self, ProcessingLogError> {
        let db_url = env::var("DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or(ProcessingLogError::MissingDbUrl)?;
        Self::new(&db_url)
    }

    pub fn new(db_url: &str) -> Result<Self, ProcessingLogError> {
        let pool = build_pool(db_url).map_err(|err| match err {
            PoolBuildError::Postgres(e) => ProcessingLogError::Postgres(e),
            PoolBuildError::Pool(e) => ProcessingLogError::Pool(e),
            PoolBuildError::Config(e) => ProcessingLogError::Config(e),
        })?;
        let log = Self { pool: Some(pool) };
        log.ensure_schema()?;
        Ok(log)
    }

    fn conn(
        &self,
    ) -> Result<PooledConnection<PostgresConnectionManager<MakeTlsConnector>>, ProcessingLogError>
    {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| ProcessingLogError::Config("processing log pool dropped".to_string()))?;
        Ok(pool.get()?)
    }

    fn ensure_schema(&self) -> Result<(), ProcessingLogError> {
        let mut conn = self.conn()?;
        conn.batch_execute(
            "CREATE TABLE IF NOT EXISTS processing_log (
                id UUID PRIMARY KEY,
                user_id UUID NOT NULL,
                message_id TEXT NOT NULL,
                sender TEXT NOT NULL,
                subject TEXT NOT NULL,
                matched_rule_id UUID,
                action TEXT NOT NULL,
                tokens_used BIGINT NOT NULL DEFAULT 0,
                latency_ms BIGINT NOT NULL DEFAULT 0,
                error TEXT,
                result_id TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            CREATE INDEX IF NOT EXISTS processing_log_user_idx
                ON processing_log(user_id, created_at);
            CREATE TABLE IF NOT EXISTS daily_stats (
                user_id UUID NOT NULL,
                day DATE NOT NULL,
                total_processed BIGINT NOT NULL DEFAULT 0,
                total_ignored BIGINT NOT NULL DEFAULT 0,
                total_failed BIGINT NOT NULL DEFAULT 0,
                drafts_created BIGINT NOT NULL DEFAULT 0,
                emails_sent BIGINT NOT NULL DEFAULT 0,
                tokens_used BIGINT NOT NULL DEFAULT 0,
                avg_latency_ms DOUBLE PRECISION NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, day)
            );",
        )?;
        Ok(())
    }
}

impl ProcessingLog for PostgresProcessingLog {
    fn append(&self, entry: &ProcessingLogEntry) -> Result<(), ProcessingLogError> {
        let mut conn = self.conn()?;
        conn.execute(
            "INSERT INTO processing_log
                (id, user_id, message_id, sender, subject, matched_rule_id, action,
                 tokens_used, latency_ms, error, result_id, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            &[
                &entry.id,
                &entry.user_id,
                &entry.message_id,
                &entry.sender,
                &entry.subject,
                &entry.matched_rule_id,
                &entry.action,
                &entry.tokens_used,
                &entry.latency_ms,
                &entry.error,
                &entry.result_id,
                &entry.created_at,
            ],
        )?;
        Ok(())
    }

    fn record_stats(
        &self,
        user_id: Uuid,
        day: NaiveDate,
        delta: &DailyStatsDelta,
    ) -> Result<(), ProcessingLogError> {
        let mut conn = self.conn()?;
        let latency = delta.latency_ms as f64;
        conn.execute(
            "INSERT INTO daily_stats
                (user_id, day, total_processed, total_ignored, total_failed,
                 drafts_created, emails_sent, tokens_used, avg_latency_ms)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (user_id, day) DO UPDATE SET
                total_processed = daily_stats.total_processed + EXCLUDED.total_processed,
                total_ignored = daily_stats.total_ignored + EXCLUDED.total_ignored,
                total_failed = daily_stats.total_failed + EXCLUDED.total_failed,
                drafts_created = daily_stats.drafts_created + EXCLUDED.drafts_created,
                emails_sent = daily_stats.emails_sent + EXCLUDED.emails_sent,
                tokens_used = daily_stats.tokens_used + EXCLUDED.tokens_used,
                avg_latency_ms =
                    (daily_stats.avg_latency_ms * daily_stats.total_processed
                        + EXCLUDED.avg_latency_ms * EXCLUDED.total_processed)
                    / GREATEST(daily_stats.total_processed + EXCLUDED.total_processed, 1)",
            &[
                &user_id,
                &day,
                &delta.processed,
                &delta.ignored,
                &delta.failed,
                &delta.drafts_created,
                &delta.emails_sent,
                &delta.tokens_used,
                &latency,
            ],
        )?;
        Ok(())
    }

    fn daily_stats(
        &self,
        user_id: Uuid,
        day: NaiveDate,
    ) -> Result<Option<DailyStats>, ProcessingLogError> {
        let mut conn = self.conn()?;
        let row = conn.query_opt(
            "SELECT total_processed, total_ignored, total_failed, drafts_created,
                    emails_sent, tokens_used, avg_latency_ms
             FROM daily_stats WHERE user_id = $1 AND day = $2",
            &[&user_id, &day],
        )?;
        Ok(row.map(|r| DailyStats {
            total_processed: r.get(0),
            total_ignored: r.get(1),
            total_failed: r.get(2),
            drafts_created: r.get(3),
            emails_sent: r.get(4),
            tokens_used: r.get(5),
            avg_latency_ms: r.get(6),
        }))
    }
}

impl Drop for PostgresProcessingLog {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            std::thread::spawn(move || drop(pool));
        }
    }
}

#[derive(Default)]
pub struct MemoryProcessingLog {
    entries: Mutex<Vec<ProcessingLogEntry>>,
    stats: Mutex<HashMap<(Uuid, NaiveDate), DailyStats>>,
}

impl MemoryProcessingLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries_for_user(&self, user_id: Uuid) -> Vec<ProcessingLogEntry> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .cloned()
            .collect()
    }
}

impl ProcessingLog for MemoryProcessingLog {
    fn append(&self, entry: &ProcessingLogEntry) -> Result<(), ProcessingLogError> {
        let mut entries = self.entries.lock().map_err(|_| ProcessingLogError::LockPoisoned)?;
        entries.push(entry.clone());
        Ok(())
    }

    fn record_stats(
        &self,
        user_id: Uuid,
        day: NaiveDate,
        delta: &DailyStatsDelta,
    ) -> Result<(), ProcessingLogError> {
        let mut stats = self.stats.lock().map_err(|_| ProcessingLogError::LockPoisoned)?;
        let current = stats.entry((user_id, day)).or_default();
        let new_total = current.total_processed + delta.processed;
        if new_total > 0 {
            current.avg_latency_ms = (current.avg_latency_ms * current.total_processed as f64
                + delta.latency_ms as f64 * delta.processed as f64)
                / new_total as f64;
        }
        current.total_processed = new_total;
        current.total_ignored += delta.ignored;
        current.total_failed += delta.failed;
        current.drafts_created += delta.drafts_created;
        current.emails_sent += delta.emails_sent;
        current.tokens_used += delta.tokens_used;
        Ok(())
    }

    fn daily_stats(
        &self,
        user_id: Uuid,
        day: NaiveDate,
    ) -> Result<Option<DailyStats>, ProcessingLogError> {
        let stats = self.stats.lock().map_err(|_| ProcessingLogError::LockPoisoned)?;
        Ok(stats.get(&(user_id, day)).cloned())
    }
}

pub fn build_processing_log_from_env() -> Result<Arc<dyn ProcessingLog>, ProcessingLogError> {
    if resolve_store_backend() == "memory" {
        return Ok(Arc::new(MemoryProcessingLog::new()));
    }
    Ok(Arc::new(PostgresProcessingLog::from_env()?))
}
