//! Queue of webhook deliveries awaiting background processing. One entry
//! per distinct (user, cursor); duplicates while an entry is pending or
//! processing are dropped, failed entries are reset in place on
//! redelivery.

use std::collections::HashMap;
use std::env;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use postgres_native_tls::MakeTlsConnector;
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use uuid::Uuid;

use crate::connection_store::{build_pool, resolve_store_backend, PoolBuildError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(QueueStatus::Pending),
            "processing" => Some(QueueStatus::Processing),
            "completed" => Some(QueueStatus::Completed),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub mail_address: String,
    pub cursor: i64,
    pub status: QueueStatus,
    pub error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new or reset entry is ready for dispatch.
    Enqueued(Uuid),
    /// An entry for this (user, cursor) is already pending or processing.
    Duplicate,
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationQueueError {
    #[error("postgres error: {0}")]
    Postgres(#[from] postgres::Error),
    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("missing DATABASE_URL")]
    MissingDbUrl,
    #[error("queue entry not found")]
    NotFound,
    #[error("lock poisoned")]
    LockPoisoned,
    #[error("config error: {0}")]
    Config(String),
}

pub trait NotificationQueue: Send + Sync {
    fn enqueue(
        &self,
        user_id: Uuid,
        mail_address: &str,
        cursor: i64,
    ) -> Result<EnqueueOutcome, NotificationQueueError>;
    fn get(&self, id: Uuid) -> Result<Option<QueueEntry>, NotificationQueueError>;
    fn mark_processing(&self, id: Uuid) -> Result<(), NotificationQueueError>;
    fn mark_completed(&self, id: Uuid) -> Result<(), NotificationQueueError>;
    fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), NotificationQueueError>;
    fn delete_for_user(&self, user_id: Uuid) -> Result<(), NotificationQueueError>;
}

#[derive(Clone)]
pub struct PostgresNotificationQueue {
    pool: Option<Pool<PostgresConnectionManager<MakeTlsConnector>>>,
}

impl PostgresNotificationQueue {
    pub fn from_env() -> Result<Self, NotificationQueueError> {
        let db_url = env::var("DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or(NotificationQueueError::MissingDbUrl)?;
        Self::new(&db_url)
    }

    pub fn new(db_url: &str) -> Result<Self, NotificationQueueError> {
        let pool = build_pool(db_url).map_err(|err| match err {
            PoolBuildError::Postgres(e) => NotificationQueueError::Postgres(e),
            PoolBuildError::Pool(e) => NotificationQueueError::Pool(e),
            PoolBuildError::Config(e) => NotificationQueueError::Config(e),
        })?;
        let queue = Self { pool: Some(pool) };
        queue.ensure_schema()?;
        Ok(queue)
    }

    fn conn(
        &self,
    ) -> Result<
        PooledConnection<PostgresConnectionManager<MakeTlsConnector>>,
        NotificationQueueError,
    > {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| NotificationQueueError::Config("queue pool dropped".to_string()))?;
        Ok(pool.get()?)
    }

    fn ensure_schema(&self) -> Result<(), NotificationQueueError> {
        let mut conn = self.conn()?;
        conn.batch_execute(
            "CREATE TABLE IF NOT EXISTS notification_queue (
                id UUID PRIMARY KEY,
                user_id UUID NOT NULL,
                mail_address TEXT NOT NULL,
                cursor_value BIGINT NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                enqueued_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                processed_at TIMESTAMPTZ
            );
            CREATE UNIQUE INDEX IF NOT EXISTS notification_queue_live_idx
                ON notification_queue(user_id, cursor_value)
                WHERE status IN ('pending', 'processing');",
        )?;
        Ok(())
    }
}

impl NotificationQueue for PostgresNotificationQueue {
    fn enqueue(
        &self,
        user_id: Uuid,
        mail_address: &str,
        cursor: i64,
    ) -> Result<EnqueueOutcome, NotificationQueueError> {
        let mut conn = self.conn()?;
        let mut tx = conn.transaction()?;

        let existing = tx.query_opt(
            "SELECT id, status FROM notification_queue
             WHERE user_id = $1 AND cursor_value = $2 AND status IN ('pending', 'processing', 'failed')
             ORDER BY enqueued_at DESC
             LIMIT 1
             FOR UPDATE",
            &[&user_id, &cursor],
        )?;

        if let Some(row) = existing {
            let id: Uuid = row.get(0);
            let status: String = row.get(1);
            if status == "failed" {
                tx.execute(
                    "UPDATE notification_queue
                     SET status = 'pending', error = NULL, enqueued_at = now(), processed_at = NULL
                     WHERE id = $1",
                    &[&id],
                )?;
                tx.commit()?;
                return Ok(EnqueueOutcome::Enqueued(id));
            }
            tx.commit()?;
            return Ok(EnqueueOutcome::Duplicate);
        }

        let id = Uuid::new_v4();
        let inserted = tx.execute(
            "INSERT INTO notification_queue
                (id, user_id, mail_address, cursor_value, status, enqueued_at)
             VALUES ($1, $2, $3, $4, 'pending', now())
             ON CONFLICT DO NOTHING",
            &[&id, &user_id, &mail_address, &cursor],
        )?;
        tx.commit()?;

        if inserted == 0 {
            // Lost a race with a concurrent delivery of the same cursor.
            return Ok(EnqueueOutcome::Duplicate);
        }
        Ok(EnqueueOutcome::Enqueued(id))
    }

    fn get(&self, id: Uuid) -> Result<Option<QueueEntry>, NotificationQueueError> {
        let mut conn = self.conn()?;
        let row = conn.query_opt(
            "SELECT id, user_id, mail_address, cursor_value, status, error, enqueued_at, processed_at
             FROM notification_queue WHERE id = $1",
            &[&id],
        )?;
        row.map(row_to_entry).transpose()
    }

    fn mark_processing(&self, id: Uuid) -> Result<(), NotificationQueueError> {
        self.set_status(id, "UPDATE notification_queue SET status = 'processing' WHERE id = $1")
    }

    fn mark_completed(&self, id: Uuid) -> Result<(), NotificationQueueError> {
        self.set_status(
            id,
            "UPDATE notification_queue SET status = 'completed', processed_at = now() WHERE id = $1",
        )
    }

    fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), NotificationQueueError> {
        let mut conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE notification_queue
             SET status = 'failed', error = $2, processed_at = now()
             WHERE id = $1",
            &[&id, &error],
        )?;
        if updated == 0 {
            return Err(NotificationQueueError::NotFound);
        }
        Ok(())
    }

    fn delete_for_user(&self, user_id: Uuid) -> Result<(), NotificationQueueError> {
        let mut conn = self.conn()?;
        conn.execute(
            "DELETE FROM notification_queue WHERE user_id = $1",
            &[&user_id],
        )?;
        Ok(())
    }
}

impl PostgresNotificationQueue {
    fn set_status(&self, id: Uuid, statement: &str) -> Result<(), NotificationQueueError> {
        let mut conn = self.conn()?;
        let updated = conn.execute(statement, &[&id])?;
        if updated == 0 {
            return Err(NotificationQueueError::NotFound);
        }
        Ok(())
    }
}

impl Drop for PostgresNotificationQueue {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            std::thread::spawn(move || drop(pool));
        }
    }
}

fn row_to_entry(row: postgres::Row) -> Result<QueueEntry, NotificationQueueError> {
    let status: String = row.get(4);
    let status = QueueStatus::parse(&status)
        .ok_or_else(|| NotificationQueueError::Config(format!("unknown queue status: {status}")))?;
    Ok(QueueEntry {
        id: row.get(0),
        user_id: row.get(1),
        mail_address: row.get(2),
        cursor: row.get(3),
        status,
        error: row.get(5),
        enqueued_at: row.get(6),
        processed_at: row.get(7),
    })
}

#[derive(Default)]
pub struct MemoryNotificationQueue {
    entries: Mutex<HashMap<Uuid, QueueEntry>>,
}

impl MemoryNotificationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries_for_user(&self, user_id: Uuid) -> Vec<QueueEntry> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries
            .values()
            .filter(|entry| entry.user_id == user_id)
            .cloned()
            .collect()
    }
}

impl NotificationQueue for MemoryNotificationQueue {
    fn enqueue(
        &self,
        user_id: Uuid,
        mail_address: &str,
        cursor: i64,
    ) -> Result<EnqueueOutcome, NotificationQueueError> {
        let mut entries = self.entries.lock().map_err(|_| NotificationQueueError::LockPoisoned)?;
        if let Some(existing) = entries
            .values_mut()
            .find(|entry| entry.user_id == user_id && entry.cursor == cursor)
        {
            match existing.status {
                QueueStatus::Pending | QueueStatus::Processing => {
                    return Ok(EnqueueOutcome::Duplicate)
                }
                QueueStatus::Failed => {
                    existing.status = QueueStatus::Pending;
                    existing.error = None;
                    existing.enqueued_at = Utc::now();
                    existing.processed_at = None;
                    return Ok(EnqueueOutcome::Enqueued(existing.id));
                }
                QueueStatus::Completed => {}
            }
        }

        let id = Uuid::new_v4();
        entries.insert(
            id,
            QueueEntry {
                id,
                user_id,
                mail_address: mail_address.to_string(),
                cursor,
                status: QueueStatus::Pending,
                error: None,
                enqueued_at: Utc::now(),
                processed_at: None,
            },
        );
        Ok(EnqueueOutcome::Enqueued(id))
    }

    fn get(&self, id: Uuid) -> Result<Option<QueueEntry>, NotificationQueueError> {
        let entries = self.entries.lock().map_err(|_| NotificationQueueError::LockPoisoned)?;
        Ok(entries.get(&id).cloned())
    }

    fn mark_processing(&self, id: Uuid) -> Result<(), NotificationQueueError> {
        self.update(id, |entry| entry.status = QueueStatus::Processing)
    }

    fn mark_completed(&self, id: Uuid) -> Result<(), NotificationQueueError> {
        self.update(id, |entry| {
            entry.status = QueueStatus::Completed;
            entry.processed_at = Some(Utc::now());
        })
    }

    fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), NotificationQueueError> {
        self.update(id, |entry| {
            entry.status = QueueStatus::Failed;
            entry.error = Some(error.to_string());
            entry.processed_at = Some(Utc::now());
        })
    }

    fn delete_for_user(&self, user_id: Uuid) -> Result<(), NotificationQueueError> {
        let mut entries = self.entries.lock().map_err(|_| NotificationQueueError::LockPoisoned)?;
        entries.retain(|_, entry| entry.user_id != user_id);
        Ok(())
    }
}

impl MemoryNotificationQueue {
    fn update(
        &self,
        id: Uuid,
        apply: impl FnOnce(&mut QueueEntry),
    ) -> Result<(), NotificationQueueError> {
        let mut entries = self.entries.lock().map_err(|_| NotificationQueueError::LockPoisoned)?;
        let entry = entries.get_mut(&id).ok_or(NotificationQueueError::NotFound)?;
        apply(entry);
        Ok(())
    }
}

pub fn build_notification_queue_from_env(
) -> Result<Arc<dyn NotificationQueue>, NotificationQueueError> {
    if resolve_store_backend() == "memory" {
        return Ok(Arc::new(MemoryNotificationQueue::new()));
    }
    Ok(Arc::new(PostgresNotificationQueue::from_env()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_delivery_while_pending_is_dropped() {
        let queue = MemoryNotificationQueue::new();
        let user_id = Uuid::new_v4();
        let first = queue.enqueue(user_id, "a@b.com", 100).expect("enqueue");
        let second = queue.enqueue(user_id, "a@b.com", 100).expect("enqueue");
        assert!(matches!(first, EnqueueOutcome::Enqueued(_)));
        assert_eq!(second, EnqueueOutcome::Duplicate);
        assert_eq!(queue.entries_for_user(user_id).len(), 1);
    }

    #[test]
    fn failed_entry_is_reset_on_redelivery() {
        let queue = MemoryNotificationQueue::new();
        let user_id = Uuid::new_v4();
        let EnqueueOutcome::Enqueued(id) =
            queue.enqueue(user_id, "a@b.com", 100).expect("enqueue")
        else {
            panic!("expected enqueue");
        };
        queue.mark_processing(id).expect("processing");
        queue.mark_failed(id, "boom").expect("failed");

        let outcome = queue.enqueue(user_id, "a@b.com", 100).expect("enqueue");
        assert_eq!(outcome, EnqueueOutcome::Enqueued(id));
        let entry = queue.get(id).expect("get").expect("present");
        assert_eq!(entry.status, QueueStatus::Pending);
        assert!(entry.error.is_none());
    }

    #[test]
    fn poisoned_lock_surfaces_as_error() {
        let queue = MemoryNotificationQueue::new();
        let user_id = Uuid::new_v4();
        let EnqueueOutcome::Enqueued(id) =
            queue.enqueue(user_id, "a@b.com", 100).expect("enqueue")
        else {
            panic!("expected enqueue");
        };

        let poisoned = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            queue.update(id, |_| panic!("poison"))
        }));
        assert!(poisoned.is_err());
        assert!(matches!(
            queue.get(id),
            Err(NotificationQueueError::LockPoisoned)
        ));
    }

    #[test]
    fn completed_entry_allows_new_cursor_deliveries() {
        let queue = MemoryNotificationQueue::new();
        let user_id = Uuid::new_v4();
        let EnqueueOutcome::Enqueued(id) =
            queue.enqueue(user_id, "a@b.com", 100).expect("enqueue")
        else {
            panic!("expected enqueue");
        };
        queue.mark_completed(id).expect("completed");

        let outcome = queue.enqueue(user_id, "a@b.com", 200).expect("enqueue");
        assert!(matches!(outcome, EnqueueOutcome::Enqueued(_)));
    }
}
