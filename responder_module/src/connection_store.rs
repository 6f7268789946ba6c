//! Connection records: one mail account per user, with encrypted tokens
//! and the last-seen provider cursor.

use std::collections::HashMap;
use std::env;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use postgres_native_tls::MakeTlsConnector;
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use tracing::error;
use uuid::Uuid;

use crate::rules::ReplyMode;

#[derive(Debug, Clone)]
pub struct Connection {
    pub user_id: Uuid,
    pub mail_address: String,
    pub access_token_enc: String,
    pub refresh_token_enc: String,
    pub access_token_expires_at: DateTime<Utc>,
    pub last_history_id: Option<i64>,
    pub default_reply_mode: ReplyMode,
    pub auto_reply_enabled: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionStoreError {
    #[error("postgres error: {0}")]
    Postgres(#[from] postgres::Error),
    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("missing DATABASE_URL")]
    MissingDbUrl,
    #[error("connection not found")]
    NotFound,
    #[error("lock poisoned")]
    LockPoisoned,
    #[error("config error: {0}")]
    Config(String),
}

pub trait ConnectionStore: Send + Sync {
    fn upsert(&self, connection: &Connection) -> Result<(), ConnectionStoreError>;
    fn find_by_user(&self, user_id: Uuid) -> Result<Option<Connection>, ConnectionStoreError>;
    fn find_by_mail_address(
        &self,
        mail_address: &str,
    ) -> Result<Option<Connection>, ConnectionStoreError>;
    fn update_access_token(
        &self,
        user_id: Uuid,
        access_token_enc: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ConnectionStoreError>;
    /// Persists a new cursor and stamps `last_synced_at`.
    fn update_cursor(&self, user_id: Uuid, cursor: i64) -> Result<(), ConnectionStoreError>;
    fn delete(&self, user_id: Uuid) -> Result<(), ConnectionStoreError>;
}

/// Custom error handler that logs connection errors
#[derive(Debug)]
struct LoggingErrorHandler;

impl r2d2::HandleError<postgres::Error> for LoggingErrorHandler {
    fn handle_error(&self, err: postgres::Error) {
        error!("connection_store postgres pool error: {:?}", err);
    }
}

#[derive(Clone)]
pub struct PostgresConnectionStore {
    pool: Option<Pool<PostgresConnectionManager<MakeTlsConnector>>>,
}

impl PostgresConnectionStore {
    pub fn from_env() -> Result<Self, ConnectionStoreError> {
        let db_url = env::var("DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConnectionStoreError::MissingDbUrl)?;
        Self::new(&db_url)
    }

    pub fn new(db_url: &str) -> Result<Self, ConnectionStoreError> {
        let pool = build_pool(db_url).map_err(|err| match err {
            PoolBuildError::Postgres(e) => ConnectionStoreError::Postgres(e),
            PoolBuildError::Pool(e) => ConnectionStoreError::Pool(e),
            PoolBuildError::Config(e) => ConnectionStoreError::Config(e),
        })?;
        let store = Self { pool: Some(pool) };
        store.ensure_schema()?;
        Ok(store)
    }

    fn conn(
        &self,
    ) -> Result<PooledConnection<PostgresConnectionManager<MakeTlsConnector>>, ConnectionStoreError>
    {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| ConnectionStoreError::Config("connection store pool dropped".to_string()))?;
        Ok(pool.get()?)
    }

    fn ensure_schema(&self) -> Result<(), ConnectionStoreError> {
        let mut conn = self.conn()?;
        conn.batch_execute(
            "CREATE TABLE IF NOT EXISTS mail_connections (
                user_id UUID PRIMARY KEY,
                mail_address TEXT NOT NULL UNIQUE,
                access_token_enc TEXT NOT NULL,
                refresh_token_enc TEXT NOT NULL,
                access_token_expires_at TIMESTAMPTZ NOT NULL,
                last_history_id BIGINT,
                default_reply_mode TEXT NOT NULL DEFAULT 'draft',
                auto_reply_enabled BOOLEAN NOT NULL DEFAULT true,
                last_synced_at TIMESTAMPTZ
            );",
        )?;
        Ok(())
    }
}

impl ConnectionStore for PostgresConnectionStore {
    fn upsert(&self, connection: &Connection) -> Result<(), ConnectionStoreError> {
        let mut conn = self.conn()?;
        conn.execute(
            "INSERT INTO mail_connections
                (user_id, mail_address, access_token_enc, refresh_token_enc,
                 access_token_expires_at, last_history_id, default_reply_mode,
                 auto_reply_enabled, last_synced_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (user_id) DO UPDATE SET
                mail_address = $2,
                access_token_enc = $3,
                refresh_token_enc = $4,
                access_token_expires_at = $5,
                last_history_id = $6,
                default_reply_mode = $7,
                auto_reply_enabled = $8,
                last_synced_at = $9",
            &[
                &connection.user_id,
                &connection.mail_address,
                &connection.access_token_enc,
                &connection.refresh_token_enc,
                &connection.access_token_expires_at,
                &connection.last_history_id,
                &connection.default_reply_mode.as_str(),
                &connection.auto_reply_enabled,
                &connection.last_synced_at,
            ],
        )?;
        Ok(())
    }

    fn find_by_user(&self, user_id: Uuid) -> Result<Option<Connection>, ConnectionStoreError> {
        let mut conn = self.conn()?;
        let row = conn.query_opt(
            "SELECT user_id, mail_address, access_token_enc, refresh_token_enc,
                    access_token_expires_at, last_history_id, default_reply_mode,
                    auto_reply_enabled, last_synced_at
             FROM mail_connections WHERE user_id = $1",
            &[&user_id],
        )?;
        Ok(row.map(row_to_connection))
    }

    fn find_by_mail_address(
        &self,
        mail_address: &str,
    ) -> Result<Option<Connection>, ConnectionStoreError> {
        let normalized = mail_address.trim().to_ascii_lowercase();
        let mut conn = self.conn()?;
        let row = conn.query_opt(
            "SELECT user_id, mail_address, access_token_enc, refresh_token_enc,
                    access_token_expires_at, last_history_id, default_reply_mode,
                    auto_reply_enabled, last_synced_at
             FROM mail_connections WHERE lower(mail_address) = $1",
            &[&normalized],
        )?;
        Ok(row.map(row_to_connection))
    }

    fn update_access_token(
        &self,
        user_id: Uuid,
        access_token_enc: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ConnectionStoreError> {
        let mut conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE mail_connections
             SET access_token_enc = $2, access_token_expires_at = $3
             WHERE user_id = $1",
            &[&user_id, &access_token_enc, &expires_at],
        )?;
        if updated == 0 {
            return Err(ConnectionStoreError::NotFound);
        }
        Ok(())
    }

    fn update_cursor(&self, user_id: Uuid, cursor: i64) -> Result<(), ConnectionStoreError> {
        let mut conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE mail_connections
             SET last_history_id = $2, last_synced_at = now()
             WHERE user_id = $1",
            &[&user_id, &cursor],
        )?;
        if updated == 0 {
            return Err(ConnectionStoreError::NotFound);
        }
        Ok(())
    }

    fn delete(&self, user_id: Uuid) -> Result<(), ConnectionStoreError> {
        let mut conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM mail_connections WHERE user_id = $1", &[&user_id])?;
        if deleted == 0 {
            return Err(ConnectionStoreError::NotFound);
        }
        Ok(())
    }
}

impl Drop for PostgresConnectionStore {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            std::thread::spawn(move || drop(pool));
        }
    }
}

fn row_to_connection(row: postgres::Row) -> Connection {
    let mode: String = row.get(6);
    Connection {
        user_id: row.get(0),
        mail_address: row.get(1),
        access_token_enc: row.get(2),
        refresh_token_enc: row.get(3),
        access_token_expires_at: row.get(4),
        last_history_id: row.get(5),
        default_reply_mode: mode.parse().unwrap_or(ReplyMode::Draft),
        auto_reply_enabled: row.get(7),
        last_synced_at: row.get(8),
    }
}

/// In-memory store for tests and single-process setups.
#[derive(Default)]
pub struct MemoryConnectionStore {
    connections: Mutex<HashMap<Uuid, Connection>>,
}

impl MemoryConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConnectionStore for MemoryConnectionStore {
    fn upsert(&self, connection: &Connection) -> Result<(), ConnectionStoreError> {
        let mut connections = self.connections.lock().map_err(|_| ConnectionStoreError::LockPoisoned)?;
        connections.insert(connection.user_id, connection.clone());
        Ok(())
    }

    fn find_by_user(&self, user_id: Uuid) -> Result<Option<Connection>, ConnectionStoreError> {
        let connections = self.connections.lock().map_err(|_| ConnectionStoreError::LockPoisoned)?;
        Ok(connections.get(&user_id).cloned())
    }

    fn find_by_mail_address(
        &self,
        mail_address: &str,
    ) -> Result<Option<Connection>, ConnectionStoreError> {
        let normalized = mail_address.trim().to_ascii_lowercase();
        let connections = self.connections.lock().map_err(|_| ConnectionStoreError::LockPoisoned)?;
        Ok(connections
            .values()
            .find(|connection| connection.mail_address.to_ascii_lowercase() == normalized)
            .cloned())
    }

    fn update_access_token(
        &self,
        user_id: Uuid,
        access_token_enc: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ConnectionStoreError> {
        let mut connections = self.connections.lock().map_err(|_| ConnectionStoreError::LockPoisoned)?;
        let connection = connections
            .get_mut(&user_id)
            .ok_or(ConnectionStoreError::NotFound)?;
        connection.access_token_enc = access_token_enc.to_string();
        connection.access_token_expires_at = expires_at;
        Ok(())
    }

    fn update_cursor(&self, user_id: Uuid, cursor: i64) -> Result<(), ConnectionStoreError> {
        let mut connections = self.connections.lock().map_err(|_| ConnectionStoreError::LockPoisoned)?;
        let connection = connections
            .get_mut(&user_id)
            .ok_or(ConnectionStoreError::NotFound)?;
        connection.last_history_id = Some(cursor);
        connection.last_synced_at = Some(Utc::now());
        Ok(())
    }

    fn delete(&self, user_id: Uuid) -> Result<(), ConnectionStoreError> {
        let mut connections = self.connections.lock().map_err(|_| ConnectionStoreError::LockPoisoned)?;
        connections
            .remove(&user_id)
            .map(|_| ())
            .ok_or(ConnectionStoreError::NotFound)
    }
}

/// Picks the backend from `STORE_BACKEND` (`postgres` default, `memory`
/// for local runs without a database).
pub fn build_connection_store_from_env(
) -> Result<Arc<dyn ConnectionStore>, ConnectionStoreError> {
    if resolve_store_backend() == "memory" {
        return Ok(Arc::new(MemoryConnectionStore::new()));
    }
    Ok(Arc::new(PostgresConnectionStore::from_env()?))
}

pub(crate) fn resolve_store_backend() -> String {
    env::var("STORE_BACKEND")
        .ok()
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "postgres".to_string())
}

pub(crate) enum PoolBuildError {
    Postgres(postgres::Error),
    Pool(r2d2::Error),
    Config(String),
}

pub(crate) fn build_pool(
    db_url: &str,
) -> Result<Pool<PostgresConnectionManager<MakeTlsConnector>>, PoolBuildError> {
    let config: postgres::Config = db_url.parse().map_err(PoolBuildError::Postgres)?;

    let mut tls_builder = native_tls::TlsConnector::builder();
    if env::var("DB_TLS_ALLOW_INVALID_CERTS")
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
    {
        tls_builder.danger_accept_invalid_certs(true);
        tls_builder.danger_accept_invalid_hostnames(true);
    }
    let tls_connector = tls_builder
        .build()
        .map_err(|e| PoolBuildError::Config(e.to_string()))?;
    let tls = MakeTlsConnector::new(tls_connector);

    let manager = PostgresConnectionManager::new(config, tls);
    Pool::builder()
        .max_size(8)
        .connection_timeout(std::time::Duration::from_secs(5))
        .idle_timeout(Some(std::time::Duration::from_secs(300)))
        .error_handler(Box::new(LoggingErrorHandler))
        .build(manager)
        .map_err(PoolBuildError::Pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_connection(mail: &str) -> Connection {
        Connection {
            user_id: Uuid::new_v4(),
            mail_address: mail.to_string(),
            access_token_enc: "enc-a".to_string(),
            refresh_token_enc: "enc-r".to_string(),
            access_token_expires_at: Utc::now() + Duration::hours(1),
            last_history_id: None,
            default_reply_mode: ReplyMode::Draft,
            auto_reply_enabled: true,
            last_synced_at: None,
        }
    }

    #[test]
    fn memory_store_lookup_is_case_insensitive() {
        let store = MemoryConnectionStore::new();
        let connection = sample_connection("User@Example.com");
        store.upsert(&connection).expect("upsert");

        let found = store
            .find_by_mail_address("user@example.com")
            .expect("lookup")
            .expect("present");
        assert_eq!(found.user_id, connection.user_id);
    }

    #[test]
    fn memory_store_cursor_update_stamps_sync_time() {
        let store = MemoryConnectionStore::new();
        let connection = sample_connection("a@b.com");
        store.upsert(&connection).expect("upsert");

        store.update_cursor(connection.user_id, 42).expect("cursor");
        let found = store
            .find_by_user(connection.user_id)
            .expect("lookup")
            .expect("present");
        assert_eq!(found.last_history_id, Some(42));
        assert!(found.last_synced_at.is_some());
    }
}
