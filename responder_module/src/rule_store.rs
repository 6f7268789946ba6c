//! Sender rule persistence. Rules are returned ordered by ascending
//! priority so the matcher can short-circuit on the first hit; equal
//! priorities tie-break by creation time.

use std::collections::HashMap;
use std::env;
use std::sync::{Arc, Mutex};

use postgres_native_tls::MakeTlsConnector;
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use uuid::Uuid;

use crate::connection_store::{build_pool, resolve_store_backend, PoolBuildError};
use crate::rules::{PatternType, ReplyMode, RuleAction, SenderRule};

#[derive(Debug, thiserror::Error)]
pub enum RuleStoreError {
    #[error("postgres error: {0}")]
    Postgres(#[from] postgres::Error),
    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("missing DATABASE_URL")]
    MissingDbUrl,
    #[error("invalid rule row: {0}")]
    InvalidRow(String),
    #[error("lock poisoned")]
    LockPoisoned,
    #[error("config error: {0}")]
    Config(String),
}

pub trait RuleStore: Send + Sync {
    /// Active rules for a user, ordered by (priority, created_at).
    fn active_rules(&self, user_id: Uuid) -> Result<Vec<SenderRule>, RuleStoreError>;
    fn insert(&self, rule: &SenderRule) -> Result<(), RuleStoreError>;
    fn delete_for_user(&self, user_id: Uuid) -> Result<(), RuleStoreError>;
}

#[derive(Clone)]
pub struct PostgresRuleStore {
    pool: Option<Pool<PostgresConnectionManager<MakeTlsConnector>>>,
}

impl PostgresRuleStore {
    pub fn from_env() -> Result<Self, RuleStoreError> {
        let db_url = env::var("DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or(RuleStoreError::MissingDbUrl)?;
        Self::new(&db_url)
    }

    pub fn new(db_url: &str) -> Result<Self, RuleStoreError> {
        let pool = build_pool(db_url).map_err(|err| match err {
            PoolBuildError::Postgres(e) => RuleStoreError::Postgres(e),
            PoolBuildError::Pool(e) => RuleStoreError::Pool(e),
            PoolBuildError::Config(e) => RuleStoreError::Config(e),
        })?;
        let store = Self { pool: Some(pool) };
        store.ensure_schema()?;
        Ok(store)
    }

    fn conn(
        &self,
    ) -> Result<PooledConnection<PostgresConnectionManager<MakeTlsConnector>>, RuleStoreError> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| RuleStoreError::Config("rule store pool dropped".to_string()))?;
        Ok(pool.get()?)
    }

    fn ensure_schema(&self) -> Result<(), RuleStoreError> {
        let mut conn = self.conn()?;
        conn.batch_execute(
            "CREATE TABLE IF NOT EXISTS sender_rules (
                id UUID PRIMARY KEY,
                user_id UUID NOT NULL,
                pattern TEXT NOT NULL,
                pattern_type TEXT NOT NULL,
                action TEXT NOT NULL,
                reply_mode_override TEXT,
                custom_instructions TEXT,
                priority INTEGER NOT NULL DEFAULT 0,
                active BOOLEAN NOT NULL DEFAULT true,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            CREATE INDEX IF NOT EXISTS sender_rules_user_idx
                ON sender_rules(user_id, active, priority);",
        )?;
        Ok(())
    }
}

impl RuleStore for PostgresRuleStore {
    fn active_rules(&self, user_id: Uuid) -> Result<Vec<SenderRule>, RuleStoreError> {
        let mut conn = self.conn()?;
        let rows = conn.query(
            "SELECT id, user_id, pattern, pattern_type, action, reply_mode_override,
                    custom_instructions, priority, active, created_at
             FROM sender_rules
             WHERE user_id = $1 AND active = true
             ORDER BY priority, created_at",
            &[&user_id],
        )?;
        rows.into_iter().map(row_to_rule).collect()
    }

    fn insert(&self, rule: &SenderRule) -> Result<(), RuleStoreError> {
        let mut conn = self.conn()?;
        conn.execute(
            "INSERT INTO sender_rules
                (id, user_id, pattern, pattern_type, action, reply_mode_override,
                 custom_instructions, priority, active, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            &[
                &rule.id,
                &rule.user_id,
                &rule.pattern,
                &rule.pattern_type.as_str(),
                &rule.action.as_str(),
                &rule.reply_mode_override.map(|mode| mode.as_str()),
                &rule.custom_instructions,
                &rule.priority,
                &rule.active,
                &rule.created_at,
            ],
        )?;
        Ok(())
    }

    fn delete_for_user(&self, user_id: Uuid) -> Result<(), RuleStoreError> {
        let mut conn = self.conn()?;
        conn.execute("DELETE FROM sender_rules WHERE user_id = $1", &[&user_id])?;
        Ok(())
    }
}

impl Drop for PostgresRuleStore {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            std::thread::spawn(move || drop(pool));
        }
    }
}

fn row_to_rule(row: postgres::Row) -> Result<SenderRule, RuleStoreError> {
    let pattern_type: String = row.get(3);
    let action: String = row.get(4);
    let override_mode: Option<String> = row.get(5);
    Ok(SenderRule {
        id: row.get(0),
        user_id: row.get(1),
        pattern: row.get(2),
        pattern_type: pattern_type
            .parse::<PatternType>()
            .map_err(RuleStoreError::InvalidRow)?,
        action: action
            .parse::<RuleAction>()
            .map_err(RuleStoreError::InvalidRow)?,
        reply_mode_override: override_mode
            .map(|mode| mode.parse::<ReplyMode>().map_err(RuleStoreError::InvalidRow))
            .transpose()?,
        custom_instructions: row.get(6),
        priority: row.get(7),
        active: row.get(8),
        created_at: row.get(9),
    })
}

#[derive(Default)]
pub struct MemoryRuleStore {
    rules: Mutex<HashMap<Uuid, Vec<SenderRule>>>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RuleStore for MemoryRuleStore {
    fn active_rules(&self, user_id: Uuid) -> Result<Vec<SenderRule>, RuleStoreError> {
        let rules = self.rules.lock().map_err(|_| RuleStoreError::LockPoisoned)?;
        let mut active: Vec<SenderRule> = rules
            .get(&user_id)
            .map(|list| list.iter().filter(|rule| rule.active).cloned().collect())
            .unwrap_or_default();
        active.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(active)
    }

    fn insert(&self, rule: &SenderRule) -> Result<(), RuleStoreError> {
        let mut rules = self.rules.lock().map_err(|_| RuleStoreError::LockPoisoned)?;
        rules.entry(rule.user_id).or_default().push(rule.clone());
        Ok(())
    }

    fn delete_for_user(&self, user_id: Uuid) -> Result<(), RuleStoreError> {
        let mut rules = self.rules.lock().map_err(|_| RuleStoreError::LockPoisoned)?;
        rules.remove(&user_id);
        Ok(())
    }
}

pub fn build_rule_store_from_env() -> Result<Arc<dyn RuleStore>, RuleStoreError> {
    if resolve_store_backend() == "memory" {
        return Ok(Arc::new(MemoryRuleStore::new()));
    }
    Ok(Arc::new(PostgresRuleStore::from_env()?))
}
