pub mod config;
pub mod connection_store;
pub mod credential_vault;
pub mod dispatcher;
pub mod generator;
pub mod history_sync;
pub mod notification_queue;
pub mod processing_log;
pub mod processor;
pub mod push_auth;
pub mod rate_limiter;
pub mod rule_store;
pub mod rules;
