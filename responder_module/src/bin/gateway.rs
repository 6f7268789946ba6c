#[path = "gateway/handlers.rs"]
mod handlers;
#[path = "gateway/state.rs"]
mod state;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tracing::info;

use responder_module::config::ServiceConfig;
use responder_module::connection_store::build_connection_store_from_env;
use responder_module::credential_vault::CredentialVault;
use responder_module::dispatcher::Dispatcher;
use responder_module::generator::OpenAiGenerator;
use responder_module::notification_queue::build_notification_queue_from_env;
use responder_module::processing_log::build_processing_log_from_env;
use responder_module::push_auth::OidcVerifier;
use responder_module::rate_limiter::FixedWindowLimiter;
use responder_module::rule_store::build_rule_store_from_env;

use gmail_module::GmailClient;

use handlers::{disconnect_connection, gmail_notifications, health, sync_connection};
use state::GatewayState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_target(false).init();
    dotenvy::dotenv().ok();

    let config = ServiceConfig::from_env()?;

    let connections = tokio::task::spawn_blocking(build_connection_store_from_env).await??;
    let rules = tokio::task::spawn_blocking(build_rule_store_from_env).await??;
    let queue = tokio::task::spawn_blocking(build_notification_queue_from_env).await??;
    let log = tokio::task::spawn_blocking(build_processing_log_from_env).await??;

    let dispatcher = Arc::new(Dispatcher {
        provider: Arc::new(GmailClient::new()),
        generator: Arc::new(OpenAiGenerator::new(&config)),
        vault: Arc::new(CredentialVault::new(&config)),
        connections,
        rules,
        queue,
        log,
    });

    let state = Arc::new(GatewayState {
        verifier: OidcVerifier::new(&config),
        limiter: Arc::new(FixedWindowLimiter::per_minute(config.rate_limit_per_minute)),
        dispatcher,
        config,
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/gmail/notifications", post(gmail_notifications))
        .route("/connections/:user_id/sync", post(sync_connection))
        .route("/connections/:user_id/disconnect", post(disconnect_connection))
        .with_state(state.clone());

    let addr: std::net::SocketAddr =
        format!("{}:{}", state.config.host, state.config.port).parse()?;
    info!("responder gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
