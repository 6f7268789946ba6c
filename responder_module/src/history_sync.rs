//! History sync: fetch message-added deltas since the stored cursor and
//! keep the cursor moving forward. A stale cursor is recovered internally
//! by re-baselining, never surfaced to callers.

use gmail_module::{MailProvider, MessageRef, ProviderError};
use tracing::{debug, info, warn};

use crate::connection_store::{Connection, ConnectionStore, ConnectionStoreError};

#[derive(Debug, Clone, Default)]
pub struct SyncedBatch {
    pub messages: Vec<MessageRef>,
    pub cursor: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("store error: {0}")]
    Store(#[from] ConnectionStoreError),
}

/// Returns the messages added since the connection's last cursor. First
/// run (no stored cursor) establishes a baseline and returns nothing.
pub async fn sync_new_messages(
    provider: &dyn MailProvider,
    store: &dyn ConnectionStore,
    connection: &mut Connection,
    access_token: &str,
) -> Result<SyncedBatch, SyncError> {
    let Some(start_cursor) = connection.last_history_id else {
        return baseline(provider, store, connection, access_token).await;
    };
    let start_cursor = start_cursor as u64;

    let delta = match provider.fetch_history(access_token, start_cursor).await {
        Ok(delta) => delta,
        Err(ProviderError::StaleCursor(_)) => {
            warn!(
                "cursor {} rejected for {}, attempting recovery",
                start_cursor, connection.mail_address
            );
            return recover_from_stale(provider, store, connection, access_token, start_cursor)
                .await;
        }
        Err(err) => return Err(err.into()),
    };

    persist_cursor(store, connection, delta.new_cursor)?;
    Ok(SyncedBatch {
        messages: delta.messages,
        cursor: delta.new_cursor,
    })
}

async fn recover_from_stale(
    provider: &dyn MailProvider,
    store: &dyn ConnectionStore,
    connection: &mut Connection,
    access_token: &str,
    rejected_cursor: u64,
) -> Result<SyncedBatch, SyncError> {
    // Another worker may have advanced the cursor since we read it.
    if let Some(stored) = store.find_by_user(connection.user_id)? {
        let stored_cursor = stored.last_history_id.map(|value| value as u64);
        if let Some(stored_cursor) = stored_cursor.filter(|value| *value != rejected_cursor) {
            match provider.fetch_history(access_token, stored_cursor).await {
                Ok(delta) => {
                    persist_cursor(store, connection, delta.new_cursor)?;
                    return Ok(SyncedBatch {
                        messages: delta.messages,
                        cursor: delta.new_cursor,
                    });
                }
                Err(ProviderError::StaleCursor(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    baseline(provider, store, connection, access_token).await
}

/// Fetches the provider's current cursor and persists it as the new
/// starting point; history before that point is not replayed.
async fn baseline(
    provider: &dyn MailProvider,
    store: &dyn ConnectionStore,
    connection: &mut Connection,
    access_token: &str,
) -> Result<SyncedBatch, SyncError> {
    let cursor = provider.current_cursor(access_token).await?;
    info!(
        "re-baselined cursor for {} to {}",
        connection.mail_address, cursor
    );
    store.update_cursor(connection.user_id, cursor as i64)?;
    connection.last_history_id = Some(cursor as i64);
    Ok(SyncedBatch {
        messages: Vec::new(),
        cursor,
    })
}

/// Every successful fetch stamps `last_synced_at`; the cursor itself only
/// moves forward.
fn persist_cursor(
    store: &dyn ConnectionStore,
    connection: &mut Connection,
    new_cursor: u64,
) -> Result<(), ConnectionStoreError> {
    let new_cursor = new_cursor as i64;
    let effective = match connection.last_history_id {
        Some(current) if new_cursor < current => {
            debug!(
                "cursor {} behind stored {} for {}, keeping stored value",
                new_cursor, current, connection.mail_address
            );
            current
        }
        _ => new_cursor,
    };
    store.update_cursor(connection.user_id, effective)?;
    connection.last_history_id = Some(effective);
    Ok(())
}
