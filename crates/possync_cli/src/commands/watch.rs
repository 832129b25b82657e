//! Watch command implementation.

use super::{load_config, CliError, LocalStores};
use possync_engine::{SessionEvent, SyncContext};
use std::path::Path;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

/// Runs the watch command.
pub async fn run(config: &Path, local: &Path) -> Result<(), CliError> {
    let config = load_config(config)?;
    let mut stores = LocalStores::load(local)?;
    let names: Vec<String> = config.collections.iter().map(|c| c.name.clone()).collect();

    let ctx = SyncContext::new(config);
    for name in &names {
        ctx.register_configured(name, stores.store(name))?;
    }
    let mut events = ctx.subscribe();
    let sessions = ctx.start_all()?;
    info!(collections = sessions.len(), "watching; press Ctrl-C to stop");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!(error = %err, "cannot listen for Ctrl-C");
                }
                break;
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log fell behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    info!("stopping");
    ctx.shutdown().await;
    for name in &names {
        let status = ctx.get_sync_status(name);
        info!(
            collection = %name,
            last_sync = ?status.last_sync_time,
            last_error = ?status.last_error,
            "final status"
        );
    }
    stores.save()
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged {
            collection,
            from,
            to,
        } => info!(%collection, ?from, ?to, "state changed"),
        SessionEvent::PullCompleted {
            collection,
            docs_read,
            docs_written,
        } => info!(%collection, docs_read, docs_written, "pulled"),
        SessionEvent::PushAcknowledged { collection, ids } => {
            info!(%collection, count = ids.len(), "push acknowledged")
        }
        SessionEvent::Purged { collection, ids } => {
            info!(%collection, ids = ?ids, "purged")
        }
        SessionEvent::ConflictResolved { collection, record } => info!(
            %collection,
            doc_id = %record.doc_id,
            strategy = %record.strategy,
            "conflict resolved"
        ),
        SessionEvent::ConflictUnresolved {
            collection,
            doc_id,
            reason,
        } => warn!(%collection, %doc_id, %reason, "conflict left pending"),
        SessionEvent::RetryScheduled {
            collection,
            attempt,
            delay,
        } => warn!(%collection, attempt, delay_ms = delay.as_millis() as u64, "retry scheduled"),
        SessionEvent::Error {
            collection,
            error: message,
        } => error!(%collection, error = %message, "session failed"),
    }
}
