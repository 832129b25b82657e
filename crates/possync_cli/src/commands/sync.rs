//! Sync command implementation.

use super::{load_config, CliError, LocalStores};
use possync_engine::{ManualSyncResult, SyncConfig, SyncContext};
use std::path::Path;
use tracing::{info, warn};

/// Runs the sync command.
pub async fn run(config: &Path, local: &Path, collection: &str) -> Result<(), CliError> {
    let config = load_config(config)?;
    let mut stores = LocalStores::load(local)?;

    let result = execute(config, &mut stores, collection).await?;
    stores.save()?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.ok {
        return Err(CliError::Failed(collection.to_string()));
    }
    Ok(())
}

/// Runs one manual cycle of `collection` against its configured remote.
pub async fn execute(
    config: SyncConfig,
    stores: &mut LocalStores,
    collection: &str,
) -> Result<ManualSyncResult, CliError> {
    let ctx = SyncContext::new(config);
    ctx.register_configured(collection, stores.store(collection))?;

    let result = ctx.trigger_manual_sync(collection).await?;
    ctx.shutdown().await;

    if result.ok {
        info!(
            collection,
            read = result.docs_read,
            written = result.docs_written,
            failures = result.doc_write_failures,
            "sync finished"
        );
    } else {
        warn!(collection, errors = ?result.errors, "sync failed");
    }
    Ok(result)
}
