use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::Engine;
use crate::observability;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites the WAL once enough records have been
/// appended since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

/// One compaction check. Returns true if the WAL was rewritten.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}
