use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites the WAL once `threshold` records have been appended
/// since the last compaction. A threshold of 0 disables it.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, shutdown: CancellationToken) {
    if threshold == 0 {
        info!("WAL compaction disabled");
        return;
    }
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        compact_if_due(&engine, threshold).await;
    }
}

/// One compactor pass. Returns true if the log was rewritten.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appended = engine.wal_appends_since_compact().await;
    if appended < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!(appended, "compacted WAL");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}
