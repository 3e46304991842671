use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineError};
use crate::notify::NotifyHub;
use crate::ratelimit::RateLimiter;

pub const TENANT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
pub const LIMITER_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Per-tenant housekeeping: drop idle notice channels, compact the WAL once
/// it has grown past `compact_threshold` appends.
pub async fn run_reaper(engine: Arc<Engine>, notify: Arc<NotifyHub>, compact_threshold: u64) {
    let mut interval = tokio::time::interval(TENANT_SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = sweep_tenant(&engine, &notify, compact_threshold).await {
            warn!("WAL compaction failed: {e}");
        }
    }
}

/// One pass of [`run_reaper`]. Returns whether the WAL was compacted.
pub async fn sweep_tenant(
    engine: &Engine,
    notify: &NotifyHub,
    compact_threshold: u64,
) -> Result<bool, EngineError> {
    notify.prune();
    let appends = engine.wal_appends_since_compact().await;
    if appends < compact_threshold {
        return Ok(false);
    }
    engine.compact_wal().await?;
    metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
    info!("compacted WAL after {appends} appends");
    Ok(true)
}

/// Drops rate-limit windows that have closed.
pub async fn run_limiter_purge(limiter: Arc<RateLimiter>) {
    let mut interval = tokio::time::interval(LIMITER_SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let purged = limiter.purge_expired();
        if purged > 0 {
            debug!("purged {purged} rate-limit windows");
        }
    }
}
