use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::engine::Engine;
use crate::model::CatalogEvent;
use crate::notify::{NotifyHub, FIELDS_CHANNEL};

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Keepalive interval for catalog listeners.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

/// Compact when at least `threshold` events were appended since the last
/// compaction. Returns whether a compaction ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            error!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Background task that pings catalog listeners so idle clients notice dead connections.
pub async fn run_heartbeat(notify: Arc<NotifyHub>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        interval.tick().await;
        heartbeat(&notify);
    }
}

fn heartbeat(notify: &NotifyHub) {
    let listeners = notify.listener_count(FIELDS_CHANNEL);
    if listeners == 0 {
        return;
    }
    let at = chrono::Utc::now().timestamp_millis();
    notify.send(FIELDS_CHANNEL, &CatalogEvent::ping(at));
    debug!(listeners, "catalog heartbeat");
}
