use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// Background task that transitions elapsed active reservations to completed.
pub async fn run_completer(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64;
        let elapsed = engine.collect_elapsed_active(now);
        for reservation_id in elapsed {
            match engine.complete_reservation(reservation_id).await {
                Ok(_) => {
                    metrics::counter!(crate::observability::RESERVATIONS_COMPLETED_TOTAL)
                        .increment(1);
                    info!("completed elapsed reservation {reservation_id}");
                }
                Err(e) => {
                    // May have been cancelled since the sweep collected it
                    tracing::debug!("completer skip {reservation_id}: {e}");
                }
            }
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => tracing::warn!("WAL compaction failed: {e}"),
        }
    }
}
