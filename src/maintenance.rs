use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::Engine;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Rewrite the tenant's WAL once it has grown by more than `threshold`
/// appends since the last rewrite. Returns true when a compaction ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends <= threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Background task that keeps a tenant's WAL bounded.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("fleetd_test_maintenance");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(path, Arc::new(NotifyHub::new()), Arc::new(SystemClock)).unwrap();

        let room = Ulid::new();
        engine.create_room(room, "Lab".into()).await.unwrap();
        let ws = Ulid::new();
        engine
            .create_workstation(ws, room, "pc-1".into(), None, None, 0.0, 0.0)
            .await
            .unwrap();
        assert!(!compact_if_needed(&engine, 5).await);

        let now = engine.now();
        for i in 0..5 {
            engine.record_heartbeat(ws, now + i).await.unwrap();
        }
        assert!(compact_if_needed(&engine, 5).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(engine.store.workstation(&ws).unwrap().last_seen, Some(now + 4));
    }
}
