use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// One compaction check. Returns true if a compaction ran.
pub async fn maybe_compact(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!(appends, "compacted WAL");
            true
        }
        Err(e) => {
            tracing::warn!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Background task that rewrites the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        maybe_compact(&engine, threshold).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("blockout_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn below_threshold_skips() {
        let path = test_wal_path("below_threshold.wal");
        let notify = Arc::new(NotifyHub::new());
        let engine = Engine::new(path, notify).unwrap();

        let rid = Ulid::new();
        let caller = CallerId::new("ops");
        engine
            .create_block(rid, Span::new(0, 1000), BlockReason::Manual, None, &caller)
            .await
            .unwrap();

        assert!(!maybe_compact(&engine, 100).await);
        assert_eq!(engine.wal_appends_since_compact().await, 1);
    }

    #[tokio::test]
    async fn at_threshold_compacts_and_resets_counter() {
        let path = test_wal_path("at_threshold.wal");
        let notify = Arc::new(NotifyHub::new());
        let engine = Engine::new(path.clone(), notify).unwrap();

        let rid = Ulid::new();
        let caller = CallerId::new("ops");

        // Churn: repeated create + delete leaves one live block but many events
        for i in 0..5 {
            let b = engine
                .create_block(
                    rid,
                    Span::new(i * 1000, i * 1000 + 500),
                    BlockReason::Manual,
                    None,
                    &caller,
                )
                .await
                .unwrap();
            engine.delete_block(b.id, &caller).await.unwrap();
        }
        let kept = engine
            .create_block(rid, Span::new(90_000, 91_000), BlockReason::Manual, None, &caller)
            .await
            .unwrap();

        assert!(maybe_compact(&engine, 5).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        // The rewritten WAL replays to just the surviving block
        let notify2 = Arc::new(NotifyHub::new());
        let engine2 = Engine::new(path, notify2).unwrap();
        let blocks = engine2.list_blocks(rid, None, None).await.unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].id, kept.id);
    }
}
