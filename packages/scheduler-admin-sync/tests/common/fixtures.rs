//! Fixtures: tracing, fast configurations and polling helpers

use std::future::Future;
use std::path::Path;
use std::sync::Once;
use std::time::Duration;

use scheduler_admin_sync::{Db, SearchQuery, SearchResult, SyncConfig};
use tokio::time::Instant;

/// How long background loops get to converge
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

static TRACING: Once = Once::new();

/// Route logs to the test output, filtered by `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Configuration with short flush timers, rooted at `root`
pub fn fast_config(root: &Path) -> SyncConfig {
    let mut config = SyncConfig::default();
    config.data_root_dir = root.to_path_buf();
    config.indexer.flush_interval_ms = 10;
    config.store.flush_interval_ms = 10;
    config.source.poll_timeout_ms = 10;
    // rechecks are triggered by the tests
    config.source.recheck_interval_ms = 3_600_000;
    config
}

/// Poll `check` until it holds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    loop {
        if check().await {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Search until the page ids equal `expected`, then return the result.
pub async fn wait_for_ids(db: &dyn Db, query: &SearchQuery, expected: &[&str]) -> SearchResult {
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    loop {
        let result = db.search_collect(query).await.unwrap();
        let ids: Vec<&str> = result.schedules.iter().map(|r| r.id.as_str()).collect();
        if ids == expected {
            return result;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {:?}, last page {:?}",
            expected,
            ids
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Search until `found` equals `expected`, then return the result.
pub async fn wait_for_found(db: &dyn Db, query: &SearchQuery, expected: usize) -> SearchResult {
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    loop {
        let result = db.search_collect(query).await.unwrap();
        if result.found == expected {
            return result;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for found={}, last found={}",
            expected,
            result.found
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
