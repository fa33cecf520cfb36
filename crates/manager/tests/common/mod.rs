#![allow(dead_code)]

use std::time::Duration;

use kiln_local::LocalWorkers;
use kiln_manager::{CompletedTask, Manager, ManagerConfig, Resources};
use once_cell::sync::Lazy;

pub static TRACING: Lazy<()> = Lazy::new(|| {
    if std::env::var("TEST_LOG").is_ok() {
        configure_tracing();
    }
});

fn configure_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, EnvFilter};
    let tree = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    let filter = EnvFilter::try_from_env("TEST_LOG").unwrap_or_else(|_| EnvFilter::new("debug"));
    let subscriber = tracing_subscriber::Registry::default()
        .with(filter)
        .with(tree);

    tracing::subscriber::set_global_default(subscriber).unwrap();
}

pub fn setup_test_tracing() {
    Lazy::force(&TRACING);
}

pub const WAIT: Duration = Duration::from_secs(20);

pub fn test_config() -> ManagerConfig {
    ManagerConfig::default()
        .with_bind(([127, 0, 0, 1], 0).into())
        .with_watch_timeout(Duration::from_millis(300))
}

/// A manager on an ephemeral port plus an empty local worker pool pointed at it.
pub async fn start(config: ManagerConfig) -> (Manager, LocalWorkers) {
    setup_test_tracing();
    let manager = Manager::bind(config).await.unwrap();
    let workers = LocalWorkers::new(manager.local_addr().to_string()).unwrap();
    (manager, workers)
}

pub fn cores(n: u32) -> Resources {
    Resources::new(n, 1024, 1024)
}

/// Wait for the next finished task, failing the test if none arrives in time.
pub async fn next(manager: &Manager) -> CompletedTask {
    manager.wait(WAIT).await.expect("a task should finish")
}

/// Poll until `check` passes, failing the test if it never does.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition never became true"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
