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
