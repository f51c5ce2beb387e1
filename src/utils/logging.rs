use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber.
///
/// `LOG_LEVEL` (or a full `RUST_LOG` directive) controls the filter; the
/// default keeps the relay at `info` while silencing chatty dependencies.
pub fn init_tracing() {
    let default_directive = std::env::var("LOG_LEVEL")
        .map(|level| format!("{level},serenity=warn,tracing::span=warn"))
        .unwrap_or_else(|_| "info,serenity=warn,tracing::span=warn".to_string());

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
