use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Start console logging filtered by `RUST_LOG`.
pub fn init() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .map_err(|e| anyhow::anyhow!("logging init failed: {e}"))?;
    Ok(())
}
