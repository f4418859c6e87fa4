use anyhow::{Context, Result};
use companion_backend::config::BotConfig;
use companion_backend::events;
use companion_backend::runtime::BotRuntime;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,companion_backend=debug")),
        )
        .init();

    let config = BotConfig::load().context("failed to load companion configuration")?;
    let (sink, event_rx) = events::channel();
    let runtime =
        BotRuntime::bootstrap(config, sink).context("failed to bootstrap companion runtime")?;

    tracing::info!(
        "Starting companion service (dashboard auth via COMPANION_DASHBOARD_TOKEN, mode via COMPANION_DASHBOARD_AUTH_MODE)"
    );

    let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    rt.block_on(runtime.run(event_rx))
}
