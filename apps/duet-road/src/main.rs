use anyhow::Context;
use clap::Parser;
use duet_road::{router, RelayConfig, RelayState};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "duet-road", about = "Signaling relay for duet lesson rooms")]
struct Cli {
    /// Overrides DUET_ROAD_PORT.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to WARN level if RUST_LOG is not set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut config = RelayConfig::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }

    let state = RelayState::new(&config);
    let _reaper = state.spawn_reaper(config.reap_interval);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        %addr,
        stale_secs = config.stale_timeout.as_secs(),
        "duet-road listening"
    );

    axum::serve(listener, router(state))
        .await
        .context("relay server failed")?;
    Ok(())
}
