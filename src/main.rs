use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use relay_core::auth::AllowAll;
use relay_hub::HubConfig;
use relay_telemetry::TelemetryConfig;

/// Real-time message distribution hub.
#[derive(Parser, Debug)]
#[command(name = "relay", version, about)]
struct Cli {
    /// Port to listen on.
    #[arg(long, default_value_t = 9400)]
    port: u16,

    /// Bound per-connection send queue; a subscriber that overflows it is
    /// disconnected.
    #[arg(long, default_value_t = 256)]
    max_send_queue: usize,

    /// Root directory for telemetry databases.
    #[arg(long)]
    db_root: Option<PathBuf>,

    /// Disable the metrics recorder.
    #[arg(long)]
    no_metrics: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut telemetry_config = TelemetryConfig::default();
    if let Some(root) = &cli.db_root {
        telemetry_config.log_db_path = root.join("relay-logs.db");
        telemetry_config.metrics_db_path = root.join("relay-metrics.db");
    }
    telemetry_config.metrics_enabled = !cli.no_metrics;
    let telemetry = relay_telemetry::init_telemetry(telemetry_config);

    tracing::info!("starting relay hub");

    let config = HubConfig {
        port: cli.port,
        max_send_queue: cli.max_send_queue,
        ..Default::default()
    };

    // Deployments front their own policy; the binary ships permissive
    // defaults and real authorization is injected via the library API.
    let handle = relay_hub::start(
        config,
        Arc::new(AllowAll),
        Arc::new(AllowAll),
        telemetry.metrics(),
    )
    .await?;

    tracing::info!(port = handle.port, "relay hub ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}
