use {clap::Parser, tracing::info};

use duet::{LogTarget, init_telemetry};

#[derive(Parser)]
#[command(name = "duet-server", about = "duet chat server", version)]
struct Cli {
    /// Port to listen on.
    port: u16,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli.log_level, cli.json_logs, LogTarget::Stdout);

    info!(version = env!("CARGO_PKG_VERSION"), "duet server starting");

    let config = duet_config::discover_and_load();
    duet_gateway::server::start_gateway(cli.port, &config).await
}
