use clap::Parser;

use duet::{LogTarget, init_telemetry};

#[derive(Parser)]
#[command(name = "duet", about = "duet: one-on-one terminal chat", version)]
struct Cli {
    /// Server address as host:port.
    addr: String,

    /// Log level (trace, debug, info, warn, error). Logs go to stderr.
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli.log_level, cli.json_logs, LogTarget::Stderr);

    let config = duet_config::discover_and_load();
    duet_client::run(&cli.addr, &config).await
}
