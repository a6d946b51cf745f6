use std::path::PathBuf;

use clap::Parser;
use dialogue_gateway::{
    app_context::AppContext,
    config::GatewayConfig,
    observability::logging::{init_logging, LoggingConfig},
    server,
};
use tracing::Level;

#[derive(Parser, Debug)]
#[command(name = "dialogue-gateway")]
#[command(about = "Latency-tiered routing gateway for game-world text generation")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Override the configured listen host.
    #[arg(long)]
    host: Option<String>,

    /// Override the configured listen port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the configured log level (trace|debug|info|warn|error).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON logs regardless of the config file setting.
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = GatewayConfig::load_from_file(&cli.config)?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(level) = cli.log_level {
        config.log_level = Some(level);
    }
    if cli.json_logs {
        config.json_logs = true;
    }

    let level = config
        .log_level
        .as_deref()
        .unwrap_or("info")
        .parse::<Level>()
        .map_err(|e| anyhow::anyhow!("invalid log level: {e}"))?;
    let _log_guard = init_logging(LoggingConfig {
        level,
        json_format: config.json_logs,
        log_dir: config.log_dir.clone(),
        ..Default::default()
    });

    let ctx = AppContext::from_config(config)?;
    server::serve(ctx).await
}
