use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tallystream_config::RuntimeConfig;

/// Streaming aggregation server speaking the fluentd forward protocol
#[derive(Parser)]
#[command(name = "tallystream")]
#[command(version)]
#[command(about = "TCP ingestion and real-time aggregation server", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// TCP listen port (overrides config file)
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Number of worker shards (overrides config file)
    #[arg(short, long, value_name = "N")]
    workers: Option<usize>,

    /// Log level: trace, debug, info, warn, error
    #[arg(short = 'v', long, value_name = "LEVEL")]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let mut config = if let Some(config_path) = &cli.config {
        tallystream_config::load_from_file_path(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?
    } else {
        RuntimeConfig::load().context("Failed to load configuration")?
    };

    apply_cli_overrides(&mut config, &cli)?;
    config.validate()?;

    tallystream_server::run_with_config(config).await
}

fn apply_cli_overrides(config: &mut RuntimeConfig, cli: &Cli) -> Result<()> {
    if let Some(port) = cli.port {
        config.server.listen_addr = format!("0.0.0.0:{}", port);
    }
    if let Some(workers) = cli.workers {
        config.server.worker_count = workers;
    }
    if let Some(level) = &cli.log_level {
        config.server.log_level = level.clone();
    }
    Ok(())
}
