use anyhow::Result;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::PathBuf;
use tensorgrid_broker::server::BrokerServer;
use tensorgrid_broker::BrokerConfig;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "tensorgrid-broker")]
#[command(about = "Tensorgrid broker - job scheduling and metered billing")]
struct Args {
    #[arg(short, long, help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Generate sample configuration file")]
    gen_config: bool,

    #[arg(long, help = "Dry run mode (validate config without starting)")]
    dry_run: bool,

    #[clap(flatten)]
    verbosity: Verbosity<InfoLevel>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tensorgrid_common::logging::init_logging(
        &args.verbosity,
        "tensorgrid_broker",
        "tensorgrid_broker=info,tensorgrid_protocol=info",
    )?;

    if args.gen_config {
        let config = BrokerConfig::default();
        let rendered = toml::to_string_pretty(&config)?;
        println!("{rendered}");
        return Ok(());
    }

    let config = BrokerConfig::load(args.config)?;
    config.validate()?;
    for warning in config.warnings() {
        warn!("{warning}");
    }

    info!("Starting Tensorgrid broker");
    info!("Environment: {}", config.service.environment);
    info!("Service ID: {}", config.service.service_id);

    let server = BrokerServer::new(config).await?;

    if args.dry_run {
        info!("Configuration validated successfully (dry-run mode)");
        return Ok(());
    }

    server.run_migrations().await?;
    server.serve(shutdown_signal()).await?;

    info!("Tensorgrid broker stopped gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
