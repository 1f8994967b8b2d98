use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rkp::{
    config::load_config,
    logging::{LogFormat, init_tracing},
    preparer::Preparer,
    shutdown::TerminationSignals,
};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "rkp", version, about = "rk8s node preparer")]
struct Cli {
    /// Log output format
    #[arg(long, global = true, value_enum, env = "RKP_LOG_FORMAT", default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the preparer with a config file
    Start {
        #[arg(short, long, env = "CONFIG_PATH")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Start { config } => {
            let cfg = load_config(&config).inspect_err(|e| error!("{e:#}"))?;
            info!(
                node = %cfg.node_name,
                endpoints = ?cfg.xline_config.endpoints,
                prefix = %cfg.store_paths().prefix(),
                hooks_dir = %cfg.hooks_directory.display(),
                launcher = %cfg.pod_launcher.display(),
                version = env!("CARGO_PKG_VERSION"),
                "starting preparer"
            );

            let mut signals =
                TerminationSignals::install().context("Failed to install signal handlers")?;
            let preparer = Preparer::connect(cfg)
                .await
                .inspect_err(|e| error!("{e:#}"))?;
            let report = preparer
                .run(&mut signals)
                .await
                .inspect_err(|e| error!("{e:#}"))?;
            info!(
                signal = %report.signal,
                pods = %report.pods,
                hooks = %report.hooks,
                "terminating"
            );
        }
    }

    Ok(())
}
