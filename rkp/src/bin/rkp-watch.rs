use std::{io::Write, path::PathBuf, sync::Arc};

use anyhow::{Context, bail};
use clap::Parser;
use common::{DEFAULT_PREFIX, HookType, StorePaths};
use futures::StreamExt;
use libkv::{KvStore, WatchOptions, XlineConfig, XlineStore, watch};
use rkp::{
    config::{host_name, read_config},
    logging::{LogFormat, init_tracing},
    render::{WatchTarget, render_snapshot},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "rkp-watch",
    version,
    about = "Print the manifests under a node's intent, reality or hook path as they change"
)]
struct Cli {
    /// Node to watch. Uses the host name by default
    #[arg(long)]
    node: Option<String>,
    /// Watch the reality path instead of the intent path
    #[arg(long, conflicts_with = "hook_type")]
    reality: bool,
    /// Watch the bindings of one hook type instead of the intent path
    #[arg(long)]
    hook_type: Option<String>,
    /// Xline endpoints, comma separated
    #[arg(long, value_delimiter = ',')]
    endpoints: Vec<String>,
    /// Key prefix of the preparer's data
    #[arg(long)]
    prefix: Option<String>,
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    password: Option<String>,
    /// Take store settings and node name from a preparer config file
    #[arg(short, long, env = "CONFIG_PATH")]
    config: Option<PathBuf>,
    #[arg(long, value_enum, env = "RKP_LOG_FORMAT", default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let (mut xline, config_node) = match &cli.config {
        Some(path) => {
            let cfg = read_config(path)?;
            (cfg.xline_config, Some(cfg.node_name))
        }
        None => (
            XlineConfig {
                endpoints: Vec::new(),
                prefix: None,
                username: None,
                password: None,
            },
            None,
        ),
    };
    if !cli.endpoints.is_empty() {
        xline.endpoints = cli.endpoints.clone();
    }
    if xline.endpoints.is_empty() {
        xline.endpoints = vec!["127.0.0.1:2379".to_string()];
    }
    if cli.prefix.is_some() {
        xline.prefix = cli.prefix.clone();
    }
    if cli.username.is_some() {
        xline.username = cli.username.clone();
        xline.password = cli.password.clone();
    }

    let node = match cli.node.clone().or(config_node.filter(|n| !n.is_empty())) {
        Some(node) => node,
        None => host_name().context("Could not get the host name to watch")?,
    };
    let target = match (&cli.hook_type, cli.reality) {
        (Some(name), _) => WatchTarget::Hooks(name.parse::<HookType>()?),
        (None, true) => WatchTarget::Reality,
        (None, false) => WatchTarget::Intent,
    };
    let paths = StorePaths::new(xline.prefix.as_deref().unwrap_or(DEFAULT_PREFIX));
    let path = target.path(&paths, &node);

    let store: Arc<dyn KvStore> = Arc::new(
        XlineStore::connect(&xline)
            .await
            .with_context(|| format!("Failed to connect to xline at {:?}", xline.endpoints))?,
    );
    info!(%path, "watching manifests");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let mut stream = watch(store, path, WatchOptions::default(), cancel);
    let mut stdout = std::io::stdout();
    while let Some(result) = stream.next().await {
        match result {
            Ok(snapshot) => {
                let text = render_snapshot(&snapshot, target, &paths, &node);
                writeln!(stdout)?;
                stdout.write_all(text.as_bytes())?;
                stdout.flush()?;
            }
            Err(e) if e.is_transient() => warn!(error = %e, "watch error, retrying"),
            Err(e) => bail!("Error occurred while watching manifests: {e}"),
        }
    }
    Ok(())
}
