//! hostpath-csi: node-local hostpath CSI driver.

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hostpath_csi::{Config, Driver, StageMode};

#[derive(Parser, Debug)]
#[command(name = "hostpath-csi")]
#[command(about = "Node-local hostpath CSI driver")]
struct Args {
    /// TOML configuration file. Flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Name the driver registers under.
    #[arg(long)]
    drivername: Option<String>,

    /// Node ID (defaults to the hostname).
    #[arg(long)]
    nodeid: Option<String>,

    /// CSI endpoint (unix:// or tcp://).
    #[arg(long)]
    endpoint: Option<String>,

    /// Directory holding the volume directories.
    #[arg(long)]
    volume_root: Option<PathBuf>,

    /// How staging exposes the backing directory.
    #[arg(long, value_enum)]
    stage_mode: Option<StageMode>,

    /// Verbosity level (0-4).
    #[arg(short, default_value = "0")]
    v: u8,
}

impl Args {
    fn into_config(self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(name) = self.drivername {
            config.name = name;
        }
        if let Some(node_id) = self.nodeid {
            config.node_id = node_id;
        }
        if let Some(endpoint) = self.endpoint {
            config.endpoint = endpoint;
        }
        if let Some(volume_root) = self.volume_root {
            config.volume_root = volume_root;
        }
        if let Some(stage_mode) = self.stage_mode {
            config.stage_mode = stage_mode;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Use targeted filters to avoid verbose logs from dependencies (h2, tonic, hyper).
    let filter = match args.v {
        0 => "warn",
        1 => "hostpath_csi=info,warn",
        2 => "hostpath_csi=debug,warn",
        3 => "hostpath_csi=trace,warn",
        _ => "hostpath_csi=trace,info",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let config = args.into_config()?;
    info!(
        name = %config.name,
        version = %config.version,
        node_id = %config.node_id,
        endpoint = %config.endpoint,
        "starting hostpath CSI driver"
    );

    let driver = Driver::new(config)?;
    driver.run().await?;

    Ok(())
}
