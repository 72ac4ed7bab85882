use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use squeak_core::Network;
use squeaknode_core::bitcoin_client::{wait_until_available, BitcoinCoreRpcClient};
use squeaknode_core::lightning_client::{LightningClient, LndRestClient};
use squeaknode_core::network::NetworkManager;
use squeaknode_core::{Config, SqueakController, SqueakStore};

/// Startup probes: 10 attempts, 10 seconds apart.
const STARTUP_RETRY_ATTEMPTS: u32 = 10;
const STARTUP_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "squeaknode")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Peer-to-peer squeak node with Lightning paid unlock")]
struct Cli {
    /// Path to the TOML config file
    #[clap(short, long, env = "SQUEAKNODE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured network (mainnet, testnet, signet, regtest)
    #[clap(short, long, env = "SQUEAKNODE_NETWORK")]
    network: Option<Network>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => {
            Config::load(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => Config::default(),
    };
    if let Some(network) = cli.network {
        config.network.name = network;
    }
    let network = config.network();
    info!(%network, "starting squeaknode");

    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let store = Arc::new(
        SqueakStore::open(&data_dir.join("squeaknode.db"), network)
            .context("opening database")?,
    );

    let bitcoin = Arc::new(BitcoinCoreRpcClient::new(
        &config.bitcoin.rpc_host,
        config.bitcoin.rpc_port(network),
        Some(config.bitcoin.rpc_user.clone()).filter(|u| !u.is_empty()),
        Some(config.bitcoin.rpc_pass.clone()).filter(|p| !p.is_empty()),
        config.bitcoin.rpc_use_ssl,
    ));
    let height = wait_until_available(
        bitcoin.as_ref(),
        STARTUP_RETRY_ATTEMPTS,
        STARTUP_RETRY_DELAY,
    )
    .await
    .context("bitcoin client unavailable")?;
    info!(height, "bitcoin client ready");

    let lightning = Arc::new(
        LndRestClient::new(
            &config.lnd.host,
            config.lnd.rpc_port,
            &config.lnd.tls_cert_path,
            &config.lnd.macaroon_path,
        )
        .context("building lnd client")?,
    );
    let lightning_info = probe_lightning(lightning.as_ref()).await?;
    info!(pubkey = %lightning_info, "lightning client ready");

    let network_manager = NetworkManager::new(network, config.node.max_peers);
    let controller = SqueakController::new(
        config,
        store,
        bitcoin,
        lightning,
        network_manager,
    );
    let bound = controller.start().await.context("starting node")?;
    info!(%bound, "peer listener ready");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    controller.stop();
    Ok(())
}

async fn probe_lightning(lightning: &dyn LightningClient) -> Result<String> {
    let mut last_err = None;
    for attempt in 1..=STARTUP_RETRY_ATTEMPTS {
        match lightning.get_info().await {
            Ok(info) => return Ok(info.identity_pubkey),
            Err(e) => {
                warn!(attempt, error = %e, "lightning client not ready");
                last_err = Some(e);
            }
        }
        if attempt < STARTUP_RETRY_ATTEMPTS {
            tokio::time::sleep(STARTUP_RETRY_DELAY).await;
        }
    }
    Err(last_err
        .map(Into::into)
        .unwrap_or_else(|| anyhow::anyhow!("lightning client unavailable")))
}
