//! Operator tool for a serial-attached signing device.
//!
//!   hwsign list
//!   hwsign account --index 0
//!   hwsign sign 0a0b0c

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use hwsign_lib::device::discovery;
use hwsign_lib::{ConnectionStatus, HostPlatform, SerialHost, SignerConfig, SignerHandle, SignerManager};

const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "hwsign")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List attached devices matching the configured vendor id
    List,

    /// Print the account identifier at a derivation index
    Account {
        #[arg(short, long, default_value_t = 0)]
        index: u32,
    },

    /// Sign a hex-encoded payload and print the signature as hex
    Sign {
        payload: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => SignerConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SignerConfig::default(),
    }
    .with_env_overrides();

    match cli.command {
        Commands::List => {
            let devices = SerialHost::new().enumerate().await?;
            let matched = discovery::matching_devices(devices, config.vendor_id);
            if matched.is_empty() {
                println!("no devices with vendor id {:04x}", config.vendor_id);
            }
            for device in matched {
                println!(
                    "{}\t{:04x}:{:04x}\t{}",
                    device.port_name,
                    device.vid,
                    device.pid,
                    device.product.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Account { index } => {
            let signer = connect(config).await?;
            let result = signer.get_account(index).await;
            signer.shutdown().await?;
            println!("{}", result?);
        }
        Commands::Sign { payload } => {
            let payload = hex::decode(payload.trim()).context("payload is not valid hex")?;
            let signer = connect(config).await?;
            let result = signer.sign(payload).await;
            signer.shutdown().await?;
            println!("{}", hex::encode(result?));
        }
    }

    Ok(())
}

async fn connect(config: SignerConfig) -> anyhow::Result<SignerHandle> {
    let settle = config.scan_delay() + SEARCH_TIMEOUT;
    let signer = SignerManager::spawn(config, SerialHost::new());
    let mut transitions = signer.subscribe_status();

    signer.find_and_connect_to_device().await?;

    let settled = tokio::time::timeout(settle, async {
        loop {
            match transitions.recv().await {
                Ok(ConnectionStatus::Searching) | Err(RecvError::Lagged(_)) => continue,
                Ok(status) => return Some(status),
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .await
    .context("timed out searching for device")?;

    match settled {
        Some(ConnectionStatus::Connected) => Ok(signer),
        Some(ConnectionStatus::Error) => bail!("device found but could not be opened"),
        Some(_) => bail!("no signing device found"),
        None => bail!("signer manager stopped"),
    }
}
