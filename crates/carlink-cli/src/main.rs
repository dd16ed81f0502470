//! carlink CLI
//!
//! Pairs a simulated phone with this machine's head-unit key store over an
//! in-process loopback, reconnects paired devices and manages the store.

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

use carlink_cli::device_cmd;
use carlink_cli::pair_cmd::{self, PairOptions};
use carlink_core::config::{load_config, load_config_from};
use carlink_core::tracing_init::{default_filter, init_tracing};

#[derive(Parser, Debug)]
#[command(name = "carlink")]
#[command(version, about = "Head unit secure channel pairing tool", long_about = None)]
struct Cli {
    /// Config file to use instead of the global and project settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Paired-device key store
    #[arg(long, global = true, env = "CARLINK_KEY_STORE")]
    key_store: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Associate a new simulated phone with the head unit.
    Pair {
        /// Accept the verification code without prompting
        #[arg(short, long)]
        yes: bool,
        /// Use out-of-band verification instead of a numeric code
        #[arg(long)]
        oob: bool,
    },
    /// Resume a session with a paired device using its stored key.
    Reconnect {
        /// Device ID to reconnect
        device_id: Uuid,
    },
    /// List paired devices.
    Devices,
    /// Forget a paired device.
    Forget {
        /// Device ID to remove
        device_id: Uuid,
    },
    /// Show the head unit's unique id.
    UniqueId {
        /// Generate a new id first
        #[arg(long)]
        rotate: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config(std::env::current_dir().ok().as_deref())?,
    };
    init_tracing(
        &default_filter(&config.logging.level),
        cli.json_logs || config.logging.json,
    );
    info!(version = env!("CARGO_PKG_VERSION"), "Starting carlink");

    let key_store = cli
        .key_store
        .clone()
        .or_else(|| config.storage.resolved_key_store_path())
        .context("No key store path: pass --key-store or set storage.key_store_path")?;
    if let Some(parent) = key_store.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let secret_len = config.storage.challenge_secret_bytes;

    match cli.command {
        Command::Pair { yes, oob } => {
            let options = PairOptions::from_config(&config, oob, yes);
            let paired = pair_cmd::pair(&key_store, &options).await?;
            let mut out = io::stdout();
            writeln!(out, "Paired device {}", paired.device_id)?;
            writeln!(out, "Head unit id  {}", paired.head_unit_id)?;
        }
        Command::Reconnect { device_id } => {
            let options = PairOptions::from_config(&config, false, true);
            pair_cmd::reconnect(&key_store, device_id, &options).await?;
            writeln!(io::stdout(), "Reconnected {device_id}")?;
        }
        Command::Devices => device_cmd::list(&key_store, secret_len)?,
        Command::Forget { device_id } => device_cmd::forget(&key_store, secret_len, device_id)?,
        Command::UniqueId { rotate } => {
            device_cmd::unique_id(&key_store, secret_len, rotate)?;
        }
    }
    Ok(())
}
