//! salty-relay binary entry point.
//!
//! Usage:
//! ```bash
//! salty-relay generate /etc/salty-relay/permanent.key
//! salty-relay serve --config relay.toml
//! salty-relay serve --bind 127.0.0.1:8765 --key permanent.key
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use saltyrelay::{keys, Config, RelayServer};

/// SaltyRTC signalling relay.
#[derive(Parser, Debug)]
#[command(name = "salty-relay")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log filter when RUST_LOG is unset (e.g. "info", "saltyrelay=debug")
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay
    Serve {
        /// Configuration file
        #[arg(long, short, default_value = "relay.toml")]
        config: PathBuf,

        /// Listen address, overriding the config file
        #[arg(long)]
        bind: Option<String>,

        /// Additional permanent key file (repeatable)
        #[arg(long = "key")]
        keys: Vec<PathBuf>,
    },

    /// Write a new permanent secret key and print its public key
    Generate {
        /// Output file (must not exist)
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve { config, bind, keys } => serve(config, bind, keys).await?,
        Commands::Generate { file } => {
            let pair = keys::generate_key_file(&file)
                .with_context(|| format!("Failed to write key file {}", file.display()))?;
            println!("{}", pair.public_hex());
        }
    }

    Ok(())
}

async fn serve(config_path: PathBuf, bind: Option<String>, extra_keys: Vec<PathBuf>) -> Result<()> {
    let mut config = if config_path.exists() {
        Config::from_file(&config_path).context("Failed to load configuration")?
    } else {
        tracing::info!(
            "No configuration at {}, using defaults",
            config_path.display()
        );
        Config::default()
    };
    if let Some(bind) = bind {
        config.server.bind_address = bind;
    }
    config.keys.permanent.extend(extra_keys);

    let permanent_keys =
        keys::load_permanent_keys(&config.keys.permanent).context("Failed to load permanent keys")?;
    let server = RelayServer::bind(&config, permanent_keys)
        .await
        .context("Failed to start relay")?;

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Cannot listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}
