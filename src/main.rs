//! PointGuard CLI - point-to-point WireGuard tunnel
//!
//! Brings up a TUN interface and a single-peer tunnel from either a standard
//! WireGuard `.conf` file or a JSON launch document.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ipnet::Ipv4Net;
use tracing_subscriber::{fmt, EnvFilter};

use pointguard::config::DEFAULT_MTU;
use pointguard::crypto::PrivateKey;
use pointguard::device::TracingSink;
use pointguard::error::ConfigError;
use pointguard::protocol::constants::DEFAULT_LIVENESS_INTERVAL;
use pointguard::tunnel::{SocketBinder, TunDevice};
use pointguard::{Device, LaunchConfig, PointGuardError, Session, WireGuardConfig};

/// PointGuard - point-to-point WireGuard tunnel
#[derive(Parser, Debug)]
#[command(name = "pointguard")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bring the tunnel up and run until interrupted
    Up {
        /// Path to the configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Read the configuration as a JSON launch document
        #[arg(long)]
        json: bool,

        /// Enable verbose logging
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate a new private key
    Genkey,

    /// Print the public key for a private key
    Pubkey {
        /// Base64 or hex private key
        private_key: String,
    },
}

/// Everything `up` needs, whichever file format it came from
struct Launch {
    address: Ipv4Net,
    mtu: u16,
    listen_port: u16,
    fwmark: Option<u32>,
    liveness_interval: Duration,
    log_path: Option<PathBuf>,
    operations: Vec<String>,
}

impl Launch {
    fn from_conf(path: &Path) -> Result<Self, PointGuardError> {
        let config = WireGuardConfig::from_file(path)?;
        let address = config
            .interface
            .address
            .first()
            .copied()
            .ok_or(ConfigError::MissingField {
                field: "Address".to_string(),
            })?;

        Ok(Self {
            address,
            mtu: config.mtu(),
            listen_port: config.interface.listen_port.unwrap_or(0),
            fwmark: config.interface.fwmark,
            liveness_interval: DEFAULT_LIVENESS_INTERVAL,
            log_path: None,
            operations: config.to_operations(),
        })
    }

    fn from_json(path: &Path) -> Result<Self, PointGuardError> {
        let config = LaunchConfig::from_file(path)?;
        let address = config.tunnel_address().ok_or(ConfigError::MissingField {
            field: "allow_ip".to_string(),
        })?;

        Ok(Self {
            address,
            mtu: DEFAULT_MTU,
            listen_port: 0,
            fwmark: None,
            liveness_interval: config.liveness_interval(),
            log_path: config.log_path.clone(),
            operations: config.to_operations(),
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let result = match args.command {
        Command::Up {
            config,
            json,
            verbose,
        } => run_up(&config, json, verbose).await,
        Command::Genkey => {
            println!("{}", PrivateKey::generate().to_base64());
            Ok(())
        }
        Command::Pubkey { private_key } => PrivateKey::parse(&private_key, "private key")
            .map(|key| println!("{}", key.public_key().to_base64()))
            .map_err(|e| PointGuardError::from(e).into()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => match e.downcast_ref::<PointGuardError>() {
            Some(error) => {
                eprintln!("Error: {}", error.user_message());
                ExitCode::from(u8::try_from(error.exit_code()).unwrap_or(u8::MAX))
            }
            None => {
                eprintln!("Error: {:#}", e);
                ExitCode::from(1)
            }
        },
    }
}

async fn run_up(path: &Path, json: bool, verbose: bool) -> anyhow::Result<()> {
    let launch = if json {
        Launch::from_json(path)?
    } else {
        Launch::from_conf(path)?
    };
    init_logging(verbose, launch.log_path.as_deref())?;
    tracing::info!("Loaded configuration from {}", path.display());

    let tun = TunDevice::create(launch.address.addr(), launch.address.prefix_len(), launch.mtu)?;
    let binder = SocketBinder::new(launch.listen_port).with_fwmark(launch.fwmark);
    let session =
        Session::new(Arc::new(TracingSink)).with_liveness_interval(launch.liveness_interval);

    let device = Device::new(Arc::new(tun), Arc::new(binder), Arc::new(session));
    let error = device.set_operation(&launch.operations).await;
    if !error.is_empty() {
        anyhow::bail!("Failed to apply configuration: {}", error);
    }

    device.up().await?;
    if let Some(addr) = device.local_addr() {
        tracing::info!("Listening on {}", addr);
    }

    wait_for_shutdown(&device).await;
    device.close().await;
    Ok(())
}

/// Log to stdout, or to `log_path` when the launch document names one
fn init_logging(verbose: bool, log_path: Option<&Path>) -> anyhow::Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = fmt().with_env_filter(filter).with_target(false);

    match log_path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            builder.with_writer(Mutex::new(file)).with_ansi(false).init();
        }
        None => builder.init(),
    }
    Ok(())
}

/// Wait for Ctrl+C, SIGTERM or the device closing on its own
async fn wait_for_shutdown(device: &Device) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
        _ = device.wait() => tracing::info!("Device closed"),
    }
}
