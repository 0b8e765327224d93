//! BrokerLink command line entry point
//!
//! Runs a broker session against whatever `_mqtt._tcp` broker the local network
//! advertises, and offers one-shot discovery and device toggling.

use brokerlink::config::BrokerLinkConfig;
use brokerlink::discovery::{MdnsBackend, ServiceLocator};
use brokerlink::observability::{init_default_logging, init_logging, LogFormat};
use brokerlink::session::{Notification, SessionController, SessionHandle, SessionState};
use brokerlink::transport::mqtt::MqttConnection;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tokio::time::Duration;
use tracing::{error, info, warn, Level};

/// Zero-configuration MQTT session client
#[derive(Parser)]
#[command(name = "brokerlink")]
#[command(about = "Discover an MQTT broker on the local network and keep a session to it")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "BROKERLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the session and print notifications as JSON lines
    Run,
    /// Browse once and print the first broker address
    Discover {
        /// Give up after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// Switch one device on or off
    Toggle {
        /// Device group identifier
        #[arg(long)]
        group: String,
        /// Device name within the group
        #[arg(long)]
        device: String,
        /// Switch the device on
        #[arg(long, conflicts_with = "off", required_unless_present = "off")]
        on: bool,
        /// Switch the device off
        #[arg(long)]
        off: bool,
        /// Seconds to wait for the session to become ready
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// Validate configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose > 0 && std::env::var("LOG_LEVEL").is_err() {
        let level = if cli.verbose > 1 {
            Level::TRACE
        } else {
            Level::DEBUG
        };
        init_logging(level, LogFormat::Pretty, false);
    } else {
        init_default_logging();
    }

    info!("Starting brokerlink v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_session(config).await,
        Commands::Discover { timeout } => discover(config, timeout).await,
        Commands::Toggle {
            group,
            device,
            on,
            off: _,
            timeout,
        } => toggle(config, &group, &device, on, timeout).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<BrokerLinkConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(BrokerLinkConfig::load_from_file(path)?)
        }
        None => {
            for path_str in ["brokerlink.toml", "config/brokerlink.toml"] {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(BrokerLinkConfig::load_from_file(&path)?);
                }
            }

            warn!("No configuration file found, using defaults");
            Ok(BrokerLinkConfig::default())
        }
    }
}

fn spawn_session(config: BrokerLinkConfig) -> Result<SessionHandle, Box<dyn std::error::Error>> {
    let connection = MqttConnection::new(&config.retry)?;
    let backend = MdnsBackend::new()?;
    Ok(SessionController::spawn(config, backend, connection))
}

async fn run_session(config: BrokerLinkConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        client_id = %config.session.client_id,
        service_type = %config.discovery.service_type,
        "Session starting"
    );

    let session = spawn_session(config)?;
    let mut notifications = session.notifications();
    session.start().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            notification = notifications.recv() => {
                let Some(notification) = notification else {
                    break;
                };
                println!("{}", serde_json::to_string(&notification)?);
                if let Notification::Failed { reason } = notification {
                    error!("Session failed permanently: {}", reason);
                    break;
                }
            }
        }
    }

    session.shutdown().await?;
    Ok(())
}

async fn discover(config: BrokerLinkConfig, timeout: u64) -> Result<(), Box<dyn std::error::Error>> {
    let locator = ServiceLocator::new(MdnsBackend::new()?);
    let service_type = config.discovery.service_type;

    let address = tokio::time::timeout(
        Duration::from_secs(timeout),
        locator.locate(&service_type),
    )
    .await
    .map_err(|_| format!("No {service_type} broker found within {timeout}s"))??;

    println!("{address}");
    Ok(())
}

async fn toggle(
    config: BrokerLinkConfig,
    group: &str,
    device: &str,
    on: bool,
    timeout: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = spawn_session(config)?;
    session.start().await?;

    let outcome = async {
        session
            .wait_for_state(SessionState::Ready, Duration::from_secs(timeout))
            .await?;
        session.publish_device_state(group, device, on).await
    }
    .await;

    session.shutdown().await?;
    outcome?;

    info!(group, device, on, "Device command published");
    Ok(())
}

fn handle_config_command(
    config: BrokerLinkConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    if show {
        println!("Effective configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    } else {
        println!("Configuration is valid");
    }
    Ok(())
}
