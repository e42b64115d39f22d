//! Device client entry point

use clap::{Args, Parser, Subcommand};
use iotcore_device::config::{ConfigOverrides, DeviceConfig};
use iotcore_device::error::{DeviceError, DeviceResult};
use iotcore_device::observability::logging::level_from_verbosity;
use iotcore_device::observability::{init_default_logging, metrics};
use iotcore_device::protocol::MessageType;
use iotcore_device::routing::LoggingHandler;
use iotcore_device::session::SessionManager;
use iotcore_device::telemetry::FixedSensor;
use iotcore_device::transport::mqtt::MqttConnector;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Config file locations tried when `--config` is not given
const DEFAULT_CONFIG_PATHS: [&str; 2] = ["device.toml", "config/device.toml"];

/// MQTT device client with signed JWT credentials
#[derive(Parser)]
#[command(name = "iotcore-device")]
#[command(about = "Device-side MQTT client: JWT auth, periodic telemetry, config and commands")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(flatten)]
    device: DeviceArgs,

    /// Defaults to `run`
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Options that override the configuration file
#[derive(Args, Debug, Default)]
struct DeviceArgs {
    /// GCP project id
    #[arg(long, env = "GCLOUD_PROJECT", global = true)]
    project_id: Option<String>,

    /// GCP cloud region
    #[arg(long = "cloud-region", global = true)]
    cloud_region: Option<String>,

    /// Device registry id
    #[arg(long, global = true)]
    registry_id: Option<String>,

    /// Device id
    #[arg(long, global = true)]
    device_id: Option<String>,

    /// Path to the PEM private key
    #[arg(long, value_name = "FILE", global = true)]
    private_key_file: Option<PathBuf>,

    /// Signature algorithm (RS256 or ES256)
    #[arg(long, global = true)]
    algorithm: Option<String>,

    /// Credential lifetime in minutes
    #[arg(long = "token-exp-mins", global = true)]
    token_exp_mins: Option<u64>,

    /// Broker hostname
    #[arg(long = "mqtt-bridge-hostname", global = true)]
    mqtt_bridge_hostname: Option<String>,

    /// Broker port
    #[arg(long = "mqtt-bridge-port", global = true)]
    mqtt_bridge_port: Option<u16>,

    /// Seconds between telemetry publications
    #[arg(long, global = true)]
    publish_interval_secs: Option<u64>,

    /// Telemetry topic: state or events
    #[arg(long, global = true)]
    message_type: Option<MessageType>,
}

impl From<DeviceArgs> for ConfigOverrides {
    fn from(args: DeviceArgs) -> Self {
        ConfigOverrides {
            project_id: args.project_id,
            region: args.cloud_region,
            registry_id: args.registry_id,
            device_id: args.device_id,
            private_key_file: args.private_key_file,
            algorithm: args.algorithm,
            token_expiration_minutes: args.token_exp_mins,
            broker_hostname: args.mqtt_bridge_hostname,
            broker_port: args.mqtt_bridge_port,
            publish_interval_secs: args.publish_interval_secs,
            message_type: args.message_type,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and publish telemetry until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
    /// Issue a credential and print it
    Token,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging(level_from_verbosity(cli.verbose));

    info!(
        "Starting iotcore-device v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = match load_configuration(cli.config.as_ref(), cli.device.into()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(e.exit_code());
        }
    };

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_device(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Token => handle_token_command(&config),
    };

    if let Err(e) = result {
        if e.is_transient() {
            warn!("Command failed on a recoverable error: {}", e);
        } else {
            error!("Command failed: {}", e);
        }
        process::exit(e.exit_code());
    }

    info!("Application shutdown complete");
}

/// File, then command-line overrides, then environment fallbacks
fn load_configuration(
    config_path: Option<&PathBuf>,
    overrides: ConfigOverrides,
) -> DeviceResult<DeviceConfig> {
    let mut config = match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            DeviceConfig::load_from_file(path)?
        }
        None => match DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
        {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                DeviceConfig::load_from_file(&path)?
            }
            None => {
                info!("No configuration file found, using command-line options only");
                DeviceConfig::default()
            }
        },
    };

    config.apply_overrides(&overrides);
    config.apply_env_fallbacks();
    config.validate()?;
    Ok(config)
}

async fn run_device(config: DeviceConfig) -> DeviceResult<()> {
    let identity = config.identity()?;
    let issuer = config.issuer()?;
    let settings = config.session_settings();

    info!(
        client_id = %identity.client_id(),
        host = %settings.host,
        port = settings.port,
        algorithm = %issuer.algorithm(),
        "Device starting"
    );

    let shutdown = CancellationToken::new();
    let manager = SessionManager::new(
        identity,
        issuer,
        Arc::new(MqttConnector::new()),
        settings,
        Arc::new(FixedSensor::default()),
        Arc::new(LoggingHandler),
        shutdown.clone(),
    )?;

    let handle = manager.handle();
    if !handle.connect().await {
        return Err(DeviceError::internal("Session stopped before connecting"));
    }

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(name) => info!("Received {}, shutting down gracefully...", name),
            Err(e) => warn!("Signal handling unavailable ({}), shutting down", e),
        }
        signal_token.cancel();
    });

    let outcome = manager.run().await;

    let snapshot = metrics().get_metrics();
    info!(
        metrics = %serde_json::to_string(&snapshot).unwrap_or_default(),
        "Final metrics"
    );

    outcome.map_err(DeviceError::from)
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => Ok("SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
    signal::ctrl_c().await?;
    Ok("Ctrl-C")
}

fn handle_config_command(config: &DeviceConfig, show: bool) -> DeviceResult<()> {
    if show {
        println!("Effective configuration:");
        println!("{}", config.to_toml_string()?);
    }

    info!("Configuration validation complete");
    Ok(())
}

fn handle_token_command(config: &DeviceConfig) -> DeviceResult<()> {
    let identity = config.identity()?;
    let credential = config.issuer()?.issue(&identity)?;

    println!("audience:   {}", credential.audience());
    println!("algorithm:  {}", credential.algorithm());
    println!("issued_at:  {}", credential.issued_at());
    println!("expires_at: {}", credential.expires_at());
    println!("{}", credential.token());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_subcommand_means_run() {
        let cli = Cli::try_parse_from(["iotcore-device", "--device-id", "dev1"]).unwrap();
        assert!(cli.command.is_none());
        assert!(matches!(cli.command.unwrap_or(Commands::Run), Commands::Run));
        assert_eq!(cli.device.device_id.as_deref(), Some("dev1"));
    }

    #[test]
    fn test_subcommand_with_global_flags() {
        let cli =
            Cli::try_parse_from(["iotcore-device", "config", "--show", "--registry-id", "reg"])
                .unwrap();
        assert!(matches!(cli.command, Some(Commands::Config { show: true })));
        assert_eq!(cli.device.registry_id.as_deref(), Some("reg"));
    }
}
