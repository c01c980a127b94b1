//! propsync - shared property daemon
//!
//! Runs the audio property set either as the master that owns the shared
//! segment or as a slave that mirrors it.

mod audiod;

use audiod::{AudiodProperties, MediaServerCommand, PhoneStatus};
use clap::{Parser, ValueEnum};
use propsync_core::{Client, Config, ProcessRole, Property, Registry, Server};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "propsync")]
#[command(about = "Shared property daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "PROPSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides the configured role
    #[arg(short, long, value_enum)]
    role: Option<RoleArg>,

    /// Overrides the configured segment name
    #[arg(short, long)]
    segment: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
    Master,
    Slave,
}

impl From<RoleArg> for ProcessRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Master => ProcessRole::Master,
            RoleArg::Slave => ProcessRole::Slave,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // An explicit config file must load; otherwise fall back to defaults.
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = Config::from_file(path).map_err(|e| {
                tracing::error!("Failed to load config: {}", e);
                e
            })?;
            config.apply_env_overrides();
            tracing::info!("Loaded config from {}", path.display());
            config
        }
        None => {
            tracing::info!("Using default configuration");
            Config::from_env()
        }
    };
    if let Some(role) = cli.role {
        config.role = role.into();
    }
    if let Some(segment) = cli.segment {
        config.segment_name = segment;
    }
    config.validate()?;

    tracing::info!("Starting propsync");
    tracing::info!("  Segment: {}", config.segment_name);
    tracing::info!("  Role: {:?}", config.role);
    tracing::info!("  Endpoint: {}", config.endpoint());

    match config.role {
        ProcessRole::Master => run_master(&config).await?,
        ProcessRole::Slave => run_slave(&config).await?,
    }

    tracing::info!("propsync stopped");
    Ok(())
}

async fn run_master(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let registry = Registry::<Server, _>::create(config, AudiodProperties::declare)?;
    let properties = registry.properties();
    let _trace = properties.trace();

    // A call in progress pauses media; hanging up resumes it.
    let pausing = properties.pausing_media_for_phone_call.clone();
    let media = properties.media_server_cmd.clone();
    properties.phone_status.set_set_behavior(
        move |property: &Property<PhoneStatus, Server>, status: PhoneStatus| {
            let in_call = status != PhoneStatus::Disconnected;
            if in_call != pausing.get() {
                pausing.set(in_call);
                media.set(if in_call {
                    MediaServerCommand::PauseAllMediaSaved
                } else {
                    MediaServerCommand::ResumeAllMediaSaved
                });
            }
            property.do_set(status)
        },
    );

    tracing::info!(
        "Publishing {} properties ({})",
        registry.property_count(),
        registry.fingerprint()
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping...");
    registry.shutdown();
    Ok(())
}

async fn run_slave(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let registry = Registry::<Client, _>::create(config, AudiodProperties::declare)?;
    let properties = registry.properties();
    let _trace = properties.trace();

    let _report = properties.phone_status.send_changes({
        let ringer = properties.ringer_on.clone();
        move |status: &PhoneStatus| {
            if *status == PhoneStatus::Incoming && !ringer.get() {
                tracing::info!("Incoming call with ringer off");
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping...");
    registry.shutdown();
    Ok(())
}
