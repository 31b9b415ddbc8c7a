//! Redfire PBX main application

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};

use redfire_pbx::{
    config::PbxConfig,
    core::RedfirePbx,
    utils::setup_logging,
    Result,
};

#[derive(Parser)]
#[command(name = "redfire-pbx")]
#[command(about = "Software PBX / SIP B2BUA")]
#[command(version = redfire_pbx::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the PBX
    Start,
    /// Validate configuration
    ValidateConfig,
    /// Generate default configuration
    GenerateConfig {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = load_configuration(&cli).await?;

    // Setup logging
    setup_logging(&config.logging)?;

    info!("Starting {} v{}", redfire_pbx::NAME, redfire_pbx::VERSION);

    match &cli.command {
        Some(Commands::Start) | None => {
            run_pbx(config).await
        }
        Some(Commands::ValidateConfig) => {
            validate_configuration(&config).await
        }
        Some(Commands::GenerateConfig { output }) => {
            generate_default_config(output.clone()).await
        }
    }
}

async fn load_configuration(cli: &Cli) -> Result<PbxConfig> {
    let config = if let Some(config_path) = &cli.config {
        info!("Loading configuration from: {}", config_path.display());
        PbxConfig::load_from_file(config_path)?
    } else {
        match PbxConfig::load_from_env() {
            Ok(config) => config,
            Err(_) => PbxConfig::default_config(),
        }
    };

    config.validate()?;

    Ok(config)
}

async fn run_pbx(config: PbxConfig) -> Result<()> {
    info!("Initializing Redfire PBX");

    let mut pbx = RedfirePbx::new(config)?;

    let mut event_rx = pbx.take_event_receiver()
        .ok_or_else(|| redfire_pbx::Error::internal("Failed to get event receiver"))?;

    pbx.start().await?;

    let pbx = Arc::new(tokio::sync::Mutex::new(pbx));
    let pbx_shutdown = Arc::clone(&pbx);

    // Handle events
    let event_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            handle_pbx_event(event).await;
        }
    });

    // Handle shutdown signals
    let shutdown_task = tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down gracefully");
                let mut pbx = pbx_shutdown.lock().await;
                if let Err(e) = pbx.stop().await {
                    error!("Error during shutdown: {}", e);
                }
            }
            Err(err) => {
                error!("Unable to listen for shutdown signal: {}", err);
            }
        }
    });

    tokio::select! {
        _ = event_task => {
            info!("Event handling completed");
        }
        _ = shutdown_task => {
            info!("Shutdown signal received");
        }
    }

    let mut pbx = pbx.lock().await;
    if pbx.is_running().await {
        pbx.stop().await?;
    }

    info!("Redfire PBX shutdown complete");
    Ok(())
}

async fn handle_pbx_event(event: redfire_pbx::core::pbx::PbxEvent) {
    use redfire_pbx::core::pbx::PbxEvent;

    match event {
        PbxEvent::Started => {
            info!("PBX started successfully");
        }
        PbxEvent::Stopped => {
            info!("PBX stopped");
        }
        PbxEvent::Registered { extension, contact } => {
            info!("Extension {} registered at {}", extension, contact);
        }
        PbxEvent::Unregistered { extension } => {
            info!("Extension {} unregistered", extension);
        }
        PbxEvent::CallStarted { call_id, caller, callee } => {
            info!("Call started: {} ({} -> {})", call_id, caller, callee);
        }
        PbxEvent::CallEnded { call_id, disposition } => {
            info!("Call ended: {} ({})", call_id, disposition);
        }
        PbxEvent::Error { message } => {
            error!("PBX error: {}", message);
        }
    }
}

async fn validate_configuration(config: &PbxConfig) -> Result<()> {
    info!("Validating configuration...");

    config.validate()?;

    println!("Configuration is valid");
    println!("  Node ID: {}", config.general.node_id);
    println!("  SIP Port: {}", config.sip.listen_port);
    println!("  SIP Domain: {}", config.sip.domain);
    println!("  RTP Port Range: {}-{}", config.rtp.port_range.min, config.rtp.port_range.max);
    println!("  Codecs: {}", config.media.codec_preference.join(", "));
    println!("  Dialplan Rules: {}", config.dialplan.rules.len());
    println!("  Voicemail Root: {}", config.voicemail.root_dir);

    Ok(())
}

async fn generate_default_config(output_path: Option<PathBuf>) -> Result<()> {
    let config = PbxConfig::default_config();
    let toml_content = toml::to_string_pretty(&config)
        .map_err(|e| redfire_pbx::Error::internal(format!("Failed to serialize config: {}", e)))?;

    match output_path {
        Some(path) => {
            std::fs::write(&path, toml_content)?;
            println!("Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", toml_content);
        }
    }

    Ok(())
}
