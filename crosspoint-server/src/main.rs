//! crosspoint-server: router-control protocol simulator.
//!
//! Runs one or more protocol engines (VideoHub, SW-P-08, GV Native)
//! against a single shared routing matrix so real control software can
//! connect and drive it.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use crosspoint_core::{ProtocolKind, RouterConfig, RoutingModel, Settings};
use crosspoint_server::{engine::EngineConfig, logging, AnyEngine};

/// crosspoint-server - broadcast video-router protocol simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Protocol engine to run (videohub, swp08, gvnative); repeatable.
    /// All three run on their standard ports when omitted.
    #[arg(short = 'p', long = "protocol")]
    protocols: Vec<ProtocolKind>,

    /// Interface to listen on
    #[arg(short, long, default_value = "0.0.0.0")]
    listen: IpAddr,

    /// Override the listen port (only with a single --protocol)
    #[arg(long)]
    port: Option<u16>,

    /// Number of router inputs
    #[arg(long)]
    inputs: Option<u32>,

    /// Number of router outputs
    #[arg(long)]
    outputs: Option<u32>,

    /// Number of routing levels
    #[arg(long)]
    levels: Option<u32>,

    /// Reported model name
    #[arg(long)]
    model_name: Option<String>,

    /// Reported friendly name
    #[arg(long)]
    friendly_name: Option<String>,

    /// Path to the settings file
    #[arg(short, long, default_value = "crosspoint.json")]
    settings: PathBuf,

    /// Configuration file path (TOML, merged under the flags)
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Number of days to keep log files
    #[arg(long, default_value = "7")]
    log_retention_days: u64,
}

/// Configuration file format.
#[derive(Debug, serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    router: RouterSection,
    #[serde(default)]
    logging: LoggingSection,
}

#[derive(Debug, serde::Deserialize, Default)]
struct RouterSection {
    inputs: Option<u32>,
    outputs: Option<u32>,
    levels: Option<u32>,
    model_name: Option<String>,
    friendly_name: Option<String>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct LoggingSection {
    log_dir: Option<String>,
    retention_days: Option<u64>,
    level: Option<String>,
}

fn load_config(path: &PathBuf) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // config file: explicit path > auto-detect > defaults
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from("crosspoint.toml");
        default_path.exists().then_some(default_path)
    });
    let file_config = match &config_path {
        Some(path) => match load_config(path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {e}");
                return Err(e);
            }
        },
        None => ConfigFile::default(),
    };

    // merge logging config, command line takes precedence
    let log_dir = if args.log_dir.to_string_lossy() != "logs" {
        args.log_dir.clone()
    } else {
        PathBuf::from(file_config.logging.log_dir.as_deref().unwrap_or("logs"))
    };
    let log_retention_days = if args.log_retention_days != 7 {
        args.log_retention_days
    } else {
        file_config.logging.retention_days.unwrap_or(7)
    };
    logging::init_logging(
        &log_dir,
        log_retention_days,
        args.verbose,
        file_config.logging.level.as_deref(),
    )
    .expect("Failed to initialize logging");

    // settings blob < config file < flags
    let mut settings = Settings::load(&args.settings)?;
    if let Some(v) = file_config.router.inputs {
        settings.inputs = v;
    }
    if let Some(v) = file_config.router.outputs {
        settings.outputs = v;
    }
    if let Some(v) = file_config.router.levels {
        settings.levels = v;
    }
    if let Some(v) = file_config.router.model_name {
        settings.model_name = v;
    }
    if let Some(v) = file_config.router.friendly_name {
        settings.friendly_name = v;
    }
    if let Some(v) = args.inputs {
        settings.inputs = v;
    }
    if let Some(v) = args.outputs {
        settings.outputs = v;
    }
    if let Some(v) = args.levels {
        settings.levels = v;
    }
    if let Some(v) = args.model_name.clone() {
        settings.model_name = v;
    }
    if let Some(v) = args.friendly_name.clone() {
        settings.friendly_name = v;
    }

    let protocols = if args.protocols.is_empty() {
        ProtocolKind::ALL.to_vec()
    } else {
        args.protocols.clone()
    };
    if args.port.is_some() && protocols.len() != 1 {
        error!("--port requires exactly one --protocol");
        return Err("--port requires exactly one --protocol".into());
    }

    let router_config = RouterConfig {
        inputs: settings.inputs,
        outputs: settings.outputs,
        levels: settings.levels,
        model_name: settings.model_name.clone(),
        friendly_name: settings.friendly_name.clone(),
        ..RouterConfig::default()
    };

    info!("crosspoint-server starting...");
    info!(
        "  Matrix: {} inputs x {} outputs x {} levels",
        router_config.inputs, router_config.outputs, router_config.levels
    );
    info!("  Model: {}", router_config.model_name);

    let model = RoutingModel::new(router_config);

    let mut engines = Vec::new();
    for protocol in protocols {
        let mut config = EngineConfig::for_protocol(protocol);
        config.bind = args.listen;
        if let Some(port) = args.port {
            config.port = port;
        }
        let engine = AnyEngine::new(protocol, Arc::clone(&model), config);
        match engine.start().await {
            Ok(port) => info!("  {} engine on port {port}", protocol.name()),
            Err(e) => {
                error!("Failed to start {} engine: {e}", protocol.name());
                return Err(e.into());
            }
        }
        engines.push(engine);
    }

    if let Err(e) = settings.save(&args.settings) {
        error!("Failed to save settings: {e}");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    for engine in &engines {
        engine.stop().await;
    }

    Ok(())
}
