//! WolfGTM - Node Registry and Global Xmin Service
//!
//! Command line entry point for the manager.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfgtm::config::GtmConfig;
use wolfgtm::error::{Error, Result};
use wolfgtm::manager::NodeManager;
use wolfgtm::network::{NetworkClient, NetworkServer};
use wolfgtm::protocol::{Request, Response};
use wolfgtm::registry::NodeType;
use wolfgtm::reglog::{self, LogRecord};
use wolfgtm::standby::{RetryPolicy, StandbyForwarder};
use wolfgtm::watermark::SharedHorizon;

/// WolfGTM - Node Registry and Global Xmin Service
#[derive(Parser)]
#[command(name = "wolfgtm")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfgtm.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the manager
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfgtm.toml")]
        output: PathBuf,

        /// Manager ID
        #[arg(long, default_value = "gtm-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Decode a register log and print it as JSON
    DumpLog {
        /// Register log to read (defaults to the configured one)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// List nodes registered with a running manager
    Nodes {
        /// Manager address (defaults to the configured bind address)
        #[arg(short, long)]
        address: Option<String>,

        /// Only nodes of this type
        #[arg(short = 't', long = "type", value_enum)]
        node_type: Option<NodeTypeArg>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum NodeTypeArg {
    Coordinator,
    Datanode,
    Proxy,
}

impl From<NodeTypeArg> for NodeType {
    fn from(arg: NodeTypeArg) -> Self {
        match arg {
            NodeTypeArg::Coordinator => NodeType::Coordinator,
            NodeTypeArg::Datanode => NodeType::Datanode,
            NodeTypeArg::Proxy => NodeType::Proxy,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file when it loads
    let logging = GtmConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    let level = cli.log_level.clone().unwrap_or(logging.level);
    init_logging(&level, &logging.format);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::DumpLog { file } => run_dump_log(cli.config, file),
        Commands::Nodes { address, node_type } => {
            run_nodes(cli.config, address, node_type.map(NodeType::from)).await
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the manager
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting WolfGTM...");

    // Load configuration
    let config = match GtmConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    tracing::info!("Loaded configuration for manager: {}", config.node.id);

    if let Err(e) = std::fs::create_dir_all(config.data_dir()) {
        tracing::error!("Failed to create data directory {:?}: {}", config.data_dir(), e);
        return Err(e.into());
    }

    // The transaction id service embedding this manager advances the horizon
    let horizon = Arc::new(SharedHorizon::default());
    let mut manager = NodeManager::from_config(&config, horizon);

    let mut standby_task = None;
    if let Some(address) = &config.standby.address {
        let link = Arc::new(NetworkClient::new(
            address.clone(),
            config.standby.connect_timeout(),
            config.standby.request_timeout(),
        ));
        let policy = RetryPolicy {
            max_retries: config.standby.max_retries,
            backoff: config.standby.retry_backoff(),
        };
        let (forwarder, handle) = StandbyForwarder::spawn(link, policy);
        manager = manager.with_standby(forwarder);
        standby_task = Some(handle);
        tracing::info!("Forwarding registrations to standby at {}", address);
    }

    let manager = Arc::new(manager);
    let restored = {
        let manager = Arc::clone(&manager);
        tokio::task::spawn_blocking(move || manager.recover())
            .await
            .map_err(|e| Error::Network(format!("recovery task failed: {}", e)))??
    };
    tracing::info!("Restored {} nodes from the register log", restored);

    let server = Arc::new(NetworkServer::new(config.node.bind_address.clone(), Arc::clone(&manager)));
    let serving = Arc::clone(&server);
    let server_task = tokio::spawn(async move { serving.start().await });

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!("Server failed: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    return Err(Error::Network(format!("server task failed: {}", e)));
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            server.stop();
        }
    }

    let snapshot = {
        let manager = Arc::clone(&manager);
        tokio::task::spawn_blocking(move || manager.shutdown()).await
    };
    match snapshot {
        Ok(Ok(count)) => tracing::info!("Saved {} nodes to the register log", count),
        Ok(Err(e)) => tracing::warn!("Failed to snapshot the register log: {}", e),
        Err(e) => tracing::warn!("Snapshot task failed: {}", e),
    }

    // Dropping the last manager handle closes the standby queue
    drop(server);
    drop(manager);
    if let Some(handle) = standby_task {
        if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
            tracing::warn!("Standby forwarder did not drain before shutdown");
        }
    }

    tracing::info!("WolfGTM stopped");
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    let config = GtmConfig::sample(
        &node_id,
        "0.0.0.0:6666",
        PathBuf::from(format!("/var/lib/wolfgtm/{}", node_id)),
    );
    let body = toml::to_string_pretty(&config)
        .map_err(|e| Error::Config(format!("failed to render configuration: {}", e)))?;

    let content = format!(
        "# WolfGTM Configuration\n# Generated configuration file\n# Set [standby] address = \"host:port\" to forward to a hot standby\n\n{}",
        body
    );

    std::fs::write(&output, content)?;
    println!("Configuration file created: {}", output.display());
    println!("Then start with: wolfgtm start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match GtmConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Manager ID: {}", config.node.id);
            println!("  Bind Address: {}", config.node.bind_address);
            println!("  Register Log: {}", config.register_log_path().display());
            println!(
                "  Xmin Report Threshold: {}s",
                config.registry.xmin_report_threshold_secs
            );
            println!(
                "  Standby: {}",
                config.standby.address.as_deref().unwrap_or("(none)")
            );
            println!("  Accept Forwarded: {}", config.standby.accept_forwarded);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// JSON shape printed by `dump-log`
#[derive(Serialize)]
struct LogDump<'a> {
    file: String,
    records: &'a [LogRecord],
    valid_bytes: u64,
    discarded_bytes: u64,
}

/// Print a register log as JSON
fn run_dump_log(config_path: PathBuf, file: Option<PathBuf>) -> Result<()> {
    let path = match file {
        Some(path) => path,
        None => GtmConfig::from_file(&config_path)?.register_log_path(),
    };

    let replay = reglog::read_log(&path)?;
    let dump = LogDump {
        file: path.display().to_string(),
        records: &replay.records,
        valid_bytes: replay.valid_len,
        discarded_bytes: replay.discarded,
    };

    let text = serde_json::to_string_pretty(&dump)
        .map_err(|e| Error::Config(format!("failed to render register log: {}", e)))?;
    println!("{}", text);
    Ok(())
}

/// Query a running manager for its nodes
async fn run_nodes(config_path: PathBuf, address: Option<String>, node_type: Option<NodeType>) -> Result<()> {
    let config = GtmConfig::from_file(&config_path).ok();
    let address = match address.or_else(|| config.as_ref().map(|c| c.node.bind_address.clone())) {
        Some(address) => address,
        None => return Err(Error::Config("no manager address given".into())),
    };
    let (connect_timeout, request_timeout) = config
        .as_ref()
        .map(|c| (c.standby.connect_timeout(), c.standby.request_timeout()))
        .unwrap_or((Duration::from_secs(5), Duration::from_secs(10)));

    let client = NetworkClient::new(address.clone(), connect_timeout, request_timeout);

    let global = client.request(Request::GlobalXmin).await?;
    let nodes = client.request(Request::ListNodes { node_type }).await?;

    println!("WolfGTM Nodes ({})", address);
    println!("================");
    if let Response::GlobalXmin { global_xmin, computed_at } = global {
        match computed_at {
            Some(at) => println!("Global xmin: {} (computed {})", global_xmin, at),
            None => println!("Global xmin: {}", global_xmin),
        }
    }
    println!();

    match nodes {
        Response::Nodes { nodes } => {
            println!(
                "{:<12} {:<20} {:<22} {:<13} {:>10} {:<6} {:<8}",
                "TYPE", "NAME", "ADDRESS", "STATUS", "XMIN", "IDLE", "EXCLUDED"
            );
            for node in nodes {
                let address = format!(
                    "{}:{}",
                    node.ip_address.as_deref().unwrap_or("-"),
                    node.port
                );
                println!(
                    "{:<12} {:<20} {:<22} {:<13} {:>10} {:<6} {:<8}",
                    node.node_type.to_string(),
                    node.node_name,
                    address,
                    node.status.to_string(),
                    node.reported_xmin.to_string(),
                    node.idle,
                    node.excluded
                );
            }
            Ok(())
        }
        Response::Error { code, message } => {
            Err(Error::Network(format!("manager returned {:?}: {}", code, message)))
        }
        other => Err(Error::Network(format!(
            "unexpected response {}",
            other.type_name()
        ))),
    }
}
