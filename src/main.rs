//! WolfClone - Tablet Replica Clone Engine
//!
//! Serves tablet snapshots to peers and clones tablets from them.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfclone::api::HttpServer;
use wolfclone::clone::{CloneCoordinator, CloneRequest};
use wolfclone::config::{LoggingConfig, WolfCloneConfig};
use wolfclone::error::{Error, Result};
use wolfclone::snapshot::SnapshotMaker;
use wolfclone::tablet::{SchemaHash, TabletEngine, TabletId, Version};
use wolfclone::transport::{HttpSnapshotSource, SnapshotSource};

/// WolfClone - Tablet Replica Clone Engine
#[derive(Parser)]
#[command(name = "wolfclone")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfclone.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve snapshots of local tablets to cloning peers
    Serve,

    /// Clone a tablet from one or more source replicas
    Clone {
        /// Tablet to clone
        #[arg(long)]
        tablet_id: TabletId,

        /// Expected schema hash of the tablet
        #[arg(long)]
        schema_hash: SchemaHash,

        /// Source replica address (host:port); repeat for failover order
        #[arg(long = "source", required = true)]
        sources: Vec<String>,

        /// Version the local replica must reach
        #[arg(long)]
        committed_version: Option<Version>,

        /// Task signature reported back with the result
        #[arg(long, default_value_t = 0)]
        signature: i64,

        /// Give up after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Show the committed versions of a tablet
    Versions {
        /// Tablet to inspect
        #[arg(long)]
        tablet_id: TabletId,

        /// Query a remote replica instead of the local engine
        #[arg(short, long)]
        address: Option<String>,
    },

    /// Remove leftovers of interrupted clones and expired snapshots
    Recover,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfclone.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "be-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file when it can be read
    let mut logging = WolfCloneConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    if let Some(level) = cli.log_level {
        logging.level = level;
    }
    init_logging(&logging)?;

    match cli.command {
        Commands::Serve => run_serve(cli.config).await,
        Commands::Clone {
            tablet_id,
            schema_hash,
            sources,
            committed_version,
            signature,
            timeout_secs,
        } => {
            let request = CloneRequest {
                tablet_id,
                schema_hash,
                signature,
                sources,
                committed_version,
            };
            run_clone(cli.config, request, timeout_secs).await
        }
        Commands::Versions { tablet_id, address } => {
            run_versions(cli.config, tablet_id, address).await
        }
        Commands::Recover => run_recover(cli.config).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Initialize logging
fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.level.as_str().into());

    let json = config.format == "json";
    let file_layer = match &config.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .with(file_layer)
        .init();
    Ok(())
}

fn load_config(config_path: &PathBuf) -> Result<WolfCloneConfig> {
    WolfCloneConfig::from_file(config_path).map_err(|e| {
        tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
        e
    })
}

fn open_engine(config: &WolfCloneConfig) -> Result<Arc<TabletEngine>> {
    let engine = TabletEngine::open(config.data_dir().clone()).map_err(|e| {
        tracing::error!("Failed to open data directory {:?}: {}", config.data_dir(), e);
        e
    })?;
    Ok(Arc::new(engine))
}

/// Run the snapshot source service until interrupted
async fn run_serve(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    tracing::info!("Starting WolfClone node {}", config.node.id);

    let engine = open_engine(&config)?;
    let report = engine.recover(config.clone.staging_ttl()).await?;
    tracing::info!(
        "Startup recovery removed {} staging and {} orphaned directories",
        report.staging_removed,
        report.orphans_removed
    );

    let maker = Arc::new(SnapshotMaker::new(Arc::clone(&engine)));
    let shutdown = CancellationToken::new();

    let sweeper = {
        let maker = Arc::clone(&maker);
        let shutdown = shutdown.clone();
        let ttl = config.clone.snapshot_ttl();
        let period = ttl.min(Duration::from_secs(3600)).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => match maker.sweep_expired(ttl) {
                        Ok(0) => {}
                        Ok(n) => tracing::info!("Swept {} expired snapshots", n),
                        Err(e) => tracing::warn!("Snapshot sweep failed: {}", e),
                    },
                }
            }
        })
    };

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received shutdown signal");
            }
            shutdown.cancel();
        });
    }

    let server = HttpServer::new(config.api.clone(), config.node.id.clone(), maker);
    let stop = shutdown.clone();
    let result = server.start(async move { stop.cancelled().await }).await;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!("Snapshot sweeper ended abnormally: {}", e);
    }
    tracing::info!("WolfClone node stopped");
    result
}

/// Clone one tablet and print the outcome as JSON
async fn run_clone(config_path: PathBuf, request: CloneRequest, timeout_secs: Option<u64>) -> Result<()> {
    let config = load_config(&config_path)?;
    let engine = open_engine(&config)?;
    let source = HttpSnapshotSource::new(config.clone.connect_timeout(), config.api.token.clone())?;
    let coordinator = CloneCoordinator::new(engine, Arc::new(source), &config.clone);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match timeout_secs {
                Some(secs) => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                            tracing::warn!("Clone timed out after {}s", secs);
                        }
                        _ = tokio::signal::ctrl_c() => {
                            tracing::info!("Received shutdown signal");
                        }
                    }
                }
                None => {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::info!("Received shutdown signal");
                    }
                }
            }
            cancel.cancel();
        });
    }

    match coordinator.run(&request, &cancel).await {
        Ok(outcome) => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Err(failure) => {
            eprintln!("✗ {}", failure);
            for line in &failure.diagnostics {
                eprintln!("  - {}", line);
            }
            Err(failure.error)
        }
    }
}

async fn run_versions(config_path: PathBuf, tablet_id: TabletId, address: Option<String>) -> Result<()> {
    let versions = match address {
        Some(address) => {
            let source = HttpSnapshotSource::new(Duration::from_secs(10), None)?;
            source.list_versions(&address, tablet_id).await?
        }
        None => {
            let config = load_config(&config_path)?;
            let engine = open_engine(&config)?;
            engine
                .get_tablet(tablet_id)
                .await?
                .ok_or(Error::TabletNotFound(tablet_id))?
                .version_set()?
        }
    };

    for range in versions.ranges() {
        println!("{}", range);
    }
    Ok(())
}

async fn run_recover(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let engine = open_engine(&config)?;

    let report = engine.recover(config.clone.staging_ttl()).await?;
    let snapshots = SnapshotMaker::new(engine).sweep_expired(config.clone.snapshot_ttl())?;

    println!("Staging directories removed: {}", report.staging_removed);
    println!("Orphaned generations removed: {}", report.orphans_removed);
    println!("Expired snapshots removed: {}", snapshots);
    Ok(())
}

fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    let config_content = format!(r#"# WolfClone Configuration
# Generated configuration file

[node]
id = "{node_id}"
data_dir = "/var/lib/wolfclone/{node_id}"

[clone]
download_max_attempts = 3
retry_backoff_ms = 200
retry_backoff_max_ms = 5000
connect_timeout_secs = 10
download_timeout_secs = 3600
max_incremental_versions = 1000
max_incremental_rowsets = 200
staging_ttl_secs = 86400
snapshot_ttl_secs = 86400
disk_reserve_mb = 64

[api]
enabled = true
bind_address = "0.0.0.0:8040"
cors_enabled = false
# token = "changeme"

[logging]
level = "info"
format = "pretty"
# file = "/var/log/wolfclone/wolfclone.log"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("Then start with: wolfclone serve --config {}", output.display());

    Ok(())
}

fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfCloneConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Data Directory: {}", config.data_dir().display());
            println!("  API Address: {}", config.api.bind_address);
            println!(
                "  Incremental Limits: {} versions / {} rowsets",
                config.clone.max_incremental_versions, config.clone.max_incremental_rowsets
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
