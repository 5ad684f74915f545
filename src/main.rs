// ============================================================================
// CLI & MAIN ENTRY POINT
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{info, warn};

use statq_engine::constants::{ENGINE_FULL_NAME, ENGINE_VERSION};
use statq_engine::{
    init_logging, DataStore, EngineConfig, FileStore, InMemoryStore, StatQueueConfig, StatService, StatsDispatcher,
    StorageBackend, StoreError,
};

/// StatQ CLI
#[derive(Parser, Debug)]
#[command(
    name = "statq",
    version,
    about = "Real-time statistics aggregation for telecom charging events",
    long_about = "StatQ routes charging events through configured stat queues, keeps \
                  incrementally updated metrics (count, ASR, ACD, costs, ...) and \
                  persists queue state to a backing store. `statq run` serves the \
                  StatSV1 methods as line-delimited JSON on stdin/stdout."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "statq.toml", env = "STATQ_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "STATQ_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long, env = "STATQ_DEBUG")]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the service and serve requests on stdin/stdout
    Run,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

// ----------------------------------------------------------------------------
// CLI Handler Functions
// ----------------------------------------------------------------------------

fn handle_validate(config_path: &Path, verbose: bool) -> AnyhowResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match EngineConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • Instance name: {}", config.service.instance_name);
            println!("  • Storage backend: {:?}", config.storage.backend);
            println!(
                "  • Store interval: {}",
                humantime::format_duration(config.service.store_interval)
            );
            println!("  • Seed queues: {}", config.queues.len());
            for queue in &config.queues {
                let metrics: Vec<String> = queue.metrics.iter().map(ToString::to_string).collect();
                println!(
                    "    - {} (weight {}, store {}, blocker {}): {}",
                    queue.id,
                    queue.weight,
                    queue.store,
                    queue.blocker,
                    metrics.join(", ")
                );
            }

            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(e.into())
        }
    }
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let config_str = EngineConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

fn handle_version() {
    println!("📈 {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("RPC methods:");
    for method in statq_engine::StatsMethod::ALL {
        println!("  • {}", method);
    }
}

// ----------------------------------------------------------------------------
// Service Host
// ----------------------------------------------------------------------------

async fn open_store(config: &EngineConfig) -> AnyhowResult<Arc<dyn DataStore>> {
    let store: Arc<dyn DataStore> = match config.storage.backend {
        StorageBackend::Memory => Arc::new(InMemoryStore::new()),
        StorageBackend::File => Arc::new(
            FileStore::open(&config.storage.path)
                .await
                .with_context(|| format!("Failed to open data directory {}", config.storage.path.display()))?,
        ),
    };
    Ok(store)
}

/// Write configured queues that the store does not know yet.
async fn seed_queues(store: &dyn DataStore, queues: &[StatQueueConfig]) -> AnyhowResult<()> {
    for queue in queues {
        match store.get_queue_config(&queue.id).await {
            Ok(_) => info!(target: "statq::service", queue_id = %queue.id, "Queue already configured in store"),
            Err(StoreError::NotFound { .. }) => {
                store
                    .set_queue_config(queue)
                    .await
                    .with_context(|| format!("Failed to seed queue {}", queue.id))?;
                info!(target: "statq::service", queue_id = %queue.id, "Queue configuration seeded");
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to read queue {}", queue.id)),
        }
    }
    Ok(())
}

async fn run(config: EngineConfig) -> AnyhowResult<()> {
    let store = open_store(&config).await?;
    seed_queues(store.as_ref(), &config.queues).await?;

    let service = Arc::new(StatService::new(config.service.clone(), store));
    service.start().await?;
    let dispatcher = StatsDispatcher::new(service.clone());

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("Failed to setup SIGINT handler")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    info!(target: "statq::rpc", "Serving requests on stdin");
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read request")? else {
                    info!(target: "statq::rpc", "Input closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let reply = dispatcher.handle_line(&line).await;
                stdout.write_all(reply.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
            _ = sigterm.recv() => {
                info!(target: "statq::service", "Received SIGTERM");
                break;
            }
            _ = sigint.recv() => {
                info!(target: "statq::service", "Received SIGINT");
                break;
            }
        }
    }

    let report = service.shutdown().await?;
    if !report.is_success() {
        warn!(
            target: "statq::service",
            failed = report.failed.len(),
            "Some queues could not be stored on shutdown"
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Handle subcommands that don't need full initialization
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            return handle_generate_config(output.as_deref());
        }
        Some(Commands::Validate { verbose }) => {
            return handle_validate(&cli.config, *verbose);
        }
        _ => {}
    }

    let config_found = cli.config.exists();
    let config = if config_found {
        EngineConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        EngineConfig::default()
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    if !config_found {
        warn!("Config file not found at {}, using defaults", cli.config.display());
    }
    info!("📈 {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);

    run(config).await
}
