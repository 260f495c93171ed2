//! indexrelay node
//!
//! Usage:
//!   indexrelay [OPTIONS] [COMMAND]
//!
//! Commands:
//!   run                        Run the node (default)
//!   aborted count              Count aborted outbox events
//!   aborted reprocess          Return aborted events to pending
//!   aborted clear --yes        Delete aborted events
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use indexrelay::backend::MemoryIndexBackend;
use indexrelay::cluster::{
    ClusterManager, OwnershipResolver, ReplicationListener, ReplicationTransport,
};
use indexrelay::config::Config;
use indexrelay::outbox::{AbortedEventAdmin, FjallOutboxStore, OutboxCoordinator};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    #[default]
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// indexrelay - distributed indexing work coordinator
#[derive(Parser, Debug)]
#[command(name = "indexrelay")]
#[command(author = "IndexRelay Contributors")]
#[command(version)]
#[command(about = "Cluster replication and durable outbox for full-text index updates")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the node until interrupted
    Run,
    /// Administer aborted outbox events
    Aborted {
        #[command(subcommand)]
        action: AbortedAction,

        /// Tenant identifier (required when multi-tenancy is enabled)
        #[arg(long, global = true)]
        tenant: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum AbortedAction {
    /// Print the number of aborted events
    Count,
    /// Return aborted events to pending with their retry count reset
    Reprocess,
    /// Permanently delete aborted events
    Clear {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise defaults plus env overrides
    let config_result = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let file_config = match config_result {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Setup logging - CLI overrides config, config overrides default (warn)
    let log_level = args.log_level.unwrap_or_else(|| {
        match file_config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Warn,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(file_config).await,
        Command::Aborted { action, tenant } => aborted(file_config, action, tenant).await,
    }
}

async fn run(file_config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting indexrelay node");
    info!("  Indexes: {}", file_config.index.names.join(", "));
    info!("  Outbox: {:?}", file_config.outbox.path);

    let tenancy = file_config.tenancy.policy();
    if tenancy.is_enabled() {
        info!(
            "  Tenancy: enabled ({})",
            tenancy.tenant_ids().collect::<Vec<_>>().join(", ")
        );
    } else {
        info!("  Tenancy: disabled");
    }

    let backend = Arc::new(MemoryIndexBackend::new(file_config.index.names.clone()));
    let store = Arc::new(FjallOutboxStore::open(&file_config.outbox.path)?);
    let coordinator = Arc::new(OutboxCoordinator::new(
        store,
        backend.clone(),
        tenancy,
        file_config.outbox.clone(),
    )?);

    if file_config.outbox.enabled {
        coordinator.start().await?;
    } else {
        info!("  Outbox processing: disabled on this node");
    }

    // Setup clustering if configured
    let cluster_manager = if file_config.cluster.enabled {
        let mut cluster_cfg = file_config.cluster.clone();
        let node_id = cluster_cfg.get_node_id();
        cluster_cfg.node_id = Some(node_id.clone());

        info!(
            "  Cluster: enabled (node={}, gossip={}, peer={}, ownership={:?})",
            node_id, cluster_cfg.gossip_addr, cluster_cfg.peer_addr, cluster_cfg.ownership
        );
        if !cluster_cfg.seeds.is_empty() {
            info!("    Seeds: {}", cluster_cfg.seeds.join(", "));
        }

        let resolver = Arc::new(OwnershipResolver::new(
            node_id,
            cluster_cfg.ownership.selector(),
        ));
        let listener = Arc::new(ReplicationListener::new(resolver, backend.clone()));

        let manager = match ClusterManager::new(cluster_cfg, listener).await {
            Ok(manager) => manager,
            Err(e) => {
                eprintln!("Error initializing cluster: {}", e);
                std::process::exit(1);
            }
        };
        if let Err(e) = manager.start() {
            eprintln!("Error starting cluster: {}", e);
            std::process::exit(1);
        }
        Some(manager)
    } else {
        info!("  Cluster: disabled");
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    coordinator.stop().await;
    if let Some(manager) = cluster_manager {
        manager.stop().await;
    }

    let stats = coordinator.stats();
    info!(
        "Outbox totals: appended={} applied={} retried={} aborted={} errors={}",
        stats.appended, stats.applied, stats.retried, stats.aborted, stats.errors
    );
    Ok(())
}

async fn aborted(
    file_config: Config,
    action: AbortedAction,
    tenant: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(FjallOutboxStore::open(&file_config.outbox.path)?);
    let admin = AbortedEventAdmin::new(store, file_config.tenancy.policy());
    let tenant = tenant.as_deref();

    let result = match action {
        AbortedAction::Count => admin.count_aborted(tenant).await.map(|count| {
            println!("{}", count);
        }),
        AbortedAction::Reprocess => admin.reprocess_aborted(tenant).await.map(|count| {
            println!("{} aborted events returned to pending", count);
        }),
        AbortedAction::Clear { yes: false } => {
            eprintln!("Refusing to delete aborted events without --yes");
            std::process::exit(2);
        }
        AbortedAction::Clear { yes: true } => admin.clear_aborted(tenant).await.map(|count| {
            println!("{} aborted events deleted", count);
        }),
    };

    if let Err(e) = result {
        error!("Aborted event administration failed: {}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}
