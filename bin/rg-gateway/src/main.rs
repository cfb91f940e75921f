//! RelayGate Gateway
//!
//! Builds the message store and routing engine from a TOML configuration,
//! registers the configured processors and runs the failed-message retry
//! scheduler until Ctrl+C / SIGTERM.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RG_CONFIG` | - | Path to the TOML configuration file |
//! | `RG_LOG_JSON` | `false` | Emit JSON log lines |
//! | `RG_STORE_KIND` | `memory` | `memory`, `sqlite`, `postgres`, `mysql`, `mongo` |
//! | `RG_STORE_URL` | - | Database connection URL |
//! | `RUST_LOG` | `info` | Log level |

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rg_config::{GatewayConfig, ProcessorKind, ProcessorSection, StoreKind, StoreSection};
use rg_router::{FakeProcessor, LogProcessor, Processor, RetryScheduler, RoutingEngine};
use rg_store::{InMemoryMessageStore, MessageStore, MongoMessageStore, SqlMessageStore};
use tokio::signal;
use tracing::{error, info};

/// RelayGate message-routing gateway
#[derive(Parser, Debug)]
#[command(name = "rg-gateway")]
#[command(about = "RelayGate - routes messages from receivers to processors")]
struct Args {
    /// Configuration file; defaults plus environment overrides when omitted
    #[arg(long, env = "RG_CONFIG")]
    config: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long, env = "RG_LOG_JSON", default_value = "false")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => GatewayConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => GatewayConfig::from_env().context("building default configuration")?,
    };

    rg_common::logging::init(args.log_json || config.logging.json);

    info!("Starting RelayGate gateway");

    let store = create_store(&config.store).await?;
    let engine = RoutingEngine::new(store, config.engine.to_engine_config());

    for section in &config.processors {
        register_processor(&engine, section).await?;
    }

    let scheduler = if config.retry.enabled {
        Some(RetryScheduler::start(Arc::clone(&engine), config.retry.to_scheduler_config()))
    } else {
        info!("Retry scheduler disabled");
        None
    };

    info!(
        processors = engine.processors().len(),
        store = ?config.store.kind,
        "RelayGate gateway started"
    );
    info!("Press Ctrl+C to shutdown");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    if let Some(scheduler) = scheduler {
        scheduler.shutdown().await;
    }
    if let Err(e) = engine.stop().await {
        error!(error = %e, "Routing engine did not stop cleanly");
    }

    info!("RelayGate gateway shutdown complete");
    Ok(())
}

async fn create_store(section: &StoreSection) -> Result<Arc<dyn MessageStore>> {
    let url = section.url.clone().unwrap_or_default();

    match section.kind {
        StoreKind::Memory => {
            info!("Using in-memory message store");
            Ok(Arc::new(InMemoryMessageStore::new()))
        }
        StoreKind::Sqlite | StoreKind::Postgres | StoreKind::Mysql => {
            let store = SqlMessageStore::connect(&url, section.max_connections)
                .await
                .context("connecting to SQL message store")?;
            store.init_schema().await.context("initializing message tables")?;
            info!(dialect = ?store.dialect(), "Using SQL message store");
            Ok(Arc::new(store))
        }
        StoreKind::Mongo => {
            let store = MongoMessageStore::connect(&url, &section.database)
                .await
                .context("connecting to MongoDB message store")?;
            info!(database = %section.database, "Using MongoDB message store");
            Ok(Arc::new(store))
        }
    }
}

async fn register_processor(engine: &Arc<RoutingEngine>, section: &ProcessorSection) -> Result<()> {
    let processor: Arc<dyn Processor> = match section.kind {
        ProcessorKind::Log => Arc::new(LogProcessor),
        ProcessorKind::Fake => Arc::new(FakeProcessor::new()),
        ProcessorKind::Fail => Arc::new(FakeProcessor::failing()),
    };

    let service = engine
        .create_processor_with(&section.id, section.priority, processor, |service| {
            if let Some(max) = section.max_concurrent_msgs {
                service.set_max_concurrent_msgs(max)?;
            }
            for acceptor in &section.acceptors {
                service.add_acceptor(acceptor.build()?)?;
            }
            for action in &section.pre_processing_actions {
                service.add_pre_processing_action(action.build()?)?;
            }
            for action in &section.post_processing_actions {
                service.add_post_processing_action(action.build()?)?;
            }
            for action in &section.post_receiving_actions {
                service.add_post_receiving_action(action.build()?)?;
            }
            Ok(())
        })
        .await?;

    info!(
        processor_id = %service.id(),
        priority = service.priority(),
        kind = ?section.kind,
        acceptors = section.acceptors.len(),
        "Registered processor"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
