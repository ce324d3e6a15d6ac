mod config;
mod shutdown;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use shutdown::Shutdown;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use streamgate_db::{PgStreamEngine, StreamEngine, VisibilityScanner};
use streamgate_kv::{InMemoryRoleStore, RoleStore};
use streamgate_notify::ConnectionHub;
use streamgate_quorum::{
    LocalQuorumTransport, NoopCallback, QuorumConfig, QuorumEngine, QuorumProfile, QuorumTransport,
};
use streamgate_scout::{ScoutConfig, ScoutManager};
use streamgate_types::{KeyMinter, StreamError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "streamgate")]
#[command(about = "Durable, at-least-once Postgres-backed stream-message broker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create (or confirm) the app's schema, partitions, and trigger.
    Deploy,
    /// Run the Notification Manager and Scout Manager until interrupted.
    Run,
    /// Print depth/oldest-message/newest-id stats for a stream.
    Stats { stream: String },
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,streamgate_daemon=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn connect_pool(config: &Config) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = Config::from_env().context("failed to load configuration")?;

    match cli.command {
        Commands::Deploy => cmd_deploy(&config).await,
        Commands::Run => cmd_run(&config).await,
        Commands::Stats { stream } => cmd_stats(&config, &stream).await,
    }
}

async fn cmd_deploy(config: &Config) -> Result<()> {
    let pool = connect_pool(config).await?;
    streamgate_db::deploy(&pool, &config.app_id).await?;
    tracing::info!(app_id = %config.app_id, "schema deployed");
    Ok(())
}

async fn cmd_stats(config: &Config, stream: &str) -> Result<()> {
    let pool = connect_pool(config).await?;
    let engine = PgStreamEngine::new(pool, &config.app_id);
    let stats = engine.stats(stream).await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

/// Boots the ambient broker infrastructure for one engine process: schema
/// deploy, the Notification Manager's connection hub, the Scout Manager, and
/// the Quorum Service. Wiring an actual workflow-engine consumer onto the
/// Stream Engine, and a real cross-host pub/sub transport for the Quorum
/// Service beyond its publish/subscribe contract, are the external
/// collaborators' job (`spec.md` §1) and aren't done here.
async fn cmd_run(config: &Config) -> Result<()> {
    let pool = connect_pool(config).await?;

    if let Err(e) = streamgate_db::deploy(&pool, &config.app_id).await {
        match e {
            StreamError::DeploymentInProgress { .. } => {
                tracing::warn!("schema deployment already in progress elsewhere, continuing");
            }
            other => return Err(other.into()),
        }
    }

    let minter = KeyMinter::new(&config.namespace, &config.app_id);
    let instance_id = uuid::Uuid::new_v4().to_string();
    let scanner: Arc<dyn VisibilityScanner> =
        Arc::new(PgStreamEngine::new(pool.clone(), &config.app_id));

    let hub = if config.disable_notifications {
        tracing::info!("notifications disabled, relying on the fallback poller only");
        ConnectionHub::without_listener(scanner.clone(), config.fallback_interval).await
    } else {
        ConnectionHub::connect(&pool, scanner.clone(), config.fallback_interval).await?
    };

    let role_store: Arc<dyn RoleStore> = Arc::new(InMemoryRoleStore::new());
    let scout = ScoutManager::new(
        role_store.clone(),
        scanner,
        minter.scout_role_key("router"),
        instance_id.clone(),
        ScoutConfig {
            role_ttl: config.scout_role_ttl,
            ..ScoutConfig::default()
        },
    );
    scout.clone().start().await;

    let quorum_transport: Arc<dyn QuorumTransport> = Arc::new(LocalQuorumTransport::new());
    let quorum = QuorumEngine::new(
        quorum_transport,
        role_store,
        &minter,
        instance_id.clone(),
        QuorumProfile {
            engine_guid: instance_id.clone(),
            namespace: config.namespace.clone(),
            app_id: config.app_id.clone(),
            stream_name: None,
            throttle: None,
        },
        QuorumConfig {
            activation_max_retry: config.quorum_activation_max_retry,
            rollcall_cycles: config.quorum_rollcall_cycles,
        },
        None,
        Arc::new(NoopCallback),
    );
    quorum
        .clone()
        .start()
        .await
        .context("failed to start quorum engine")?;

    tracing::info!(app_id = %config.app_id, instance_id = %instance_id, "streamgate daemon running");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown signal received");

    Shutdown::new(scout, quorum, hub, instance_id).run().await
}
