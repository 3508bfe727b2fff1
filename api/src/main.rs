use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

use agent_company_api::{build_router, EchoChat};
use agent_bus::{AgentBus, FileBackend, MemoryBackend};
use run_store::RunStore;
use settings_manager::{MessageQueueKind, SettingsManager};
use worker_pool::{PoolConfig, WorkerPool};
use worker_runtime::InMemoryRuntime;
use workflow_engine::{CommandQualityGate, EngineConfig, NoopVcs, WorkflowEngine};

#[derive(Debug, Parser)]
#[command(name = "agent-company-api", about = "AgentCompany workflow engine control surface")]
struct Args {
    /// Listen port for the HTTP control surface.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Runtime root directory (state/, runs/, workspaces/).
    #[arg(long, default_value = "runtime")]
    root: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let store = Arc::new(RunStore::new(&args.root)?);
    let settings = SettingsManager::new(store.state_dir().join("config.json"))?;
    let config = settings.current();
    info!(root = %args.root.display(), "runtime root initialised");

    let pruned = store.prune_runs(config.state_retention_days)?;
    if pruned > 0 {
        info!(pruned, "removed expired run directories");
    }

    // TODO: sqlite and redis queue backends; until they land the file
    // backend covers every configuration.
    let bus = match config.message_queue_type {
        MessageQueueKind::File => {
            AgentBus::new(Arc::new(FileBackend::new(store.state_dir().join("queue"))?))
        }
        other => {
            warn!(?other, "queue backend not yet available, using in-memory queue");
            AgentBus::new(Arc::new(MemoryBackend::new()))
        }
    };

    let mut pool_config = PoolConfig::new(
        config.max_concurrent_workers as usize,
        store.workspaces_dir(),
    );
    pool_config.memory_limit = config.worker_memory_limit.clone();
    pool_config.cpu_limit = config.worker_cpu_limit.clone();
    pool_config.results_dir = Some(store.runs_dir());
    // Concrete container back-ends (dod / rootless / dind) attach from
    // outside the engine; the in-process runtime keeps the lifecycle
    // contract exercised meanwhile.
    let pool = Arc::new(WorkerPool::new(pool_config, Arc::new(InMemoryRuntime::new())));

    let engine = Arc::new(WorkflowEngine::new(
        EngineConfig::from_system(&config),
        store,
        bus,
        pool,
        Arc::new(CommandQualityGate::new(Vec::new(), Vec::new())),
        Arc::new(EchoChat),
        Arc::new(NoopVcs),
    ));

    let restored = engine.restore_workflows().await?;
    if restored > 0 {
        info!(restored, "restored workflows from previous runs");
    }

    let router = build_router(engine.clone());
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "control surface listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    engine.pool().shutdown().await.ok();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
    }
}
