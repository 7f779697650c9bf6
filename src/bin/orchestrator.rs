// Petriflow - orchestrator worker
// Consumes the workflow queues and drives nets forward
// Run with: cargo run --bin orchestrator

//! # Orchestrator Worker Binary
//!
//! Wires the whole system together: loads settings, connects the store
//! backend, registers the orchestrator handler on the petri queues and the
//! dispatch handler on the shell queue, then listens until shutdown.
//! Multiple workers can run against the same broker and store; the atomic
//! firing protocol keeps them from stepping on each other.
//!
//! Exit codes: 0 on clean shutdown, 1 on a fatal publisher nack or an
//! unrecoverable error.

use clap::Parser;
use dotenv::dotenv;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use petriflow::config::StoreBackend;
use petriflow::{
    AmqpBroker, Broker, DispatchHandler, ForkExecutor, MemoryStore, OrchestratorHandler,
    RedisStore, ServiceContext, Settings, Store,
};

#[derive(Parser, Debug)]
#[command(name = "orchestrator", about = "Petriflow orchestrator worker")]
struct Args {
    /// Path to a settings file (TOML/YAML/JSON)
    #[arg(short, long, env = "PETRIFLOW_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    std::process::exit(match run().await {
        Ok(code) => code,
        Err(e) => {
            // The subscriber may not be up yet, so hit stderr directly too.
            eprintln!("orchestrator failed: {}", e);
            error!(error = %e, "orchestrator failed");
            1
        }
    });
}

async fn run() -> petriflow::Result<i32> {
    // .env is optional; real deployments set the environment themselves.
    let _ = dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref())?;

    info!("🚀 Starting Petriflow orchestrator...");
    info!(url = %settings.amqp.url, vhost = %settings.amqp.vhost, "AMQP");
    info!(prefetch_count = settings.prefetch_count, ack_mode = ?settings.ack_mode, "broker");

    let store: Arc<dyn Store> = match settings.store.backend {
        StoreBackend::Memory => {
            info!("🔧 Using in-memory store; state will not survive a restart");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Redis => {
            info!(url = %settings.store.url, "🔧 Connecting to redis store");
            Arc::new(RedisStore::connect(&settings.store.url).await?)
        }
    };

    let broker = AmqpBroker::new(
        settings.amqp.url.clone(),
        settings.prefetch_count,
        settings.ack_mode,
        settings.bindings.clone(),
    );

    let orchestrator = Arc::new(OrchestratorHandler::new());
    for queue in settings.orchestrator_queues() {
        broker.register_handler(&queue, orchestrator.clone());
    }
    broker.register_handler(
        &settings.shell.queue,
        Arc::new(DispatchHandler::new(Arc::new(ForkExecutor::new()))),
    );

    let context = ServiceContext::new(store, settings.routes.clone());

    info!("✅ Handlers registered; listening");
    let exit_code = broker.listen(context).await?;
    info!(exit_code, "orchestrator stopped");
    Ok(exit_code)
}
