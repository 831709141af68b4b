use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mirage_api::config::ServerConfig;
use mirage_api::router::build_app_router;
use mirage_api::state::AppState;
use mirage_db::{JobStore, MemoryStore, PgStore};
use mirage_engine::{Dispatcher, DispatcherConfig, ProviderRegistry, StepExecutor};
use mirage_fal::api::FalConfig;
use mirage_fal::{FalImageProvider, FalVideoProvider};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mirage_api=debug,mirage_engine=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env();
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    // --- Job store ---
    let store: Arc<dyn JobStore> = match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            let pool = mirage_db::create_pool(&database_url)
                .await
                .expect("Failed to connect to database");
            tracing::info!("Database connection pool created");

            mirage_db::health_check(&pool)
                .await
                .expect("Database health check failed");

            mirage_db::run_migrations(&pool)
                .await
                .expect("Failed to run database migrations");
            tracing::info!("Database migrations applied");

            Arc::new(PgStore::new(pool))
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set, using in-memory job store (state is lost on restart)");
            Arc::new(MemoryStore::new())
        }
    };

    // --- Provider adapters ---
    let fal_config = FalConfig::from_env().expect("FAL_KEY must be set");
    let registry = Arc::new(ProviderRegistry::new(
        Arc::new(FalImageProvider::new(fal_config.clone())),
        Arc::new(FalVideoProvider::new(fal_config)),
    ));

    // --- Workflow engine ---
    let executor = Arc::new(StepExecutor::new(Arc::clone(&store), registry));
    let cancel = CancellationToken::new();
    let dispatcher = Dispatcher::start(
        Arc::clone(&store),
        executor,
        DispatcherConfig {
            max_concurrent_jobs: config.max_concurrent_jobs,
            queue_capacity: config.queue_capacity,
        },
        cancel.clone(),
    );
    tracing::info!(
        max_concurrent_jobs = config.max_concurrent_jobs,
        "Workflow dispatcher started",
    );

    // Requeue jobs interrupted by the previous shutdown or crash.
    let recovered = dispatcher
        .recover()
        .await
        .expect("Startup recovery sweep failed");
    if recovered > 0 {
        tracing::info!(recovered, "Requeued unfinished generation jobs");
    }

    // --- App state and router ---
    let state = AppState {
        store,
        dispatcher,
        config: Arc::new(config.clone()),
    };
    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    // Stop dispatching; in-flight workflows run to their next durable
    // checkpoint and are recovered on the next startup.
    cancel.cancel();

    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix) so the server
/// shuts down cleanly whether stopped interactively or by a process
/// manager (e.g. systemd, Docker, Kubernetes).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
