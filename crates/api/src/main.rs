use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use realtyops_api::config::{server_lock_config, ServerConfig};
use realtyops_api::router::build_app_router;
use realtyops_api::state::AppState;
use realtyops_core::clock::{SharedClock, SystemClock};
use realtyops_core::store::ScheduleStore;
use realtyops_db::repositories::PgScheduleStore;
use realtyops_locking::{EditLockManager, InMemoryScheduleStore, LockConfig, LockController};
use realtyops_realtime::memory::LocalPushSource;
use realtyops_realtime::pg_source::PgPushSource;
use realtyops_realtime::source::PushSource;
use realtyops_realtime::{RealtimeConfig, RealtimeManager};

/// Subscriber id the server's own lock observer subscribes under.
const SERVER_SUBSCRIBER_ID: &str = "api-server";

const DEFAULT_LOG_FILTER: &str =
    "realtyops_api=debug,realtyops_realtime=debug,realtyops_locking=debug,tower_http=debug";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    // --- Configuration ---
    let config = ServerConfig::from_env().context("Invalid server configuration")?;
    let realtime_config = RealtimeConfig::from_env().context("Invalid realtime configuration")?;
    let lock_config = server_lock_config(LockConfig::from_env().context("Invalid lock configuration")?);
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    let clock: SharedClock = Arc::new(SystemClock);

    // --- Store and push source ---
    let (pool, store, source): (_, Arc<dyn ScheduleStore>, Arc<dyn PushSource>) = match &config.database_url {
        Some(url) => {
            let pool = realtyops_db::create_pool(url)
                .await
                .context("Failed to connect to database")?;
            tracing::info!("Database connection pool created");

            realtyops_db::health_check(&pool)
                .await
                .context("Database health check failed")?;
            realtyops_db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            tracing::info!("Database migrations applied");

            (
                Some(pool.clone()),
                Arc::new(PgScheduleStore::new(pool.clone())) as Arc<dyn ScheduleStore>,
                Arc::new(PgPushSource::new(pool)) as Arc<dyn PushSource>,
            )
        }
        None => {
            tracing::warn!("DATABASE_URL not set; running on the in-process store");
            let source = LocalPushSource::new();
            let store = InMemoryScheduleStore::new().with_push(source.clone(), Arc::clone(&clock));
            (
                None,
                Arc::new(store) as Arc<dyn ScheduleStore>,
                Arc::new(source) as Arc<dyn PushSource>,
            )
        }
    };

    // --- Realtime pool ---
    let realtime = RealtimeManager::new(realtime_config, source);
    realtime.start();
    tracing::info!(enabled = realtime.is_enabled(), "Realtime manager started");

    // --- Lock controller (push when possible, else polling) ---
    let manager = EditLockManager::new(store, clock, lock_config);
    let locks = LockController::connect(manager, Some(&realtime), SERVER_SUBSCRIBER_ID).await;

    // --- App state and router ---
    let state = AppState {
        pool,
        config: Arc::new(config.clone()),
        realtime: realtime.clone(),
        locks: locks.clone(),
    };
    let app = build_app_router(state, &config);

    // --- Start server ---
    let host = config.host.parse::<IpAddr>().context("Invalid HOST address")?;
    let addr = SocketAddr::new(host, config.port);
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");
    let cleanup = async {
        // Release held leases before the pool goes away.
        locks.shutdown().await;
        tracing::info!("Lock controller shut down");
        realtime.shutdown().await;
        tracing::info!("Realtime manager shut down");
    };
    if tokio::time::timeout(Duration::from_secs(config.shutdown_timeout_secs), cleanup)
        .await
        .is_err()
    {
        tracing::warn!(
            timeout_secs = config.shutdown_timeout_secs,
            "Cleanup did not finish before the shutdown timeout"
        );
    }

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// `LOG_FORMAT=json` switches to one JSON object per event.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
