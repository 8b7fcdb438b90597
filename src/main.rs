use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cloud_drive_server::{
    config::{Config, LedgerBackend},
    create_app,
    database::{Database, LedgerRef, MemoryLedger, PgLedger},
    storage::LocalStorage,
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cloud_drive_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    let ledger: LedgerRef = match config.ledger_backend {
        LedgerBackend::Postgres => {
            let database = Database::new(&config.database_url)
                .await
                .context("Failed to connect to database")?;
            database.migrate().await.context("Failed to run migrations")?;
            Arc::new(PgLedger::new(database, config.quota_policy.clone()))
        }
        LedgerBackend::Memory => {
            tracing::warn!("Using the in-memory ledger; metadata is lost on restart");
            Arc::new(MemoryLedger::new(config.quota_policy.clone()))
        }
    };

    let blobs = Arc::new(
        LocalStorage::new(&config.upload_dir).context("Failed to prepare upload directory")?,
    );

    let port = config.port;
    let sweep_interval = config.orphan_sweep_interval_secs;
    let state = AppState::new(config, ledger, blobs)?;

    if sweep_interval > 0 {
        Arc::new(state.orphan_sweeper()).spawn(Duration::from_secs(sweep_interval));
    } else {
        tracing::info!("Orphan sweep disabled");
    }

    let app = create_app(state);

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;
    tracing::info!("Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to install SIGTERM handler");
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

    tracing::info!("Shutdown signal received");
}
