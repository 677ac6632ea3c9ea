// Callsign Queue - Web Server
// Restores the queue from SQLite, starts the reconciler (when a QRZ key is
// configured) and serves the JSON API until Ctrl+C.

use anyhow::{Context, Result};
use callsign_queue::http::{self, AppState};
use callsign_queue::{
    db, logging, AppConfig, ChangeNotifier, MutationGateway, QrzLogbookClient, ReconcilerControl,
    SharedSecret, SlotRegistry,
};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let config = AppConfig::from_env().context("Failed to load configuration")?;
    tracing::info!(version = callsign_queue::VERSION, "📻 Callsign Queue server starting");

    // Database + restore
    let conn = db::open_database(&config.db_path)?;
    let station = db::load_station_config(&conn)?.unwrap_or_else(|| config.station.clone());
    let stored = db::load_entries(&conn)?;
    tracing::info!(path = %config.db_path.display(), stored = stored.len(), "database opened");

    let notifier = Arc::new(ChangeNotifier::new());
    let registry = Arc::new(SlotRegistry::restore(config.capacity, stored, notifier));
    let db = Arc::new(Mutex::new(conn));

    // Push sockets and the reconciler stop on `shutdown`; the mirror writer
    // outlives both so it records their last changes
    let shutdown = CancellationToken::new();
    let writer_shutdown = CancellationToken::new();
    let writer = db::spawn_snapshot_writer(
        Arc::clone(&registry),
        Arc::clone(&db),
        writer_shutdown.clone(),
    );

    // Gateway + reconciler
    let admin = SharedSecret::new(config.admin_password.clone());
    if !admin.is_enabled() {
        tracing::warn!("ADMIN_PASSWORD not set, admin endpoints will reject every call");
    }
    let logger = SharedSecret::new(config.logger_api_key.clone());
    if !logger.is_enabled() {
        tracing::warn!("LOGGER_API_KEY not set, /api/clear_callsign will reject every call");
    }
    let mut gateway =
        MutationGateway::new(Arc::clone(&registry), admin, station).with_logger_key(logger);

    let control = match config.qrz() {
        Some(qrz) => {
            tracing::info!(
                key = %qrz.masked_key(),
                endpoint = %qrz.endpoint,
                "QRZ verifier configured"
            );
            let client = QrzLogbookClient::new(qrz)?;
            let control = Arc::new(ReconcilerControl::new(
                Arc::clone(&registry),
                Arc::new(client),
                config.reconciler.clone(),
                shutdown.clone(),
            ));
            control.start().await;
            gateway = gateway.with_reconciler(Arc::clone(&control));
            Some(control)
        }
        None => {
            tracing::warn!("QRZ_API_KEY not set, automatic removal disabled");
            None
        }
    };

    let state = AppState {
        gateway: Arc::new(gateway),
        db,
        shutdown: shutdown.clone(),
    };

    // Serve
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind))?;
    tracing::info!(addr = %config.bind, "🚀 server listening");

    let signal = shutdown.clone();
    let served = axum::serve(listener, http::router(state))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for Ctrl+C");
            }
            tracing::info!("shutdown requested");
            signal.cancel();
        })
        .await
        .context("Server error");

    // In-flight requests have drained; stop the reconciler, then the writer
    shutdown.cancel();
    if let Some(control) = control {
        control.stop().await;
    }
    writer_shutdown.cancel();
    if let Err(e) = writer.await {
        tracing::error!(error = %e, "snapshot writer task failed");
    }

    served?;
    tracing::info!("server stopped");
    Ok(())
}
