//! dbmx - headless session host.
//!
//! Restores saved connections and tabs, connects the ids given on the
//! command line and logs session events until interrupted.

use std::process::ExitCode;
use std::sync::Arc;

use dbmx_core::logging::{init_logging, LogConfig};
use dbmx_core::services::storage::init_data_dir;
use dbmx_core::{
    ConnectionId, CoreSettings, DbmxResult, LocalStorage, PostgresBackend, SessionCoordinator,
    StateEvent,
};
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> ExitCode {
    let settings = match CoreSettings::load(&CoreSettings::default_path()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let _logging_guard = init_logging(LogConfig::from_settings(&settings));

    tracing::info!(data_dir = %settings.data_dir.display(), "Starting dbmx");

    match run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, category = e.category(), "dbmx stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(settings: CoreSettings) -> DbmxResult<()> {
    init_data_dir(&settings.data_dir)?;
    let store = Arc::new(LocalStorage::open(settings.data_dir.clone())?);
    let backend = Arc::new(PostgresBackend::default());
    let coordinator = SessionCoordinator::with_store(backend, store, settings);

    coordinator.load_saved_connections()?;
    coordinator.load_saved_tabs()?;
    tokio::spawn(log_events(coordinator.clone()));

    for arg in std::env::args().skip(1) {
        let Ok(id) = arg.parse::<i64>() else {
            tracing::warn!(arg = %arg, "Ignoring argument that is not a connection id");
            continue;
        };
        if let Err(e) = coordinator.connect(ConnectionId(id)).await {
            tracing::error!(connection_id = id, error = %e, "Failed to connect");
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for interrupt");
    }
    coordinator.shutdown().await;
    Ok(())
}

async fn log_events(coordinator: SessionCoordinator) {
    let mut rx = coordinator.subscribe();
    loop {
        match rx.recv().await {
            Ok(StateEvent::SelectionChanged(view)) => {
                tracing::info!(
                    database = %view.selected_database_label,
                    pool_id = %view.active_pool_id,
                    live_databases = view.active_databases.len(),
                    "Selection changed"
                );
            }
            Ok(StateEvent::DatabasesChanged(id)) => {
                tracing::info!(
                    connection_id = %id,
                    databases = ?coordinator.database_names(id),
                    "Databases changed"
                );
            }
            Ok(event) => tracing::debug!(event = ?event, "Session event"),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event listener fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
