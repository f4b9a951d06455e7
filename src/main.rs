use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

mod config;
mod database;
mod db;
mod logging;

use config::BackupConfig;
use database::BackupError;
use database::backup::{BackupOptions, BackupService};
use database::engine::create_engine;
use database::locks::DatabaseLocks;
use database::request::BackupRequest;
use database::scheduler::{Scheduler, entries_for};
use database::storage::sqlite_catalog::SqliteCatalog;
use database::storage::{ArtifactCatalog, ArtifactRecord};
use database::verifier::RecoveryVerifier;

// Shared state for the HTTP handlers
struct AppState {
    service: Arc<BackupService>,
    /// Owns manual backups so shutdown drains them
    tracker: TaskTracker,
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

// Maps orchestration errors onto HTTP responses
struct ApiError(BackupError);

impl From<BackupError> for ApiError {
    fn from(error: BackupError) -> Self {
        ApiError(error)
    }
}

fn status_for(error: &BackupError) -> StatusCode {
    if error.is_validation() {
        return StatusCode::BAD_REQUEST;
    }
    match error {
        BackupError::MissingBaseBackup(_) | BackupError::LogBackupUnsupported { .. } => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        let body = ErrorBody {
            error: self.0.code(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// Handler to run a backup now
async fn trigger_backup_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BackupRequest>,
) -> Result<(StatusCode, Json<ArtifactRecord>), ApiError> {
    // A dropped connection detaches the backup instead of cancelling it
    let record = state
        .service
        .spawn_trigger(&state.tracker, request)
        .await
        .map_err(|e| BackupError::Task(e.to_string()))??;
    Ok((StatusCode::CREATED, Json(record)))
}

#[derive(Deserialize)]
struct ArtifactQuery {
    database: Option<String>,
}

// Handler to list recorded artifacts
async fn list_artifacts_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ArtifactQuery>,
) -> Result<Json<Vec<ArtifactRecord>>, ApiError> {
    let records = state.service.list_artifacts(query.database.as_deref()).await?;
    Ok(Json(records))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl+C: {}", e);
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
                warn!("Cannot listen for SIGTERM: {}", e);
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
    info!("Shutdown signal received");
}

async fn run(config: BackupConfig) -> database::Result<()> {
    // Initialize the artifact catalog
    let pool = db::init_db(&config.catalog_url).await?;
    let catalog: Arc<dyn ArtifactCatalog> = Arc::new(SqliteCatalog::new(pool));

    let engine = create_engine(&config)?;
    let locks = Arc::new(DatabaseLocks::new());
    let service = Arc::new(BackupService::new(
        engine.clone(),
        catalog.clone(),
        locks.clone(),
        BackupOptions::from_config(&config),
    ));

    let databases = if config.scheduled_databases.is_empty() {
        engine.list_databases().await?
    } else {
        config.scheduled_databases.clone()
    };
    info!("Scheduling backups for {} database(s): {:?}", databases.len(), databases);

    let tracker = TaskTracker::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Arc::new(Scheduler::new(service.clone()));
    scheduler.start(entries_for(&databases, &config.schedule), &tracker, shutdown_rx.clone());

    let verifier = Arc::new(RecoveryVerifier::new(engine, catalog, locks, config.verify.clone()));
    verifier.start(&tracker, shutdown_rx);

    // Set up the routes
    let app = Router::new()
        .route("/backups", post(trigger_backup_handler))
        .route("/artifacts", get(list_artifacts_handler))
        .with_state(Arc::new(AppState {
            service,
            tracker: tracker.clone(),
        }));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!("Server starting on http://{}", config.listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Backups in progress are not preemptible: stop the timers, then drain
    info!("Waiting for in-flight backups and verifications");
    let _ = shutdown_tx.send(true);
    tracker.close();
    tracker.wait().await;
    info!("Shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file
    dotenv().ok();

    let config = match BackupConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    logging::init(&config.log_level);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use database::engine::RecoveryModel;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            status_for(&BackupError::InvalidDatabase("Ghost".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&BackupError::InvalidBackupKind("SNAPSHOT".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&BackupError::MissingBaseBackup("Sales".to_string())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&BackupError::LogBackupUnsupported {
                database: "Sales".to_string(),
                model: RecoveryModel::Simple,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&BackupError::Catalog("locked".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
