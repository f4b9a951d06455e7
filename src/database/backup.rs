//! Backup dispatch and the orchestration entry points
//!
//! [`BackupService`] runs the whole pipeline for one request: validation,
//! location, naming, kind preconditions, the engine call and the catalog
//! record. Manual triggers wait for the database lock; the scheduler takes
//! the lock itself and calls [`BackupService::execute`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::config::BackupConfig;
use crate::database::backup_naming::{ArtifactName, BackupNamingService, TimestampZone};
use crate::database::engine::BackupEngine;
use crate::database::location::{ResolvedLocation, ensure_directory, resolve_location};
use crate::database::locks::DatabaseLocks;
use crate::database::request::{BackupKind, BackupRequest, ValidatedRequest, validate_request};
use crate::database::storage::{ArtifactCatalog, ArtifactRecord, NewArtifact};
use crate::database::{BackupError, Result};

/// Give up looking for a free name after this many same-second collisions
const MAX_NAME_SEQUENCE: u32 = 1000;

/// Options for configuring the backup pipeline
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// `<Root>` of the folder taxonomy
    pub backup_root: String,
    /// Artifact file extension
    pub extension: String,
    pub timestamp_zone: TimestampZone,
    /// Check kind preconditions before calling the engine
    pub enforce_prerequisites: bool,
}

impl BackupOptions {
    pub fn from_config(config: &BackupConfig) -> Self {
        Self {
            backup_root: config.backup_root.clone(),
            extension: config.extension.clone(),
            timestamp_zone: config.timestamp_zone,
            enforce_prerequisites: config.enforce_prerequisites,
        }
    }
}

/// Orchestrates backups against one engine and one artifact catalog
pub struct BackupService {
    engine: Arc<dyn BackupEngine>,
    catalog: Arc<dyn ArtifactCatalog>,
    locks: Arc<DatabaseLocks>,
    naming: BackupNamingService,
    options: BackupOptions,
}

impl BackupService {
    /// Create a new backup service
    pub fn new(
        engine: Arc<dyn BackupEngine>,
        catalog: Arc<dyn ArtifactCatalog>,
        locks: Arc<DatabaseLocks>,
        options: BackupOptions,
    ) -> Self {
        Self {
            engine,
            catalog,
            locks,
            naming: BackupNamingService::new(&options.extension, options.timestamp_zone),
            options,
        }
    }

    pub fn locks(&self) -> &DatabaseLocks {
        &self.locks
    }

    /// Run a backup now, waiting for any operation on the same database
    pub async fn trigger_backup(&self, request: &BackupRequest) -> Result<ArtifactRecord> {
        self.trigger_backup_at(request, Utc::now()).await
    }

    /// Run a backup as if requested at `timestamp`
    pub async fn trigger_backup_at(
        &self,
        request: &BackupRequest,
        timestamp: DateTime<Utc>,
    ) -> Result<ArtifactRecord> {
        let validated = self.validate(request).await?;
        let _guard = self.locks.acquire(&validated.database).await;
        self.execute(&validated, timestamp).await
    }

    /// Run a manual backup as a task owned by `tracker`
    ///
    /// Dropping the returned handle detaches the task instead of cancelling
    /// it, so a caller that goes away mid-backup still gets the artifact
    /// recorded and the lock released only after the engine returns.
    pub fn spawn_trigger(
        self: &Arc<Self>,
        tracker: &TaskTracker,
        request: BackupRequest,
    ) -> JoinHandle<Result<ArtifactRecord>> {
        let service = Arc::clone(self);
        tracker.spawn(async move { service.trigger_backup(&request).await })
    }

    /// List recorded artifacts, newest first
    pub async fn list_artifacts(&self, database: Option<&str>) -> Result<Vec<ArtifactRecord>> {
        self.catalog.list(database).await
    }

    /// Whether the catalog holds a FULL backup of `database`
    pub async fn has_full_backup(&self, database: &str) -> Result<bool> {
        Ok(self.catalog.latest(database, BackupKind::Full).await?.is_some())
    }

    pub async fn validate(&self, request: &BackupRequest) -> Result<ValidatedRequest> {
        validate_request(self.engine.as_ref(), request).await
    }

    /// Location and name for a request, without touching the filesystem
    pub fn plan(
        &self,
        request: &ValidatedRequest,
        timestamp: DateTime<Utc>,
    ) -> (ResolvedLocation, ArtifactName) {
        let location = resolve_location(&self.options.backup_root, request);
        let name = self.naming.generate(request, timestamp, 0);
        (location, name)
    }

    /// Run the pipeline for a validated request
    ///
    /// The caller must hold the database lock: the free-name lookup and the
    /// engine call are only collision-free under it.
    pub async fn execute(
        &self,
        request: &ValidatedRequest,
        timestamp: DateTime<Utc>,
    ) -> Result<ArtifactRecord> {
        // Kind preconditions fail before anything is created on disk
        self.check_prerequisites(request).await?;

        let (location, name) = self.plan(request, timestamp);
        ensure_directory(self.engine.as_ref(), &location).await?;
        let (name, target) = self.free_name(&location, request, name, timestamp).await?;

        self.dispatch(request, &name, &target, timestamp).await
    }

    async fn check_prerequisites(&self, request: &ValidatedRequest) -> Result<()> {
        if !self.options.enforce_prerequisites {
            return Ok(());
        }

        match request.kind {
            BackupKind::Full => Ok(()),
            BackupKind::Differential => {
                if !self.has_full_backup(&request.database).await? {
                    return Err(BackupError::MissingBaseBackup(request.database.clone()));
                }
                Ok(())
            }
            BackupKind::Log => {
                let model = self.engine.recovery_model(&request.database).await?;
                if !model.supports_log_backup() {
                    return Err(BackupError::LogBackupUnsupported {
                        database: request.database.clone(),
                        model,
                    });
                }
                Ok(())
            }
        }
    }

    async fn free_name(
        &self,
        location: &ResolvedLocation,
        request: &ValidatedRequest,
        mut name: ArtifactName,
        timestamp: DateTime<Utc>,
    ) -> Result<(ArtifactName, PathBuf)> {
        for sequence in 1..=MAX_NAME_SEQUENCE {
            let target = location.file_path(&name.file_name);
            if !self.engine.artifact_exists(&target).await? {
                return Ok((name, target));
            }
            warn!("{} already exists, adding a disambiguator", target.display());
            name = self.naming.generate(request, timestamp, sequence);
        }

        Err(BackupError::InvalidPath {
            path: location.directory().to_string(),
            reason: format!("no free artifact name after {} attempts", MAX_NAME_SEQUENCE),
        })
    }

    async fn dispatch(
        &self,
        request: &ValidatedRequest,
        name: &ArtifactName,
        target: &Path,
        timestamp: DateTime<Utc>,
    ) -> Result<ArtifactRecord> {
        let engine_failure = |reason: String| BackupError::EngineBackupFailure {
            database: request.database.clone(),
            kind: request.kind,
            path: target.display().to_string(),
            reason,
        };

        info!(
            "Starting {} backup of {} to {}",
            request.kind,
            request.database,
            target.display()
        );

        if let Err(e) = self
            .engine
            .backup(&request.database, request.kind, target, &name.description)
            .await
        {
            error!("{} backup of {} failed: {}", request.kind, request.database, e);
            return Err(engine_failure(e.to_string()));
        }

        let fingerprint = self
            .engine
            .fingerprint(target)
            .await
            .map_err(|e| engine_failure(format!("artifact unreadable after backup: {}", e)))?;

        let file_path = target.display().to_string();
        let record = match self
            .catalog
            .record(NewArtifact {
                database: request.database.clone(),
                kind: request.kind,
                file_path: file_path.clone(),
                description: name.description.clone(),
                created_at: timestamp,
                size_bytes: fingerprint.size_bytes,
                checksum: fingerprint.checksum,
            })
            .await
        {
            Ok(record) => record,
            Err(e) => {
                error!(
                    "{} backup of {} written to {} but not cataloged: {}",
                    request.kind, request.database, file_path, e
                );
                return Err(BackupError::Catalog(format!(
                    "artifact {} written but not recorded: {}",
                    file_path, e
                )));
            }
        };

        info!(
            "Backup {} completed: {} ({} bytes)",
            record.description,
            record.file_path,
            record.size_bytes
        );
        Ok(record)
    }
}
