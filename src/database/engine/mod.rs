//! Database engine adapters
//!
//! The orchestrator never reimplements backup or restore: it calls into the
//! engine's native primitives through the [`BackupEngine`] trait. Two
//! adapters are provided, one for SQLite database files and one for
//! SQL Server driven through `sqlcmd`.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::config::{BackupConfig, EngineSettings};
use crate::database::request::BackupKind;

#[cfg(test)]
pub mod fake;
pub mod sqlite;
pub mod sqlserver;

/// Engine setting controlling whether log backups are possible
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryModel {
    Simple,
    Full,
    BulkLogged,
}

impl RecoveryModel {
    /// Whether the engine retains log history for log backups
    pub fn supports_log_backup(self) -> bool {
        !matches!(self, RecoveryModel::Simple)
    }
}

impl fmt::Display for RecoveryModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecoveryModel::Simple => "SIMPLE",
            RecoveryModel::Full => "FULL",
            RecoveryModel::BulkLogged => "BULK_LOGGED",
        })
    }
}

/// Errors raised by an engine adapter
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("SQLite error: {0}")]
    Sqlite(String),

    #[error("Command failed ({status}): {stderr}")]
    Command { status: String, stderr: String },

    #[error("Unexpected engine output: {0}")]
    Output(String),

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for EngineError {
    fn from(error: sqlx::Error) -> Self {
        EngineError::Sqlite(error.to_string())
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Size and content fingerprint of a written artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFingerprint {
    pub size_bytes: u64,
    /// Hex SHA-256 of the file, or an engine-issued backup set identifier
    /// when the file is only reachable from the engine host
    pub checksum: String,
}

/// Fingerprint a file readable from this host
pub async fn file_fingerprint(path: &Path) -> std::io::Result<ArtifactFingerprint> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    let mut size_bytes = 0u64;

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        size_bytes += n as u64;
    }

    Ok(ArtifactFingerprint {
        size_bytes,
        checksum: format!("{:x}", hasher.finalize()),
    })
}

/// Native backup and restore primitives of a database engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackupEngine: Send + Sync {
    /// Names of all databases the engine can back up
    async fn list_databases(&self) -> EngineResult<Vec<String>>;

    /// Whether the named database exists (read-only catalog lookup)
    async fn database_exists(&self, database: &str) -> EngineResult<bool>;

    /// Current recovery model of the named database
    async fn recovery_model(&self, database: &str) -> EngineResult<RecoveryModel>;

    /// Create `directory` and its missing parents on the host that writes artifacts
    async fn prepare_directory(&self, directory: &str) -> EngineResult<()>;

    /// Whether a file already exists at `path` on the artifact host
    async fn artifact_exists(&self, path: &Path) -> EngineResult<bool>;

    /// Size and fingerprint of the artifact at `path`
    async fn fingerprint(&self, artifact: &Path) -> EngineResult<ArtifactFingerprint>;

    /// Write a backup of `kind` to `target`, replacing anything already there
    async fn backup(
        &self,
        database: &str,
        kind: BackupKind,
        target: &Path,
        description: &str,
    ) -> EngineResult<()>;

    /// Restore `artifact` into a disposable target the engine creates under
    /// `scratch_dir` and removes again, and check that it is usable. The
    /// artifact itself is left untouched.
    async fn restore_verify(
        &self,
        database: &str,
        kind: BackupKind,
        artifact: &Path,
        scratch_dir: &Path,
    ) -> EngineResult<()>;
}

/// Create the engine adapter selected by configuration
pub fn create_engine(config: &BackupConfig) -> crate::database::Result<Arc<dyn BackupEngine>> {
    match &config.engine {
        EngineSettings::Sqlite { database_dir } => {
            Ok(Arc::new(sqlite::SqliteEngine::new(database_dir.clone())))
        }
        EngineSettings::SqlServer { host, user, password } => {
            let engine = sqlserver::SqlServerEngine::locate(host, user.clone(), password.clone())
                .map_err(|e| crate::database::BackupError::Config(e.to_string()))?;
            Ok(Arc::new(engine))
        }
    }
}
