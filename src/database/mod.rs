//! Backup orchestration: request validation, artifact placement and naming,
//! dispatch to the database engine, scheduling and restore verification.

pub mod backup;
pub mod backup_naming;
pub mod engine;
pub mod location;
pub mod locks;
pub mod request;
pub mod scheduler;
pub mod storage;
pub mod verifier;

use engine::{EngineError, RecoveryModel};
use request::BackupKind;

/// Error type for backup orchestration
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("Database '{0}' does not exist")]
    InvalidDatabase(String),

    #[error("Invalid backup kind '{0}': expected FULL, DIFFERENTIAL or LOG")]
    InvalidBackupKind(String),

    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Failed to create backup directory {path}: {source}")]
    PathCreationFailure {
        path: String,
        #[source]
        source: EngineError,
    },

    #[error("No FULL backup of '{0}' exists to base a differential backup on")]
    MissingBaseBackup(String),

    #[error("Database '{database}' uses the {model} recovery model, which does not allow log backups")]
    LogBackupUnsupported {
        database: String,
        model: RecoveryModel,
    },

    #[error("{kind} backup of '{database}' to {path} failed: {reason}")]
    EngineBackupFailure {
        database: String,
        kind: BackupKind,
        path: String,
        reason: String,
    },

    #[error("Verification of artifact {artifact} failed: {reason}")]
    VerificationFailure { artifact: String, reason: String },

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backup task failed: {0}")]
    Task(String),
}

impl From<sqlx::Error> for BackupError {
    fn from(error: sqlx::Error) -> Self {
        BackupError::Catalog(error.to_string())
    }
}

impl BackupError {
    /// Stable identifier of the error kind, surfaced to operators
    pub fn code(&self) -> &'static str {
        match self {
            BackupError::InvalidDatabase(_) => "InvalidDatabase",
            BackupError::InvalidBackupKind(_) => "InvalidBackupKind",
            BackupError::InvalidPath { .. } => "InvalidPath",
            BackupError::PathCreationFailure { .. } => "PathCreationFailure",
            BackupError::MissingBaseBackup(_) => "MissingBaseBackup",
            BackupError::LogBackupUnsupported { .. } => "LogBackupUnsupported",
            BackupError::EngineBackupFailure { .. } => "EngineBackupFailure",
            BackupError::VerificationFailure { .. } => "VerificationFailure",
            BackupError::Engine(_) => "EngineError",
            BackupError::Catalog(_) => "CatalogError",
            BackupError::Io(_) => "IoError",
            BackupError::Config(_) => "ConfigError",
            BackupError::Task(_) => "TaskError",
        }
    }

    /// Whether the error was raised before any filesystem or engine backup I/O
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            BackupError::InvalidDatabase(_)
                | BackupError::InvalidBackupKind(_)
                | BackupError::InvalidPath { .. }
        )
    }
}

/// Result type for backup orchestration
pub type Result<T> = std::result::Result<T, BackupError>;
