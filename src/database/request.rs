//! Backup requests and the parameter validator
//!
//! A [`BackupRequest`] arrives as raw caller input (the backup kind is still
//! a string). [`validate_request`] turns it into a [`ValidatedRequest`] or
//! fails before any filesystem or engine backup I/O happens.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::database::engine::BackupEngine;
use crate::database::{BackupError, Result};

/// Kind of backup taken against a database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackupKind {
    /// Complete point-in-time copy
    Full,
    /// Changes since the last full backup
    Differential,
    /// Transaction log since the last log backup
    Log,
}

impl BackupKind {
    pub const ALL: [BackupKind; 3] = [BackupKind::Full, BackupKind::Differential, BackupKind::Log];

    /// Upper-case token used in artifact names and descriptions
    pub fn token(self) -> &'static str {
        match self {
            BackupKind::Full => "FULL",
            BackupKind::Differential => "DIFFERENTIAL",
            BackupKind::Log => "LOG",
        }
    }

    /// Folder name in the `<Root>/<Database>/<Kind>/` taxonomy
    pub fn folder(self) -> &'static str {
        match self {
            BackupKind::Full => "Full",
            BackupKind::Differential => "Differential",
            BackupKind::Log => "Log",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for BackupKind {
    type Err = BackupError;

    fn from_str(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        BackupKind::ALL
            .into_iter()
            .find(|kind| kind.token().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| BackupError::InvalidBackupKind(value.to_string()))
    }
}

/// Raw backup request as received from a caller
#[derive(Debug, Clone, Deserialize)]
pub struct BackupRequest {
    pub database: String,
    pub kind: String,
    #[serde(default)]
    pub custom_path: Option<String>,
    #[serde(default)]
    pub backup_name: Option<String>,
}

impl BackupRequest {
    /// Create a request for the given database and backup kind
    pub fn new(database: &str, kind: BackupKind) -> Self {
        Self::from_raw(database, kind.token())
    }

    /// Create a request with an unparsed backup kind
    pub fn from_raw(database: &str, kind: &str) -> Self {
        Self {
            database: database.to_string(),
            kind: kind.to_string(),
            custom_path: None,
            backup_name: None,
        }
    }

    pub fn with_custom_path(mut self, path: &str) -> Self {
        self.custom_path = Some(path.to_string());
        self
    }

    pub fn with_backup_name(mut self, name: &str) -> Self {
        self.backup_name = Some(name.to_string());
        self
    }
}

/// A request that passed validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    pub database: String,
    pub kind: BackupKind,
    pub custom_path: Option<String>,
    pub backup_name: Option<String>,
}

/// Validate a backup request against the engine's catalog
///
/// The kind and path checks are pure; the only engine call is the read-only
/// database existence lookup, made last.
pub async fn validate_request(
    engine: &dyn BackupEngine,
    request: &BackupRequest,
) -> Result<ValidatedRequest> {
    let kind: BackupKind = request.kind.parse()?;

    let custom_path = request
        .custom_path
        .as_deref()
        .map(check_custom_path)
        .transpose()?;

    let backup_name = match request.backup_name.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(name) => {
            if let Some(reason) = component_problem(name) {
                return Err(BackupError::InvalidPath {
                    path: name.to_string(),
                    reason: format!("backup name {}", reason),
                });
            }
            Some(name.to_string())
        }
    };

    let database = request.database.trim();
    if component_problem(database).is_some() || !engine.database_exists(database).await? {
        return Err(BackupError::InvalidDatabase(database.to_string()));
    }

    Ok(ValidatedRequest {
        database: database.to_string(),
        kind,
        custom_path,
        backup_name,
    })
}

// Reserved on at least one of the filesystems backups land on.
fn is_reserved(c: char) -> bool {
    c.is_control() || matches!(c, '<' | '>' | '"' | '|' | '?' | '*')
}

fn check_custom_path(path: &str) -> Result<String> {
    let invalid = |reason: &str| BackupError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    if path.trim().is_empty() {
        return Err(invalid("path is empty"));
    }
    if path.chars().any(is_reserved) {
        return Err(invalid("path contains reserved characters"));
    }
    // A colon is only legal as a drive designator ("D:\...")
    let drive_letter = path.chars().next().is_some_and(|c| c.is_ascii_alphabetic());
    if path
        .char_indices()
        .any(|(i, c)| c == ':' && !(i == 1 && drive_letter))
    {
        return Err(invalid("path contains a misplaced ':'"));
    }

    Ok(path.to_string())
}

/// Describe why a value cannot be used as a single path component
fn component_problem(value: &str) -> Option<&'static str> {
    if value.is_empty() {
        Some("is empty")
    } else if value == "." || value == ".." {
        Some("is a relative path marker")
    } else if value.contains(['/', '\\', ':']) {
        Some("contains a path separator")
    } else if value.chars().any(is_reserved) {
        Some("contains reserved characters")
    } else {
        None
    }
}
