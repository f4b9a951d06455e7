//! Storage module for the artifact catalog
//!
//! Every successful backup is recorded as an [`ArtifactRecord`]. The catalog
//! is append-only: records are inserted one at a time and never rewritten,
//! a newer record simply supersedes an older one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::database::Result;
use crate::database::request::BackupKind;

pub mod sqlite_catalog;

/// Metadata persisted for one backup artifact
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactRecord {
    /// Catalog-assigned identifier
    pub id: i64,
    pub database: String,
    pub kind: BackupKind,
    /// Location of the artifact file
    pub file_path: String,
    /// Engine-visible label
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    /// Hex SHA-256 of the artifact file
    pub checksum: String,
}

impl ArtifactRecord {
    /// Short identity used in logs and verification reports
    pub fn identity(&self) -> String {
        format!("#{} {}", self.id, self.file_path)
    }
}

/// An artifact about to be recorded
#[derive(Debug, Clone, PartialEq)]
pub struct NewArtifact {
    pub database: String,
    pub kind: BackupKind,
    pub file_path: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub checksum: String,
}

/// Provides a unified interface over the artifact catalog
#[async_trait]
pub trait ArtifactCatalog: Send + Sync {
    /// Insert one record and return it with its assigned id
    async fn record(&self, artifact: NewArtifact) -> Result<ArtifactRecord>;

    /// List records, newest first, optionally for a single database
    async fn list(&self, database: Option<&str>) -> Result<Vec<ArtifactRecord>>;

    /// Most recent record of the given kind for a database
    async fn latest(&self, database: &str, kind: BackupKind) -> Result<Option<ArtifactRecord>>;
}
