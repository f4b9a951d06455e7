//! SQLite implementation of the ArtifactCatalog trait

use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::debug;

use super::{ArtifactCatalog, ArtifactRecord, NewArtifact};
use crate::database::Result;
use crate::database::request::BackupKind;
use crate::db::DbPool;

const SELECT_COLUMNS: &str = r#"
    SELECT id, database_name, kind, file_path, description, created_at, size_bytes, checksum
    FROM artifacts
"#;

/// Artifact catalog stored in the `artifacts` table
pub struct SqliteCatalog {
    pool: DbPool,
}

impl SqliteCatalog {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for ArtifactRecord {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let kind: String = row.try_get("kind")?;
        let kind = kind.parse::<BackupKind>().map_err(|e| sqlx::Error::ColumnDecode {
            index: "kind".to_string(),
            source: Box::new(e),
        })?;
        let size_bytes: i64 = row.try_get("size_bytes")?;
        let size_bytes = u64::try_from(size_bytes).map_err(|e| sqlx::Error::ColumnDecode {
            index: "size_bytes".to_string(),
            source: Box::new(e),
        })?;

        Ok(ArtifactRecord {
            id: row.try_get("id")?,
            database: row.try_get("database_name")?,
            kind,
            file_path: row.try_get("file_path")?,
            description: row.try_get("description")?,
            created_at: row.try_get("created_at")?,
            size_bytes,
            checksum: row.try_get("checksum")?,
        })
    }
}

#[async_trait]
impl ArtifactCatalog for SqliteCatalog {
    async fn record(&self, artifact: NewArtifact) -> Result<ArtifactRecord> {
        let size_bytes =
            i64::try_from(artifact.size_bytes).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

        let result = sqlx::query(
            r#"
            INSERT INTO artifacts
                (database_name, kind, file_path, description, created_at, size_bytes, checksum)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&artifact.database)
        .bind(artifact.kind.token())
        .bind(&artifact.file_path)
        .bind(&artifact.description)
        .bind(artifact.created_at)
        .bind(size_bytes)
        .bind(&artifact.checksum)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!("Recorded artifact #{} at {}", id, artifact.file_path);

        Ok(ArtifactRecord {
            id,
            database: artifact.database,
            kind: artifact.kind,
            file_path: artifact.file_path,
            description: artifact.description,
            created_at: artifact.created_at,
            size_bytes: artifact.size_bytes,
            checksum: artifact.checksum,
        })
    }

    async fn list(&self, database: Option<&str>) -> Result<Vec<ArtifactRecord>> {
        let records = match database {
            Some(database) => {
                sqlx::query_as::<_, ArtifactRecord>(&format!(
                    "{} WHERE database_name = ? ORDER BY created_at DESC, id DESC",
                    SELECT_COLUMNS
                ))
                .bind(database)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, ArtifactRecord>(&format!(
                    "{} ORDER BY created_at DESC, id DESC",
                    SELECT_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(records)
    }

    async fn latest(&self, database: &str, kind: BackupKind) -> Result<Option<ArtifactRecord>> {
        let record = sqlx::query_as::<_, ArtifactRecord>(&format!(
            "{} WHERE database_name = ? AND kind = ? ORDER BY created_at DESC, id DESC LIMIT 1",
            SELECT_COLUMNS
        ))
        .bind(database)
        .bind(kind.token())
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }
}
