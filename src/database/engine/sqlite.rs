//! SQLite engine adapter
//!
//! Every `<name>.db` file in the configured directory is one database. Full
//! and differential backups use `VACUUM INTO`, which writes a consistent,
//! compacted copy. SQLite does not track changed pages, so a differential
//! artifact is a full snapshot: a superset of the changes since its base.
//! Log backups copy the write-ahead log while holding the write lock, then
//! truncate it so the next log backup starts where this one ended.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Connection, Executor, SqliteConnection};
use tokio::fs as tokio_fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use super::{
    ArtifactFingerprint, BackupEngine, EngineError, EngineResult, RecoveryModel, file_fingerprint,
};
use crate::database::request::BackupKind;

const DATABASE_EXTENSION: &str = "db";

/// First word of a WAL file header, big-endian checksum variant or not
const WAL_MAGIC: [[u8; 4]; 2] = [[0x37, 0x7f, 0x06, 0x82], [0x37, 0x7f, 0x06, 0x83]];

/// Backs up SQLite database files found in one directory
pub struct SqliteEngine {
    database_dir: PathBuf,
}

impl SqliteEngine {
    pub fn new(database_dir: PathBuf) -> Self {
        Self { database_dir }
    }

    fn database_path(&self, database: &str) -> PathBuf {
        self.database_dir
            .join(format!("{}.{}", database, DATABASE_EXTENSION))
    }

    fn wal_path(&self, database: &str) -> PathBuf {
        self.database_dir
            .join(format!("{}.{}-wal", database, DATABASE_EXTENSION))
    }

    async fn connect(path: &Path, read_only: bool) -> EngineResult<SqliteConnection> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(false)
            .read_only(read_only);
        Ok(SqliteConnection::connect_with(&options).await?)
    }

    async fn remove_existing(target: &Path) -> EngineResult<()> {
        match tokio_fs::remove_file(target).await {
            Ok(()) => {
                debug!("Replaced existing file at {}", target.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::Io(e)),
        }
    }

    async fn snapshot(&self, database: &str, target: &Path) -> EngineResult<()> {
        // VACUUM INTO refuses to overwrite, INIT semantics replace
        Self::remove_existing(target).await?;

        let dest = target
            .to_str()
            .ok_or_else(|| EngineError::Output(format!("non UTF-8 path {}", target.display())))?;

        let mut conn = Self::connect(&self.database_path(database), false).await?;
        sqlx::query("VACUUM INTO ?")
            .bind(dest)
            .execute(&mut conn)
            .await
            .map_err(|e| EngineError::Sqlite(format!("VACUUM INTO failed: {}", e)))?;
        conn.close().await?;
        Ok(())
    }

    async fn copy_log(&self, database: &str, target: &Path) -> EngineResult<()> {
        let mut conn = Self::connect(&self.database_path(database), false).await?;

        // Holding the write lock keeps writers from appending mid-copy
        conn.execute("BEGIN IMMEDIATE").await?;

        let wal = self.wal_path(database);
        let copied = match tokio_fs::copy(&wal, target).await {
            Ok(bytes) => Ok(bytes),
            // No WAL yet means nothing was logged since the last checkpoint
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tokio_fs::write(target, b"").await.map(|_| 0)
            }
            Err(e) => Err(e),
        };

        let bytes = match copied {
            Ok(bytes) => bytes,
            Err(e) => {
                if let Err(rollback) = conn.execute("ROLLBACK").await {
                    warn!("Rollback after failed log copy of {} failed: {}", database, rollback);
                }
                return Err(EngineError::Io(e));
            }
        };
        conn.execute("COMMIT").await?;
        debug!("Copied {} bytes of WAL for {}", bytes, database);

        // Reset the WAL so the next log artifact holds only newer frames
        let (busy, _, _): (i64, i64, i64) = sqlx::query_as("PRAGMA wal_checkpoint(TRUNCATE)")
            .fetch_one(&mut conn)
            .await?;
        conn.close().await?;
        if busy != 0 {
            return Err(EngineError::Sqlite(format!(
                "WAL of {} is in use and could not be truncated after the log backup",
                database
            )));
        }
        Ok(())
    }

    async fn check_wal_header(artifact: &Path) -> EngineResult<()> {
        let mut file = tokio_fs::File::open(artifact).await?;
        let mut header = [0u8; 4];
        let mut read = 0;
        while read < header.len() {
            let n = file.read(&mut header[read..]).await?;
            if n == 0 {
                break;
            }
            read += n;
        }

        match read {
            0 => Ok(()),
            4 if WAL_MAGIC.contains(&header) => Ok(()),
            _ => Err(EngineError::Integrity(
                "log artifact does not start with a WAL header".to_string(),
            )),
        }
    }

    async fn check_restored_copy(restored: &Path) -> EngineResult<()> {
        let mut conn = Self::connect(restored, true).await?;

        let results: Vec<String> = sqlx::query_scalar("PRAGMA integrity_check")
            .fetch_all(&mut conn)
            .await?;
        if results.len() != 1 || results[0] != "ok" {
            return Err(EngineError::Integrity(results.join("; ")));
        }

        let _: i64 = sqlx::query_scalar("SELECT count(*) FROM sqlite_master")
            .fetch_one(&mut conn)
            .await?;
        conn.close().await?;
        Ok(())
    }
}

#[async_trait]
impl BackupEngine for SqliteEngine {
    async fn list_databases(&self) -> EngineResult<Vec<String>> {
        let mut entries = match tokio_fs::read_dir(&self.database_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EngineError::Io(e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(DATABASE_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }

        names.sort();
        Ok(names)
    }

    async fn database_exists(&self, database: &str) -> EngineResult<bool> {
        match tokio_fs::metadata(self.database_path(database)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(EngineError::Io(e)),
        }
    }

    async fn recovery_model(&self, database: &str) -> EngineResult<RecoveryModel> {
        let mut conn = Self::connect(&self.database_path(database), true).await?;
        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&mut conn)
            .await?;
        conn.close().await?;

        Ok(if mode.eq_ignore_ascii_case("wal") {
            RecoveryModel::Full
        } else {
            RecoveryModel::Simple
        })
    }

    async fn prepare_directory(&self, directory: &str) -> EngineResult<()> {
        tokio_fs::create_dir_all(directory).await?;
        Ok(())
    }

    async fn artifact_exists(&self, path: &Path) -> EngineResult<bool> {
        Ok(tokio_fs::try_exists(path).await?)
    }

    async fn fingerprint(&self, artifact: &Path) -> EngineResult<ArtifactFingerprint> {
        Ok(file_fingerprint(artifact).await?)
    }

    async fn backup(
        &self,
        database: &str,
        kind: BackupKind,
        target: &Path,
        description: &str,
    ) -> EngineResult<()> {
        // SQLite files carry no backup label; the description lives in the catalog
        debug!("SQLite {} backup '{}' of {} to {}", kind, description, database, target.display());

        match kind {
            BackupKind::Full | BackupKind::Differential => self.snapshot(database, target).await,
            BackupKind::Log => self.copy_log(database, target).await,
        }
    }

    async fn restore_verify(
        &self,
        database: &str,
        kind: BackupKind,
        artifact: &Path,
        scratch_dir: &Path,
    ) -> EngineResult<()> {
        match kind {
            BackupKind::Log => Self::check_wal_header(artifact).await,
            BackupKind::Full | BackupKind::Differential => {
                tokio_fs::create_dir_all(scratch_dir).await?;
                // Removed with everything in it when dropped
                let scratch = tempfile::Builder::new()
                    .prefix("verify-")
                    .tempdir_in(scratch_dir)?;
                let restored = scratch
                    .path()
                    .join(format!("{}.{}", database, DATABASE_EXTENSION));
                tokio_fs::copy(artifact, &restored).await?;
                Self::check_restored_copy(&restored).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqliteJournalMode;
    use tempfile::tempdir;

    async fn create_database(dir: &Path, name: &str, wal: bool) -> SqliteConnection {
        let mut options = SqliteConnectOptions::new()
            .filename(dir.join(format!("{}.db", name)))
            .create_if_missing(true);
        if wal {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }
        let mut conn = SqliteConnection::connect_with(&options).await.unwrap();
        conn.execute("CREATE TABLE orders (id INTEGER PRIMARY KEY, total REAL)")
            .await
            .unwrap();
        conn.execute("INSERT INTO orders (total) VALUES (10.5), (99.0)")
            .await
            .unwrap();
        conn
    }

    #[tokio::test]
    async fn test_catalog_lookups() {
        let dir = tempdir().unwrap();
        create_database(dir.path(), "Sales", false).await.close().await.unwrap();
        create_database(dir.path(), "Inventory", false).await.close().await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a database").unwrap();

        let engine = SqliteEngine::new(dir.path().to_path_buf());
        assert_eq!(engine.list_databases().await.unwrap(), vec!["Inventory", "Sales"]);
        assert!(engine.database_exists("Sales").await.unwrap());
        assert!(!engine.database_exists("Ghost").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_directory_lists_nothing() {
        let dir = tempdir().unwrap();
        let engine = SqliteEngine::new(dir.path().join("absent"));
        assert!(engine.list_databases().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recovery_model_follows_journal_mode() {
        let dir = tempdir().unwrap();
        create_database(dir.path(), "Simple", false).await.close().await.unwrap();
        let _wal = create_database(dir.path(), "Logged", true).await;

        let engine = SqliteEngine::new(dir.path().to_path_buf());
        assert_eq!(engine.recovery_model("Simple").await.unwrap(), RecoveryModel::Simple);
        assert_eq!(engine.recovery_model("Logged").await.unwrap(), RecoveryModel::Full);
    }

    #[tokio::test]
    async fn test_full_backup_restores_cleanly() {
        let dir = tempdir().unwrap();
        create_database(dir.path(), "Sales", false).await.close().await.unwrap();
        let engine = SqliteEngine::new(dir.path().to_path_buf());

        let target = dir.path().join("Sales_FULL_20240101_120000.bak");
        std::fs::write(&target, "stale content").unwrap();
        engine
            .backup("Sales", BackupKind::Full, &target, "Sales_FULL_Backup")
            .await
            .unwrap();

        let scratch = tempdir().unwrap();
        engine
            .restore_verify("Sales", BackupKind::Full, &target, scratch.path())
            .await
            .unwrap();
        assert!(target.exists());
        // The restored copy does not outlive the check
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);

        let fingerprint = engine.fingerprint(&target).await.unwrap();
        assert_eq!(fingerprint.size_bytes, std::fs::metadata(&target).unwrap().len());
    }

    #[tokio::test]
    async fn test_artifact_host_operations() {
        let dir = tempdir().unwrap();
        let engine = SqliteEngine::new(dir.path().to_path_buf());
        let nested = dir.path().join("Sales").join("Full");

        engine.prepare_directory(nested.to_str().unwrap()).await.unwrap();
        assert!(nested.is_dir());

        let artifact = nested.join("Sales_FULL_20240101_120000.bak");
        assert!(!engine.artifact_exists(&artifact).await.unwrap());
        std::fs::write(&artifact, "x").unwrap();
        assert!(engine.artifact_exists(&artifact).await.unwrap());
    }

    #[tokio::test]
    async fn test_log_backup_copies_wal() {
        let dir = tempdir().unwrap();
        // Keep the writer open so the WAL is not checkpointed away
        let _writer = create_database(dir.path(), "Sales", true).await;
        let engine = SqliteEngine::new(dir.path().to_path_buf());

        let target = dir.path().join("Sales_LOG_20240101_121500.bak");
        engine
            .backup("Sales", BackupKind::Log, &target, "Sales_LOG_Backup")
            .await
            .unwrap();

        let scratch = tempdir().unwrap();
        engine
            .restore_verify("Sales", BackupKind::Log, &target, scratch.path())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_consecutive_log_backups_do_not_overlap() {
        let dir = tempdir().unwrap();
        let mut writer = create_database(dir.path(), "Sales", true).await;
        let engine = SqliteEngine::new(dir.path().to_path_buf());
        let wal = dir.path().join("Sales.db-wal");

        let first = dir.path().join("Sales_LOG_20240101_121500.bak");
        engine
            .backup("Sales", BackupKind::Log, &first, "Sales_LOG_Backup")
            .await
            .unwrap();
        assert_eq!(std::fs::metadata(&wal).unwrap().len(), 0);

        writer
            .execute("INSERT INTO orders (total) VALUES (7.25)")
            .await
            .unwrap();

        let second = dir.path().join("Sales_LOG_20240101_123000.bak");
        engine
            .backup("Sales", BackupKind::Log, &second, "Sales_LOG_Backup")
            .await
            .unwrap();

        let first = std::fs::read(&first).unwrap();
        let second = std::fs::read(&second).unwrap();
        assert!(!first.is_empty());
        assert!(!second.is_empty());
        assert!(second.len() < first.len());
        assert!(!second.starts_with(&first));

        let scratch = tempdir().unwrap();
        engine
            .restore_verify(
                "Sales",
                BackupKind::Log,
                &dir.path().join("Sales_LOG_20240101_123000.bak"),
                scratch.path(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_artifacts_fail_verification() {
        let dir = tempdir().unwrap();
        let engine = SqliteEngine::new(dir.path().to_path_buf());
        let scratch = tempdir().unwrap();

        let full = dir.path().join("broken.bak");
        std::fs::write(&full, vec![0xAB; 4096]).unwrap();
        assert!(engine
            .restore_verify("Sales", BackupKind::Full, &full, scratch.path())
            .await
            .is_err());

        let log = dir.path().join("broken_log.bak");
        std::fs::write(&log, b"garbage").unwrap();
        let err = engine
            .restore_verify("Sales", BackupKind::Log, &log, scratch.path())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Integrity(_)));
    }
}
