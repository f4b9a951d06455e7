//! In-process engines for tests: one that can hold a backup or restore
//! open, and local-disk artifact host behavior for mocks

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::Notify;

use super::{
    ArtifactFingerprint, BackupEngine, EngineError, EngineResult, MockBackupEngine, RecoveryModel,
    file_fingerprint,
};
use crate::database::request::BackupKind;

/// Knows the single database `Sales` and writes artifacts to the local disk
#[derive(Default)]
pub struct GatedEngine {
    /// When set, each backup waits for a permit before writing
    pub backup_gate: Option<Arc<Notify>>,
    /// When set, each restore waits for a permit before finishing
    pub restore_gate: Option<Arc<Notify>>,
    pub backup_started: Notify,
    pub restore_started: Notify,
    pub fail: bool,
    pub backups: AtomicUsize,
    pub backups_finished: AtomicUsize,
    pub restores_finished: AtomicUsize,
}

impl GatedEngine {
    pub fn backups(&self) -> usize {
        self.backups.load(Ordering::SeqCst)
    }

    pub fn backups_finished(&self) -> usize {
        self.backups_finished.load(Ordering::SeqCst)
    }

    pub fn restores_finished(&self) -> usize {
        self.restores_finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackupEngine for GatedEngine {
    async fn list_databases(&self) -> EngineResult<Vec<String>> {
        Ok(vec!["Sales".to_string()])
    }

    async fn database_exists(&self, database: &str) -> EngineResult<bool> {
        Ok(database == "Sales")
    }

    async fn recovery_model(&self, _database: &str) -> EngineResult<RecoveryModel> {
        Ok(RecoveryModel::Full)
    }

    async fn prepare_directory(&self, directory: &str) -> EngineResult<()> {
        tokio::fs::create_dir_all(directory).await?;
        Ok(())
    }

    async fn artifact_exists(&self, path: &Path) -> EngineResult<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn fingerprint(&self, artifact: &Path) -> EngineResult<ArtifactFingerprint> {
        Ok(file_fingerprint(artifact).await?)
    }

    async fn backup(
        &self,
        _database: &str,
        kind: BackupKind,
        target: &Path,
        _description: &str,
    ) -> EngineResult<()> {
        self.backups.fetch_add(1, Ordering::SeqCst);
        self.backup_started.notify_one();
        if let Some(gate) = &self.backup_gate {
            gate.notified().await;
        }
        if self.fail {
            return Err(EngineError::Output("disk full".to_string()));
        }
        tokio::fs::write(target, kind.token()).await?;
        self.backups_finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn restore_verify(
        &self,
        _database: &str,
        _kind: BackupKind,
        _artifact: &Path,
        _scratch_dir: &Path,
    ) -> EngineResult<()> {
        self.restore_started.notify_one();
        if let Some(gate) = &self.restore_gate {
            gate.notified().await;
        }
        self.restores_finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Blocking counterpart of `file_fingerprint` for mock closures
pub fn local_fingerprint(path: &Path) -> EngineResult<ArtifactFingerprint> {
    let bytes = std::fs::read(path)?;
    Ok(ArtifactFingerprint {
        size_bytes: bytes.len() as u64,
        checksum: format!("{:x}", Sha256::digest(&bytes)),
    })
}

/// Artifact host calls served from the local filesystem
pub fn local_artifact_host(engine: &mut MockBackupEngine) {
    engine
        .expect_prepare_directory()
        .returning(|directory| Ok(std::fs::create_dir_all(directory)?));
    engine
        .expect_artifact_exists()
        .returning(|path| Ok(path.exists()));
    engine
        .expect_fingerprint()
        .returning(|path| local_fingerprint(path));
}
