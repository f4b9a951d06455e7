//! Recovery verifier
//!
//! Periodically samples recent artifacts of every database and proves they
//! restore: the file must still match its recorded size and checksum, then
//! the engine restores it into a throwaway target under the scratch root.
//! Artifacts are only ever read.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use rand::seq::SliceRandom;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::config::VerifyConfig;
use crate::database::engine::BackupEngine;
use crate::database::locks::DatabaseLocks;
use crate::database::storage::{ArtifactCatalog, ArtifactRecord};
use crate::database::{BackupError, Result};

/// Outcome of one verification round
#[derive(Debug, Default)]
pub struct VerificationReport {
    /// Identities of artifacts that restored cleanly
    pub verified: Vec<String>,
    pub failures: Vec<BackupError>,
    /// Databases skipped because another operation held their lock
    pub skipped_databases: Vec<String>,
}

enum DatabaseRound {
    Skipped(String),
    Checked(Vec<(String, Result<()>)>),
}

pub struct RecoveryVerifier {
    engine: Arc<dyn BackupEngine>,
    catalog: Arc<dyn ArtifactCatalog>,
    locks: Arc<DatabaseLocks>,
    config: VerifyConfig,
}

impl RecoveryVerifier {
    pub fn new(
        engine: Arc<dyn BackupEngine>,
        catalog: Arc<dyn ArtifactCatalog>,
        locks: Arc<DatabaseLocks>,
        config: VerifyConfig,
    ) -> Self {
        Self {
            engine,
            catalog,
            locks,
            config,
        }
    }

    /// Verify a sample of recent artifacts for every cataloged database
    pub async fn verify_once(&self) -> Result<VerificationReport> {
        let mut by_database: BTreeMap<String, Vec<ArtifactRecord>> = BTreeMap::new();
        for record in self.catalog.list(None).await? {
            by_database.entry(record.database.clone()).or_default().push(record);
        }

        let rounds = join_all(
            by_database
                .into_iter()
                .map(|(database, records)| self.verify_database(database, records)),
        )
        .await;

        let mut report = VerificationReport::default();
        for round in rounds {
            match round {
                DatabaseRound::Skipped(database) => report.skipped_databases.push(database),
                DatabaseRound::Checked(results) => {
                    for (identity, result) in results {
                        match result {
                            Ok(()) => report.verified.push(identity),
                            Err(e) => report.failures.push(e),
                        }
                    }
                }
            }
        }
        Ok(report)
    }

    async fn verify_database(&self, database: String, records: Vec<ArtifactRecord>) -> DatabaseRound {
        let Some(_guard) = self.locks.try_acquire(&database) else {
            info!("Database {} is busy, verification deferred to the next round", database);
            return DatabaseRound::Skipped(database);
        };

        let mut results = Vec::new();
        for record in self.sample(&records) {
            results.push((record.identity(), self.verify_artifact(record).await));
        }
        DatabaseRound::Checked(results)
    }

    /// Random pick among the newest `window` records (input is newest first)
    fn sample<'a>(&self, records: &'a [ArtifactRecord]) -> Vec<&'a ArtifactRecord> {
        let window = &records[..records.len().min(self.config.window)];
        window
            .choose_multiple(&mut rand::thread_rng(), self.config.sample_size)
            .collect()
    }

    /// Check one artifact against its record, then restore it into scratch space
    pub async fn verify_artifact(&self, record: &ArtifactRecord) -> Result<()> {
        let failure = |reason: String| BackupError::VerificationFailure {
            artifact: record.identity(),
            reason,
        };
        let path = Path::new(&record.file_path);

        let current = self
            .engine
            .fingerprint(path)
            .await
            .map_err(|e| failure(format!("artifact unreadable: {}", e)))?;
        if current.size_bytes != record.size_bytes {
            return Err(failure(format!(
                "size is {} bytes, recorded {}",
                current.size_bytes, record.size_bytes
            )));
        }
        if current.checksum != record.checksum {
            return Err(failure(format!(
                "checksum {} does not match recorded {}",
                current.checksum, record.checksum
            )));
        }

        self.engine
            .restore_verify(&record.database, record.kind, path, &self.config.scratch_dir)
            .await
            .map_err(|e| failure(format!("restore failed: {}", e)))?;

        info!("Verified artifact {}", record.identity());
        Ok(())
    }

    /// Run a verification round every configured interval until shutdown
    ///
    /// A round in progress when `shutdown` flips runs to completion.
    pub fn start(self: &Arc<Self>, tracker: &TaskTracker, mut shutdown: watch::Receiver<bool>) {
        let verifier = self.clone();
        let interval = self.config.interval;
        info!("Verifying recent artifacts every {:?}", interval);

        tracker.spawn(async move {
            let mut timer = interval_at(Instant::now() + interval, interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = timer.tick() => match verifier.verify_once().await {
                        Ok(report) => {
                            for failure in &report.failures {
                                error!("{}", failure);
                            }
                            info!(
                                "Verification round: {} verified, {} failed, {} databases busy",
                                report.verified.len(),
                                report.failures.len(),
                                report.skipped_databases.len()
                            );
                        }
                        Err(e) => warn!("Verification round aborted: {}", e),
                    },
                }
            }
        });
    }
}
