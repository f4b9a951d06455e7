//! SQL Server engine adapter
//!
//! Drives the server through the `sqlcmd` client: catalog lookups against
//! `sys.databases` and native `BACKUP` / `RESTORE` statements. Paths handed
//! to the server are interpreted on the server host, so directories are
//! created and checked through the server too. Artifacts the orchestrator
//! cannot read itself are fingerprinted from the `msdb` backup history.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::{Rng, thread_rng};
use tokio::process::Command;
use tracing::{debug, info, warn};
use which::which;

use super::{
    ArtifactFingerprint, BackupEngine, EngineError, EngineResult, RecoveryModel, file_fingerprint,
};
use crate::database::location::ResolvedLocation;
use crate::database::request::BackupKind;

/// Column separator requested from sqlcmd
const SEPARATOR: char = '|';

/// Backs up databases of one SQL Server instance
pub struct SqlServerEngine {
    program: PathBuf,
    host: String,
    user: Option<String>,
    password: Option<String>,
}

impl SqlServerEngine {
    /// Find `sqlcmd` on the PATH and target the given server
    ///
    /// Without a user, Windows (trusted) authentication is used.
    pub fn locate(host: &str, user: Option<String>, password: Option<String>) -> Result<Self, which::Error> {
        let program = which("sqlcmd")?;
        info!("Using sqlcmd at {} against {}", program.display(), host);
        Ok(Self {
            program,
            host: host.to_string(),
            user,
            password,
        })
    }

    fn command(&self, query: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-S")
            .arg(&self.host)
            .arg("-b")
            .args(["-h", "-1"])
            .arg("-W")
            .arg("-s")
            .arg(SEPARATOR.to_string())
            .arg("-Q")
            .arg(query)
            .stdin(Stdio::null());

        match &self.user {
            Some(user) => {
                cmd.arg("-U").arg(user);
                if let Some(password) = &self.password {
                    // Keeps the password off the process list
                    cmd.env("SQLCMDPASSWORD", password);
                }
            }
            None => {
                cmd.arg("-E");
            }
        }
        cmd
    }

    /// Run a batch and return its non-empty output lines
    async fn run(&self, query: &str) -> EngineResult<Vec<String>> {
        debug!("sqlcmd -Q {}", query);
        let output = self.command(query).output().await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // sqlcmd reports server errors on stdout
            let detail = if stderr.trim().is_empty() { stdout.trim() } else { stderr.trim() };
            return Err(EngineError::Command {
                status: output.status.to_string(),
                stderr: detail.to_string(),
            });
        }

        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn restore_full(&self, database: &str, artifact: &Path, scratch_dir: &Path) -> EngineResult<()> {
        let artifact = path_str(artifact)?;
        let files = parse_file_list(
            &self
                .run(&format!("RESTORE FILELISTONLY FROM DISK = {};", quote_literal(artifact)))
                .await?,
        )?;

        let scratch_dir = path_str(scratch_dir)?;
        self.prepare_directory(scratch_dir).await?;

        // Dropping the scratch database deletes the files moved here
        let scratch_db = format!("{}_verify_{}", database, random_suffix());
        let restore = restore_statement(&scratch_db, artifact, &files, scratch_dir)?;

        let result = async {
            self.run(&restore).await?;
            self.run(&format!(
                "DBCC CHECKDB ({}) WITH NO_INFOMSGS, ALL_ERRORMSGS;",
                quote_identifier(&scratch_db)
            ))
            .await?;
            Ok::<(), EngineError>(())
        }
        .await;

        // Best effort; a leftover scratch database is harmless but noisy
        let drop = format!(
            "IF DB_ID({}) IS NOT NULL DROP DATABASE {};",
            quote_literal(&scratch_db),
            quote_identifier(&scratch_db)
        );
        if let Err(e) = self.run(&drop).await {
            warn!("Failed to drop scratch database {}: {}", scratch_db, e);
        }

        result
    }
}

#[async_trait]
impl BackupEngine for SqlServerEngine {
    async fn list_databases(&self) -> EngineResult<Vec<String>> {
        // database_id 1-4 are master, tempdb, model and msdb
        self.run("SET NOCOUNT ON; SELECT name FROM sys.databases WHERE database_id > 4 ORDER BY name;")
            .await
    }

    async fn database_exists(&self, database: &str) -> EngineResult<bool> {
        let lines = self
            .run(&format!(
                "SET NOCOUNT ON; SELECT COUNT(*) FROM sys.databases WHERE name = {};",
                quote_literal(database)
            ))
            .await?;
        let count: u32 = lines
            .first()
            .and_then(|line| line.parse().ok())
            .ok_or_else(|| EngineError::Output(lines.join("\n")))?;
        Ok(count > 0)
    }

    async fn recovery_model(&self, database: &str) -> EngineResult<RecoveryModel> {
        let lines = self
            .run(&format!(
                "SET NOCOUNT ON; SELECT recovery_model_desc FROM sys.databases WHERE name = {};",
                quote_literal(database)
            ))
            .await?;
        match lines.first() {
            Some(line) => parse_recovery_model(line),
            None => Err(EngineError::Output(format!("no recovery model for {}", database))),
        }
    }

    async fn prepare_directory(&self, directory: &str) -> EngineResult<()> {
        self.run(&format!("EXEC master.sys.xp_create_subdir {};", quote_literal(directory)))
            .await?;
        Ok(())
    }

    async fn artifact_exists(&self, path: &Path) -> EngineResult<bool> {
        let lines = self
            .run(&format!(
                "SET NOCOUNT ON; DECLARE @exists INT; \
                 EXEC master.sys.xp_fileexist {}, @exists OUTPUT; SELECT @exists;",
                quote_literal(path_str(path)?)
            ))
            .await?;
        match lines.first().map(String::as_str) {
            Some("1") => Ok(true),
            Some("0") => Ok(false),
            _ => Err(EngineError::Output(lines.join("\n"))),
        }
    }

    async fn fingerprint(&self, artifact: &Path) -> EngineResult<ArtifactFingerprint> {
        match file_fingerprint(artifact).await {
            Ok(fingerprint) => return Ok(fingerprint),
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::PermissionDenied) => {
                debug!(
                    "{} is not readable here ({}), using the server's backup history",
                    artifact.display(),
                    e
                );
            }
            Err(e) => return Err(EngineError::Io(e)),
        }

        let lines = self.run(&backup_history_query(path_str(artifact)?)).await?;
        parse_backup_history(&lines)
    }

    async fn backup(
        &self,
        database: &str,
        kind: BackupKind,
        target: &Path,
        description: &str,
    ) -> EngineResult<()> {
        let statement = backup_statement(database, kind, path_str(target)?, description);
        self.run(&statement).await?;
        Ok(())
    }

    async fn restore_verify(
        &self,
        database: &str,
        kind: BackupKind,
        artifact: &Path,
        scratch_dir: &Path,
    ) -> EngineResult<()> {
        match kind {
            BackupKind::Full => self.restore_full(database, artifact, scratch_dir).await,
            // Not restorable on their own; check media and page checksums
            BackupKind::Differential | BackupKind::Log => {
                self.run(&format!(
                    "RESTORE VERIFYONLY FROM DISK = {} WITH CHECKSUM;",
                    quote_literal(path_str(artifact)?)
                ))
                .await?;
                Ok(())
            }
        }
    }
}

fn path_str(path: &Path) -> EngineResult<&str> {
    path.to_str()
        .ok_or_else(|| EngineError::Output(format!("non UTF-8 path {}", path.display())))
}

fn random_suffix() -> String {
    let mut rng = thread_rng();
    (0..6).map(|_| rng.sample(Alphanumeric) as char).collect()
}

fn quote_identifier(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

fn quote_literal(value: &str) -> String {
    format!("N'{}'", value.replace('\'', "''"))
}

fn backup_statement(database: &str, kind: BackupKind, target: &str, description: &str) -> String {
    let (verb, options) = match kind {
        BackupKind::Full => ("DATABASE", "INIT"),
        BackupKind::Differential => ("DATABASE", "DIFFERENTIAL, INIT"),
        BackupKind::Log => ("LOG", "INIT"),
    };
    format!(
        "BACKUP {} {} TO DISK = {} WITH {}, NAME = {}, CHECKSUM;",
        verb,
        quote_identifier(database),
        quote_literal(target),
        options,
        quote_literal(description)
    )
}

fn parse_recovery_model(value: &str) -> EngineResult<RecoveryModel> {
    match value.trim().to_ascii_uppercase().as_str() {
        "SIMPLE" => Ok(RecoveryModel::Simple),
        "FULL" => Ok(RecoveryModel::Full),
        "BULK_LOGGED" => Ok(RecoveryModel::BulkLogged),
        other => Err(EngineError::Output(format!("unknown recovery model {}", other))),
    }
}

/// Most recent backup set written to `path`, per `msdb`
fn backup_history_query(path: &str) -> String {
    format!(
        "SET NOCOUNT ON; \
         SELECT TOP 1 CAST(bs.backup_size AS BIGINT), CONVERT(NVARCHAR(36), bs.backup_set_uuid) \
         FROM msdb.dbo.backupset bs \
         JOIN msdb.dbo.backupmediafamily mf ON bs.media_set_id = mf.media_set_id \
         WHERE mf.physical_device_name = {} \
         ORDER BY bs.backup_finish_date DESC;",
        quote_literal(path)
    )
}

fn parse_backup_history(lines: &[String]) -> EngineResult<ArtifactFingerprint> {
    let line = lines
        .first()
        .ok_or_else(|| EngineError::Output("no backup history for artifact".to_string()))?;
    let (size, uuid) = line
        .split_once(SEPARATOR)
        .ok_or_else(|| EngineError::Output(line.clone()))?;
    let size_bytes = size
        .trim()
        .parse()
        .map_err(|_| EngineError::Output(format!("bad backup size '{}'", size)))?;

    Ok(ArtifactFingerprint {
        size_bytes,
        checksum: format!("backupset:{}", uuid.trim().to_ascii_lowercase()),
    })
}

/// Database file listed by `RESTORE FILELISTONLY`
#[derive(Debug, Clone, PartialEq)]
struct BackupFile {
    logical_name: String,
    /// D (data), L (log), S (filestream), F (full-text)
    file_type: char,
}

fn parse_file_list(lines: &[String]) -> EngineResult<Vec<BackupFile>> {
    let files: Vec<BackupFile> = lines
        .iter()
        .filter_map(|line| {
            let columns: Vec<&str> = line.split(SEPARATOR).collect();
            let logical_name = columns.first()?.trim();
            let file_type = columns.get(2)?.trim().chars().next()?;
            (!logical_name.is_empty()).then(|| BackupFile {
                logical_name: logical_name.to_string(),
                file_type,
            })
        })
        .collect();

    if files.is_empty() {
        return Err(EngineError::Output("backup set lists no database files".to_string()));
    }
    Ok(files)
}

fn restore_statement(
    scratch_db: &str,
    artifact: &str,
    files: &[BackupFile],
    scratch_dir: &str,
) -> EngineResult<String> {
    let scratch = ResolvedLocation::from_directory(scratch_dir);
    let mut moves = Vec::with_capacity(files.len());
    for (index, file) in files.iter().enumerate() {
        let extension = match file.file_type {
            'L' => "ldf",
            _ if index == 0 => "mdf",
            _ => "ndf",
        };
        let target = scratch.file_path(&format!("{}_{}.{}", scratch_db, index, extension));
        moves.push(format!(
            "MOVE {} TO {}",
            quote_literal(&file.logical_name),
            quote_literal(path_str(&target)?)
        ));
    }

    Ok(format!(
        "RESTORE DATABASE {} FROM DISK = {} WITH {}, RECOVERY, CHECKSUM;",
        quote_identifier(scratch_db),
        quote_literal(artifact),
        moves.join(", ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_statements() {
        assert_eq!(
            backup_statement(
                "Sales",
                BackupKind::Full,
                "C:\\Backups\\Sales\\Full\\Sales_FULL_20240101_120000.bak",
                "Sales_FULL_Backup"
            ),
            "BACKUP DATABASE [Sales] TO DISK = N'C:\\Backups\\Sales\\Full\\Sales_FULL_20240101_120000.bak' \
             WITH INIT, NAME = N'Sales_FULL_Backup', CHECKSUM;"
        );
        assert_eq!(
            backup_statement("Sales", BackupKind::Differential, "d.bak", "d"),
            "BACKUP DATABASE [Sales] TO DISK = N'd.bak' WITH DIFFERENTIAL, INIT, NAME = N'd', CHECKSUM;"
        );
        assert_eq!(
            backup_statement("Sales", BackupKind::Log, "l.bak", "l"),
            "BACKUP LOG [Sales] TO DISK = N'l.bak' WITH INIT, NAME = N'l', CHECKSUM;"
        );
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_identifier("odd]name"), "[odd]]name]");
        assert_eq!(quote_literal("O'Brien"), "N'O''Brien'");
    }

    #[test]
    fn test_parse_recovery_model() {
        assert_eq!(parse_recovery_model("SIMPLE").unwrap(), RecoveryModel::Simple);
        assert_eq!(parse_recovery_model("full").unwrap(), RecoveryModel::Full);
        assert_eq!(parse_recovery_model("BULK_LOGGED").unwrap(), RecoveryModel::BulkLogged);
        assert!(parse_recovery_model("CHAOS").is_err());
    }

    #[test]
    fn test_parse_file_list_and_restore_statement() {
        let lines = vec![
            "Sales|D:\\Data\\Sales.mdf|D|PRIMARY|8388608".to_string(),
            "Sales_log|D:\\Data\\Sales_log.ldf|L|NULL|8388608".to_string(),
        ];
        let files = parse_file_list(&lines).unwrap();
        assert_eq!(
            files,
            vec![
                BackupFile { logical_name: "Sales".to_string(), file_type: 'D' },
                BackupFile { logical_name: "Sales_log".to_string(), file_type: 'L' },
            ]
        );

        let statement =
            restore_statement("Sales_verify_abc123", "full.bak", &files, "/scratch").unwrap();
        assert_eq!(
            statement,
            "RESTORE DATABASE [Sales_verify_abc123] FROM DISK = N'full.bak' WITH \
             MOVE N'Sales' TO N'/scratch/Sales_verify_abc123_0.mdf', \
             MOVE N'Sales_log' TO N'/scratch/Sales_verify_abc123_1.ldf', RECOVERY, CHECKSUM;"
        );

        // Server-side Windows scratch paths keep their separator on any host
        let statement =
            restore_statement("Sales_verify_abc123", "full.bak", &files, "D:\\Scratch").unwrap();
        assert!(statement.contains("MOVE N'Sales' TO N'D:\\Scratch\\Sales_verify_abc123_0.mdf'"));
    }

    #[test]
    fn test_parse_backup_history() {
        let lines = vec!["7340032|6F9619FF-8B86-D011-B42D-00C04FC964FF".to_string()];
        assert_eq!(
            parse_backup_history(&lines).unwrap(),
            ArtifactFingerprint {
                size_bytes: 7_340_032,
                checksum: "backupset:6f9619ff-8b86-d011-b42d-00c04fc964ff".to_string(),
            }
        );
        assert!(parse_backup_history(&[]).is_err());
        assert!(parse_backup_history(&["NULL|x".to_string()]).is_err());
    }

    #[test]
    fn test_backup_history_query_targets_device() {
        let query = backup_history_query("\\\\nas\\backups\\Sales_FULL_20240101_120000.bak");
        assert!(query.contains("WHERE mf.physical_device_name = N'\\\\nas\\backups\\Sales_FULL_20240101_120000.bak'"));
        assert!(query.contains("ORDER BY bs.backup_finish_date DESC"));
    }

    #[test]
    fn test_parse_empty_file_list() {
        assert!(parse_file_list(&[]).is_err());
    }

    #[test]
    fn test_random_suffix() {
        let suffix = random_suffix();
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
