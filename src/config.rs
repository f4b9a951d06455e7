use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::database::backup_naming::TimestampZone;
use crate::database::request::BackupKind;
use crate::database::{BackupError, Result};

/// Which database engine backups are taken from
#[derive(Debug, Clone, PartialEq)]
pub enum EngineSettings {
    /// A directory of `<name>.db` SQLite files
    Sqlite { database_dir: PathBuf },
    /// A SQL Server instance reached through `sqlcmd`
    SqlServer {
        host: String,
        user: Option<String>,
        password: Option<String>,
    },
}

/// Cadence of scheduled backups per kind
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleConfig {
    pub full: Duration,
    pub differential: Duration,
    pub log: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            full: Duration::from_secs(24 * 60 * 60),
            differential: Duration::from_secs(8 * 60 * 60),
            log: Duration::from_secs(15 * 60),
        }
    }
}

impl ScheduleConfig {
    /// Interval between scheduled backups of the given kind
    pub fn interval(&self, kind: BackupKind) -> Duration {
        match kind {
            BackupKind::Full => self.full,
            BackupKind::Differential => self.differential,
            BackupKind::Log => self.log,
        }
    }
}

/// Settings for periodic restore verification
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyConfig {
    pub interval: Duration,
    /// Artifacts verified per database per round
    pub sample_size: usize,
    /// How many of the most recent artifacts are sampled from
    pub window: usize,
    /// Root under which disposable restore targets are created
    pub scratch_dir: PathBuf,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(6 * 60 * 60),
            sample_size: 1,
            window: 5,
            scratch_dir: env::temp_dir(),
        }
    }
}

/// Configuration for the backup orchestrator
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// `<Root>` of the artifact folder taxonomy
    pub backup_root: String,
    /// Artifact file extension
    pub extension: String,
    /// Clock used for the timestamp in artifact names
    pub timestamp_zone: TimestampZone,
    pub engine: EngineSettings,
    /// Connection URL of the artifact catalog
    pub catalog_url: String,
    /// Databases to schedule; empty means every database the engine lists
    pub scheduled_databases: Vec<String>,
    pub schedule: ScheduleConfig,
    pub verify: VerifyConfig,
    /// Check for a base FULL backup and log-capable recovery model before dispatch
    pub enforce_prerequisites: bool,
    /// Bind address of the HTTP surface
    pub listen_addr: String,
    /// Log filter used when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_root: String::from("./backups"),
            extension: String::from("bak"),
            timestamp_zone: TimestampZone::Local,
            engine: EngineSettings::Sqlite {
                database_dir: PathBuf::from("./databases"),
            },
            catalog_url: String::from("sqlite:catalog.sqlite"),
            scheduled_databases: Vec::new(),
            schedule: ScheduleConfig::default(),
            verify: VerifyConfig::default(),
            enforce_prerequisites: true,
            listen_addr: String::from("0.0.0.0:8080"),
            log_level: String::from("info"),
        }
    }
}

impl BackupConfig {
    /// Load backup configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key/value source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |key: &str, default: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let engine = match text("BACKUP_ENGINE", "sqlite").to_lowercase().as_str() {
            "sqlite" => EngineSettings::Sqlite {
                database_dir: PathBuf::from(text("BACKUP_SQLITE_DIR", "./databases")),
            },
            "sqlserver" | "mssql" => EngineSettings::SqlServer {
                host: text("BACKUP_SQLSERVER_HOST", "localhost"),
                user: lookup("BACKUP_SQLSERVER_USER").filter(|v| !v.is_empty()),
                password: lookup("BACKUP_SQLSERVER_PASSWORD"),
            },
            other => {
                return Err(BackupError::Config(format!(
                    "BACKUP_ENGINE must be 'sqlite' or 'sqlserver', got '{}'",
                    other
                )));
            }
        };

        let scheduled_databases = lookup("BACKUP_DATABASES")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let schedule = ScheduleConfig {
            full: minutes(&lookup, "BACKUP_FULL_INTERVAL_MINS", defaults.schedule.full)?,
            differential: minutes(
                &lookup,
                "BACKUP_DIFFERENTIAL_INTERVAL_MINS",
                defaults.schedule.differential,
            )?,
            log: minutes(&lookup, "BACKUP_LOG_INTERVAL_MINS", defaults.schedule.log)?,
        };

        let verify = VerifyConfig {
            interval: minutes(&lookup, "BACKUP_VERIFY_INTERVAL_MINS", defaults.verify.interval)?,
            sample_size: count(&lookup, "BACKUP_VERIFY_SAMPLE", defaults.verify.sample_size)?,
            window: count(&lookup, "BACKUP_VERIFY_WINDOW", defaults.verify.window)?,
            scratch_dir: lookup("BACKUP_SCRATCH_DIR")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.verify.scratch_dir),
        };

        let timestamp_zone = match lookup("BACKUP_TIMESTAMP_ZONE").filter(|v| !v.trim().is_empty()) {
            None => defaults.timestamp_zone,
            Some(value) => value.parse().map_err(|e| {
                BackupError::Config(format!("BACKUP_TIMESTAMP_ZONE must be 'utc' or 'local': {}", e))
            })?,
        };

        let enforce_prerequisites = lookup("BACKUP_ENFORCE_PREREQUISITES")
            .map(|v| !matches!(v.trim().to_lowercase().as_str(), "false" | "0" | "no" | "off"))
            .unwrap_or(true);

        Ok(Self {
            backup_root: text("BACKUP_ROOT", &defaults.backup_root),
            extension: text("BACKUP_EXTENSION", &defaults.extension),
            timestamp_zone,
            engine,
            catalog_url: text("BACKUP_CATALOG_URL", &defaults.catalog_url),
            scheduled_databases,
            schedule,
            verify,
            enforce_prerequisites,
            listen_addr: text("BACKUP_LISTEN_ADDR", &defaults.listen_addr),
            log_level: text("BACKUP_LOG_LEVEL", &defaults.log_level),
        })
    }
}

fn minutes<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => match value.trim().parse::<u64>() {
            Ok(mins) if mins > 0 => Ok(Duration::from_secs(mins * 60)),
            _ => Err(BackupError::Config(format!(
                "{} must be a positive number of minutes, got '{}'",
                key, value
            ))),
        },
    }
}

fn count<F>(lookup: &F, key: &str, default: usize) -> Result<usize>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => match value.trim().parse::<usize>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(BackupError::Config(format!(
                "{} must be a positive integer, got '{}'",
                key, value
            ))),
        },
    }
}
