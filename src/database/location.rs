//! Path resolver for backup artifacts
//!
//! Locations follow the `<Root>/<Database>/<Kind>/` taxonomy unless the
//! caller supplied a custom directory. `<Root>` is configured per deployment
//! (a local Windows path on one host, a mounted volume on another), so the
//! separator style is taken from the root itself rather than from the host
//! platform. Composition is pure; [`ensure_directory`] is the only I/O and
//! runs through the engine, on the host that writes the artifacts.

use std::path::{MAIN_SEPARATOR, PathBuf};

use tracing::debug;

use crate::database::engine::BackupEngine;
use crate::database::request::{BackupKind, ValidatedRequest};
use crate::database::{BackupError, Result};

/// Directory an artifact is written into, always ending in a separator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLocation {
    directory: String,
}

impl ResolvedLocation {
    /// Use `directory` as given, in its own separator style
    pub fn from_directory(directory: &str) -> Self {
        let mut resolved = directory.to_string();
        if !resolved.ends_with(['/', '\\']) {
            resolved.push(separator_for(directory));
        }
        Self {
            directory: resolved,
        }
    }

    /// The directory, with its trailing separator
    pub fn directory(&self) -> &str {
        &self.directory
    }

    /// Full path of a file placed in this directory
    pub fn file_path(&self, file_name: &str) -> PathBuf {
        PathBuf::from(format!("{}{}", self.directory, file_name))
    }
}

/// Resolve where the artifact for a validated request goes
pub fn resolve_location(root: &str, request: &ValidatedRequest) -> ResolvedLocation {
    match &request.custom_path {
        Some(custom) => ResolvedLocation::from_directory(custom),
        None => taxonomy_location(root, &request.database, request.kind),
    }
}

/// `<Root>/<Database>/<KindFolder>/`, without doubled separators
pub fn taxonomy_location(root: &str, database: &str, kind: BackupKind) -> ResolvedLocation {
    let separator = separator_for(root);
    let base = root.trim_end_matches(['/', '\\']);
    let directory = format!(
        "{base}{sep}{database}{sep}{folder}{sep}",
        sep = separator,
        folder = kind.folder()
    );
    ResolvedLocation { directory }
}

fn separator_for(path: &str) -> char {
    match (path.contains('\\'), path.contains('/')) {
        (true, false) => '\\',
        (false, true) => '/',
        _ => MAIN_SEPARATOR,
    }
}

/// Create the location and any missing parents
///
/// Existing directories are fine; anything the filesystem refuses is a
/// [`BackupError::PathCreationFailure`].
pub async fn ensure_directory(engine: &dyn BackupEngine, location: &ResolvedLocation) -> Result<()> {
    let directory = location.directory();
    engine
        .prepare_directory(directory)
        .await
        .map_err(|source| BackupError::PathCreationFailure {
            path: directory.to_string(),
            source,
        })?;
    debug!("Backup directory {} ready", directory);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::engine::sqlite::SqliteEngine;
    use tempfile::tempdir;

    fn request(custom_path: Option<&str>) -> ValidatedRequest {
        ValidatedRequest {
            database: "Sales".to_string(),
            kind: BackupKind::Differential,
            custom_path: custom_path.map(str::to_string),
            backup_name: None,
        }
    }

    #[test]
    fn test_taxonomy_ignores_trailing_separator() {
        for root in ["C:\\Backups", "C:\\Backups\\", "C:\\Backups\\\\"] {
            let location = taxonomy_location(root, "Sales", BackupKind::Full);
            assert_eq!(location.directory(), "C:\\Backups\\Sales\\Full\\");
        }
        for root in ["/var/opt/mssql/backups", "/var/opt/mssql/backups/"] {
            let location = taxonomy_location(root, "Sales", BackupKind::Log);
            assert_eq!(location.directory(), "/var/opt/mssql/backups/Sales/Log/");
        }
    }

    #[test]
    fn test_taxonomy_folders_per_kind() {
        for kind in BackupKind::ALL {
            let location = taxonomy_location("/backups", "Sales", kind);
            assert_eq!(location.directory(), format!("/backups/Sales/{}/", kind.folder()));
            assert!(!location.directory().contains("//"));
        }
    }

    #[test]
    fn test_filesystem_root() {
        let location = taxonomy_location("/", "Sales", BackupKind::Full);
        assert_eq!(location.directory(), "/Sales/Full/");
    }

    #[test]
    fn test_custom_path_used_verbatim() {
        let location = resolve_location("/backups", &request(Some("D:\\Adhoc")));
        assert_eq!(location.directory(), "D:\\Adhoc\\");

        let location = resolve_location("/backups", &request(Some("/mnt/adhoc/")));
        assert_eq!(location.directory(), "/mnt/adhoc/");
        assert_eq!(location.file_path("x.bak"), PathBuf::from("/mnt/adhoc/x.bak"));
    }

    #[test]
    fn test_from_directory_keeps_separator_style() {
        let location = ResolvedLocation::from_directory("D:\\Scratch");
        assert_eq!(location.file_path("a.mdf"), PathBuf::from("D:\\Scratch\\a.mdf"));

        let location = ResolvedLocation::from_directory("/var/opt/mssql/scratch");
        assert_eq!(location.file_path("a.mdf"), PathBuf::from("/var/opt/mssql/scratch/a.mdf"));
    }

    #[test]
    fn test_without_custom_path_uses_taxonomy() {
        let location = resolve_location("/backups", &request(None));
        assert_eq!(location.directory(), "/backups/Sales/Differential/");
    }

    #[tokio::test]
    async fn test_ensure_directory_is_idempotent() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_str().unwrap();
        let location = taxonomy_location(root, "Sales", BackupKind::Full);
        let engine = SqliteEngine::new(dir.path().to_path_buf());

        ensure_directory(&engine, &location).await.unwrap();
        ensure_directory(&engine, &location).await.unwrap();
        assert!(dir.path().join("Sales").join("Full").is_dir());
    }

    #[tokio::test]
    async fn test_ensure_directory_reports_creation_failure() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("occupied");
        std::fs::write(&blocker, "a file, not a directory").unwrap();

        let location = taxonomy_location(blocker.to_str().unwrap(), "Sales", BackupKind::Full);
        let engine = SqliteEngine::new(dir.path().to_path_buf());
        let err = ensure_directory(&engine, &location).await.unwrap_err();
        assert!(matches!(err, BackupError::PathCreationFailure { .. }));
    }
}
