//! Backup naming module for generating timestamped artifact names
//!
//! Names follow `[<BackupName>_]<Database>_<KIND>_<YYYYMMDD_HHMMSS>.<ext>` so
//! they sort chronologically as plain text, and the engine-visible label is
//! `[<BackupName>_]<Database>_<KIND>_Backup`. The timestamp is rendered in
//! the host's local time unless UTC is configured.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local, Utc};

use crate::database::request::ValidatedRequest;

/// Fixed-width timestamp token with no separator characters
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Clock the timestamp token is rendered in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampZone {
    Utc,
    /// Host local time, as operators read it off the server clock
    #[default]
    Local,
}

impl FromStr for TimestampZone {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "utc" => Ok(TimestampZone::Utc),
            "local" => Ok(TimestampZone::Local),
            other => Err(format!("unknown timestamp zone '{}'", other)),
        }
    }
}

impl fmt::Display for TimestampZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimestampZone::Utc => write!(f, "utc"),
            TimestampZone::Local => write!(f, "local"),
        }
    }
}

/// File name and description generated for one artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    pub file_name: String,
    pub description: String,
}

/// Service for generating artifact names
#[derive(Debug, Clone)]
pub struct BackupNamingService {
    /// File extension without the leading dot
    extension: String,
    zone: TimestampZone,
}

impl BackupNamingService {
    /// Create a naming service producing files with the given extension
    pub fn new(extension: &str, zone: TimestampZone) -> Self {
        Self {
            extension: extension.trim_start_matches('.').to_string(),
            zone,
        }
    }

    /// Generate the name for a request captured at `timestamp`
    ///
    /// `sequence` disambiguates requests that land in the same second: 0
    /// yields the plain name, n > 0 appends `_n` before the extension.
    pub fn generate(
        &self,
        request: &ValidatedRequest,
        timestamp: DateTime<Utc>,
        sequence: u32,
    ) -> ArtifactName {
        let stem = self.stem(request);
        let disambiguator = match sequence {
            0 => String::new(),
            n => format!("_{}", n),
        };

        ArtifactName {
            file_name: format!(
                "{}_{}{}.{}",
                stem,
                timestamp_token(timestamp, self.zone),
                disambiguator,
                self.extension
            ),
            description: format!("{}_Backup", stem),
        }
    }

    fn stem(&self, request: &ValidatedRequest) -> String {
        let label = match &request.backup_name {
            Some(name) => format!("{}_", name),
            None => String::new(),
        };
        format!("{}{}_{}", label, request.database, request.kind.token())
    }
}

/// Format a timestamp as `YYYYMMDD_HHMMSS` in the given zone
pub fn timestamp_token(timestamp: DateTime<Utc>, zone: TimestampZone) -> String {
    match zone {
        TimestampZone::Utc => timestamp.format(TIMESTAMP_FORMAT).to_string(),
        TimestampZone::Local => timestamp
            .with_timezone(&Local)
            .format(TIMESTAMP_FORMAT)
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::request::BackupKind;
    use chrono::TimeZone;

    fn request(kind: BackupKind, backup_name: Option<&str>) -> ValidatedRequest {
        ValidatedRequest {
            database: "Sales".to_string(),
            kind,
            custom_path: None,
            backup_name: backup_name.map(str::to_string),
        }
    }

    #[test]
    fn test_generate_plain_name() {
        let service = BackupNamingService::new("bak", TimestampZone::Utc);
        let timestamp = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        let name = service.generate(&request(BackupKind::Full, None), timestamp, 0);
        assert_eq!(name.file_name, "Sales_FULL_20240101_120000.bak");
        assert_eq!(name.description, "Sales_FULL_Backup");
    }

    #[test]
    fn test_generate_with_backup_name() {
        let service = BackupNamingService::new(".bak", TimestampZone::Utc);
        let timestamp = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        let name = service.generate(&request(BackupKind::Full, Some("Nightly")), timestamp, 0);
        assert_eq!(name.file_name, "Nightly_Sales_FULL_20240101_120000.bak");
        assert_eq!(name.description, "Nightly_Sales_FULL_Backup");
    }

    #[test]
    fn test_kind_tokens_in_names() {
        let service = BackupNamingService::new("bak", TimestampZone::Utc);
        let timestamp = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 3).unwrap();

        let diff = service.generate(&request(BackupKind::Differential, None), timestamp, 0);
        assert_eq!(diff.file_name, "Sales_DIFFERENTIAL_20240309_070503.bak");

        let log = service.generate(&request(BackupKind::Log, None), timestamp, 0);
        assert_eq!(log.file_name, "Sales_LOG_20240309_070503.bak");
        assert_eq!(log.description, "Sales_LOG_Backup");
    }

    #[test]
    fn test_distinct_timestamps_give_distinct_sortable_names() {
        let service = BackupNamingService::new("bak", TimestampZone::Utc);
        let req = request(BackupKind::Log, Some("Ops"));
        let earlier = Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap();
        let later = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        let a = service.generate(&req, earlier, 0);
        let b = service.generate(&req, later, 0);
        assert_ne!(a.file_name, b.file_name);
        assert!(a.file_name < b.file_name);
        // Description does not depend on the timestamp
        assert_eq!(a.description, b.description);
    }

    #[test]
    fn test_sequence_disambiguates_same_second() {
        let service = BackupNamingService::new("bak", TimestampZone::Utc);
        let timestamp = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let req = request(BackupKind::Full, None);

        let first = service.generate(&req, timestamp, 0);
        let second = service.generate(&req, timestamp, 1);
        assert_eq!(second.file_name, "Sales_FULL_20240101_120000_1.bak");
        assert_ne!(first.file_name, second.file_name);
    }

    #[test]
    fn test_timestamp_token_has_no_reserved_characters() {
        let token = timestamp_token(
            Utc.with_ymd_and_hms(2025, 6, 1, 14, 30, 0).unwrap(),
            TimestampZone::Utc,
        );
        assert_eq!(token, "20250601_143000");
        assert!(!token.contains([':', '-', ' ', '/', '\\']));
    }

    #[test]
    fn test_local_zone_uses_host_clock() {
        let timestamp = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let expected = Local
            .from_utc_datetime(&timestamp.naive_utc())
            .format(TIMESTAMP_FORMAT)
            .to_string();

        let service = BackupNamingService::new("bak", TimestampZone::Local);
        let name = service.generate(&request(BackupKind::Full, None), timestamp, 0);
        assert_eq!(name.file_name, format!("Sales_FULL_{}.bak", expected));
        assert_eq!(timestamp_token(timestamp, TimestampZone::Local), expected);
    }

    #[test]
    fn test_timestamp_zone_parsing() {
        assert_eq!("UTC".parse::<TimestampZone>(), Ok(TimestampZone::Utc));
        assert_eq!(" local ".parse::<TimestampZone>(), Ok(TimestampZone::Local));
        assert!("zulu".parse::<TimestampZone>().is_err());
        assert_eq!(TimestampZone::default(), TimestampZone::Local);
    }
}
