//! Core data models used throughout the symbol cache.
//!
//! These types represent the scan records, cache keys, and symbol entries
//! that flow between the watcher, the orchestrator, the router, and the
//! reclaimer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Identity of one extracted symbol set: device identifier, OS version and
/// build identifier.
///
/// Every component builds keys through [`CacheKey::new`], so the store, the
/// watcher's cooldown table and the router's lookups agree on normalization.
/// Marketing names must be resolved to canonical identifiers *before* a key
/// is built (see [`crate::devices`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub device_identifier: String,
    pub os_version: String,
    pub build_id: String,
}

impl CacheKey {
    pub fn new(device_identifier: &str, os_version: &str, build_id: &str) -> Self {
        Self {
            device_identifier: device_identifier.trim().to_string(),
            os_version: normalize_version(os_version),
            build_id: build_id.trim().to_ascii_uppercase(),
        }
    }

    /// Filesystem-safe form of the key, used to name scratch directories.
    pub fn slug(&self) -> String {
        self.to_string()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}",
            self.device_identifier, self.os_version, self.build_id
        )
    }
}

/// Strips whitespace and a leading `v`/`iOS ` so `"iOS 17.5"` and `"17.5"`
/// produce the same key.
fn normalize_version(version: &str) -> String {
    let v = version.trim();
    let v = v
        .strip_prefix("iOS ")
        .or_else(|| v.strip_prefix("iPhone OS "))
        .unwrap_or(v);
    v.trim_start_matches(|c: char| c == 'v' || c == 'V')
        .trim()
        .to_string()
}

/// Lifecycle state of a [`ScanRecord`].
///
/// Allowed transitions:
///
/// ```text
/// Pending ──┐
///           ├──▶ Scanning ──▶ Completed
/// Failed  ──┘        │
///                    └──────▶ Failed
/// ```
///
/// `Scanning → Scanning` is additionally allowed when a stale claim is taken
/// over by another instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Scanning,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Scanning => "scanning",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
        }
    }

    pub fn can_transition_to(self, next: ScanStatus) -> bool {
        matches!(
            (self, next),
            (ScanStatus::Pending, ScanStatus::Scanning)
                | (ScanStatus::Failed, ScanStatus::Scanning)
                | (ScanStatus::Scanning, ScanStatus::Scanning)
                | (ScanStatus::Scanning, ScanStatus::Completed)
                | (ScanStatus::Scanning, ScanStatus::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ScanStatus::Completed | ScanStatus::Failed)
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ScanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ScanStatus::Pending),
            "scanning" => Ok(ScanStatus::Scanning),
            "completed" => Ok(ScanStatus::Completed),
            "failed" => Ok(ScanStatus::Failed),
            other => Err(format!("unknown scan status: '{}'", other)),
        }
    }
}

/// Where a firmware image lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "location", rename_all = "lowercase")]
pub enum SourceRef {
    /// A key in the configured object store.
    Object(String),
    /// A file on the local filesystem, submitted explicitly.
    File(PathBuf),
}

impl SourceRef {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceRef::Object(_) => "object",
            SourceRef::File(_) => "file",
        }
    }

    pub fn location(&self) -> String {
        match self {
            SourceRef::Object(key) => key.clone(),
            SourceRef::File(path) => path.display().to_string(),
        }
    }

    pub fn from_parts(kind: &str, location: &str) -> Option<Self> {
        match kind {
            "object" => Some(SourceRef::Object(location.to_string())),
            "file" => Some(SourceRef::File(PathBuf::from(location))),
            _ => None,
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.location())
    }
}

/// One row of `scan_records`: the extraction state of a single [`CacheKey`].
#[derive(Debug, Clone, Serialize)]
pub struct ScanRecord {
    pub id: String,
    pub source: SourceRef,
    pub device_identifier: String,
    pub os_version: String,
    pub build_id: String,
    pub file_size_bytes: i64,
    pub status: ScanStatus,
    pub symbols_extracted: i64,
    pub error_message: Option<String>,
    pub attempts: i64,
    pub created_at: i64,
    pub scan_started_at: Option<i64>,
    pub scan_completed_at: Option<i64>,
    pub can_delete_source: bool,
    pub source_deleted_at: Option<i64>,
    pub last_accessed_at: Option<i64>,
    pub access_count: i64,
}

impl ScanRecord {
    pub fn key(&self) -> CacheKey {
        CacheKey::new(&self.device_identifier, &self.os_version, &self.build_id)
    }
}

/// A single symbol produced by the extraction tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedSymbol {
    pub address: u64,
    pub name: String,
}

/// An object listed from the object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectInfo {
    /// Full object key (path within the bucket or below the root directory).
    pub key: String,
    /// Object size in bytes.
    pub size: i64,
    /// Last modification timestamp (Unix epoch seconds).
    pub last_modified: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_normalizes_components() {
        let a = CacheKey::new(" iPhone15,2 ", "iOS 17.5", "21f79");
        let b = CacheKey::new("iPhone15,2", "17.5", "21F79");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "iPhone15,2_17.5_21F79");
    }

    #[test]
    fn cache_key_slug_is_path_safe() {
        let key = CacheKey::new("iPhone15,2", "17.5", "21F79");
        assert_eq!(key.slug(), "iPhone15-2_17.5_21F79");
    }

    #[test]
    fn status_transitions() {
        use ScanStatus::*;
        assert!(Pending.can_transition_to(Scanning));
        assert!(Failed.can_transition_to(Scanning));
        assert!(Scanning.can_transition_to(Completed));
        assert!(Scanning.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Scanning));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Failed));
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in ["pending", "scanning", "completed", "failed"] {
            assert_eq!(s.parse::<ScanStatus>().unwrap().as_str(), s);
        }
        assert!("done".parse::<ScanStatus>().is_err());
    }

    #[test]
    fn source_ref_parts() {
        let src = SourceRef::from_parts("object", "fw/iPhone15,2_17.5_21F79.ipsw").unwrap();
        assert_eq!(src.kind(), "object");
        assert_eq!(src.location(), "fw/iPhone15,2_17.5_21F79.ipsw");
        assert!(SourceRef::from_parts("ftp", "x").is_none());
    }
}
