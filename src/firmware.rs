//! Firmware file naming.
//!
//! Firmware images are identified by their file names. Apple's own naming
//! is `iPhone15,2_17.5_21F79_Restore.ipsw`, but uploads arrive under several
//! conventions, so [`parse_firmware_name`] tries these patterns in order
//! (case-insensitive, matched against the last path segment):
//!
//! | Pattern | Example |
//! |---------|---------|
//! | `device_version_BUILD_*.ipsw` | `iPhone15,2_17.5_21F79_Restore.ipsw` |
//! | `device_version_BUILD*.ipsw` (device may contain `_`) | `iPhone_15_Pro_17.5_21F79.ipsw` |
//! | `device_version_*.ipsw` | `iPhone15,2_17.5_Restore.ipsw` |
//! | `device-version-BUILD*.ipsw` | `iPhone15,2-17.5-21F79.ipsw` |
//! | `device[-_]version*.ipsw` | `iPhone_17.4.ipsw` |
//!
//! Builds have Apple's shape (`21F79`, `20A362`, `19A5261w`), so a trailing
//! `_Restore` is never mistaken for one.
//!
//! A multi-device image (`iPhone15,2,iPhone15,3_17.5_...`) is attributed to
//! its first identifier.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::models::CacheKey;

static NAME_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)^([^_/]+)_(\d+\.\d+(?:\.\d+)?)_(\d+[A-Z]\d+[A-Z]?)_.*\.ipsw$",
        r"(?i)^([^/]+?)_(\d+\.\d+(?:\.\d+)?)_(\d+[A-Z]\d+[A-Z]?).*\.ipsw$",
        r"(?i)^([^_/]+)_(\d+\.\d+(?:\.\d+)?)_.*\.ipsw$",
        r"(?i)^([^-/]+)-(\d+\.\d+(?:\.\d+)?)-(\d+[A-Z]\d+[A-Z]?).*\.ipsw$",
        r"(?i)^([^/]+?)[-_](\d+\.\d+(?:\.\d+)?).*\.ipsw$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("firmware name pattern should compile"))
    .collect()
});

static DEVICE_IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z]+\d+,\d+").expect("device identifier regex should compile")
});

static DIGIT_GROUPS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+").expect("digit regex should compile"));

/// Device, OS version and (when present) build parsed from a file name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirmwareName {
    pub device: String,
    pub os_version: String,
    pub build_id: Option<String>,
}

impl FirmwareName {
    /// The cache key this firmware would fill, if the name carries a build.
    ///
    /// `device` must already be a canonical identifier; see
    /// [`crate::devices::DeviceResolver`].
    pub fn key_for(&self, device_identifier: &str) -> Option<CacheKey> {
        self.build_id
            .as_deref()
            .map(|build| CacheKey::new(device_identifier, &self.os_version, build))
    }
}

/// Parse a firmware object key or path. Returns `None` for names matching
/// none of the known conventions.
pub fn parse_firmware_name(key: &str) -> Option<FirmwareName> {
    let file_name = key.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(key);

    for pattern in NAME_PATTERNS.iter() {
        let Some(caps) = pattern.captures(file_name) else {
            continue;
        };
        let raw_device = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let device = DEVICE_IDENTIFIER
            .find(raw_device)
            .map(|m| m.as_str())
            .unwrap_or(raw_device)
            .trim()
            .to_string();
        if device.is_empty() {
            continue;
        }
        return Some(FirmwareName {
            device,
            os_version: caps[2].to_string(),
            build_id: caps.get(3).map(|m| m.as_str().to_ascii_uppercase()),
        });
    }
    None
}

fn normalize_device(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '_' | '-' | ' ' | ','))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Loose comparison of two device names under differing conventions.
///
/// Names match when they are equal after dropping `_ - , space` and case,
/// or when they name the same family (`iphone`, `ipad`, ...) with the same
/// digit groups, so `iPhone15,2` matches `iPhone_15_2`.
pub fn device_matches(a: &str, b: &str) -> bool {
    let na = normalize_device(a);
    let nb = normalize_device(b);
    if na == nb {
        return true;
    }

    let family = |n: &str| -> String { n.chars().take_while(|c| c.is_ascii_alphabetic()).collect() };
    let (fa, fb) = (family(&na), family(&nb));
    if fa.is_empty() || fa != fb {
        return false;
    }

    let digits = |s: &str| -> Vec<String> {
        DIGIT_GROUPS
            .find_iter(s)
            .map(|m| m.as_str().to_string())
            .collect()
    };
    let (da, db) = (digits(a), digits(b));
    !da.is_empty() && da == db
}

/// Canonical file name to ask for when a firmware image is missing.
pub fn expected_file_name(device_identifier: &str, os_version: &str, build_id: Option<&str>) -> String {
    match build_id {
        Some(build) => format!("{}_{}_{}_Restore.ipsw", device_identifier, os_version, build),
        None => format!("{}_{}_<build>_Restore.ipsw", device_identifier, os_version),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apple_restore_name() {
        let fw = parse_firmware_name("firmware/iPhone15,2_17.5_21F79_Restore.ipsw").unwrap();
        assert_eq!(fw.device, "iPhone15,2");
        assert_eq!(fw.os_version, "17.5");
        assert_eq!(fw.build_id.as_deref(), Some("21F79"));
        assert_eq!(
            fw.key_for("iPhone15,2").unwrap(),
            CacheKey::new("iPhone15,2", "17.5", "21F79")
        );
    }

    #[test]
    fn multi_device_name_uses_first_identifier() {
        let fw = parse_firmware_name("iPhone15,2,iPhone15,3_17.5.1_21F90_Restore.ipsw").unwrap();
        assert_eq!(fw.device, "iPhone15,2");
        assert_eq!(fw.os_version, "17.5.1");
        assert_eq!(fw.build_id.as_deref(), Some("21F90"));
    }

    #[test]
    fn alternative_conventions() {
        let dashed = parse_firmware_name("iPhone14,5-16.0-20a362.ipsw").unwrap();
        assert_eq!(dashed.device, "iPhone14,5");
        assert_eq!(dashed.build_id.as_deref(), Some("20A362"));

        let no_build = parse_firmware_name("iPhone15,2_17.5_Restore.ipsw").unwrap();
        assert_eq!(no_build.os_version, "17.5");
        assert!(no_build.build_id.is_none());
        assert!(no_build.key_for("iPhone15,2").is_none());

        let simple = parse_firmware_name("iPhone_17.4.ipsw").unwrap();
        assert_eq!(simple.device, "iPhone");
        assert_eq!(simple.os_version, "17.4");
    }

    #[test]
    fn unparseable_names() {
        assert!(parse_firmware_name("notes.txt").is_none());
        assert!(parse_firmware_name("iPhone15,2.ipsw").is_none());
    }

    #[test]
    fn device_matching() {
        assert!(device_matches("iPhone15,2", "iphone15,2"));
        assert!(device_matches("iPhone15,2", "iPhone_15_2"));
        assert!(!device_matches("iPhone15,2", "iPhone15,3"));
        assert!(!device_matches("iPhone15,2", "iPad15,2"));
        assert!(!device_matches("iPad13,1", "iPad14,2"));
    }

    #[test]
    fn expected_names() {
        assert_eq!(
            expected_file_name("iPhone15,2", "17.5", Some("21F79")),
            "iPhone15,2_17.5_21F79_Restore.ipsw"
        );
    }
}
