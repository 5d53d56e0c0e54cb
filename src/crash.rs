//! Crash report parsing.
//!
//! Two report shapes are understood:
//!
//! - **`.ips` JSON**: a one-line metadata object followed by a JSON body
//!   (kernel panics, stackshots, modern crash logs). A single JSON object is
//!   accepted too.
//! - **Legacy text**: `Hardware Model:` / `OS Version:` header lines.
//!
//! From either, [`parse_crash_report`] pulls the device, OS version, build
//! and the raw addresses to symbolicate. Kernel frame offsets
//! (`"kernelFrames": [[image, offset], ...]`) are preferred; reports without
//! them fall back to every `0x`-prefixed 8 to 16 digit hex number in the
//! text. Addresses at or below `0x1000` are dropped.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;

use crate::symbols::SymbolTable;

/// Lowest address considered meaningful.
const MIN_ADDRESS: u64 = 0x1000;

static HEX_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b0x[0-9a-fA-F]{8,16}\b").expect("hex address regex should compile")
});

/// `iPhone OS 17.5 (21F79)` and friends.
static VERSION_AND_BUILD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+\.\d+(?:\.\d+)?)\s*\(([0-9A-Za-z]+)\)").expect("version regex should compile")
});

static VERSION_ONLY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+\.\d+(?:\.\d+)?)").expect("version regex should compile"));

static BUILD_SHAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d+[A-Za-z]\d+[A-Za-z]?$").expect("build regex should compile")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrashFormat {
    IpsJson,
    Text,
}

/// Values supplied by the caller that take precedence over parsed ones.
#[derive(Debug, Clone, Default)]
pub struct CrashHints {
    pub device: Option<String>,
    pub os_version: Option<String>,
    pub build_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CrashReport {
    pub format: CrashFormat,
    pub device: Option<String>,
    pub os_version: Option<String>,
    pub build_id: Option<String>,
    /// Sorted, deduplicated.
    pub addresses: Vec<u64>,
    pub text: String,
}

impl CrashReport {
    pub fn apply_hints(&mut self, hints: &CrashHints) {
        let pick = |hint: &Option<String>, parsed: &mut Option<String>| {
            if let Some(h) = hint.as_deref().map(str::trim).filter(|h| !h.is_empty()) {
                *parsed = Some(h.to_string());
            }
        };
        pick(&hints.device, &mut self.device);
        pick(&hints.os_version, &mut self.os_version);
        pick(&hints.build_id, &mut self.build_id);
    }
}

pub fn parse_crash_report(bytes: &[u8]) -> CrashReport {
    let text = String::from_utf8_lossy(bytes).into_owned();
    match parse_ips(&text) {
        Some(report) => report,
        None => parse_text(text),
    }
}

fn parse_ips(text: &str) -> Option<CrashReport> {
    let trimmed = text.trim_start();
    if !trimmed.starts_with('{') {
        return None;
    }

    let (meta, body) = match serde_json::from_str::<Value>(trimmed) {
        Ok(single) => (Value::Null, single),
        Err(_) => {
            let (first, rest) = trimmed.split_once('\n')?;
            let meta = serde_json::from_str::<Value>(first).unwrap_or(Value::Null);
            let body = serde_json::from_str::<Value>(rest.trim()).ok()?;
            (meta, body)
        }
    };

    let str_field = |v: &Value, key: &str| v.get(key).and_then(Value::as_str).map(str::to_string);

    let device = str_field(&body, "product")
        .or_else(|| str_field(&body, "modelCode"))
        .or_else(|| str_field(&meta, "device"))
        .or_else(|| str_field(&meta, "modelCode"))
        .or_else(|| str_field(&meta, "product"));

    // Newer crash logs nest the OS as {"train": "iPhone OS 17.5", "build": "21F79"}.
    let nested_os = body.get("osVersion");
    let os_strings = [
        str_field(&body, "os_version"),
        str_field(&meta, "os_version"),
        str_field(&body, "build"),
        nested_os.and_then(|o| str_field(o, "train")),
    ];

    let mut os_version = None;
    let mut build_id = nested_os.and_then(|o| str_field(o, "build"));
    for s in os_strings.iter().flatten() {
        let (version, build) = split_os_string(s);
        if os_version.is_none() {
            os_version = version;
        }
        if build_id.is_none() {
            build_id = build;
        }
    }
    if build_id.is_none() {
        build_id = str_field(&body, "build").filter(|b| BUILD_SHAPE.is_match(b));
    }

    let mut offsets = BTreeSet::new();
    collect_kernel_frames(&body, &mut offsets);
    let addresses = if offsets.is_empty() {
        hex_addresses(text)
    } else {
        offsets.into_iter().collect()
    };

    Some(CrashReport {
        format: CrashFormat::IpsJson,
        device,
        os_version,
        build_id,
        addresses,
        text: text.to_string(),
    })
}

fn parse_text(text: String) -> CrashReport {
    let mut device = None;
    let mut os_version = None;
    let mut build_id = None;
    let mut fallback_build = None;

    for line in text.lines() {
        let line = line.trim();
        if let Some(v) = line.strip_prefix("Hardware Model:") {
            device.get_or_insert_with(|| v.trim().to_string());
        } else if let Some(v) = line.strip_prefix("OS Version:") {
            let (version, build) = split_os_string(v);
            if os_version.is_none() {
                os_version = version;
            }
            if build_id.is_none() {
                build_id = build;
            }
        } else if let Some(v) = line.strip_prefix("BuildID:") {
            let v = v.trim();
            if BUILD_SHAPE.is_match(v) {
                fallback_build.get_or_insert_with(|| v.to_string());
            }
        }
    }

    let addresses = hex_addresses(&text);
    CrashReport {
        format: CrashFormat::Text,
        device,
        os_version,
        build_id: build_id.or(fallback_build),
        addresses,
        text,
    }
}

/// `"iPhone OS 17.5 (21F79)"` → `(Some("17.5"), Some("21F79"))`.
fn split_os_string(s: &str) -> (Option<String>, Option<String>) {
    if let Some(caps) = VERSION_AND_BUILD.captures(s) {
        return (Some(caps[1].to_string()), Some(caps[2].to_string()));
    }
    let version = VERSION_ONLY.captures(s).map(|c| c[1].to_string());
    (version, None)
}

fn collect_kernel_frames(value: &Value, out: &mut BTreeSet<u64>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                if k == "kernelFrames" {
                    if let Some(frames) = v.as_array() {
                        for frame in frames {
                            let offset = frame
                                .as_array()
                                .filter(|pair| pair.len() >= 2)
                                .and_then(|pair| pair[1].as_u64());
                            if let Some(addr) = offset.filter(|a| *a > MIN_ADDRESS) {
                                out.insert(addr);
                            }
                        }
                    }
                } else {
                    collect_kernel_frames(v, out);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_kernel_frames(item, out);
            }
        }
        _ => {}
    }
}

fn hex_addresses(text: &str) -> Vec<u64> {
    HEX_ADDRESS
        .find_iter(text)
        .filter_map(|m| u64::from_str_radix(&m.as_str()[2..], 16).ok())
        .filter(|a| *a > MIN_ADDRESS)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Append ` (symbol)` after every hex address in `text` that is above the
/// minimum address.
pub fn annotate_text(text: &str, table: &SymbolTable) -> String {
    HEX_ADDRESS
        .replace_all(text, |caps: &Captures| {
            let raw = &caps[0];
            match u64::from_str_radix(&raw[2..], 16) {
                Ok(addr) if addr > MIN_ADDRESS => format!("{} ({})", raw, table.render(addr)),
                _ => raw.to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExtractedSymbol;

    const IPS: &str = r#"{"bug_type":"210","os_version":"iPhone OS 17.5 (21F79)","timestamp":"2024-05-01"}
{
  "product": "iPhone15,2",
  "build": "iPhone OS 17.5 (21F79)",
  "processByPid": {
    "0": {"threadById": {"101": {"kernelFrames": [[0, 628560], [0, 622884], [0, 12]]}}}
  }
}"#;

    const TEXT: &str = "Incident Identifier: 1234\n\
Hardware Model:      iPhone 15 Pro\n\
OS Version:          iPhone OS 17.5 (21F79)\n\
\n\
Thread 0 Crashed:\n\
0   kernel   0xfffffff007123456 0x0 + 10\n\
1   kernel   0xfffffff007123456\n\
2   kernel   0x0000000000000800\n";

    #[test]
    fn parses_ips_report() {
        let report = parse_crash_report(IPS.as_bytes());
        assert_eq!(report.format, CrashFormat::IpsJson);
        assert_eq!(report.device.as_deref(), Some("iPhone15,2"));
        assert_eq!(report.os_version.as_deref(), Some("17.5"));
        assert_eq!(report.build_id.as_deref(), Some("21F79"));
        assert_eq!(report.addresses, vec![622884, 628560]);
    }

    #[test]
    fn parses_text_report() {
        let report = parse_crash_report(TEXT.as_bytes());
        assert_eq!(report.format, CrashFormat::Text);
        assert_eq!(report.device.as_deref(), Some("iPhone 15 Pro"));
        assert_eq!(report.os_version.as_deref(), Some("17.5"));
        assert_eq!(report.build_id.as_deref(), Some("21F79"));
        assert_eq!(report.addresses, vec![0xfffffff007123456]);
    }

    #[test]
    fn text_build_falls_back_to_build_id_line() {
        let report = parse_crash_report(b"Hardware Model: iPhone15,2\nOS Version: 17.5\nBuildID: 21F79\n");
        assert_eq!(report.os_version.as_deref(), Some("17.5"));
        assert_eq!(report.build_id.as_deref(), Some("21F79"));
    }

    #[test]
    fn hints_override_parsed_values() {
        let mut report = parse_crash_report(TEXT.as_bytes());
        report.apply_hints(&CrashHints {
            device: Some("iPhone15,2".into()),
            os_version: None,
            build_id: Some("  ".into()),
        });
        assert_eq!(report.device.as_deref(), Some("iPhone15,2"));
        assert_eq!(report.build_id.as_deref(), Some("21F79"));
    }

    #[test]
    fn annotates_addresses_in_text() {
        let table = SymbolTable::new(
            vec![ExtractedSymbol { address: 0xfffffff007123400, name: "_panic".into() }],
            0x10000,
        );
        let out = annotate_text("at 0xfffffff007123456 and 0x0000000000000800", &table);
        assert_eq!(
            out,
            "at 0xfffffff007123456 (_panic+0x56) and 0x0000000000000800"
        );
    }
}
