//! Device identity resolution.
//!
//! Crash reports and uploads name devices inconsistently: `iPhone15,2`,
//! `iPhone 15 Pro`, `iphone15,2`. Every cache key must carry the canonical
//! identifier, so names pass through a [`DeviceResolver`] before a
//! [`CacheKey`](crate::models::CacheKey) is built.
//!
//! [`DeviceMap`] is backed by an optional AppleDB `device-list.json` plus
//! the `[devices.aliases]` config table. Two list shapes are accepted:
//!
//! ```json
//! {"iPhone15,2": {"name": "iPhone 14 Pro"}}
//! [{"name": "iPhone 14 Pro", "identifier": ["iPhone15,2"]}]
//! ```

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

use crate::config::DevicesConfig;

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z]+\d+,\d+$").expect("device identifier regex should compile")
});

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown device '{0}'")]
pub struct DeviceNotFound(pub String);

/// Maps a marketing name or identifier to a canonical device identifier.
pub trait DeviceResolver: Send + Sync {
    fn resolve(&self, name_or_identifier: &str) -> Result<String, DeviceNotFound>;

    /// Marketing name for an identifier, when known.
    fn marketing_name(&self, identifier: &str) -> Option<String>;
}

pub fn is_identifier(s: &str) -> bool {
    IDENTIFIER.is_match(s.trim())
}

/// Lowercase and drop whitespace so `"iPhone 15  Pro"` equals `"iphone15pro"`.
fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

#[derive(Debug, Default, Clone)]
pub struct DeviceMap {
    /// normalized marketing name → identifier
    by_name: HashMap<String, String>,
    /// lowercased identifier → (canonical identifier, marketing name)
    by_identifier: HashMap<String, (String, Option<String>)>,
}

impl DeviceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &DevicesConfig) -> Result<Self> {
        let mut map = Self::new();
        if let Some(path) = &config.device_list {
            map.load_device_list(path)?;
        }
        for (name, identifier) in &config.aliases {
            map.insert(name, identifier);
        }
        Ok(map)
    }

    pub fn load_device_list(&mut self, path: &Path) -> Result<()> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read device list: {}", path.display()))?;
        let value: Value = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse device list: {}", path.display()))?;
        let added = self.load_json(&value);
        tracing::debug!(path = %path.display(), devices = added, "loaded device list");
        Ok(())
    }

    /// Merge an AppleDB-style device list; returns the number of identifiers added.
    pub fn load_json(&mut self, value: &Value) -> usize {
        let mut added = 0;
        match value {
            Value::Object(map) => {
                for (identifier, info) in map {
                    let name = info
                        .get("name")
                        .and_then(Value::as_str)
                        .or_else(|| info.as_str());
                    if let Some(name) = name {
                        self.insert(name, identifier);
                        added += 1;
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    let Some(name) = item.get("name").and_then(Value::as_str) else {
                        continue;
                    };
                    let identifiers: Vec<&str> = match item.get("identifier") {
                        Some(Value::String(s)) => vec![s.as_str()],
                        Some(Value::Array(ids)) => ids.iter().filter_map(Value::as_str).collect(),
                        _ => Vec::new(),
                    };
                    for identifier in identifiers {
                        self.insert(name, identifier);
                        added += 1;
                    }
                }
            }
            _ => {}
        }
        added
    }

    /// Register `name` as a marketing name for `identifier`. The first name
    /// registered for an identifier is the one reported back.
    pub fn insert(&mut self, name: &str, identifier: &str) {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return;
        }
        self.by_name
            .insert(normalize_name(name), identifier.to_string());
        let entry = self
            .by_identifier
            .entry(identifier.to_ascii_lowercase())
            .or_insert_with(|| (identifier.to_string(), None));
        if entry.1.is_none() && !is_identifier(name) {
            entry.1 = Some(name.trim().to_string());
        }
    }

    pub fn len(&self) -> usize {
        self.by_identifier.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_identifier.is_empty()
    }
}

impl DeviceResolver for DeviceMap {
    fn resolve(&self, name_or_identifier: &str) -> Result<String, DeviceNotFound> {
        let input = name_or_identifier.trim();
        if input.is_empty() {
            return Err(DeviceNotFound(input.to_string()));
        }
        if is_identifier(input) {
            // Fix the case of a known identifier; pass unknown ones through.
            return Ok(self
                .by_identifier
                .get(&input.to_ascii_lowercase())
                .map(|(canonical, _)| canonical.clone())
                .unwrap_or_else(|| input.to_string()));
        }
        self.by_name
            .get(&normalize_name(input))
            .cloned()
            .ok_or_else(|| DeviceNotFound(input.to_string()))
    }

    fn marketing_name(&self, identifier: &str) -> Option<String> {
        self.by_identifier
            .get(&identifier.trim().to_ascii_lowercase())
            .and_then(|(_, name)| name.clone())
    }
}
