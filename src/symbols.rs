//! Symbol lists: parsing extractor output and address lookup.
//!
//! Extraction tools disagree on output format, so [`parse_symbol_output`]
//! accepts all of:
//!
//! | Shape | Example |
//! |-------|---------|
//! | JSON object | `{"0xfffffff007004000": "_start"}` |
//! | JSON array | `[{"address": "0xfffffff007004000", "symbol": "_start"}]` |
//! | Text lines | `0xfffffff007004000 _start` |
//!
//! Array entries may spell the name `symbol` or `name`, and addresses may be
//! numbers or hex / decimal strings.

use serde_json::Value;

use crate::error::ExtractError;
use crate::models::ExtractedSymbol;

/// Parse a hex (`0x`-prefixed) or decimal address.
pub fn parse_address(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

fn address_from_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => parse_address(s),
        _ => None,
    }
}

/// Parse an extraction tool's output into symbols.
///
/// Entries with an unparseable address or an empty name are skipped. An
/// output with no usable entries yields [`ExtractError::Empty`].
pub fn parse_symbol_output(output: &str) -> Result<Vec<ExtractedSymbol>, ExtractError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err(ExtractError::Empty);
    }

    let symbols = if trimmed.starts_with('{') || trimmed.starts_with('[') {
        let value: Value = serde_json::from_str(trimmed)
            .map_err(|e| ExtractError::Output(format!("invalid JSON: {}", e)))?;
        parse_json(&value)?
    } else {
        parse_lines(trimmed)
    };

    if symbols.is_empty() {
        return Err(ExtractError::Empty);
    }
    Ok(symbols)
}

fn parse_json(value: &Value) -> Result<Vec<ExtractedSymbol>, ExtractError> {
    let mut symbols = Vec::new();
    match value {
        Value::Object(map) => {
            for (addr, name) in map {
                if let (Some(address), Some(name)) = (parse_address(addr), name.as_str()) {
                    push(&mut symbols, address, name);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                let address = item.get("address").and_then(address_from_value);
                let name = item
                    .get("symbol")
                    .or_else(|| item.get("name"))
                    .and_then(Value::as_str);
                if let (Some(address), Some(name)) = (address, name) {
                    push(&mut symbols, address, name);
                }
            }
        }
        _ => {
            return Err(ExtractError::Output(
                "expected a JSON object or array".to_string(),
            ))
        }
    }
    Ok(symbols)
}

fn parse_lines(text: &str) -> Vec<ExtractedSymbol> {
    let mut symbols = Vec::new();
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        let (Some(addr), Some(name)) = (parts.next(), parts.next()) else {
            continue;
        };
        if let Some(address) = parse_address(addr) {
            push(&mut symbols, address, name);
        }
    }
    symbols
}

fn push(symbols: &mut Vec<ExtractedSymbol>, address: u64, name: &str) {
    let name = name.trim();
    if !name.is_empty() {
        symbols.push(ExtractedSymbol {
            address,
            name: name.to_string(),
        });
    }
}

/// How an address was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<'a> {
    Exact(&'a str),
    /// Nearest preceding symbol plus offset.
    Offset(&'a str, u64),
    Unknown,
}

/// An address-sorted symbol set supporting nearest-preceding lookup.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    entries: Vec<ExtractedSymbol>,
    max_distance: u64,
}

impl SymbolTable {
    /// Build a table; symbols further than `max_distance` past the nearest
    /// preceding entry resolve to [`Resolution::Unknown`].
    pub fn new(mut entries: Vec<ExtractedSymbol>, max_distance: u64) -> Self {
        entries.sort_by_key(|e| e.address);
        entries.dedup_by_key(|e| e.address);
        Self {
            entries,
            max_distance,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resolve(&self, address: u64) -> Resolution<'_> {
        let idx = self.entries.partition_point(|e| e.address <= address);
        if idx == 0 {
            return Resolution::Unknown;
        }
        let entry = &self.entries[idx - 1];
        let offset = address - entry.address;
        if offset == 0 {
            Resolution::Exact(&entry.name)
        } else if offset <= self.max_distance {
            Resolution::Offset(&entry.name, offset)
        } else {
            Resolution::Unknown
        }
    }

    /// Render an address as `name`, `name+0x1c`, or `<unknown>+0x...`.
    pub fn render(&self, address: u64) -> String {
        match self.resolve(address) {
            Resolution::Exact(name) => name.to_string(),
            Resolution::Offset(name, off) => format!("{}+0x{:x}", name, off),
            Resolution::Unknown => format!("<unknown>+0x{:x}", address),
        }
    }
}
