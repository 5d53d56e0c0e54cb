//! Cache statistics.
//!
//! A quick summary of what the cache holds: records per status, symbol
//! totals, reclaimed firmware, and the most used builds. Used by
//! `symcache stats` and `GET /v1/stats`. [`collect_disk_usage`] adds the
//! space held by firmware and scratch files (`GET /v1/disk-usage`).

use serde::Serialize;
use sqlx::Row;
use std::path::Path;
use walkdir::WalkDir;

use crate::error::{StoreError, SymcacheError};
use crate::object_store::ObjectStore;
use crate::store::SymbolStore;

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub records: i64,
    pub pending: i64,
    pub scanning: i64,
    pub completed: i64,
    pub failed: i64,
    pub symbols: i64,
    pub sources_reclaimed: i64,
    pub bytes_reclaimed: i64,
    pub total_hits: i64,
    pub db_size_bytes: u64,
    pub most_accessed: Vec<AccessStat>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccessStat {
    pub device_identifier: String,
    pub os_version: String,
    pub build_id: String,
    pub access_count: i64,
    pub last_accessed_at: Option<i64>,
}

pub async fn collect_stats(store: &SymbolStore, db_path: &Path) -> Result<CacheStats, StoreError> {
    let pool = store.pool();
    let mut stats = CacheStats::default();

    let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM scan_records GROUP BY status")
        .fetch_all(pool)
        .await?;
    for row in &rows {
        let status: String = row.try_get("status")?;
        let n: i64 = row.try_get("n")?;
        stats.records += n;
        match status.as_str() {
            "pending" => stats.pending = n,
            "scanning" => stats.scanning = n,
            "completed" => stats.completed = n,
            "failed" => stats.failed = n,
            _ => {}
        }
    }

    let row = sqlx::query(
        r#"
        SELECT
            COALESCE(SUM(CASE WHEN status = 'completed' THEN symbols_extracted ELSE 0 END), 0) AS symbols,
            COALESCE(SUM(CASE WHEN source_deleted_at IS NOT NULL THEN 1 ELSE 0 END), 0) AS reclaimed,
            COALESCE(SUM(CASE WHEN source_deleted_at IS NOT NULL THEN file_size_bytes ELSE 0 END), 0) AS reclaimed_bytes,
            COALESCE(SUM(access_count), 0) AS hits
        FROM scan_records
        "#,
    )
    .fetch_one(pool)
    .await?;
    stats.symbols = row.try_get("symbols")?;
    stats.sources_reclaimed = row.try_get("reclaimed")?;
    stats.bytes_reclaimed = row.try_get("reclaimed_bytes")?;
    stats.total_hits = row.try_get("hits")?;

    let top = sqlx::query(
        r#"
        SELECT device_identifier, os_version, build_id, access_count, last_accessed_at
        FROM scan_records
        WHERE access_count > 0
        ORDER BY access_count DESC, last_accessed_at DESC
        LIMIT 5
        "#,
    )
    .fetch_all(pool)
    .await?;
    for row in &top {
        stats.most_accessed.push(AccessStat {
            device_identifier: row.try_get("device_identifier")?,
            os_version: row.try_get("os_version")?,
            build_id: row.try_get("build_id")?,
            access_count: row.try_get("access_count")?,
            last_accessed_at: row.try_get("last_accessed_at")?,
        });
    }

    stats.db_size_bytes = std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);
    Ok(stats)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiskUsage {
    pub db_size_bytes: u64,
    /// Firmware objects currently in the store.
    pub firmware_objects: usize,
    pub firmware_bytes: i64,
    /// Downloads and tool output not yet cleaned up.
    pub scratch_files: u64,
    pub scratch_bytes: u64,
}

pub async fn collect_disk_usage(
    objects: &dyn ObjectStore,
    scratch_root: &Path,
    db_path: &Path,
) -> Result<DiskUsage, SymcacheError> {
    let listing = objects.list().await.map_err(SymcacheError::object_store)?;

    let root = scratch_root.to_path_buf();
    let (scratch_files, scratch_bytes) = tokio::task::spawn_blocking(move || dir_size(&root))
        .await
        .unwrap_or_default();

    Ok(DiskUsage {
        db_size_bytes: std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0),
        firmware_objects: listing.len(),
        firmware_bytes: listing.iter().map(|o| o.size).sum(),
        scratch_files,
        scratch_bytes,
    })
}

/// File count and total size below `root`; a missing directory is empty.
fn dir_size(root: &Path) -> (u64, u64) {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .fold((0, 0), |(files, bytes), m| (files + 1, bytes + m.len()))
}

pub fn print_disk_usage(usage: &DiskUsage) {
    println!("Disk Usage");
    println!("==========");
    println!();
    println!("  Database:    {}", format_bytes(usage.db_size_bytes));
    println!(
        "  Firmware:    {} object(s), {}",
        usage.firmware_objects,
        format_bytes(usage.firmware_bytes.max(0) as u64)
    );
    println!(
        "  Scratch:     {} file(s), {}",
        usage.scratch_files,
        format_bytes(usage.scratch_bytes)
    );
    println!();
}

pub fn print_stats(stats: &CacheStats, db_path: &Path) {
    println!("Symbol Cache Stats");
    println!("==================");
    println!();
    println!("  Database:    {}", db_path.display());
    println!("  Size:        {}", format_bytes(stats.db_size_bytes));
    println!();
    println!("  Records:     {}", stats.records);
    println!(
        "    completed {} / scanning {} / pending {} / failed {}",
        stats.completed, stats.scanning, stats.pending, stats.failed
    );
    println!("  Symbols:     {}", stats.symbols);
    println!("  Cache hits:  {}", stats.total_hits);
    println!(
        "  Reclaimed:   {} firmware ({})",
        stats.sources_reclaimed,
        format_bytes(stats.bytes_reclaimed.max(0) as u64)
    );

    if !stats.most_accessed.is_empty() {
        println!();
        println!("  Most used:");
        println!(
            "  {:<16} {:<10} {:<10} {:>6}   {}",
            "DEVICE", "OS", "BUILD", "HITS", "LAST HIT"
        );
        println!("  {}", "-".repeat(64));
        for a in &stats.most_accessed {
            let last = match a.last_accessed_at {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            println!(
                "  {:<16} {:<10} {:<10} {:>6}   {}",
                a.device_identifier, a.os_version, a.build_id, a.access_count, last
            );
        }
    }
    println!();
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp relative to now ("3 hours ago").
pub fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    let plural = |n: i64| if n == 1 { "" } else { "s" };
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        format!("{} min{} ago", delta / 60, plural(delta / 60))
    } else if delta < 86400 {
        format!("{} hour{} ago", delta / 3600, plural(delta / 3600))
    } else if delta < 86400 * 30 {
        format!("{} day{} ago", delta / 86400, plural(delta / 86400))
    } else {
        format_ts_iso(ts)
    }
}

pub fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
