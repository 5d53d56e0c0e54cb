//! Database schema migrations.
//!
//! All statements are idempotent (`IF NOT EXISTS`), so migrations run both
//! from `symcache init` and every time the service starts.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes on an existing pool.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // One row per (device, os_version, build). The UNIQUE constraint is what
    // serializes concurrent record creation across instances.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scan_records (
            id TEXT PRIMARY KEY,
            source_kind TEXT NOT NULL,
            source_path TEXT NOT NULL,
            device_identifier TEXT NOT NULL,
            os_version TEXT NOT NULL,
            build_id TEXT NOT NULL,
            file_size_bytes INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'scanning', 'completed', 'failed')),
            symbols_extracted INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            claim_token TEXT,
            created_at INTEGER NOT NULL,
            scan_started_at INTEGER,
            scan_completed_at INTEGER,
            can_delete_source INTEGER NOT NULL DEFAULT 0,
            source_deleted_at INTEGER,
            last_accessed_at INTEGER,
            access_count INTEGER NOT NULL DEFAULT 0,
            UNIQUE(device_identifier, os_version, build_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Addresses are the i64 bit pattern of the u64 address.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS symbol_entries (
            scan_id TEXT NOT NULL,
            address INTEGER NOT NULL,
            name TEXT NOT NULL,
            UNIQUE(scan_id, address),
            FOREIGN KEY (scan_id) REFERENCES scan_records(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_symbol_entries_name ON symbol_entries(scan_id, name)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_scan_records_status ON scan_records(status)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_scan_records_device_version ON scan_records(device_identifier, os_version)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
