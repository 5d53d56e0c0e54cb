//! SQLite-backed symbol store.
//!
//! The store is the single source of truth for scan state across every
//! component and every service instance. All state transitions are
//! conditional `UPDATE`s whose `WHERE` clause encodes the allowed source
//! states, so concurrent claimants are serialized by SQLite itself rather
//! than by any in-process lock.
//!
//! | Method | Transition |
//! |--------|------------|
//! | [`ensure_record`](SymbolStore::ensure_record) | ∅ → pending |
//! | [`claim`](SymbolStore::claim) | pending/failed/stale scanning → scanning |
//! | [`complete`](SymbolStore::complete) | scanning → completed (+ symbols, one transaction) |
//! | [`fail`](SymbolStore::fail) | scanning → failed |
//!
//! Symbol entries are only ever inserted in the same transaction that flips
//! the record to `completed`, and readers only read entries of completed
//! records, so a reader sees either no symbols or the full set.

use std::collections::BTreeMap;

use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::{QueryBuilder, Row, SqlitePool};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{CacheKey, ExtractedSymbol, ScanRecord, ScanStatus, SourceRef};

/// Rows per multi-row `INSERT` when bulk-writing symbols.
const INSERT_BATCH: usize = 500;

const RECORD_COLUMNS: &str = "id, source_kind, source_path, device_identifier, os_version, build_id, \
     file_size_bytes, status, symbols_extracted, error_message, attempts, created_at, \
     scan_started_at, scan_completed_at, can_delete_source, source_deleted_at, \
     last_accessed_at, access_count";

/// Conditions under which a non-pending record may be claimed.
#[derive(Debug, Clone, Copy)]
pub struct ClaimPolicy {
    pub now: i64,
    /// `scanning` claims started at or before this instant are stale.
    pub stale_before: i64,
    /// `failed` records finished at or before this instant may be retried.
    pub retry_before: i64,
    pub max_attempts: u32,
    /// Ignore backoff and the attempt cap for `failed` records.
    pub force: bool,
}

/// A successful claim. The token fences `complete`/`fail` so that a claimant
/// whose stale claim was taken over cannot overwrite the new owner's result.
#[derive(Debug, Clone)]
pub struct Claim {
    pub record: ScanRecord,
    token: String,
}

impl Claim {
    pub fn token(&self) -> &str {
        &self.token
    }
}

#[derive(Clone)]
pub struct SymbolStore {
    pool: SqlitePool,
}

impl SymbolStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn get(&self, key: &CacheKey) -> Result<Option<ScanRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM scan_records WHERE device_identifier = ? AND os_version = ? AND build_id = ?",
            RECORD_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(&key.device_identifier)
            .bind(&key.os_version)
            .bind(&key.build_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<ScanRecord>, StoreError> {
        let sql = format!("SELECT {} FROM scan_records WHERE id = ?", RECORD_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn list(&self) -> Result<Vec<ScanRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM scan_records ORDER BY device_identifier, os_version, build_id",
            RECORD_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Most recently completed record for a device and OS version, any build.
    ///
    /// Used when a crash report does not carry a build identifier.
    pub async fn latest_completed(
        &self,
        device_identifier: &str,
        os_version: &str,
    ) -> Result<Option<ScanRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM scan_records WHERE device_identifier = ? AND os_version = ? \
             AND status = 'completed' ORDER BY scan_completed_at DESC LIMIT 1",
            RECORD_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(device_identifier)
            .bind(os_version)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Return the record for `key`, creating a `pending` one if none exists.
    ///
    /// Concurrent callers race on the UNIQUE constraint; every caller gets
    /// the same row back.
    pub async fn ensure_record(
        &self,
        key: &CacheKey,
        source: &SourceRef,
        file_size_bytes: i64,
        now: i64,
    ) -> Result<ScanRecord, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO scan_records (id, source_kind, source_path, device_identifier, os_version,
                                      build_id, file_size_bytes, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?)
            ON CONFLICT(device_identifier, os_version, build_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(source.kind())
        .bind(source.location())
        .bind(&key.device_identifier)
        .bind(&key.os_version)
        .bind(&key.build_id)
        .bind(file_size_bytes)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get(key)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("scan record for {} vanished", key)))
    }

    /// Atomically move a record to `scanning`.
    ///
    /// Returns `None` when the record is not claimable (already scanning,
    /// completed, or a failed record still inside its backoff window), which
    /// includes losing the race to another claimant.
    pub async fn claim(
        &self,
        id: &str,
        source: &SourceRef,
        file_size_bytes: i64,
        policy: ClaimPolicy,
    ) -> Result<Option<Claim>, StoreError> {
        let token = Uuid::new_v4().to_string();
        let result = sqlx::query(
            r#"
            UPDATE scan_records SET
                status = 'scanning',
                claim_token = ?,
                scan_started_at = ?,
                scan_completed_at = NULL,
                error_message = NULL,
                attempts = attempts + 1,
                source_kind = ?,
                source_path = ?,
                file_size_bytes = ?
            WHERE id = ? AND (
                status = 'pending'
                OR (status = 'failed' AND (? OR (attempts < ? AND COALESCE(scan_completed_at, 0) <= ?)))
                OR (status = 'scanning' AND COALESCE(scan_started_at, 0) <= ?)
            )
            "#,
        )
        .bind(&token)
        .bind(policy.now)
        .bind(source.kind())
        .bind(source.location())
        .bind(file_size_bytes)
        .bind(id)
        .bind(policy.force)
        .bind(i64::from(policy.max_attempts))
        .bind(policy.retry_before)
        .bind(policy.stale_before)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        let record = self
            .get_by_id(id)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("claimed scan record {} vanished", id)))?;
        Ok(Some(Claim { record, token }))
    }

    /// Persist the extracted symbols and mark the scan `completed` in one
    /// transaction. Duplicate addresses keep the first name seen.
    pub async fn complete(
        &self,
        claim: &Claim,
        symbols: &[ExtractedSymbol],
        now: i64,
    ) -> Result<ScanRecord, StoreError> {
        let mut unique: BTreeMap<u64, &str> = BTreeMap::new();
        for sym in symbols {
            unique.entry(sym.address).or_insert(sym.name.as_str());
        }
        let scan_id = claim.record.id.as_str();

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE scan_records SET
                status = 'completed',
                symbols_extracted = ?,
                scan_completed_at = ?,
                can_delete_source = 1,
                error_message = NULL,
                claim_token = NULL
            WHERE id = ? AND status = 'scanning' AND claim_token = ?
            "#,
        )
        .bind(unique.len() as i64)
        .bind(now)
        .bind(scan_id)
        .bind(&claim.token)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(self.rejected(scan_id, ScanStatus::Completed).await);
        }

        sqlx::query("DELETE FROM symbol_entries WHERE scan_id = ?")
            .bind(scan_id)
            .execute(&mut *tx)
            .await?;

        let entries: Vec<(u64, &str)> = unique.into_iter().collect();
        for batch in entries.chunks(INSERT_BATCH) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO symbol_entries (scan_id, address, name) ");
            qb.push_values(batch, |mut b, (address, name)| {
                b.push_bind(scan_id.to_string())
                    .push_bind(*address as i64)
                    .push_bind(name.to_string());
            });
            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;

        self.get_by_id(scan_id)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("completed scan record {} vanished", scan_id)))
    }

    /// Mark a claimed scan `failed`. No symbols are written.
    pub async fn fail(
        &self,
        claim: &Claim,
        message: &str,
        now: i64,
    ) -> Result<ScanRecord, StoreError> {
        let scan_id = claim.record.id.as_str();
        let result = sqlx::query(
            r#"
            UPDATE scan_records SET
                status = 'failed',
                error_message = ?,
                scan_completed_at = ?,
                claim_token = NULL
            WHERE id = ? AND status = 'scanning' AND claim_token = ?
            "#,
        )
        .bind(message)
        .bind(now)
        .bind(scan_id)
        .bind(&claim.token)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.rejected(scan_id, ScanStatus::Failed).await);
        }

        self.get_by_id(scan_id)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("failed scan record {} vanished", scan_id)))
    }

    /// Build the error for a transition whose conditional update matched no row.
    async fn rejected(&self, id: &str, to: ScanStatus) -> StoreError {
        match self.get_by_id(id).await {
            Ok(Some(current)) => StoreError::IllegalTransition {
                from: current.status,
                to,
            },
            Ok(None) => StoreError::Corrupt(format!("scan record {} not found", id)),
            Err(e) => e,
        }
    }

    /// All symbols of a completed scan, sorted by address.
    ///
    /// Returns an empty list for any record that is not `completed`.
    pub async fn load_symbols(&self, scan_id: &str) -> Result<Vec<ExtractedSymbol>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT e.address, e.name
            FROM symbol_entries e
            JOIN scan_records r ON r.id = e.scan_id
            WHERE e.scan_id = ? AND r.status = 'completed'
            "#,
        )
        .bind(scan_id)
        .fetch_all(&self.pool)
        .await?;

        let mut symbols = rows
            .iter()
            .map(|row| {
                Ok(ExtractedSymbol {
                    address: row.try_get::<i64, _>("address")? as u64,
                    name: row.try_get("name")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        symbols.sort_by_key(|s| s.address);
        Ok(symbols)
    }

    pub async fn symbol_count(&self, scan_id: &str) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM symbol_entries e
            JOIN scan_records r ON r.id = e.scan_id
            WHERE e.scan_id = ? AND r.status = 'completed'
            "#,
        )
        .bind(scan_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Address of a named symbol in a completed scan.
    pub async fn find_symbol(&self, scan_id: &str, name: &str) -> Result<Option<u64>, StoreError> {
        let address: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT e.address FROM symbol_entries e
            JOIN scan_records r ON r.id = e.scan_id
            WHERE e.scan_id = ? AND e.name = ? AND r.status = 'completed'
            ORDER BY e.address LIMIT 1
            "#,
        )
        .bind(scan_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(address.map(|a| a as u64))
    }

    /// Record a cache hit.
    pub async fn touch(&self, id: &str, now: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE scan_records SET last_accessed_at = ?, access_count = access_count + 1 \
             WHERE id = ? AND status = 'completed'",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Completed records whose source may be deleted and whose scan finished
    /// at or before `completed_before`.
    pub async fn reclaimable(&self, completed_before: i64) -> Result<Vec<ScanRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM scan_records WHERE status = 'completed' AND can_delete_source = 1 \
             AND source_deleted_at IS NULL AND scan_completed_at <= ? ORDER BY scan_completed_at",
            RECORD_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(completed_before)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn mark_source_deleted(&self, id: &str, now: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE scan_records SET source_deleted_at = ? \
             WHERE id = ? AND status = 'completed' AND can_delete_source = 1 AND source_deleted_at IS NULL",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

fn record_from_row(row: &SqliteRow) -> Result<ScanRecord, StoreError> {
    let kind: String = row.try_get("source_kind")?;
    let location: String = row.try_get("source_path")?;
    let source = SourceRef::from_parts(&kind, &location)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown source kind '{}'", kind)))?;
    let status: String = row.try_get("status")?;
    let status = status.parse::<ScanStatus>().map_err(StoreError::Corrupt)?;

    Ok(ScanRecord {
        id: row.try_get("id")?,
        source,
        device_identifier: row.try_get("device_identifier")?,
        os_version: row.try_get("os_version")?,
        build_id: row.try_get("build_id")?,
        file_size_bytes: row.try_get("file_size_bytes")?,
        status,
        symbols_extracted: row.try_get("symbols_extracted")?,
        error_message: row.try_get("error_message")?,
        attempts: row.try_get("attempts")?,
        created_at: row.try_get("created_at")?,
        scan_started_at: row.try_get("scan_started_at")?,
        scan_completed_at: row.try_get("scan_completed_at")?,
        can_delete_source: row.try_get("can_delete_source")?,
        source_deleted_at: row.try_get("source_deleted_at")?,
        last_accessed_at: row.try_get("last_accessed_at")?,
        access_count: row.try_get("access_count")?,
    })
}
