//! Storage reclaimer.
//!
//! Deletes firmware images, and any scratch files left behind, once their
//! symbols are durably cached. A source is only eligible when its record is
//! `completed` with `can_delete_source` set and the scan finished more than
//! `retention_secs` ago. Records and symbols are never touched.
//!
//! Deletion is best effort per record: a failure is logged and counted, the
//! record stays unmarked, and the next sweep tries again.

use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::config::ReclaimerConfig;
use crate::error::StoreError;
use crate::models::{ScanRecord, ScanStatus, SourceRef};
use crate::object_store::ObjectStore;
use crate::store::SymbolStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub candidates: usize,
    pub deleted: usize,
    pub failed: usize,
    /// Local firmware files left in place (`delete_file_sources = false`).
    pub kept_files: usize,
    pub bytes_reclaimed: i64,
}

pub struct StorageReclaimer {
    store: SymbolStore,
    objects: Arc<dyn ObjectStore>,
    scratch_root: PathBuf,
    config: ReclaimerConfig,
}

impl StorageReclaimer {
    pub fn new(
        store: SymbolStore,
        objects: Arc<dyn ObjectStore>,
        scratch_root: PathBuf,
        config: ReclaimerConfig,
    ) -> Self {
        Self {
            store,
            objects,
            scratch_root,
            config,
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        let now = Utc::now().timestamp();
        let cutoff = now - self.config.retention_secs as i64;
        let candidates = self.store.reclaimable(cutoff).await?;

        let mut report = SweepReport {
            candidates: candidates.len(),
            ..Default::default()
        };

        for record in candidates {
            if record.status != ScanStatus::Completed || !record.can_delete_source {
                continue;
            }
            self.remove_scratch(&record).await;

            match self.delete_source(&record).await {
                Ok(true) => match self.store.mark_source_deleted(&record.id, now).await {
                    Ok(true) => {
                        report.deleted += 1;
                        report.bytes_reclaimed += record.file_size_bytes;
                        tracing::info!(key = %record.key(), source = %record.source, "reclaimed firmware");
                    }
                    Ok(false) => {}
                    Err(e) => {
                        // The source is gone; a later sweep marks the record.
                        report.failed += 1;
                        tracing::warn!(key = %record.key(), error = %e, "failed to mark firmware reclaimed");
                    }
                },
                Ok(false) => report.kept_files += 1,
                Err(e) => {
                    report.failed += 1;
                    let message = format!("{:#}", e);
                    tracing::warn!(key = %record.key(), source = %record.source, error = %message, "failed to delete firmware");
                }
            }
        }

        Ok(report)
    }

    /// Returns `false` when the source is deliberately kept.
    async fn delete_source(&self, record: &ScanRecord) -> anyhow::Result<bool> {
        match &record.source {
            SourceRef::Object(key) => {
                self.objects.delete(key).await?;
                Ok(true)
            }
            SourceRef::File(path) => {
                if !self.config.delete_file_sources {
                    return Ok(false);
                }
                match tokio::fs::remove_file(path).await {
                    Ok(()) => Ok(true),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    async fn remove_scratch(&self, record: &ScanRecord) {
        let dir = self.scratch_root.join(record.key().slug());
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => tracing::debug!(dir = %dir.display(), "removed scratch dir"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "failed to remove scratch dir"),
        }
    }

    /// Sweep on the configured interval, and whenever `wake` is notified.
    pub async fn run(self, wake: Arc<Notify>) {
        tracing::info!(
            interval_secs = self.config.interval_secs,
            retention_secs = self.config.retention_secs,
            "reclaimer started"
        );
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wake.notified() => {}
            }
            match self.sweep().await {
                Ok(report) if report.deleted > 0 || report.failed > 0 => {
                    tracing::info!(deleted = report.deleted, failed = report.failed, bytes = report.bytes_reclaimed, "reclaimer sweep");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "reclaimer sweep failed"),
            }
        }
    }
}
