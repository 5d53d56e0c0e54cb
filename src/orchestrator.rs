//! Scan orchestration.
//!
//! [`ScanOrchestrator::request_scan`] is the single entry point for "extract
//! the symbols of this firmware". It guarantees at most one extraction in
//! flight per [`CacheKey`] across every task and every service instance
//! sharing the database, by funnelling all claims through the store's
//! conditional update ([`SymbolStore::claim`]).
//!
//! # Flow
//!
//! ```text
//! request_scan ──▶ completed? ──yes──▶ AlreadyCompleted
//!       │
//!       ▼
//! ensure_record (pending) ──▶ claim ──lost──▶ AlreadyRunning / RetryDeferred
//!       │
//!       ▼ won
//! spawn: fetch ▶ extract ▶ complete | fail ▶ notify reclaimer
//! ```
//!
//! Fetch plus extraction is bounded by `run_timeout_secs`, which config
//! validation keeps below `stale_scan_secs`. A live claim is therefore
//! always failed or completed before another caller may treat it as stale.
//!
//! Extraction runs on a spawned task; callers that need the result use
//! [`ScanOrchestrator::wait_for`], which polls the store and gives up after a
//! bounded timeout.

use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::OrchestratorConfig;
use crate::error::{Result, SymcacheError};
use crate::extractor::Extractor;
use crate::models::{CacheKey, ScanRecord, ScanStatus, SourceRef};
use crate::object_store::{FetchedObject, ObjectStore};
use crate::store::{Claim, ClaimPolicy, SymbolStore};

#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub source: SourceRef,
    pub key: CacheKey,
    pub file_size_bytes: i64,
    /// Retry a failed scan even inside its backoff window or past the
    /// attempt cap.
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanOutcome {
    /// Symbols already cached; nothing was started.
    AlreadyCompleted,
    /// Another caller holds the claim.
    AlreadyRunning,
    /// This call won the claim and extraction is running.
    Started,
    /// The last attempt failed and the record is not yet eligible for retry.
    RetryDeferred,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanHandle {
    pub outcome: ScanOutcome,
    pub record: ScanRecord,
}

#[derive(Clone)]
pub struct ScanOrchestrator {
    store: SymbolStore,
    objects: Arc<dyn ObjectStore>,
    extractor: Arc<dyn Extractor>,
    config: OrchestratorConfig,
    scratch_root: PathBuf,
    completed: Arc<Notify>,
}

impl ScanOrchestrator {
    pub fn new(
        store: SymbolStore,
        objects: Arc<dyn ObjectStore>,
        extractor: Arc<dyn Extractor>,
        config: OrchestratorConfig,
        scratch_root: PathBuf,
    ) -> Self {
        Self {
            store,
            objects,
            extractor,
            config,
            scratch_root,
            completed: Arc::new(Notify::new()),
        }
    }

    pub fn store(&self) -> &SymbolStore {
        &self.store
    }

    pub fn scratch_root(&self) -> &Path {
        &self.scratch_root
    }

    /// Signalled after every successful scan; the reclaimer waits on it.
    pub fn completion_signal(&self) -> Arc<Notify> {
        self.completed.clone()
    }

    /// Scratch directory of a key. Removed by the reclaimer if a crashed
    /// process left anything behind.
    fn work_dir(&self, key: &CacheKey) -> PathBuf {
        self.scratch_root.join(key.slug())
    }

    /// Private scratch directory of one claim, so a displaced run never
    /// touches the files of the claim that replaced it.
    fn claim_dir(&self, claim: &Claim) -> PathBuf {
        self.work_dir(&claim.record.key()).join(claim.token())
    }

    pub async fn request_scan(&self, request: ScanRequest) -> Result<ScanHandle> {
        let ScanRequest {
            source,
            key,
            file_size_bytes,
            force,
        } = request;

        if let Some(existing) = self.store.get(&key).await? {
            if existing.status == ScanStatus::Completed {
                return Ok(ScanHandle {
                    outcome: ScanOutcome::AlreadyCompleted,
                    record: existing,
                });
            }
        }

        let now = Utc::now().timestamp();
        let record = self
            .store
            .ensure_record(&key, &source, file_size_bytes, now)
            .await?;
        if record.status == ScanStatus::Completed {
            return Ok(ScanHandle {
                outcome: ScanOutcome::AlreadyCompleted,
                record,
            });
        }

        let policy = ClaimPolicy {
            now,
            stale_before: now - self.config.stale_scan_secs as i64,
            retry_before: now - self.config.retry_backoff_secs as i64,
            max_attempts: self.config.max_attempts,
            force,
        };

        match self
            .store
            .claim(&record.id, &source, file_size_bytes, policy)
            .await?
        {
            Some(claim) => {
                if record.status == ScanStatus::Scanning {
                    tracing::warn!(key = %key, "taking over stale scan");
                }
                tracing::info!(key = %key, source = %source, attempt = claim.record.attempts, "scan started");
                let record = claim.record.clone();
                let this = self.clone();
                tokio::spawn(async move {
                    this.run(claim, source).await;
                });
                Ok(ScanHandle {
                    outcome: ScanOutcome::Started,
                    record,
                })
            }
            None => {
                let current = self.store.get_by_id(&record.id).await?.unwrap_or(record);
                let outcome = match current.status {
                    ScanStatus::Completed => ScanOutcome::AlreadyCompleted,
                    ScanStatus::Failed => ScanOutcome::RetryDeferred,
                    ScanStatus::Scanning | ScanStatus::Pending => ScanOutcome::AlreadyRunning,
                };
                tracing::debug!(key = %key, ?outcome, "scan not claimed");
                Ok(ScanHandle {
                    outcome,
                    record: current,
                })
            }
        }
    }

    /// Fetch, extract and record the result of a won claim.
    ///
    /// The work runs on its own task under the run budget, so a timeout or
    /// a panic still ends in `fail` while this claim is current.
    async fn run(&self, claim: Claim, source: SourceRef) {
        let key = claim.record.key();
        let work_dir = self.claim_dir(&claim);
        let started = Instant::now();
        let budget = self.config.run_timeout();

        let this = self.clone();
        let dir = work_dir.clone();
        let mut task = tokio::spawn(async move { this.extract(&source, &dir).await });
        let result = match tokio::time::timeout(budget, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) if join.is_panic() => Err("extraction panicked".to_string()),
            Ok(Err(join)) => Err(format!("extraction task aborted: {}", join)),
            Err(_) => {
                task.abort();
                Err(format!("scan exceeded run timeout of {}s", budget.as_secs()))
            }
        };
        let now = Utc::now().timestamp();

        let failure = match result {
            Ok(symbols) => match self.store.complete(&claim, &symbols, now).await {
                Ok(record) => {
                    tracing::info!(
                        key = %key,
                        symbols = record.symbols_extracted,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "scan completed"
                    );
                    self.completed.notify_one();
                    None
                }
                Err(e) => {
                    tracing::error!(key = %key, error = %e, "failed to persist symbols");
                    Some(format!("failed to persist symbols: {}", e))
                }
            },
            Err(message) => {
                tracing::warn!(key = %key, error = %message, "scan failed");
                Some(message)
            }
        };

        if let Some(message) = failure {
            if let Err(e) = self.store.fail(&claim, &message, now).await {
                tracing::error!(key = %key, error = %e, "failed to record scan failure");
            }
        }

        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %work_dir.display(), error = %e, "failed to remove scratch dir");
            }
        }
        // Only succeeds once no other claim of this key is using the parent.
        if let Some(parent) = work_dir.parent() {
            let _ = tokio::fs::remove_dir(parent).await;
        }
    }

    async fn extract(
        &self,
        source: &SourceRef,
        work_dir: &Path,
    ) -> std::result::Result<Vec<crate::models::ExtractedSymbol>, String> {
        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(|e| format!("cannot create {}: {}", work_dir.display(), e))?;

        let fetched = match source {
            SourceRef::Object(object_key) => self
                .objects
                .fetch(object_key, work_dir)
                .await
                .map_err(|e| format!("fetch failed: {:#}", e))?,
            SourceRef::File(path) => {
                if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                    return Err(format!("firmware file not found: {}", path.display()));
                }
                FetchedObject {
                    path: path.clone(),
                    temporary: false,
                }
            }
        };

        self.extractor
            .extract(&fetched.path, work_dir)
            .await
            .map_err(|e| e.to_string())
    }

    /// Poll the store until `key` is completed or failed, or `timeout`
    /// elapses.
    ///
    /// Returns [`SymcacheError::InProgress`] on timeout and
    /// [`SymcacheError::ExtractionFailed`] when the scan failed.
    pub async fn wait_for(
        &self,
        key: &CacheKey,
        timeout: Duration,
        poll: Duration,
    ) -> Result<ScanRecord> {
        let deadline = Instant::now() + timeout;
        loop {
            let record = self
                .store
                .get(key)
                .await?
                .ok_or_else(|| SymcacheError::NotFound {
                    what: key.to_string(),
                    required: format!("a scan request for {}", key),
                })?;

            match record.status {
                ScanStatus::Completed => return Ok(record),
                ScanStatus::Failed => {
                    return Err(SymcacheError::ExtractionFailed {
                        key: key.clone(),
                        message: record
                            .error_message
                            .unwrap_or_else(|| "unknown error".to_string()),
                    })
                }
                ScanStatus::Pending | ScanStatus::Scanning => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(SymcacheError::InProgress { key: key.clone() });
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }
}
