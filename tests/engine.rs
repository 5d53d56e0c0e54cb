use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sqlx::SqlitePool;
use tempfile::TempDir;

use ipsw_symcache::config::{parse_config, Config};
use ipsw_symcache::crash::CrashHints;
use ipsw_symcache::db;
use ipsw_symcache::devices::DeviceMap;
use ipsw_symcache::engine::{Engine, ScanSubmission};
use ipsw_symcache::error::{ExtractError, SymcacheError};
use ipsw_symcache::extractor::Extractor;
use ipsw_symcache::migrate;
use ipsw_symcache::models::{CacheKey, ExtractedSymbol, ObjectInfo, ScanStatus, SourceRef};
use ipsw_symcache::object_store::{self, FetchedObject, ObjectStore};
use ipsw_symcache::orchestrator::{ScanOutcome, ScanRequest};

const FIRMWARE: &str = "iPhone15,2_17.5_21F79_Restore.ipsw";

const CRASH: &str = "Incident Identifier: 42\n\
Hardware Model:      iPhone15,2\n\
OS Version:          iPhone OS 17.5 (21F79)\n\
\n\
Thread 0 Crashed:\n\
0   kernel   0xfffffff007123456\n\
1   kernel   0xfffffff007004000\n";

/// Counts calls and returns a fixed symbol set after an optional delay.
struct FakeExtractor {
    calls: AtomicUsize,
    fail: AtomicBool,
    panic: AtomicBool,
    delay: Duration,
}

impl FakeExtractor {
    fn new(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            panic: AtomicBool::new(false),
            delay,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Extractor for FakeExtractor {
    async fn extract(
        &self,
        firmware: &Path,
        _work_dir: &Path,
    ) -> Result<Vec<ExtractedSymbol>, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(firmware.exists(), "firmware should be fetched before extraction");
        tokio::time::sleep(self.delay).await;
        if self.panic.load(Ordering::SeqCst) {
            panic!("extractor crashed");
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ExtractError::ToolFailed {
                status: "exit status: 1".to_string(),
                stderr: "corrupt image".to_string(),
            });
        }
        Ok(vec![
            ExtractedSymbol {
                address: 0xfffffff007004000,
                name: "_panic".to_string(),
            },
            ExtractedSymbol {
                address: 0xfffffff007123400,
                name: "_vm_fault".to_string(),
            },
        ])
    }
}

/// Delays every fetch and remembers the scratch directory it was given.
struct SlowFetch {
    inner: Arc<dyn ObjectStore>,
    delay_ms: AtomicU64,
    scratch_dirs: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl ObjectStore for SlowFetch {
    fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }

    async fn list(&self) -> anyhow::Result<Vec<ObjectInfo>> {
        self.inner.list().await
    }

    async fn fetch(&self, key: &str, scratch_dir: &Path) -> anyhow::Result<FetchedObject> {
        self.scratch_dirs.lock().unwrap().push(scratch_dir.to_path_buf());
        let delay = self.delay_ms.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        self.inner.fetch(key, scratch_dir).await
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.inner.delete(key).await
    }
}

struct Harness {
    _tmp: TempDir,
    root: PathBuf,
    engine: Engine,
    extractor: Arc<FakeExtractor>,
    pool: SqlitePool,
    objects: Arc<SlowFetch>,
}

impl Harness {
    fn firmware_path(&self, name: &str) -> PathBuf {
        self.root.join("ipsw").join(name)
    }

    fn upload(&self, name: &str, bytes: &[u8]) {
        fs::write(self.firmware_path(name), bytes).unwrap();
    }

    fn key(&self) -> CacheKey {
        CacheKey::new("iPhone15,2", "17.5", "21F79")
    }

    async fn scan(&self, force: bool) -> ScanOutcome {
        self.engine
            .orchestrator
            .request_scan(ScanRequest {
                source: SourceRef::Object(FIRMWARE.to_string()),
                key: self.key(),
                file_size_bytes: 64,
                force,
            })
            .await
            .unwrap()
            .outcome
    }

    async fn wait(&self) -> Result<ipsw_symcache::models::ScanRecord, SymcacheError> {
        self.engine
            .orchestrator
            .wait_for(&self.key(), Duration::from_secs(10), Duration::from_millis(20))
            .await
    }
}

async fn harness(delay: Duration, tweak: impl FnOnce(&mut Config)) -> Harness {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    fs::create_dir_all(root.join("ipsw")).unwrap();

    let toml = format!(
        r#"[db]
path = "{root}/data/symcache.sqlite"

[object_store]
kind = "filesystem"
root = "{root}/ipsw"

[extractor]
command = "unused"
args = ["{{firmware}}"]
scratch_dir = "{root}/scratch"

[router]
wait_timeout_secs = 10
poll_interval_ms = 20

[reclaimer]
retention_secs = 0
"#,
        root = root.display()
    );
    let mut config = parse_config(&toml).unwrap();
    tweak(&mut config);

    let pool = db::connect(&config).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    let objects = Arc::new(SlowFetch {
        inner: object_store::from_config(&config.object_store).unwrap(),
        delay_ms: AtomicU64::new(0),
        scratch_dirs: Mutex::new(Vec::new()),
    });

    let mut devices = DeviceMap::new();
    devices.insert("iPhone 15 Pro", "iPhone16,1");

    let extractor = Arc::new(FakeExtractor::new(delay));
    let engine = Engine::with_parts(
        config,
        pool.clone(),
        objects.clone(),
        extractor.clone(),
        Arc::new(devices),
    );

    Harness {
        _tmp: tmp,
        root,
        engine,
        extractor,
        pool,
        objects,
    }
}

#[tokio::test]
async fn concurrent_requests_run_a_single_extraction() {
    let h = harness(Duration::from_millis(300), |_| {}).await;
    h.upload(FIRMWARE, b"firmware");

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let orchestrator = h.engine.orchestrator.clone();
        let key = h.key();
        tasks.push(tokio::spawn(async move {
            orchestrator
                .request_scan(ScanRequest {
                    source: SourceRef::Object(FIRMWARE.to_string()),
                    key,
                    file_size_bytes: 8,
                    force: false,
                })
                .await
                .unwrap()
                .outcome
        }));
    }

    let mut started = 0;
    for task in tasks {
        match task.await.unwrap() {
            ScanOutcome::Started => started += 1,
            ScanOutcome::AlreadyRunning => {}
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert_eq!(started, 1);

    let record = h.wait().await.unwrap();
    assert_eq!(record.status, ScanStatus::Completed);
    assert_eq!(record.symbols_extracted, 2);
    assert_eq!(record.attempts, 1);
    assert_eq!(h.extractor.calls(), 1);
}

#[tokio::test]
async fn slow_fetch_is_failed_before_the_claim_goes_stale() {
    let h = harness(Duration::ZERO, |cfg| {
        cfg.extractor.timeout_secs = 1;
        cfg.orchestrator.run_timeout_secs = 1;
        cfg.orchestrator.stale_scan_secs = 2;
        cfg.orchestrator.retry_backoff_secs = 0;
    })
    .await;
    h.upload(FIRMWARE, b"firmware");
    h.objects.delay_ms.store(2_500, Ordering::SeqCst);

    assert_eq!(h.scan(false).await, ScanOutcome::Started);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.scan(false).await, ScanOutcome::AlreadyRunning);

    let err = h.wait().await.unwrap_err();
    match &err {
        SymcacheError::ExtractionFailed { message, .. } => {
            assert!(message.contains("run timeout"), "{}", message)
        }
        other => panic!("expected ExtractionFailed, got {:?}", other),
    }
    assert_eq!(h.extractor.calls(), 0);

    // Past the stale window the timed-out claim is already failed, so the
    // next request is an ordinary retry with its own scratch directory.
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    h.objects.delay_ms.store(0, Ordering::SeqCst);
    assert_eq!(h.scan(false).await, ScanOutcome::Started);
    let record = h.wait().await.unwrap();
    assert_eq!(record.attempts, 2);
    assert_eq!(h.extractor.calls(), 1);

    let dirs = h.objects.scratch_dirs.lock().unwrap().clone();
    assert_eq!(dirs.len(), 2);
    assert_ne!(dirs[0], dirs[1]);
    assert_eq!(dirs[0].parent(), dirs[1].parent());
}

#[tokio::test]
async fn failed_symbol_write_marks_the_scan_failed() {
    let h = harness(Duration::ZERO, |_| {}).await;
    h.upload(FIRMWARE, b"firmware");
    sqlx::query(
        "CREATE TRIGGER reject_symbols BEFORE INSERT ON symbol_entries \
         BEGIN SELECT RAISE(ABORT, 'disk full'); END",
    )
    .execute(&h.pool)
    .await
    .unwrap();

    assert_eq!(h.scan(false).await, ScanOutcome::Started);
    let err = h.wait().await.unwrap_err();
    match &err {
        SymcacheError::ExtractionFailed { message, .. } => {
            assert!(message.contains("failed to persist symbols"), "{}", message)
        }
        other => panic!("expected ExtractionFailed, got {:?}", other),
    }

    let record = h.engine.store.get(&h.key()).await.unwrap().unwrap();
    assert_eq!(record.status, ScanStatus::Failed);
    assert!(h.engine.store.load_symbols(&record.id).await.unwrap().is_empty());
    assert_eq!(h.scan(false).await, ScanOutcome::RetryDeferred);

    sqlx::query("DROP TRIGGER reject_symbols")
        .execute(&h.pool)
        .await
        .unwrap();
    assert_eq!(h.scan(true).await, ScanOutcome::Started);
    assert_eq!(h.wait().await.unwrap().symbols_extracted, 2);
}

#[tokio::test]
async fn extractor_panic_marks_the_scan_failed() {
    let h = harness(Duration::ZERO, |_| {}).await;
    h.upload(FIRMWARE, b"firmware");
    h.extractor.panic.store(true, Ordering::SeqCst);

    assert_eq!(h.scan(false).await, ScanOutcome::Started);
    match h.wait().await.unwrap_err() {
        SymcacheError::ExtractionFailed { message, .. } => {
            assert!(message.contains("panicked"), "{}", message)
        }
        other => panic!("expected ExtractionFailed, got {:?}", other),
    }
    assert_eq!(h.scan(false).await, ScanOutcome::RetryDeferred);
}

#[tokio::test]
async fn completed_scan_is_not_repeated() {
    let h = harness(Duration::ZERO, |_| {}).await;
    h.upload(FIRMWARE, b"firmware");

    assert_eq!(h.scan(false).await, ScanOutcome::Started);
    h.wait().await.unwrap();

    assert_eq!(h.scan(false).await, ScanOutcome::AlreadyCompleted);
    assert_eq!(h.scan(true).await, ScanOutcome::AlreadyCompleted);
    assert_eq!(h.extractor.calls(), 1);
}

#[tokio::test]
async fn symbols_are_invisible_until_the_scan_completes() {
    let h = harness(Duration::from_millis(1500), |cfg| {
        cfg.router.wait_timeout_secs = 1;
    })
    .await;
    h.upload(FIRMWARE, b"firmware");

    assert_eq!(h.scan(false).await, ScanOutcome::Started);
    let record = h.engine.store.get(&h.key()).await.unwrap().unwrap();
    assert_eq!(record.status, ScanStatus::Scanning);
    assert!(h.engine.store.load_symbols(&record.id).await.unwrap().is_empty());

    let err = h
        .engine
        .router
        .symbolicate(CRASH.as_bytes(), &CrashHints::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SymcacheError::InProgress { .. }), "{:?}", err);
    assert!(err.is_retryable());

    let record = h.wait().await.unwrap();
    assert_eq!(h.engine.store.load_symbols(&record.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn cache_hit_needs_neither_firmware_nor_extractor() {
    let h = harness(Duration::ZERO, |_| {}).await;
    h.upload(FIRMWARE, b"firmware");
    h.scan(false).await;
    h.wait().await.unwrap();

    fs::remove_file(h.firmware_path(FIRMWARE)).unwrap();

    let output = h
        .engine
        .router
        .symbolicate(CRASH.as_bytes(), &CrashHints::default())
        .await
        .unwrap();
    assert!(output.from_cache);
    assert_eq!(output.key, h.key());
    assert_eq!(output.resolved, 2);
    assert_eq!(output.frames[0].symbol, "_panic");
    assert_eq!(output.frames[1].symbol, "_vm_fault+0x56");
    assert!(output
        .symbolicated_text
        .contains("0xfffffff007123456 (_vm_fault+0x56)"));
    assert_eq!(h.extractor.calls(), 1);

    let record = h.engine.store.get(&h.key()).await.unwrap().unwrap();
    assert_eq!(record.access_count, 1);
    assert!(record.last_accessed_at.is_some());
}

#[tokio::test]
async fn cache_hit_survives_a_failed_access_update() {
    let h = harness(Duration::ZERO, |_| {}).await;
    h.upload(FIRMWARE, b"firmware");
    h.scan(false).await;
    h.wait().await.unwrap();
    sqlx::query(
        "CREATE TRIGGER readonly_access BEFORE UPDATE OF access_count ON scan_records \
         BEGIN SELECT RAISE(ABORT, 'read only'); END",
    )
    .execute(&h.pool)
    .await
    .unwrap();

    let output = h
        .engine
        .router
        .symbolicate(CRASH.as_bytes(), &CrashHints::default())
        .await
        .unwrap();
    assert!(output.from_cache);
    assert_eq!(output.resolved, 2);

    let record = h.engine.store.get(&h.key()).await.unwrap().unwrap();
    assert_eq!(record.access_count, 0);
}

#[tokio::test]
async fn missing_firmware_names_the_upload() {
    let h = harness(Duration::ZERO, |_| {}).await;

    let err = h
        .engine
        .router
        .symbolicate(CRASH.as_bytes(), &CrashHints::default())
        .await
        .unwrap_err();
    match err {
        SymcacheError::NotFound { required, .. } => {
            assert_eq!(required, "iPhone15,2_17.5_21F79_Restore.ipsw")
        }
        other => panic!("expected NotFound, got {:?}", other),
    }
    assert_eq!(h.extractor.calls(), 0);
}

#[tokio::test]
async fn report_without_device_is_a_bad_request() {
    let h = harness(Duration::ZERO, |_| {}).await;
    let err = h
        .engine
        .router
        .symbolicate(b"Thread 0 Crashed:\n0 kernel 0xfffffff007123456\n", &CrashHints::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "bad_request");
}

#[tokio::test]
async fn failed_scan_retries_after_backoff_or_with_force() {
    let h = harness(Duration::ZERO, |_| {}).await;
    h.upload(FIRMWARE, b"firmware");
    h.extractor.fail.store(true, Ordering::SeqCst);

    assert_eq!(h.scan(false).await, ScanOutcome::Started);
    let err = h.wait().await.unwrap_err();
    match &err {
        SymcacheError::ExtractionFailed { message, .. } => assert!(message.contains("corrupt image")),
        other => panic!("expected ExtractionFailed, got {:?}", other),
    }

    let record = h.engine.store.get(&h.key()).await.unwrap().unwrap();
    assert_eq!(record.status, ScanStatus::Failed);
    assert!(!record.can_delete_source);
    assert!(h.engine.store.load_symbols(&record.id).await.unwrap().is_empty());

    // Inside the default 300 s backoff.
    assert_eq!(h.scan(false).await, ScanOutcome::RetryDeferred);
    assert_eq!(h.extractor.calls(), 1);

    h.extractor.fail.store(false, Ordering::SeqCst);
    assert_eq!(h.scan(true).await, ScanOutcome::Started);
    let record = h.wait().await.unwrap();
    assert_eq!(record.status, ScanStatus::Completed);
    assert_eq!(record.attempts, 2);
    assert!(record.error_message.is_none());
}

#[tokio::test]
async fn failed_scan_is_retried_once_backoff_elapses() {
    let h = harness(Duration::ZERO, |cfg| {
        cfg.orchestrator.retry_backoff_secs = 0;
        cfg.orchestrator.max_attempts = 2;
    })
    .await;
    h.upload(FIRMWARE, b"firmware");
    h.extractor.fail.store(true, Ordering::SeqCst);

    h.scan(false).await;
    assert!(h.wait().await.is_err());
    assert_eq!(h.scan(false).await, ScanOutcome::Started);
    assert!(h.wait().await.is_err());

    // Attempt cap reached.
    assert_eq!(h.scan(false).await, ScanOutcome::RetryDeferred);
    assert_eq!(h.extractor.calls(), 2);
}

#[tokio::test]
async fn reclaimer_deletes_only_cached_firmware() {
    let h = harness(Duration::ZERO, |_| {}).await;
    h.upload(FIRMWARE, b"firmware");
    h.upload("iPhone14,5_16.0_20A362_Restore.ipsw", b"other firmware");

    h.scan(false).await;
    h.wait().await.unwrap();

    // A failed record for the other firmware must survive the sweep.
    h.extractor.fail.store(true, Ordering::SeqCst);
    let other = CacheKey::new("iPhone14,5", "16.0", "20A362");
    h.engine
        .orchestrator
        .request_scan(ScanRequest {
            source: SourceRef::Object("iPhone14,5_16.0_20A362_Restore.ipsw".to_string()),
            key: other.clone(),
            file_size_bytes: 14,
            force: false,
        })
        .await
        .unwrap();
    assert!(h
        .engine
        .orchestrator
        .wait_for(&other, Duration::from_secs(10), Duration::from_millis(20))
        .await
        .is_err());

    let reclaimer = h.engine.reclaimer();
    let report = reclaimer.sweep().await.unwrap();
    assert_eq!(report.candidates, 1);
    assert_eq!(report.deleted, 1);
    assert_eq!(report.bytes_reclaimed, 64);
    assert!(!h.firmware_path(FIRMWARE).exists());
    assert!(h.firmware_path("iPhone14,5_16.0_20A362_Restore.ipsw").exists());

    let record = h.engine.store.get(&h.key()).await.unwrap().unwrap();
    assert!(record.source_deleted_at.is_some());
    assert_eq!(h.engine.store.load_symbols(&record.id).await.unwrap().len(), 2);

    let again = reclaimer.sweep().await.unwrap();
    assert_eq!(again.candidates, 0);
}

#[tokio::test]
async fn reclaimer_continues_past_a_record_it_cannot_mark() {
    let h = harness(Duration::ZERO, |_| {}).await;
    let other_name = "iPhone14,5_16.0_20A362_Restore.ipsw";
    let other = CacheKey::new("iPhone14,5", "16.0", "20A362");
    h.upload(FIRMWARE, b"firmware");
    h.upload(other_name, b"other firmware");

    h.scan(false).await;
    h.wait().await.unwrap();
    h.engine
        .orchestrator
        .request_scan(ScanRequest {
            source: SourceRef::Object(other_name.to_string()),
            key: other.clone(),
            file_size_bytes: 14,
            force: false,
        })
        .await
        .unwrap();
    h.engine
        .orchestrator
        .wait_for(&other, Duration::from_secs(10), Duration::from_millis(20))
        .await
        .unwrap();

    let blocked = h.engine.store.get(&h.key()).await.unwrap().unwrap();
    let trigger = format!(
        "CREATE TRIGGER keep_source BEFORE UPDATE OF source_deleted_at ON scan_records \
         WHEN OLD.id = '{}' BEGIN SELECT RAISE(ABORT, 'locked'); END",
        blocked.id
    );
    sqlx::query(&trigger).execute(&h.pool).await.unwrap();

    let reclaimer = h.engine.reclaimer();
    let report = reclaimer.sweep().await.unwrap();
    assert_eq!(report.candidates, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.deleted, 1);
    assert!(!h.firmware_path(other_name).exists());
    let reclaimed = h.engine.store.get(&other).await.unwrap().unwrap();
    assert!(reclaimed.source_deleted_at.is_some());
    let blocked = h.engine.store.get(&h.key()).await.unwrap().unwrap();
    assert!(blocked.source_deleted_at.is_none());

    sqlx::query("DROP TRIGGER keep_source")
        .execute(&h.pool)
        .await
        .unwrap();
    let report = reclaimer.sweep().await.unwrap();
    assert_eq!(report.candidates, 1);
    assert_eq!(report.deleted, 1);
    assert_eq!(report.failed, 0);
}

#[tokio::test]
async fn reclaimer_respects_retention() {
    let h = harness(Duration::ZERO, |cfg| {
        cfg.reclaimer.retention_secs = 3600;
    })
    .await;
    h.upload(FIRMWARE, b"firmware");
    h.scan(false).await;
    h.wait().await.unwrap();

    let report = h.engine.reclaimer().sweep().await.unwrap();
    assert_eq!(report.deleted, 0);
    assert!(h.firmware_path(FIRMWARE).exists());
}

#[tokio::test]
async fn local_file_sources_are_kept_unless_configured() {
    let h = harness(Duration::ZERO, |_| {}).await;
    let local = h.root.join("local.ipsw");
    fs::write(&local, b"firmware").unwrap();

    let handle = h
        .engine
        .submit(ScanSubmission {
            source: Some(SourceRef::File(local.clone())),
            device: "iPhone15,2".to_string(),
            os_version: "17.5".to_string(),
            build_id: Some("21F79".to_string()),
            force: false,
        })
        .await
        .unwrap();
    assert_eq!(handle.outcome, ScanOutcome::Started);
    assert_eq!(handle.record.file_size_bytes, 8);
    h.wait().await.unwrap();

    let report = h.engine.reclaimer().sweep().await.unwrap();
    assert_eq!(report.kept_files, 1);
    assert_eq!(report.deleted, 0);
    assert!(local.exists());
}

#[tokio::test]
async fn watcher_submits_new_firmware_once_and_honours_cooldown() {
    let h = harness(Duration::ZERO, |_| {}).await;
    h.upload(FIRMWARE, b"firmware");
    h.upload("notes.ipsw", b"not firmware");

    let mut watcher = h.engine.watcher();
    let first = watcher.tick().await;
    assert_eq!(first.listed, 2);
    assert_eq!(first.submitted, 1);
    assert_eq!(first.skipped, 1);
    h.wait().await.unwrap();

    let second = watcher.tick().await;
    assert_eq!(second.changed, 0);
    assert_eq!(second.submitted, 0);

    // Re-uploaded with different content inside the cooldown window.
    h.upload(FIRMWARE, b"firmware, second upload");
    let third = watcher.tick().await;
    assert_eq!(third.changed, 1);
    assert_eq!(third.cooled_down, 1);
    assert_eq!(third.submitted, 0);

    let status = watcher.status();
    let status = status.read().await;
    assert_eq!(status.recent_submissions.len(), 1);
    assert_eq!(
        status.recent_submissions[0].outcome,
        Some(ScanOutcome::Started)
    );
    assert_eq!(h.extractor.calls(), 1);
}

#[tokio::test]
async fn watcher_survives_listing_failures() {
    let h = harness(Duration::ZERO, |_| {}).await;
    fs::remove_dir_all(h.root.join("ipsw")).unwrap();

    let mut watcher = h.engine.watcher();
    let report = watcher.tick().await;
    assert_eq!(report.errors, 1);
    assert!(watcher.status().read().await.last_error.is_some());

    fs::create_dir_all(h.root.join("ipsw")).unwrap();
    h.upload(FIRMWARE, b"firmware");
    let report = watcher.tick().await;
    assert_eq!(report.errors, 0);
    assert_eq!(report.submitted, 1);
    assert!(watcher.status().read().await.last_error.is_none());
    h.wait().await.unwrap();
}

#[tokio::test]
async fn marketing_name_crash_is_scanned_on_demand() {
    let h = harness(Duration::from_millis(100), |_| {}).await;
    h.upload("iPhone16,1_17.5_21F79_Restore.ipsw", b"pro firmware");

    let crash = CRASH.replace("iPhone15,2", "iPhone 15 Pro");
    let output = h
        .engine
        .router
        .symbolicate(crash.as_bytes(), &CrashHints::default())
        .await
        .unwrap();
    assert!(!output.from_cache);
    assert_eq!(output.key, CacheKey::new("iPhone16,1", "17.5", "21F79"));
    assert_eq!(output.resolved, 2);
    assert_eq!(output.unresolved, 0);

    let again = h
        .engine
        .router
        .symbolicate(crash.as_bytes(), &CrashHints::default())
        .await
        .unwrap();
    assert!(again.from_cache);
    assert_eq!(h.extractor.calls(), 1);
}

#[tokio::test]
async fn report_without_build_uses_latest_cached_build() {
    let h = harness(Duration::ZERO, |_| {}).await;
    h.upload(FIRMWARE, b"firmware");
    h.scan(false).await;
    h.wait().await.unwrap();

    let crash = "Hardware Model: iPhone15,2\nOS Version: 17.5\n0 kernel 0xfffffff007004010\n";
    let output = h
        .engine
        .router
        .symbolicate(crash.as_bytes(), &CrashHints::default())
        .await
        .unwrap();
    assert_eq!(output.key.build_id, "21F79");
    assert_eq!(output.frames[0].symbol, "_panic+0x10");
}

#[tokio::test]
async fn submission_finds_firmware_by_device_and_version() {
    let h = harness(Duration::ZERO, |_| {}).await;
    h.upload(FIRMWARE, b"firmware");

    let handle = h
        .engine
        .submit(ScanSubmission {
            device: "iPhone15,2".to_string(),
            os_version: "iOS 17.5".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(handle.outcome, ScanOutcome::Started);
    assert_eq!(handle.record.key(), h.key());
    assert_eq!(handle.record.source, SourceRef::Object(FIRMWARE.to_string()));
    h.wait().await.unwrap();

    let err = h
        .engine
        .submit(ScanSubmission {
            device: "iPhone14,5".to_string(),
            os_version: "16.0".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_found");
}
