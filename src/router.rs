//! Symbolication routing.
//!
//! [`SymbolicationRouter::symbolicate`] turns a raw crash report into
//! symbolicated output:
//!
//! 1. parse device, OS version, build and addresses from the report;
//! 2. resolve the device to its canonical identifier;
//! 3. look the [`CacheKey`] up in the store. A completed record is the fast
//!    path and never touches the object store or the extractor;
//! 4. on a miss, find matching firmware in the object store, request a scan
//!    and wait for it, bounded by `wait_timeout_secs`;
//! 5. with no matching firmware, fail with [`SymcacheError::NotFound`]
//!    naming the firmware file to upload.
//!
//! A report without a build identifier is served from the newest completed
//! build of the same device and OS version when one exists.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RouterConfig;
use crate::crash::{annotate_text, parse_crash_report, CrashFormat, CrashHints};
use crate::devices::DeviceResolver;
use crate::error::{Result, SymcacheError};
use crate::firmware::{device_matches, expected_file_name, parse_firmware_name};
use crate::models::{CacheKey, ObjectInfo, ScanRecord, ScanStatus, SourceRef};
use crate::object_store::ObjectStore;
use crate::orchestrator::{ScanOrchestrator, ScanOutcome, ScanRequest};
use crate::store::SymbolStore;
use crate::symbols::{Resolution, SymbolTable};

#[derive(Debug, Clone, Serialize)]
pub struct SymbolicatedFrame {
    /// `0x`-prefixed hex.
    pub address: String,
    pub symbol: String,
    pub resolved: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolicatedOutput {
    pub key: CacheKey,
    pub format: CrashFormat,
    /// Served from symbols cached before this request.
    pub from_cache: bool,
    pub symbol_count: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub frames: Vec<SymbolicatedFrame>,
    pub symbolicated_text: String,
}

/// A firmware object matched to a symbolication request.
#[derive(Debug, Clone)]
pub struct FirmwareMatch {
    pub object: ObjectInfo,
    pub key: CacheKey,
}

#[derive(Clone)]
pub struct SymbolicationRouter {
    store: SymbolStore,
    orchestrator: ScanOrchestrator,
    objects: Arc<dyn ObjectStore>,
    resolver: Arc<dyn DeviceResolver>,
    config: RouterConfig,
}

impl SymbolicationRouter {
    pub fn new(
        orchestrator: ScanOrchestrator,
        objects: Arc<dyn ObjectStore>,
        resolver: Arc<dyn DeviceResolver>,
        config: RouterConfig,
    ) -> Self {
        Self {
            store: orchestrator.store().clone(),
            orchestrator,
            objects,
            resolver,
            config,
        }
    }

    pub async fn symbolicate(&self, crash: &[u8], hints: &CrashHints) -> Result<SymbolicatedOutput> {
        let mut report = parse_crash_report(crash);
        report.apply_hints(hints);

        let raw_device = report.device.as_deref().ok_or_else(|| {
            SymcacheError::BadRequest(
                "crash report does not name a device; pass a device hint".to_string(),
            )
        })?;
        let os_version = report.os_version.as_deref().ok_or_else(|| {
            SymcacheError::BadRequest(
                "crash report does not name an OS version; pass an os_version hint".to_string(),
            )
        })?;
        let device = self.resolver.resolve(raw_device).map_err(|e| {
            SymcacheError::BadRequest(format!("{}; pass the device identifier as a hint", e))
        })?;

        let record = match report.build_id.as_deref() {
            Some(build) => {
                let key = CacheKey::new(&device, os_version, build);
                self.cached_or_scanned(key).await?
            }
            None => {
                let partial = CacheKey::new(&device, os_version, "");
                match self
                    .store
                    .latest_completed(&partial.device_identifier, &partial.os_version)
                    .await?
                {
                    Some(record) => (record, true),
                    None => self.scan_without_build(&device, os_version).await?,
                }
            }
        };
        let (record, from_cache) = record;

        let symbols = self.store.load_symbols(&record.id).await?;
        if let Err(e) = self.store.touch(&record.id, Utc::now().timestamp()).await {
            tracing::warn!(key = %record.key(), error = %e, "failed to record cache access");
        }

        let table = SymbolTable::new(symbols, self.config.max_symbol_distance);
        let frames: Vec<SymbolicatedFrame> = report
            .addresses
            .iter()
            .map(|&addr| SymbolicatedFrame {
                address: format!("0x{:x}", addr),
                symbol: table.render(addr),
                resolved: table.resolve(addr) != Resolution::Unknown,
            })
            .collect();
        let resolved = frames.iter().filter(|f| f.resolved).count();

        tracing::debug!(key = %record.key(), frames = frames.len(), resolved, from_cache, "symbolicated crash report");

        Ok(SymbolicatedOutput {
            key: record.key(),
            format: report.format,
            from_cache,
            symbol_count: table.len(),
            resolved,
            unresolved: frames.len() - resolved,
            symbolicated_text: annotate_text(&report.text, &table),
            frames,
        })
    }

    /// The completed record for `key`, scanning on demand if needed.
    /// The flag is `true` for a cache hit.
    async fn cached_or_scanned(&self, key: CacheKey) -> Result<(ScanRecord, bool)> {
        if let Some(record) = self.store.get(&key).await? {
            match record.status {
                ScanStatus::Completed => return Ok((record, true)),
                ScanStatus::Scanning => return Ok((self.wait(&key).await?, false)),
                ScanStatus::Pending | ScanStatus::Failed => {}
            }
        }

        let found = self
            .find_firmware(&key.device_identifier, &key.os_version, Some(&key.build_id))
            .await?
            .ok_or_else(|| SymcacheError::NotFound {
                what: key.to_string(),
                required: expected_file_name(
                    &key.device_identifier,
                    &key.os_version,
                    Some(&key.build_id),
                ),
            })?;

        self.scan_and_wait(found.object, key).await
    }

    async fn scan_without_build(&self, device: &str, os_version: &str) -> Result<(ScanRecord, bool)> {
        let not_found = || SymcacheError::NotFound {
            what: format!("{} {}", device, os_version),
            required: expected_file_name(device, os_version, None),
        };
        let found = self
            .find_firmware(device, os_version, None)
            .await?
            .ok_or_else(not_found)?;

        match self.store.get(&found.key).await? {
            Some(record) if record.status == ScanStatus::Completed => Ok((record, true)),
            _ => self.scan_and_wait(found.object, found.key).await,
        }
    }

    async fn scan_and_wait(&self, object: ObjectInfo, key: CacheKey) -> Result<(ScanRecord, bool)> {
        tracing::info!(key = %key, object = %object.key, "cache miss; scanning on demand");
        let handle = self
            .orchestrator
            .request_scan(ScanRequest {
                source: SourceRef::Object(object.key),
                key: key.clone(),
                file_size_bytes: object.size,
                force: false,
            })
            .await?;

        match handle.outcome {
            ScanOutcome::AlreadyCompleted => Ok((handle.record, false)),
            ScanOutcome::Started | ScanOutcome::AlreadyRunning => {
                Ok((self.wait(&key).await?, false))
            }
            ScanOutcome::RetryDeferred => Err(SymcacheError::ExtractionFailed {
                key,
                message: handle
                    .record
                    .error_message
                    .unwrap_or_else(|| "previous scan failed".to_string()),
            }),
        }
    }

    async fn wait(&self, key: &CacheKey) -> Result<ScanRecord> {
        self.orchestrator
            .wait_for(
                key,
                Duration::from_secs(self.config.wait_timeout_secs),
                Duration::from_millis(self.config.poll_interval_ms),
            )
            .await
    }

    /// Find firmware for a device and OS version in the object store.
    ///
    /// An exact identifier match is preferred over a loose one; with a
    /// build requested, a firmware naming a different build never matches.
    pub async fn find_firmware(
        &self,
        device: &str,
        os_version: &str,
        build_id: Option<&str>,
    ) -> Result<Option<FirmwareMatch>> {
        let listing = self
            .objects
            .list()
            .await
            .map_err(SymcacheError::object_store)?;
        let wanted_version = CacheKey::new(device, os_version, "").os_version;
        let wanted_build = build_id.map(|b| b.trim().to_ascii_uppercase());

        let mut loose: Option<FirmwareMatch> = None;
        for object in listing {
            let Some(name) = parse_firmware_name(&object.key) else {
                continue;
            };
            if CacheKey::new("", &name.os_version, "").os_version != wanted_version {
                continue;
            }
            let build = match (&name.build_id, &wanted_build) {
                (Some(have), Some(want)) if have != want => continue,
                (Some(have), _) => have.clone(),
                (None, Some(want)) => want.clone(),
                (None, None) => continue,
            };

            let resolved = self.resolver.resolve(&name.device).ok();
            let exact = resolved.as_deref() == Some(device);
            let fuzzy = exact
                || device_matches(&name.device, device)
                || resolved.as_deref().is_some_and(|r| device_matches(r, device));
            if !fuzzy {
                continue;
            }

            let found = FirmwareMatch {
                key: CacheKey::new(device, os_version, &build),
                object,
            };
            if exact && name.build_id.is_some() {
                return Ok(Some(found));
            }
            if loose.is_none() {
                loose = Some(found);
            }
        }
        Ok(loose)
    }
}
