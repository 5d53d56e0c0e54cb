//! Component wiring.
//!
//! [`Engine`] builds every component from a [`Config`] once and hands out
//! the long-running loops. The CLI and the HTTP server both go through it,
//! so they share one store pool, one object store client and one
//! orchestrator.

use anyhow::Context;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::devices::{DeviceMap, DeviceResolver};
use crate::error::{Result, SymcacheError};
use crate::extractor::{CommandExtractor, Extractor};
use crate::firmware::{expected_file_name, parse_firmware_name, FirmwareName};
use crate::models::{CacheKey, ObjectInfo, SourceRef};
use crate::object_store::{self, ObjectStore};
use crate::orchestrator::{ScanHandle, ScanOrchestrator, ScanRequest};
use crate::reclaimer::StorageReclaimer;
use crate::router::SymbolicationRouter;
use crate::stats::{collect_disk_usage, DiskUsage};
use crate::store::SymbolStore;
use crate::watcher::{IngestionWatcher, WatcherStatus};
use crate::{db, migrate};

/// An explicit scan request from an operator (CLI `scan`, `POST /v1/scans`).
///
/// Without a `source` the firmware is looked up in the object store by
/// device, OS version and build. Without a `build_id` the build is taken
/// from the firmware name.
#[derive(Debug, Clone, Default)]
pub struct ScanSubmission {
    pub source: Option<SourceRef>,
    pub device: String,
    pub os_version: String,
    pub build_id: Option<String>,
    pub force: bool,
}

/// One object of the firmware listing, with its parsed name.
#[derive(Debug, Clone, Serialize)]
pub struct FirmwareEntry {
    #[serde(flatten)]
    pub object: ObjectInfo,
    pub parsed: Option<FirmwareName>,
    /// Canonical identifier of the parsed device, when it resolves.
    pub device_identifier: Option<String>,
}

#[derive(Clone)]
pub struct Engine {
    pub config: Arc<Config>,
    pub store: SymbolStore,
    pub objects: Arc<dyn ObjectStore>,
    pub resolver: Arc<dyn DeviceResolver>,
    pub orchestrator: ScanOrchestrator,
    pub router: SymbolicationRouter,
}

impl Engine {
    /// Connect to the database (migrating it), the object store, and load
    /// the device map.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        let objects = object_store::from_config(&config.object_store)
            .context("Failed to initialise object store")?;
        let resolver = DeviceMap::from_config(&config.devices)?;
        let extractor = CommandExtractor::new(&config.extractor);
        Ok(Self::with_parts(
            config.clone(),
            pool,
            objects,
            Arc::new(extractor),
            Arc::new(resolver),
        ))
    }

    /// Assemble an engine from already-built parts.
    pub fn with_parts(
        config: Config,
        pool: SqlitePool,
        objects: Arc<dyn ObjectStore>,
        extractor: Arc<dyn Extractor>,
        resolver: Arc<dyn DeviceResolver>,
    ) -> Self {
        let store = SymbolStore::new(pool);
        let orchestrator = ScanOrchestrator::new(
            store.clone(),
            objects.clone(),
            extractor,
            config.orchestrator.clone(),
            config.extractor.scratch_dir.clone(),
        );
        let router = SymbolicationRouter::new(
            orchestrator.clone(),
            objects.clone(),
            resolver.clone(),
            config.router.clone(),
        );
        Self {
            config: Arc::new(config),
            store,
            objects,
            resolver,
            orchestrator,
            router,
        }
    }

    /// Resolve a submission into a [`ScanRequest`] and hand it to the
    /// orchestrator.
    pub async fn submit(&self, submission: ScanSubmission) -> Result<ScanHandle> {
        let device = self
            .resolver
            .resolve(&submission.device)
            .map_err(|e| SymcacheError::BadRequest(e.to_string()))?;
        let os_version = submission.os_version.trim();
        if os_version.is_empty() {
            return Err(SymcacheError::BadRequest(
                "os_version must not be empty".to_string(),
            ));
        }
        let wanted_build = submission
            .build_id
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty());

        let (source, key, file_size_bytes) = match submission.source {
            None => {
                let found = self
                    .router
                    .find_firmware(&device, os_version, wanted_build)
                    .await?
                    .ok_or_else(|| SymcacheError::NotFound {
                        what: format!("{} {}", device, os_version),
                        required: expected_file_name(&device, os_version, wanted_build),
                    })?;
                let size = found.object.size;
                (SourceRef::Object(found.object.key), found.key, size)
            }
            Some(source) => {
                let build = match wanted_build {
                    Some(build) => build.to_string(),
                    None => parse_firmware_name(&source.location())
                        .and_then(|name| name.build_id)
                        .ok_or_else(|| {
                            SymcacheError::BadRequest(format!(
                                "no build identifier given and none in {}",
                                source.location()
                            ))
                        })?,
                };
                let size = self.source_size(&source).await?;
                (source, CacheKey::new(&device, os_version, &build), size)
            }
        };

        self.orchestrator
            .request_scan(ScanRequest {
                source,
                key,
                file_size_bytes,
                force: submission.force,
            })
            .await
    }

    async fn source_size(&self, source: &SourceRef) -> Result<i64> {
        match source {
            SourceRef::File(path) => match tokio::fs::metadata(path).await {
                Ok(meta) => Ok(meta.len() as i64),
                Err(e) => Err(SymcacheError::BadRequest(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                ))),
            },
            SourceRef::Object(object_key) => {
                let listing = self
                    .objects
                    .list()
                    .await
                    .map_err(SymcacheError::object_store)?;
                listing
                    .into_iter()
                    .find(|o| &o.key == object_key)
                    .map(|o| o.size)
                    .ok_or_else(|| SymcacheError::NotFound {
                        what: format!("object {}", object_key),
                        required: object_key.clone(),
                    })
            }
        }
    }

    /// Every firmware object in the store with its parsed name.
    pub async fn firmware_listing(&self) -> Result<Vec<FirmwareEntry>> {
        let listing = self
            .objects
            .list()
            .await
            .map_err(SymcacheError::object_store)?;
        Ok(listing
            .into_iter()
            .map(|object| {
                let parsed = parse_firmware_name(&object.key);
                let device_identifier = parsed
                    .as_ref()
                    .and_then(|name| self.resolver.resolve(&name.device).ok());
                FirmwareEntry {
                    object,
                    parsed,
                    device_identifier,
                }
            })
            .collect())
    }

    pub async fn disk_usage(&self) -> Result<DiskUsage> {
        collect_disk_usage(
            self.objects.as_ref(),
            &self.config.extractor.scratch_dir,
            &self.config.db.path,
        )
        .await
    }

    pub fn watcher(&self) -> IngestionWatcher {
        IngestionWatcher::new(
            self.objects.clone(),
            self.orchestrator.clone(),
            self.resolver.clone(),
            Duration::from_secs(self.config.watcher.interval_secs),
            Duration::from_secs(self.config.watcher.cooldown_secs),
        )
    }

    pub fn reclaimer(&self) -> StorageReclaimer {
        StorageReclaimer::new(
            self.store.clone(),
            self.objects.clone(),
            self.config.extractor.scratch_dir.clone(),
            self.config.reclaimer.clone(),
        )
    }

    /// Spawn the enabled background loops and return the watcher's status
    /// handle (idle when the watcher is disabled).
    pub fn spawn_background(&self) -> Arc<RwLock<WatcherStatus>> {
        let watcher = self.watcher();
        let status = watcher.status();
        if self.config.watcher.enabled {
            tokio::spawn(watcher.run());
        } else {
            tracing::info!("watcher disabled");
        }

        if self.config.reclaimer.enabled {
            let wake = self.orchestrator.completion_signal();
            tokio::spawn(self.reclaimer().run(wake));
        } else {
            tracing::info!("reclaimer disabled");
        }
        status
    }
}
