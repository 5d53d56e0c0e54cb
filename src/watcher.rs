//! Ingestion watcher.
//!
//! Polls the object store on a fixed interval and submits new or changed
//! firmware images to the [`ScanOrchestrator`].
//!
//! Each [`tick`](IngestionWatcher::tick):
//!
//! 1. lists the object store;
//! 2. diffs the listing against the previous one by `(size, last_modified)`;
//! 3. parses and resolves each changed object's name into a [`CacheKey`];
//! 4. requests a scan unless the key was submitted within the cooldown
//!    window, and records the cooldown whatever the outcome.
//!
//! The seen-object table is per instance and only a hint: whether a scan
//! actually runs is decided by the store's atomic claim, so several
//! watchers over one bucket are safe.
//!
//! A listing failure is logged and the next tick retries; it never stops
//! the loop. A name that fails to parse or resolve skips only that object.

use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::devices::DeviceResolver;
use crate::firmware::parse_firmware_name;
use crate::models::{CacheKey, ObjectInfo, SourceRef};
use crate::object_store::ObjectStore;
use crate::orchestrator::{ScanOrchestrator, ScanOutcome, ScanRequest};

/// Submissions older than this drop out of [`WatcherStatus::recent_submissions`].
const RECENT_WINDOW_SECS: i64 = 3600;
const RECENT_MAX: usize = 100;

/// Counters for a single tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub listed: usize,
    pub changed: usize,
    /// `request_scan` calls made.
    pub submitted: usize,
    /// Changed objects held back by the cooldown.
    pub cooled_down: usize,
    /// Changed objects whose name could not be parsed or resolved.
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub key: CacheKey,
    pub object_key: String,
    pub outcome: Option<ScanOutcome>,
    pub at: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WatcherStatus {
    pub running: bool,
    pub interval_secs: u64,
    pub cooldown_secs: u64,
    pub last_tick_at: Option<i64>,
    pub last_tick: Option<TickReport>,
    pub known_objects: usize,
    pub last_error: Option<String>,
    pub recent_submissions: VecDeque<Submission>,
}

pub struct IngestionWatcher {
    objects: Arc<dyn ObjectStore>,
    orchestrator: ScanOrchestrator,
    resolver: Arc<dyn DeviceResolver>,
    interval: Duration,
    cooldown: Duration,
    /// object key → (size, last_modified) as of the last successful listing
    seen: HashMap<String, (i64, i64)>,
    last_submitted: HashMap<CacheKey, Instant>,
    status: Arc<RwLock<WatcherStatus>>,
}

impl IngestionWatcher {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        orchestrator: ScanOrchestrator,
        resolver: Arc<dyn DeviceResolver>,
        interval: Duration,
        cooldown: Duration,
    ) -> Self {
        let status = WatcherStatus {
            interval_secs: interval.as_secs(),
            cooldown_secs: cooldown.as_secs(),
            ..Default::default()
        };
        Self {
            objects,
            orchestrator,
            resolver,
            interval,
            cooldown,
            seen: HashMap::new(),
            last_submitted: HashMap::new(),
            status: Arc::new(RwLock::new(status)),
        }
    }

    /// Shared handle to the published status.
    pub fn status(&self) -> Arc<RwLock<WatcherStatus>> {
        self.status.clone()
    }

    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();

        let listing = match self.objects.list().await {
            Ok(listing) => listing,
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::warn!(store = %self.objects.describe(), error = %message, "object store listing failed");
                report.errors += 1;
                let mut status = self.status.write().await;
                status.last_tick_at = Some(Utc::now().timestamp());
                status.last_error = Some(message);
                status.last_tick = Some(report.clone());
                return report;
            }
        };
        report.listed = listing.len();

        let now = Instant::now();
        let cooldown = self.cooldown;
        self.last_submitted
            .retain(|_, at| now.duration_since(*at) < cooldown);

        let mut next_seen = HashMap::with_capacity(listing.len());
        let mut submissions = Vec::new();

        for object in listing {
            let fingerprint = (object.size, object.last_modified);
            let changed = self.seen.get(&object.key) != Some(&fingerprint);
            if !changed {
                next_seen.insert(object.key, fingerprint);
                continue;
            }
            report.changed += 1;

            let Some(key) = self.key_for(&object) else {
                report.skipped += 1;
                next_seen.insert(object.key, fingerprint);
                continue;
            };

            if self.last_submitted.contains_key(&key) {
                // Left out of `seen` so it is reconsidered once the cooldown ends.
                tracing::debug!(key = %key, object = %object.key, "in cooldown");
                report.cooled_down += 1;
                continue;
            }
            self.last_submitted.insert(key.clone(), Instant::now());

            report.submitted += 1;
            let request = ScanRequest {
                source: SourceRef::Object(object.key.clone()),
                key: key.clone(),
                file_size_bytes: object.size,
                force: false,
            };
            let outcome = match self.orchestrator.request_scan(request).await {
                Ok(handle) => {
                    tracing::info!(key = %key, object = %object.key, outcome = ?handle.outcome, "submitted firmware");
                    next_seen.insert(object.key.clone(), fingerprint);
                    Some(handle.outcome)
                }
                Err(e) => {
                    tracing::warn!(key = %key, object = %object.key, error = %e, "scan request failed");
                    report.errors += 1;
                    None
                }
            };
            submissions.push(Submission {
                key,
                object_key: object.key,
                outcome,
                at: Utc::now().timestamp(),
            });
        }

        self.seen = next_seen;

        let mut status = self.status.write().await;
        let now_secs = Utc::now().timestamp();
        status.last_tick_at = Some(now_secs);
        status.known_objects = self.seen.len();
        status.last_error = None;
        status.last_tick = Some(report.clone());
        status.recent_submissions.extend(submissions);
        status
            .recent_submissions
            .retain(|s| now_secs - s.at < RECENT_WINDOW_SECS);
        while status.recent_submissions.len() > RECENT_MAX {
            status.recent_submissions.pop_front();
        }

        if report.changed > 0 {
            tracing::info!(
                listed = report.listed,
                changed = report.changed,
                submitted = report.submitted,
                cooled_down = report.cooled_down,
                skipped = report.skipped,
                "watcher tick"
            );
        }
        report
    }

    fn key_for(&self, object: &ObjectInfo) -> Option<CacheKey> {
        let Some(name) = parse_firmware_name(&object.key) else {
            tracing::debug!(object = %object.key, "unrecognised firmware name");
            return None;
        };
        let device = match self.resolver.resolve(&name.device) {
            Ok(device) => device,
            Err(e) => {
                tracing::warn!(object = %object.key, error = %e, "cannot resolve device");
                return None;
            }
        };
        let key = name.key_for(&device);
        if key.is_none() {
            tracing::warn!(object = %object.key, "firmware name has no build identifier");
        }
        key
    }

    /// Tick forever on the configured interval. The first tick runs
    /// immediately.
    pub async fn run(mut self) {
        self.status.write().await.running = true;
        tracing::info!(
            store = %self.objects.describe(),
            interval_secs = self.interval.as_secs(),
            cooldown_secs = self.cooldown.as_secs(),
            "watcher started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }
}
