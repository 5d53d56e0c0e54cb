//! TOML configuration parsing and validation.
//!
//! ```toml
//! [db]
//! path = "./data/symcache.sqlite"
//!
//! [object_store]
//! kind = "s3"
//! bucket = "ipsw"
//! region = "us-east-1"
//! endpoint_url = "http://localhost:9000"
//!
//! [extractor]
//! command = "ipsw"
//! args = ["kernel", "symbolicate", "--json", "{firmware}"]
//!
//! [server]
//! bind = "127.0.0.1:3993"
//! ```
//!
//! Every section other than `[db]`, `[object_store]` and `[extractor]` is
//! optional and falls back to the defaults below.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder replaced by the firmware path in extractor arguments.
pub const FIRMWARE_PLACEHOLDER: &str = "{firmware}";
/// Placeholder replaced by a scratch output file in extractor arguments.
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub object_store: ObjectStoreConfig,
    pub extractor: ExtractorConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub reclaimer: ReclaimerConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub devices: DevicesConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ObjectStoreConfig {
    Filesystem(FilesystemStoreConfig),
    S3(S3StoreConfig),
}

impl ObjectStoreConfig {
    pub fn include_globs(&self) -> &[String] {
        match self {
            ObjectStoreConfig::Filesystem(c) => &c.include_globs,
            ObjectStoreConfig::S3(c) => &c.include_globs,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemStoreConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3StoreConfig {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Per-request limit, covering a whole firmware download.
    #[serde(default = "default_s3_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.ipsw".to_string()]
}
fn default_s3_timeout() -> u64 {
    1800
}
fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractorConfig {
    pub command: String,
    #[serde(default = "default_extractor_args")]
    pub args: Vec<String>,
    #[serde(default = "default_extract_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
}

impl ExtractorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_extractor_args() -> Vec<String> {
    vec![FIRMWARE_PLACEHOLDER.to_string()]
}
fn default_extract_timeout() -> u64 {
    1800
}
fn default_scratch_dir() -> PathBuf {
    PathBuf::from("./data/scratch")
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrchestratorConfig {
    /// A `scanning` claim older than this may be taken over.
    #[serde(default = "default_stale_scan")]
    pub stale_scan_secs: u64,
    /// Budget for fetching plus extracting one firmware image.
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stale_scan_secs: default_stale_scan(),
            run_timeout_secs: default_run_timeout(),
            retry_backoff_secs: default_retry_backoff(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl OrchestratorConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

fn default_stale_scan() -> u64 {
    7200
}
fn default_run_timeout() -> u64 {
    3600
}
fn default_retry_backoff() -> u64 {
    300
}
fn default_max_attempts() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatcherConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_watch_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_watch_interval(),
            cooldown_secs: default_cooldown(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_watch_interval() -> u64 {
    300
}
fn default_cooldown() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReclaimerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_reclaim_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
    /// Also delete explicitly submitted local firmware files.
    #[serde(default)]
    pub delete_file_sources: bool,
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_reclaim_interval(),
            retention_secs: default_retention(),
            delete_file_sources: false,
        }
    }
}

fn default_reclaim_interval() -> u64 {
    900
}
fn default_retention() -> u64 {
    86_400
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouterConfig {
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_symbol_distance")]
    pub max_symbol_distance: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            wait_timeout_secs: default_wait_timeout(),
            poll_interval_ms: default_poll_interval(),
            max_symbol_distance: default_max_symbol_distance(),
        }
    }
}

fn default_wait_timeout() -> u64 {
    120
}
fn default_poll_interval() -> u64 {
    500
}
fn default_max_symbol_distance() -> u64 {
    0x10000
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DevicesConfig {
    /// AppleDB-style `device-list.json`.
    #[serde(default)]
    pub device_list: Option<PathBuf>,
    /// Marketing name → device identifier.
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:3993".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    match &config.object_store {
        ObjectStoreConfig::S3(s3) => {
            if s3.bucket.trim().is_empty() {
                anyhow::bail!("object_store.bucket must not be empty");
            }
            if s3.region.trim().is_empty() {
                anyhow::bail!("object_store.region must not be empty");
            }
            if s3.timeout_secs == 0 {
                anyhow::bail!("object_store.timeout_secs must be > 0");
            }
        }
        ObjectStoreConfig::Filesystem(fs) => {
            if fs.root.as_os_str().is_empty() {
                anyhow::bail!("object_store.root must not be empty");
            }
        }
    }
    if config.object_store.include_globs().is_empty() {
        anyhow::bail!("object_store.include_globs must list at least one pattern");
    }

    if config.extractor.command.trim().is_empty() {
        anyhow::bail!("extractor.command must not be empty");
    }
    if !config
        .extractor
        .args
        .iter()
        .any(|a| a.contains(FIRMWARE_PLACEHOLDER))
    {
        anyhow::bail!(
            "extractor.args must contain the {} placeholder",
            FIRMWARE_PLACEHOLDER
        );
    }
    if config.extractor.timeout_secs == 0 {
        anyhow::bail!("extractor.timeout_secs must be > 0");
    }

    if config.orchestrator.max_attempts == 0 {
        anyhow::bail!("orchestrator.max_attempts must be >= 1");
    }
    if config.orchestrator.run_timeout_secs < config.extractor.timeout_secs {
        anyhow::bail!("orchestrator.run_timeout_secs must be >= extractor.timeout_secs");
    }
    if config.orchestrator.stale_scan_secs <= config.orchestrator.run_timeout_secs {
        anyhow::bail!("orchestrator.stale_scan_secs must be > orchestrator.run_timeout_secs");
    }

    if config.watcher.interval_secs == 0 {
        anyhow::bail!("watcher.interval_secs must be > 0");
    }
    if config.reclaimer.interval_secs == 0 {
        anyhow::bail!("reclaimer.interval_secs must be > 0");
    }
    if config.router.wait_timeout_secs == 0 {
        anyhow::bail!("router.wait_timeout_secs must be > 0");
    }
    if config.router.poll_interval_ms == 0 {
        anyhow::bail!("router.poll_interval_ms must be > 0");
    }

    Ok(())
}
