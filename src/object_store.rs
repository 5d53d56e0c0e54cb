//! Firmware object stores.
//!
//! The [`ObjectStore`] trait is the seam between the symbol cache and
//! wherever firmware images are uploaded. Two implementations ship:
//!
//! - [`LocalObjectStore`]: a directory tree, walked with `walkdir`.
//! - [`S3ObjectStore`]: an S3 bucket (or MinIO / LocalStack endpoint),
//!   spoken to over the REST API with AWS Signature V4.
//!
//! Both filter object keys through the configured include/exclude globs,
//! relative to the root directory or the bucket prefix.
//!
//! # Credentials
//!
//! The S3 store reads `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and the
//! optional `AWS_SESSION_TOKEN` from the environment when it is built.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use globset::{Glob, GlobSet, GlobSetBuilder};
use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

use crate::config::{FilesystemStoreConfig, ObjectStoreConfig, S3StoreConfig};
use crate::models::ObjectInfo;

/// A firmware image made available on local disk for extraction.
#[derive(Debug, Clone)]
pub struct FetchedObject {
    pub path: PathBuf,
    /// The file was downloaded into scratch space and may be removed once
    /// extraction finishes. `false` means `path` is the stored object itself.
    pub temporary: bool,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short type label, `"filesystem"` or `"s3"`.
    fn kind(&self) -> &'static str;

    /// Human-readable location, e.g. `s3://ipsw/firmware/`.
    fn describe(&self) -> String;

    /// All objects whose keys pass the include/exclude globs, sorted by key.
    async fn list(&self) -> Result<Vec<ObjectInfo>>;

    /// Make `key` available as a local file, downloading into `scratch_dir`
    /// when the object is remote.
    async fn fetch(&self, key: &str, scratch_dir: &Path) -> Result<FetchedObject>;

    /// Remove `key` from the store. Deleting a missing object succeeds.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Build the store named by `[object_store]`.
pub fn from_config(config: &ObjectStoreConfig) -> Result<Arc<dyn ObjectStore>> {
    match config {
        ObjectStoreConfig::Filesystem(fs) => Ok(Arc::new(LocalObjectStore::new(fs)?)),
        ObjectStoreConfig::S3(s3) => Ok(Arc::new(S3ObjectStore::from_env(s3)?)),
    }
}

/// Include/exclude filtering shared by both stores.
#[derive(Debug, Clone)]
struct KeyFilter {
    include: GlobSet,
    exclude: GlobSet,
}

impl KeyFilter {
    fn new(include_globs: &[String], exclude_globs: &[String]) -> Result<Self> {
        Ok(Self {
            include: build_globset(include_globs)?,
            exclude: build_globset(exclude_globs)?,
        })
    }

    fn matches(&self, relative_key: &str) -> bool {
        !self.exclude.is_match(relative_key) && self.include.is_match(relative_key)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob '{}'", pattern))?);
    }
    Ok(builder.build()?)
}

// ============ Local directory ============

pub struct LocalObjectStore {
    root: PathBuf,
    filter: KeyFilter,
}

impl LocalObjectStore {
    pub fn new(config: &FilesystemStoreConfig) -> Result<Self> {
        Ok(Self {
            root: config.root.clone(),
            filter: KeyFilter::new(&config.include_globs, &config.exclude_globs)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key below the root, refusing keys that would escape it.
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        if key.is_empty()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("invalid object key '{}'", key);
        }
        Ok(self.root.join(rel))
    }

    fn list_blocking(root: &Path, filter: &KeyFilter) -> Result<Vec<ObjectInfo>> {
        if !root.exists() {
            bail!("object store root does not exist: {}", root.display());
        }

        let mut objects = Vec::new();
        for entry in WalkDir::new(root) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let key = relative.to_string_lossy().replace('\\', "/");
            if !filter.matches(&key) {
                continue;
            }

            let metadata = entry.metadata()?;
            let last_modified = metadata
                .modified()
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
                .duration_since(std::time::SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64;

            objects.push(ObjectInfo {
                key,
                size: metadata.len() as i64,
                last_modified,
            });
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn kind(&self) -> &'static str {
        "filesystem"
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    async fn list(&self) -> Result<Vec<ObjectInfo>> {
        let root = self.root.clone();
        let filter = self.filter.clone();
        tokio::task::spawn_blocking(move || Self::list_blocking(&root, &filter)).await?
    }

    async fn fetch(&self, key: &str, _scratch_dir: &Path) -> Result<FetchedObject> {
        let path = self.resolve(key)?;
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            bail!("object '{}' not found under {}", key, self.root.display());
        }
        Ok(FetchedObject {
            path,
            temporary: false,
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete {}", path.display())),
        }
    }
}

// ============ S3 ============

type HmacSha256 = Hmac<Sha256>;

/// AWS credentials loaded from environment variables.
#[derive(Clone)]
struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

pub struct S3ObjectStore {
    config: S3StoreConfig,
    creds: AwsCredentials,
    filter: KeyFilter,
    client: reqwest::Client,
}

/// A signed request, ready to send.
struct SignedRequest {
    url: String,
    headers: Vec<(String, String)>,
}

impl S3ObjectStore {
    pub fn from_env(config: &S3StoreConfig) -> Result<Self> {
        Ok(Self {
            config: config.clone(),
            creds: AwsCredentials::from_env()?,
            filter: KeyFilter::new(&config.include_globs, &config.exclude_globs)?,
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(30))
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()
                .context("Failed to build S3 HTTP client")?,
        })
    }

    /// Scheme, host, and the path prefix for object keys.
    ///
    /// A custom endpoint (MinIO, LocalStack) is addressed path-style; AWS
    /// itself virtual-hosted style.
    fn endpoint(&self) -> (String, String, String) {
        match self.config.endpoint_url {
            Some(ref endpoint) => {
                let scheme = if endpoint.starts_with("http://") {
                    "http"
                } else {
                    "https"
                };
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .trim_end_matches('/')
                    .to_string();
                (
                    scheme.to_string(),
                    host,
                    format!("/{}", sigv4_escape(&self.config.bucket)),
                )
            }
            None => (
                "https".to_string(),
                format!(
                    "{}.s3.{}.amazonaws.com",
                    self.config.bucket, self.config.region
                ),
                String::new(),
            ),
        }
    }

    fn sign(&self, method: &str, key: Option<&str>, query: &[(String, String)]) -> SignedRequest {
        let (scheme, host, base_path) = self.endpoint();
        let canonical_uri = match key {
            Some(k) => format!(
                "{}/{}",
                base_path,
                k.split('/').map(sigv4_escape).collect::<Vec<_>>().join("/")
            ),
            None => format!("{}/", base_path),
        };

        let mut sorted = query.to_vec();
        sorted.sort();
        let canonical_querystring = sorted
            .iter()
            .map(|(k, v)| format!("{}={}", sigv4_escape(k), sigv4_escape(v)))
            .collect::<Vec<_>>()
            .join("&");

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = sha256_hex(b"");

        let mut headers = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort();

        let signed_headers = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method,
            canonical_uri,
            canonical_querystring,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!(
            "{}/{}/s3/aws4_request",
            date_stamp, self.config.region
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            sha256_hex(canonical_request.as_bytes())
        );
        let signature = SigningKey::derive(
            &self.creds.secret_access_key,
            &date_stamp,
            &self.config.region,
        )
        .signature(&string_to_sign);

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut url = format!("{}://{}{}", scheme, host, canonical_uri);
        if !canonical_querystring.is_empty() {
            url.push('?');
            url.push_str(&canonical_querystring);
        }

        let mut out: Vec<(String, String)> = headers
            .into_iter()
            .filter(|(k, _)| k != "host")
            .collect();
        out.push(("authorization".to_string(), authorization));
        SignedRequest { url, headers: out }
    }

    fn request(&self, method: reqwest::Method, signed: SignedRequest) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, &signed.url);
        for (k, v) in &signed.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        builder
    }

    fn relative_key<'a>(&self, key: &'a str) -> &'a str {
        let prefix = self.config.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return key;
        }
        key.strip_prefix(prefix)
            .map(|s| s.trim_start_matches('/'))
            .unwrap_or(key)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn kind(&self) -> &'static str {
        "s3"
    }

    fn describe(&self) -> String {
        format!("s3://{}/{}", self.config.bucket, self.config.prefix)
    }

    async fn list(&self) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !self.config.prefix.is_empty() {
                query.push(("prefix".to_string(), self.config.prefix.clone()));
            }
            if let Some(ref token) = continuation_token {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let signed = self.sign("GET", None, &query);
            let resp = self
                .request(reqwest::Method::GET, signed)
                .send()
                .await
                .with_context(|| format!("failed to list {}", self.describe()))?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!(
                    "S3 ListObjectsV2 failed (HTTP {}): {}",
                    status,
                    body.chars().take(500).collect::<String>()
                );
            }

            let page = ListPage::parse(&resp.text().await?);
            objects.extend(
                page.objects
                    .into_iter()
                    .filter(|o| self.filter.matches(self.relative_key(&o.key))),
            );

            match page.next_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn fetch(&self, key: &str, scratch_dir: &Path) -> Result<FetchedObject> {
        tokio::fs::create_dir_all(scratch_dir)
            .await
            .with_context(|| format!("failed to create {}", scratch_dir.display()))?;
        let file_name = key.rsplit('/').next().unwrap_or(key);
        let path = scratch_dir.join(file_name);

        let signed = self.sign("GET", Some(key), &[]);
        let mut resp = self
            .request(reqwest::Method::GET, signed)
            .send()
            .await
            .with_context(|| format!("failed to get s3://{}/{}", self.config.bucket, key))?;

        if !resp.status().is_success() {
            bail!(
                "S3 GetObject failed (HTTP {}) for key '{}'",
                resp.status(),
                key
            );
        }

        let mut file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("failed to create {}", path.display()))?;
        while let Some(chunk) = resp.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        Ok(FetchedObject {
            path,
            temporary: true,
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let signed = self.sign("DELETE", Some(key), &[]);
        let resp = self
            .request(reqwest::Method::DELETE, signed)
            .send()
            .await
            .with_context(|| format!("failed to delete s3://{}/{}", self.config.bucket, key))?;

        // S3 answers 204 for both deleted and already-missing objects.
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            bail!(
                "S3 DeleteObject failed (HTTP {}) for key '{}'",
                resp.status(),
                key
            );
        }
        Ok(())
    }
}

// ============ SigV4 and ListObjectsV2 ============

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts keys of any length"),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Per-day S3 signing key, chained through date, region, and service scopes.
struct SigningKey(Vec<u8>);

impl SigningKey {
    fn derive(secret_access_key: &str, date_stamp: &str, region: &str) -> Self {
        let seed = format!("AWS4{}", secret_access_key).into_bytes();
        let key = [date_stamp, region, "s3", "aws4_request"]
            .iter()
            .fold(seed, |key, scope| hmac(&key, scope.as_bytes()));
        Self(key)
    }

    fn signature(&self, string_to_sign: &str) -> String {
        hex::encode(hmac(&self.0, string_to_sign.as_bytes()))
    }
}

/// Percent-encode a key segment or query component. Only unreserved
/// characters pass through, which is what SigV4 canonicalization expects.
fn sigv4_escape(s: &str) -> String {
    s.bytes().fold(String::with_capacity(s.len()), |mut out, b| {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            let _ = write!(out, "%{:02X}", b);
        }
        out
    })
}

static CONTENTS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<Contents>(.*?)</Contents>").expect("contents regex should compile")
});

static CONTENTS_FIELD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<(Key|Size|LastModified)>([^<]*)</").expect("field regex should compile")
});

static NEXT_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<NextContinuationToken>([^<]*)</NextContinuationToken>")
        .expect("token regex should compile")
});

static TRUNCATED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<IsTruncated>\s*true\s*</IsTruncated>").expect("truncation regex should compile")
});

/// One page of a `ListObjectsV2` response.
#[derive(Debug, Default)]
struct ListPage {
    objects: Vec<ObjectInfo>,
    /// Set only when the listing is truncated.
    next_token: Option<String>,
}

impl ListPage {
    fn parse(xml: &str) -> Self {
        let objects = CONTENTS
            .captures_iter(xml)
            .filter_map(|c| c.get(1).and_then(|m| firmware_object(m.as_str())))
            .collect();
        let next_token = if TRUNCATED.is_match(xml) {
            NEXT_TOKEN
                .captures(xml)
                .and_then(|c| c.get(1))
                .map(|m| unescape_xml(m.as_str()))
        } else {
            None
        };
        Self {
            objects,
            next_token,
        }
    }
}

/// Build an [`ObjectInfo`] from a `<Contents>` block. Folder markers
/// (keys ending in `/`) are skipped.
fn firmware_object(block: &str) -> Option<ObjectInfo> {
    let mut object = ObjectInfo {
        key: String::new(),
        size: 0,
        last_modified: 0,
    };
    for field in CONTENTS_FIELD.captures_iter(block) {
        let value = &field[2];
        match &field[1] {
            "Key" => object.key = unescape_xml(value),
            "Size" => object.size = value.trim().parse().unwrap_or(0),
            "LastModified" => {
                object.last_modified = chrono::DateTime::parse_from_rfc3339(value.trim())
                    .map(|dt| dt.timestamp())
                    .unwrap_or(0)
            }
            _ => {}
        }
    }
    (!object.key.is_empty() && !object.key.ends_with('/')).then_some(object)
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
