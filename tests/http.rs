#![cfg(unix)]

use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::RwLock;

use ipsw_symcache::config::parse_config;
use ipsw_symcache::engine::Engine;
use ipsw_symcache::server::{router, AppState};
use ipsw_symcache::watcher::WatcherStatus;

const SYMBOLS: &str = r#"{"0xfffffff007004000": "_panic", "0xfffffff007123400": "_vm_fault"}"#;

const CRASH: &str = "Hardware Model: iPhone15,2\n\
OS Version: iPhone OS 17.5 (21F79)\n\
Thread 0 Crashed:\n\
0   kernel   0xfffffff007123456\n";

/// Serve the API on an ephemeral port. The extractor is `cat`, so a
/// firmware file's content is its symbol table.
async fn serve(root: &Path) -> String {
    fs::create_dir_all(root.join("ipsw")).unwrap();
    let config = parse_config(&format!(
        r#"[db]
path = "{root}/symcache.sqlite"

[object_store]
kind = "filesystem"
root = "{root}/ipsw"

[extractor]
command = "cat"
args = ["{{firmware}}"]
scratch_dir = "{root}/scratch"

[router]
wait_timeout_secs = 10
poll_interval_ms = 20

[reclaimer]
retention_secs = 0
"#,
        root = root.display()
    ))
    .unwrap();

    let engine = Engine::from_config(&config).await.unwrap();
    let state = AppState {
        engine,
        watcher: Arc::new(RwLock::new(WatcherStatus::default())),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn health_reports_version() {
    let tmp = TempDir::new().unwrap();
    let base = serve(tmp.path()).await;

    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn symbolicate_scan_and_inspect() {
    let tmp = TempDir::new().unwrap();
    let base = serve(tmp.path()).await;
    let client = reqwest::Client::new();

    // Nothing uploaded yet.
    let resp = client
        .post(format!("{}/v1/symbolicate", base))
        .body(CRASH)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("iPhone15,2_17.5_21F79_Restore.ipsw"));

    fs::write(
        tmp.path().join("ipsw/iPhone15,2_17.5_21F79_Restore.ipsw"),
        SYMBOLS,
    )
    .unwrap();

    let firmware: Value = client
        .get(format!("{}/v1/firmware", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(firmware["firmware"][0]["device_identifier"], "iPhone15,2");
    assert_eq!(firmware["firmware"][0]["parsed"]["build_id"], "21F79");

    let resp = client
        .post(format!("{}/v1/scans", base))
        .json(&json!({"device": "iPhone15,2", "os_version": "17.5", "wait": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["outcome"], "started");
    assert_eq!(body["finished"]["status"], "completed");
    assert_eq!(body["finished"]["symbols_extracted"], 2);

    let resp = client
        .post(format!("{}/v1/symbolicate", base))
        .body(CRASH)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["from_cache"], true);
    assert_eq!(body["frames"][0]["symbol"], "_vm_fault+0x56");

    let record: Value = client
        .get(format!("{}/v1/scans/iPhone15,2/17.5/21F79", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(record["status"], "completed");
    assert_eq!(record["access_count"], 1);

    let stats: Value = client
        .get(format!("{}/v1/stats", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["completed"], 1);
    assert_eq!(stats["symbols"], 2);

    let usage: Value = client
        .get(format!("{}/v1/disk-usage", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(usage["firmware_objects"], 1);
    assert_eq!(usage["firmware_bytes"], SYMBOLS.len());
    assert_eq!(usage["scratch_files"], 0);
    assert!(usage["db_size_bytes"].as_u64().unwrap() > 0);

    let resp = client
        .post(format!("{}/v1/reclaim", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let report: Value = resp.json().await.unwrap();
    assert_eq!(report["candidates"], 1);
    assert_eq!(report["deleted"], 1);
    assert_eq!(report["bytes_reclaimed"], SYMBOLS.len());
    assert!(!tmp.path().join("ipsw/iPhone15,2_17.5_21F79_Restore.ipsw").exists());

    let usage: Value = client
        .get(format!("{}/v1/disk-usage", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(usage["firmware_objects"], 0);

    // Reclaimed firmware is still symbolicated from the cache.
    let body: Value = client
        .post(format!("{}/v1/symbolicate", base))
        .body(CRASH)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["from_cache"], true);
}

#[tokio::test]
async fn bad_requests_use_the_error_body() {
    let tmp = TempDir::new().unwrap();
    let base = serve(tmp.path()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/v1/symbolicate", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let resp = client
        .get(format!("{}/v1/scans/iPhone15,2/17.5/21F79", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .post(format!("{}/v1/scans", base))
        .json(&json!({"source": "file", "device": "iPhone15,2", "os_version": "17.5"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}
