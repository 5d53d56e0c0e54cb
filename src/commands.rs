//! CLI command implementations.
//!
//! Each `run_*` function backs one `symcache` subcommand: it drives the
//! [`Engine`] and prints results to stdout. Logs go to stderr, so output
//! can be piped. Commands that start a scan wait for it to finish, since a
//! scan task does not outlive the process.

use anyhow::{Context, Result};
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use crate::crash::CrashHints;
use crate::engine::{Engine, ScanSubmission};
use crate::error::SymcacheError;
use crate::models::{CacheKey, ScanRecord, ScanStatus};
use crate::orchestrator::ScanOutcome;
use crate::router::SymbolicatedOutput;
use crate::stats::{
    collect_stats, format_bytes, format_ts_iso, format_ts_relative, print_disk_usage, print_stats,
};

/// How long a foreground command waits for a scan: the extractor timeout
/// plus a margin for fetching and persisting.
fn foreground_wait(engine: &Engine) -> Duration {
    engine.config.extractor.timeout() + Duration::from_secs(120)
}

fn poll_interval(engine: &Engine) -> Duration {
    Duration::from_millis(engine.config.router.poll_interval_ms)
}

pub async fn run_scan(engine: &Engine, submission: ScanSubmission) -> Result<()> {
    let handle = engine.submit(submission).await?;
    let key = handle.record.key();

    match handle.outcome {
        ScanOutcome::AlreadyCompleted => {
            println!(
                "{}: already cached ({} symbols)",
                key, handle.record.symbols_extracted
            );
            return Ok(());
        }
        ScanOutcome::RetryDeferred => {
            println!(
                "{}: last scan failed ({}); retry later or pass --force",
                key,
                handle.record.error_message.as_deref().unwrap_or("unknown error")
            );
            return Ok(());
        }
        ScanOutcome::Started => println!("{}: scanning {}", key, handle.record.source),
        ScanOutcome::AlreadyRunning => println!("{}: scan already running, waiting", key),
    }

    let record = engine
        .orchestrator
        .wait_for(&key, foreground_wait(engine), poll_interval(engine))
        .await?;
    println!(
        "{}: completed, {} symbols extracted",
        key, record.symbols_extracted
    );
    Ok(())
}

pub async fn run_status(
    engine: &Engine,
    device: &str,
    os_version: &str,
    build_id: &str,
    json: bool,
) -> Result<()> {
    let device = engine
        .resolver
        .resolve(device)
        .map_err(|e| SymcacheError::BadRequest(e.to_string()))?;
    let key = CacheKey::new(&device, os_version, build_id);
    let Some(record) = engine.store.get(&key).await? else {
        anyhow::bail!("no scan record for {}", key);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    println!("{}", key);
    println!("  status:     {}", record.status);
    println!("  source:     {}", record.source);
    println!("  size:       {}", format_bytes(record.file_size_bytes.max(0) as u64));
    println!("  attempts:   {}", record.attempts);
    if record.status == ScanStatus::Completed {
        println!("  symbols:    {}", record.symbols_extracted);
    }
    if let Some(err) = &record.error_message {
        println!("  error:      {}", err);
    }
    println!("  created:    {}", format_ts_iso(record.created_at));
    if let Some(ts) = record.scan_started_at {
        println!("  started:    {}", format_ts_iso(ts));
    }
    if let Some(ts) = record.scan_completed_at {
        println!("  completed:  {}", format_ts_iso(ts));
    }
    match record.source_deleted_at {
        Some(ts) => println!("  reclaimed:  {}", format_ts_iso(ts)),
        None if record.can_delete_source => println!("  reclaimed:  pending"),
        None => {}
    }
    if let Some(ts) = record.last_accessed_at {
        println!(
            "  last hit:   {} ({} total)",
            format_ts_relative(ts),
            record.access_count
        );
    }
    Ok(())
}

pub async fn run_list(engine: &Engine, json: bool) -> Result<()> {
    let records = engine.store.list().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No scan records.");
        return Ok(());
    }

    println!(
        "{:<14} {:<10} {:<10} {:<10} {:>8}  {}",
        "DEVICE", "OS", "BUILD", "STATUS", "SYMBOLS", "SOURCE"
    );
    println!("{}", "-".repeat(72));
    for record in &records {
        print_record_row(record);
    }
    println!();
    println!("{} record(s)", records.len());
    Ok(())
}

fn print_record_row(record: &ScanRecord) {
    let source = if record.source_deleted_at.is_some() {
        "(reclaimed)".to_string()
    } else {
        record.source.location()
    };
    println!(
        "{:<14} {:<10} {:<10} {:<10} {:>8}  {}",
        record.device_identifier,
        record.os_version,
        record.build_id,
        record.status,
        record.symbols_extracted,
        source
    );
}

pub async fn run_firmware(engine: &Engine, json: bool) -> Result<()> {
    let entries = engine.firmware_listing().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!("Firmware in {}", engine.objects.describe());
    if entries.is_empty() {
        println!("  (none)");
        return Ok(());
    }
    for entry in &entries {
        let parsed = match (&entry.parsed, &entry.device_identifier) {
            (Some(name), Some(device)) => format!(
                "{} {} {}",
                device,
                name.os_version,
                name.build_id.as_deref().unwrap_or("(no build)")
            ),
            (Some(name), None) => format!("unresolved device {:?}", name.device),
            (None, _) => "unrecognised name".to_string(),
        };
        println!(
            "  {:<56} {:>10}  {}",
            entry.object.key,
            format_bytes(entry.object.size.max(0) as u64),
            parsed
        );
    }
    Ok(())
}

/// Symbolicate a crash report read from `path` (`-` for stdin).
pub async fn run_symbolicate(
    engine: &Engine,
    path: &Path,
    hints: CrashHints,
    json: bool,
) -> Result<()> {
    let crash = read_input(path)?;

    let output = match engine.router.symbolicate(&crash, &hints).await {
        Err(SymcacheError::InProgress { key }) => {
            eprintln!("Symbols for {} are being extracted, waiting...", key);
            engine
                .orchestrator
                .wait_for(&key, foreground_wait(engine), poll_interval(engine))
                .await?;
            engine.router.symbolicate(&crash, &hints).await?
        }
        other => other?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_symbolicated(&output);
    }
    Ok(())
}

fn read_input(path: &Path) -> Result<Vec<u8>> {
    if path.as_os_str() == "-" {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("Failed to read crash report from stdin")?;
        Ok(buf)
    } else {
        std::fs::read(path)
            .with_context(|| format!("Failed to read crash report: {}", path.display()))
    }
}

fn print_symbolicated(output: &SymbolicatedOutput) {
    eprintln!(
        "{}: {} of {} frames resolved ({} symbols{})",
        output.key,
        output.resolved,
        output.resolved + output.unresolved,
        output.symbol_count,
        if output.from_cache { ", cached" } else { "" }
    );
    print!("{}", output.symbolicated_text);
    if !output.symbolicated_text.ends_with('\n') {
        println!();
    }
}

pub async fn run_reclaim(engine: &Engine) -> Result<()> {
    let report = engine.reclaimer().sweep().await?;
    println!(
        "Reclaimed {} of {} eligible firmware ({}), {} failed, {} local file(s) kept",
        report.deleted,
        report.candidates,
        format_bytes(report.bytes_reclaimed.max(0) as u64),
        report.failed,
        report.kept_files
    );
    Ok(())
}

/// Poll the object store. With `once`, run a single tick and wait for the
/// scans it started; otherwise run until interrupted.
pub async fn run_watch(engine: &Engine, once: bool) -> Result<()> {
    let mut watcher = engine.watcher();

    if !once {
        if engine.config.reclaimer.enabled {
            let wake = engine.orchestrator.completion_signal();
            tokio::spawn(engine.reclaimer().run(wake));
        }
        watcher.run().await;
        return Ok(());
    }

    let report = watcher.tick().await;
    println!(
        "Listed {} object(s): {} changed, {} submitted, {} in cooldown, {} skipped, {} error(s)",
        report.listed,
        report.changed,
        report.submitted,
        report.cooled_down,
        report.skipped,
        report.errors
    );

    let started: Vec<CacheKey> = watcher
        .status()
        .read()
        .await
        .recent_submissions
        .iter()
        .filter(|s| s.outcome == Some(ScanOutcome::Started))
        .map(|s| s.key.clone())
        .collect();

    let mut failures = 0;
    for key in started {
        match engine
            .orchestrator
            .wait_for(&key, foreground_wait(engine), poll_interval(engine))
            .await
        {
            Ok(record) => println!("  {}: {} symbols", key, record.symbols_extracted),
            Err(e) => {
                failures += 1;
                println!("  {}: {}", key, e);
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{} scan(s) failed", failures);
    }
    Ok(())
}

pub async fn run_stats(engine: &Engine) -> Result<()> {
    let stats = collect_stats(&engine.store, &engine.config.db.path).await?;
    print_stats(&stats, &engine.config.db.path);
    match engine.disk_usage().await {
        Ok(usage) => print_disk_usage(&usage),
        Err(e) => eprintln!("Disk usage unavailable: {}", e),
    }
    Ok(())
}
