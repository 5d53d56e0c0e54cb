//! # Symbol cache CLI (`symcache`)
//!
//! ## Usage
//!
//! ```bash
//! symcache --config ./config/symcache.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `symcache init` | Create the SQLite database and run schema migrations |
//! | `symcache scan` | Extract and cache the symbols of one firmware |
//! | `symcache status` | Show the scan record of one device/OS/build |
//! | `symcache list` | List all scan records |
//! | `symcache firmware` | List firmware in the object store |
//! | `symcache symbolicate <file>` | Symbolicate a crash report |
//! | `symcache reclaim` | Delete firmware whose symbols are cached |
//! | `symcache watch` | Poll the object store and scan new firmware |
//! | `symcache serve` | Start the HTTP API with the background loops |
//! | `symcache stats` | Show cache statistics |
//!
//! Logging is controlled by `RUST_LOG` (default `info`) and goes to stderr.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use ipsw_symcache::commands;
use ipsw_symcache::config;
use ipsw_symcache::crash::CrashHints;
use ipsw_symcache::engine::{Engine, ScanSubmission};
use ipsw_symcache::migrate;
use ipsw_symcache::models::SourceRef;
use ipsw_symcache::server;

/// Extract iOS firmware symbols once, cache them, and serve fast crash
/// symbolication.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/symcache.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "symcache", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/symcache.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Extract and cache the symbols of one firmware image, waiting for the
    /// scan to finish.
    ///
    /// Without --object or --file the firmware is looked up in the object
    /// store by device, OS version and build.
    Scan {
        /// Device identifier (`iPhone15,2`) or marketing name.
        #[arg(long)]
        device: String,

        #[arg(long = "os")]
        os_version: String,

        #[arg(long = "build")]
        build_id: Option<String>,

        /// Object store key of the firmware.
        #[arg(long, conflicts_with = "file")]
        object: Option<String>,

        /// Local firmware file.
        #[arg(long)]
        file: Option<PathBuf>,

        /// Retry a failed scan immediately, ignoring backoff and attempt cap.
        #[arg(long)]
        force: bool,
    },

    /// Show the scan record of one device/OS/build.
    Status {
        device: String,
        os_version: String,
        build_id: String,

        #[arg(long)]
        json: bool,
    },

    /// List all scan records.
    List {
        #[arg(long)]
        json: bool,
    },

    /// List firmware in the object store with the parsed device, OS and build.
    Firmware {
        #[arg(long)]
        json: bool,
    },

    /// Symbolicate a crash report (`.ips` or legacy text). Use `-` for stdin.
    Symbolicate {
        path: PathBuf,

        /// Override the device named in the report.
        #[arg(long)]
        device: Option<String>,

        #[arg(long = "os")]
        os_version: Option<String>,

        #[arg(long = "build")]
        build_id: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Delete firmware whose symbols are cached and past retention.
    Reclaim,

    /// Poll the object store and scan new firmware.
    Watch {
        /// Run one poll, wait for the scans it started, and exit.
        #[arg(long)]
        once: bool,
    },

    /// Start the HTTP API, the watcher and the reclaimer.
    Serve,

    /// Show cache statistics.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let engine = Engine::from_config(&cfg).await?;

    match cli.command {
        Commands::Init => {}
        Commands::Scan {
            device,
            os_version,
            build_id,
            object,
            file,
            force,
        } => {
            let source = match (object, file) {
                (Some(key), _) => Some(SourceRef::Object(key)),
                (None, Some(path)) => Some(SourceRef::File(path)),
                (None, None) => None,
            };
            commands::run_scan(
                &engine,
                ScanSubmission {
                    source,
                    device,
                    os_version,
                    build_id,
                    force,
                },
            )
            .await?;
        }
        Commands::Status {
            device,
            os_version,
            build_id,
            json,
        } => {
            commands::run_status(&engine, &device, &os_version, &build_id, json).await?;
        }
        Commands::List { json } => {
            commands::run_list(&engine, json).await?;
        }
        Commands::Firmware { json } => {
            commands::run_firmware(&engine, json).await?;
        }
        Commands::Symbolicate {
            path,
            device,
            os_version,
            build_id,
            json,
        } => {
            let hints = CrashHints {
                device,
                os_version,
                build_id,
            };
            commands::run_symbolicate(&engine, &path, hints, json).await?;
        }
        Commands::Reclaim => {
            commands::run_reclaim(&engine).await?;
        }
        Commands::Watch { once } => {
            commands::run_watch(&engine, once).await?;
        }
        Commands::Serve => {
            server::run_server(engine).await?;
        }
        Commands::Stats => {
            commands::run_stats(&engine).await?;
        }
    }

    Ok(())
}
