//! # IPSW Symbol Cache
//!
//! Extracts kernel symbols from iOS firmware images (IPSW) once, caches them
//! in SQLite, and serves crash symbolication from the cache.
//!
//! Symbol extraction takes minutes and firmware images are gigabytes; crash
//! symbolication should take milliseconds. The cache sits between the two:
//! firmware uploaded to an object store is scanned in the background, crash
//! reports are symbolicated against cached symbols, and firmware whose
//! symbols are safely cached is deleted to reclaim storage.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Object store │──▶│   Watcher    │──▶│ Orchestrator │──▶ extractor tool
//! │  (FS / S3)   │   └──────────────┘   └──────┬───────┘
//! └──────┬───────┘                             │ claim / complete / fail
//!        │ delete                              ▼
//! ┌──────┴───────┐                     ┌──────────────┐
//! │  Reclaimer   │◀────── completed ───│ Symbol store │
//! └──────────────┘                     │   (SQLite)   │
//!                                      └──────┬───────┘
//!                   ┌──────────┐              │
//!   crash report ──▶│  Router  │◀─────────────┘
//!                   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! symcache init                                   # create database
//! symcache firmware                               # what the store holds
//! symcache scan --device iPhone15,2 --os 17.5     # extract one build
//! symcache symbolicate panic.ips                  # symbolicate a report
//! symcache serve                                  # HTTP API + background loops
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Cache keys, scan records, symbols |
//! | [`error`] | Error taxonomy |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`store`] | Symbol store and atomic scan claims |
//! | [`object_store`] | Filesystem and S3 firmware stores |
//! | [`extractor`] | External symbol extraction tool |
//! | [`symbols`] | Extractor output parsing and address lookup |
//! | [`firmware`] | Firmware file name conventions |
//! | [`devices`] | Marketing name to identifier mapping |
//! | [`crash`] | Crash report parsing |
//! | [`orchestrator`] | At-most-once scan scheduling |
//! | [`watcher`] | Object store polling |
//! | [`router`] | Crash symbolication routing |
//! | [`reclaimer`] | Firmware deletion after caching |
//! | [`stats`] | Cache statistics |
//! | [`engine`] | Component wiring |
//! | [`commands`] | CLI command implementations |
//! | [`server`] | HTTP API |

pub mod commands;
pub mod config;
pub mod crash;
pub mod db;
pub mod devices;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod firmware;
pub mod migrate;
pub mod models;
pub mod object_store;
pub mod orchestrator;
pub mod reclaimer;
pub mod router;
pub mod server;
pub mod stats;
pub mod store;
pub mod symbols;
pub mod watcher;
