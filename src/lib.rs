//! # app_vault
//!
//! Backs up and restores application data directories through a privileged
//! shell, on demand or on recurring schedules.
//!
//! ## Features
//!
//! - **Two archive strategies**: an in-process tar stream, or the shell's own `tar`;
//!   either restores what the other wrote
//! - **Compression and encryption**: gzip, then AES-256-GCM in authenticated chunks
//! - **Schedules**: daily-interval schedules persisted in SQLite, fired by alarms
//! - **Batches**: per-package work items run in parallel with an aggregated result
//! - **Housekeeping**: a fixed number of backup revisions and log records kept
//!
//! ## Quick Start
//!
//! ```no_run
//! use app_vault::backup::app_config::AppConfig;
//!
//! let config = AppConfig::load("config.yml")?;
//! let (fired_tx, fired_rx) = std::sync::mpsc::channel();
//! let app = config.build(fired_tx)?;
//! app.shell.init()?;
//! app.service.run_daemon(fired_rx)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
