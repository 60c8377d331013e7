//! # archive_backup
//!
//! Scheduled backups of files and directories into timestamped tar archives.
//!
//! ## Features
//!
//! - **Sources**: files and directories with include/exclude glob patterns,
//!   deduplicated and cycle-safe
//! - **Exclusive runs**: a lock file in the destination, stale locks are reclaimed
//! - **Parallel copy**: a bounded worker pool feeding a single archive writer
//! - **Compression**: XZ (LZMA) with parallel processing
//! - **Retention**: keep the last N archives and/or archives newer than a duration
//! - **Dry run**: the same run, without writing or deleting anything
//!
//! ## Quick Start
//!
//! ```no_run
//! use archive_backup::backup::backup_config::RunConfig;
//! use archive_backup::backup::orchestrator;
//!
//! let config = RunConfig::from_path("config.yaml")?;
//! let report = orchestrator::run(&config, false);
//! report.log_summary();
//! std::process::exit(report.exit_code());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
