use archive_backup::backup::backup_config::RunConfig;
use archive_backup::backup::engine::{CancellationToken, CopyProgress, CopyResult};
use archive_backup::backup::orchestrator::Orchestrator;
use archive_backup::backup::report::RunStatus;
use archive_backup::backup::schedule::run_scheduled;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use tracing::{error, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

static LOG_FILE_NAME: &str = "backup.log";
static PROGRESS_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({binary_bytes_per_sec}, {eta}) {msg}";

/// Back up files and directories into timestamped archives and prune old ones
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of config file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
    /// Go through the whole run without writing or deleting archives
    #[arg(long)]
    dry_run: bool,
    /// Keep running and back up on every tick of the configured `cron`
    #[arg(long)]
    daemon: bool,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Logs to stdout and to `backup.log` in the destination.
fn init_logging(destination: &Path) -> WorkerGuard {
    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(destination, LOG_FILE_NAME));
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer())
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .init();
    guard
}

/// Bytes committed by the copy workers, drawn on stderr when it is a terminal.
struct CopyProgressBar {
    bar: ProgressBar,
}

impl CopyProgressBar {
    fn new() -> Self {
        let style = ProgressStyle::with_template(PROGRESS_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        Self {
            bar: ProgressBar::new(0).with_style(style),
        }
    }
}

impl CopyProgress for CopyProgressBar {
    fn start(&self, units: usize, bytes: u64) {
        self.bar.reset();
        self.bar.set_length(bytes);
        self.bar.set_message(format!("{units} units"));
    }

    fn unit_done(&self, result: &CopyResult) {
        self.bar.inc(result.bytes);
        if result.is_failed() {
            self.bar.println(format!("{:?}: {}", result.unit.src, result.status));
        }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

fn main() {
    let args = Args::parse();

    let config = match RunConfig::from_path(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing_subscriber::fmt().with_env_filter(env_filter()).init();
            error!("{e}");
            exit(RunStatus::Failed.exit_code());
        }
    };
    let log_guard = init_logging(config.destination());

    let cancel = CancellationToken::new();
    let handler_cancel = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        warn!("Interrupted, stopping after the units in flight");
        handler_cancel.cancel();
    }) {
        warn!("Cannot install signal handler: {e}");
    }

    let progress: Arc<dyn CopyProgress> = Arc::new(CopyProgressBar::new());
    let code = if args.daemon {
        match run_scheduled(&config, args.dry_run, &cancel, Some(progress)) {
            Ok(Some(report)) => report.exit_code(),
            Ok(None) => RunStatus::Success.exit_code(),
            Err(e) => {
                error!("{e}");
                RunStatus::Failed.exit_code()
            }
        }
    } else {
        let report = Orchestrator::new(&config, cancel)
            .with_progress(Some(progress))
            .run(args.dry_run);
        report.log_summary();
        report.exit_code()
    };

    drop(log_guard);
    exit(code);
}
