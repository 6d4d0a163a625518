use std::{
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use tokio::sync::RwLock;
use tracing::{debug, info, metadata::LevelFilter, trace, Level};
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Lines written to the log file are flushed when this is dropped.
static FILE_GUARD: Mutex<Option<WorkerGuard>> = Mutex::new(None);

const LOG_FILE_PREFIX: &str = "harness-keel.log";

fn file_writer(dir: &Path) -> (NonBlocking, WorkerGuard) {
    tracing_appender::non_blocking(RollingFileAppender::new(
        Rotation::DAILY,
        dir,
        LOG_FILE_PREFIX,
    ))
}

fn do_init(stdout_level: Level, file_logging: Option<(Level, PathBuf)>) {
    let mut message = String::from("Logging with: stdout");

    // RUST_LOG wins over the level asked for.
    let stdout_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(stdout_level).into())
        .from_env_lossy();

    let stdout_layer = tracing_subscriber::fmt::layer().with_filter(stdout_filter);

    let registry = tracing_subscriber::registry().with(stdout_layer);

    let file_layer = file_logging.map(|(level, dir)| {
        message += &format!(", daily file in {dir:?}");

        let (writer, guard) = file_writer(&dir);
        *FILE_GUARD.lock().unwrap_or_else(PoisonError::into_inner) = Some(guard);

        tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_filter(LevelFilter::from(level))
    });

    // Tests may have installed a subscriber already.
    if registry.with(file_layer).try_init().is_err() {
        message += " (a global subscriber was already set)";
    }

    debug!(message);
}

/// Initialize tracing.
///
/// Will only initialize once, so tests may call this.
pub async fn init(stdout_level: Level, file_logging: Option<(Level, PathBuf)>) {
    static TRACING_IS_INITIALIZED: RwLock<bool> = RwLock::const_new(false);

    if *TRACING_IS_INITIALIZED.read().await {
        return;
    }

    let mut initialized = TRACING_IS_INITIALIZED.write().await;

    // Someone may have come between the read and the write.
    if !*initialized {
        do_init(stdout_level, file_logging);
        *initialized = true;
        info!("Logging initialized");
    }
}

/// Flush the log file, if logging to one.
/// Nothing more is written to the file after this.
pub fn shutdown() {
    trace!("Flushing log file");

    let guard = FILE_GUARD
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    drop(guard);
}
