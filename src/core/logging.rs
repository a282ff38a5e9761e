use std::path::Path;

use thiserror::Error;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::shared::paths::ensure_dir;

/// Target used by every recorder log line; routed to its own file.
const RECORDER_TARGET: &str = "screencast";

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Failed to create logs directory: {0}")]
    CreateDir(#[from] std::io::Error),
    #[error("Failed to set global tracing subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Guards that must be kept alive to ensure logs are flushed
pub struct LoggingGuards {
    _guards: Vec<WorkerGuard>,
}

/// Routes recorder events to `screencast.log`, everything else to `system.log`.
struct TargetWriter {
    recorder_writer: NonBlocking,
    system_writer: NonBlocking,
}

impl TargetWriter {
    fn writer_for(&self, target: &str) -> &NonBlocking {
        if is_recorder_target(target) {
            &self.recorder_writer
        } else {
            &self.system_writer
        }
    }
}

fn is_recorder_target(target: &str) -> bool {
    target == RECORDER_TARGET || target.starts_with(&format!("{}::", RECORDER_TARGET))
}

impl<'a> MakeWriter<'a> for TargetWriter {
    type Writer = NonBlocking;

    fn make_writer(&'a self) -> Self::Writer {
        self.system_writer.clone()
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        self.writer_for(meta.target()).clone()
    }
}

/// Installs the global subscriber writing daily-rotated files under `log_dir`.
///
/// The filter comes from `RUST_LOG`, defaulting to `info`.
pub fn init_logging(log_dir: &Path) -> Result<LoggingGuards, LoggingError> {
    ensure_dir(log_dir)?;

    let recorder_appender = RollingFileAppender::new(
        Rotation::DAILY,
        log_dir,
        format!("{}.log", RECORDER_TARGET),
    );
    let (recorder_writer, recorder_guard) = tracing_appender::non_blocking(recorder_appender);

    let system_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "system.log");
    let (system_writer, system_guard) = tracing_appender::non_blocking(system_appender);

    let writer = TargetWriter {
        recorder_writer,
        system_writer,
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::registry().with(env_filter).with(
        tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false),
    );

    tracing::subscriber::set_global_default(subscriber)?;

    tracing::info!(target: "system", "Logging initialized at {:?}", log_dir);

    Ok(LoggingGuards {
        _guards: vec![recorder_guard, system_guard],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_targets_are_routed() {
        assert!(is_recorder_target("screencast"));
        assert!(is_recorder_target("screencast::writer"));
        assert!(!is_recorder_target("screencaster"));
        assert!(!is_recorder_target("system"));
    }

    #[test]
    fn test_init_creates_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");

        let guards = init_logging(&log_dir).unwrap();
        tracing::info!(target: "screencast", "[TEST] hello");
        drop(guards);

        assert!(log_dir.is_dir());
        // A second global subscriber is refused rather than panicking
        assert!(matches!(
            init_logging(&log_dir),
            Err(LoggingError::SetSubscriber(_))
        ));
    }
}
