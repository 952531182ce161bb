use crate::config::LogTarget;
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::Path;
use tracing::Span;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::{self, WorkerGuard};
use tracing_subscriber::EnvFilter;

pub struct LoggingGuard {
    _worker: Option<WorkerGuard>,
}

impl LoggingGuard {
    pub fn none() -> Self {
        Self { _worker: None }
    }

    pub fn with_guard(guard: WorkerGuard) -> Self {
        Self {
            _worker: Some(guard),
        }
    }
}

/// Installs the global subscriber. Console logs go to stderr since stdout may
/// carry the flow records. `RUST_LOG` overrides `level` when set.
pub fn init_logging(target: &LogTarget, level: LevelFilter) -> Result<LoggingGuard> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    match target {
        LogTarget::Stderr => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .init();
            Ok(LoggingGuard::none())
        }
        LogTarget::File(file_path) => {
            let file = open_log_file(file_path)?;
            let (writer, guard) = non_blocking::NonBlockingBuilder::default().finish(file);

            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .init();

            Ok(LoggingGuard::with_guard(guard))
        }
    }
}

fn open_log_file(file_path: &Path) -> Result<std::fs::File> {
    if let Some(parent) = file_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {parent:?}"))?;
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(file_path)
        .with_context(|| format!("Failed to open log file {file_path:?}"))
}

/// Span every pipeline event for one capture is recorded under.
pub fn pipeline_span(capture: &Path) -> Span {
    tracing::info_span!("convert", capture = %capture.display())
}
