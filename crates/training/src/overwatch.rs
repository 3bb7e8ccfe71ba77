use std::fs;
use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{LogLevel, TrainingError};

pub const BANNER: &str = "[*] Launching GPT-2 training =>>>";

/// Keeps the file sink alive; dropping it flushes buffered lines.
pub struct Overwatch {
    log_file: PathBuf,
    _guard: WorkerGuard,
}

impl Overwatch {
    pub fn log_file(&self) -> &Path {
        &self.log_file
    }
}

/// Level actually emitted by a process: the configured one on the primary
/// process, errors only elsewhere.
pub fn effective_level(level: LogLevel, rank: i64) -> tracing::Level {
    if rank <= 0 {
        level.as_tracing()
    } else {
        tracing::Level::ERROR
    }
}

/// Installs console and file logging for the launch. `RUST_LOG` refines the
/// filter when set.
pub fn init(log_file: &Path, level: LogLevel, rank: i64) -> Result<Overwatch, TrainingError> {
    let dir = log_file.parent().unwrap_or_else(|| Path::new("."));
    let file_name = log_file
        .file_name()
        .ok_or_else(|| {
            TrainingError::initialization(format!("log path {} has no file name", log_file.display()))
        })?
        .to_os_string();
    fs::create_dir_all(dir)?;

    let level = effective_level(level, rank);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|err| {
            TrainingError::initialization(format!("failed to install logging: {err}"))
        })?;

    Ok(Overwatch {
        log_file: log_file.to_path_buf(),
        _guard: guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secondary_ranks_only_log_errors() {
        assert_eq!(effective_level(LogLevel::Debug, -1), tracing::Level::DEBUG);
        assert_eq!(effective_level(LogLevel::Warning, 0), tracing::Level::WARN);
        assert_eq!(effective_level(LogLevel::Debug, 3), tracing::Level::ERROR);
        assert_eq!(effective_level(LogLevel::Critical, 0), tracing::Level::ERROR);
    }
}
