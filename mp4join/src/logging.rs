//! Logging setup.
//!
//! Console output is always on; a daily-rotated log file is added when a
//! log directory is configured. Timestamps use the server's local
//! timezone via chrono.

use std::path::PathBuf;

use chrono::Local;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::error::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "mp4join=info,tower_http=info";

/// Custom timer that uses the local timezone via chrono.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Initialize logging.
///
/// Returns a worker guard when file logging is enabled; keep it alive for
/// the process lifetime or buffered log lines are lost on exit.
pub fn init_logging(log_dir: Option<&str>) -> Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(true).with_timer(LocalTimer));

    match log_dir {
        Some(dir) => {
            let log_path = PathBuf::from(dir);
            std::fs::create_dir_all(&log_path)?;

            let file_appender = tracing_appender::rolling::daily(&log_path, "mp4join.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            registry
                .with(
                    fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_timer(LocalTimer),
                )
                .try_init()
                .map_err(|e| Error::config(format!("failed to set subscriber: {e}")))?;

            Ok(Some(guard))
        }
        None => {
            registry
                .try_init()
                .map_err(|e| Error::config(format!("failed to set subscriber: {e}")))?;

            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        assert!(DEFAULT_LOG_FILTER.contains("mp4join=info"));
        assert!(DEFAULT_LOG_FILTER.contains("tower_http=info"));
    }
}
