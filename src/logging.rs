//! Tracing setup for the binaries.
//!
//! `RUST_LOG` overrides the default filter in both modes.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const DEFAULT_FILTER: &str = "fnb_updater=info,fnb_update=info,swap_executor=info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Log to stderr only. Used by the interactive CLI.
pub fn init_console() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter())
        .init();
}

/// Log to stderr and to `logs_dir()/swap-executor.log`.
///
/// The executor runs detached with its standard streams closed, so the file
/// is the only place its output survives. Keep the returned guard alive until
/// exit so buffered lines are flushed. Falls back to stderr only when the log
/// file cannot be opened.
pub fn init_swap_executor() -> Option<WorkerGuard> {
    let dir = crate::app_dirs::logs_dir();
    let appender = std::fs::create_dir_all(&dir)
        .map_err(|e| e.to_string())
        .and_then(|()| {
            RollingFileAppender::builder()
                .rotation(Rotation::NEVER)
                .filename_prefix("swap-executor")
                .filename_suffix("log")
                .build(&dir)
                .map_err(|e| e.to_string())
        });

    match appender {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(env_filter())
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        Err(e) => {
            init_console();
            tracing::warn!(dir = %dir.display(), "cannot open swap executor log: {e}");
            None
        }
    }
}
