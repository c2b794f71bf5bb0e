//! Logging setup.
//!
//! Interactive runs with `--verbose` log to stderr. Otherwise logs go to
//! systemd's journal on Linux, falling back to a daily rolling file.

use anyhow::Result;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging system.
///
/// Log level is controlled via the `PHOTOMIGRATE_LOG` environment variable
/// (`debug`, `info`, `warn`, `error`, or any `EnvFilter` directive). The
/// default is `info`, or `debug` for this crate when `to_stderr` is set.
pub fn init(log_dir: Option<PathBuf>, to_stderr: bool) -> Result<()> {
    let default_directive = if to_stderr { "info,photomigrate=debug" } else { "info" };
    let env_filter = EnvFilter::try_from_env("PHOTOMIGRATE_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    if to_stderr {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .init();
        return Ok(());
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(journald_layer.with_syslog_identifier("photomigrate".to_string()))
                .init();

            tracing::info!("Logging initialized with journald backend");
            return Ok(());
        }
    }

    let log_dir = log_dir.unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "photomigrate.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Dropping the guard stops the writer thread; keep it for the process lifetime.
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> = std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    tracing::info!("Logging initialized with file backend at {:?}", log_dir);
    Ok(())
}

pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("photomigrate")
        .join("logs")
}
