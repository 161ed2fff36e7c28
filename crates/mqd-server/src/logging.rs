//! Tracing initialization. Grounded in the donor's `tracing_subscriber`
//! registry setup, minus the dashboard-facing broadcast layer this daemon
//! has no use for.

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global subscriber: an `EnvFilter` (default `mqd_server=info,
/// mqd_core=info,mqd_review=info,tower_http=warn`) plus either a plain-text
/// or JSON `fmt` layer, writing to stdout and to a daily-rotated file under
/// `log_path` via `tracing-appender`.
pub fn init(log_path: &str, json: bool) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(log_path)
        .with_context(|| format!("failed to create log directory {log_path:?}"))?;
    let file_appender = tracing_appender::rolling::daily(log_path, "mqd.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "mqd_server=info,mqd_core=info,mqd_review=info,tower_http=warn".into()
    });

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .with(file_layer.json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .with(file_layer)
            .init();
    }

    Ok(guard)
}
