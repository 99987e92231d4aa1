use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE_PREFIX: &str = "kiln-daemon.log";

/// Installs the global subscriber: human-readable output on stdout plus a daily rolling
/// file under `<data_root>/logs`. `RUST_LOG` overrides the default `info` filter.
///
/// Keep the returned guard alive for as long as file output is wanted.
pub fn init(data_root: &Path) -> anyhow::Result<WorkerGuard> {
    let dir = data_root.join("logs");
    std::fs::create_dir_all(&dir)?;
    let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
    let (file, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_writer(file).with_ansi(false).with_target(false))
        .try_init()
        .map_err(|e| anyhow::anyhow!("init tracing: {e}"))?;
    Ok(guard)
}
