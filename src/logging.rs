//! Tracing setup shared by the binaries: stdout plus one append-only file.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// `logs/[{prefix}_]market_maker.log`, or `LOG_FILE` when set.
pub fn log_path(prefix: Option<&str>) -> PathBuf {
    if let Ok(v) = std::env::var("LOG_FILE") {
        if !v.trim().is_empty() {
            return PathBuf::from(v.trim());
        }
    }
    let name = match prefix.filter(|p| !p.is_empty()) {
        Some(p) => format!("{p}_market_maker.log"),
        None => "market_maker.log".to_string(),
    };
    PathBuf::from("logs").join(name)
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(std::env::var("LOG_LEVEL").unwrap_or_default()))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Keep the guard alive for the whole process
/// or buffered file lines are lost on exit.
pub fn init(prefix: Option<&str>) -> anyhow::Result<WorkerGuard> {
    let path = log_path(prefix);
    let dir = path
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("log path {} has no file name", path.display()))?;
    std::fs::create_dir_all(&dir)?;

    let appender = tracing_appender::rolling::never(&dir, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .try_init()?;

    tracing::info!("📝 logging to {}", path.display());
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_follows_prefix() {
        // LOG_FILE is not set in the test environment
        if std::env::var("LOG_FILE").is_ok() {
            return;
        }
        assert_eq!(log_path(None), PathBuf::from("logs/market_maker.log"));
        assert_eq!(log_path(Some("")), PathBuf::from("logs/market_maker.log"));
        assert_eq!(log_path(Some("acct1")), PathBuf::from("logs/acct1_market_maker.log"));
    }
}
