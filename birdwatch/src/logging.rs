use anyhow::Result;
use std::path::Path;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// Initialize tracing output: to a file when one is given, otherwise to
/// stderr. Filter priority: `--log-level`, then `RUST_LOG`, then `warn`.
pub fn initialize_logging(log_level: Option<&str>, log_file: Option<&Path>) -> Result<()> {
    let filter = || {
        let default = log_level.unwrap_or("warn").to_string();
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default))
    };

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(file)
                .with_filter(filter());
            tracing_subscriber::registry().with(layer).try_init().ok();
        }
        None => {
            let layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(filter());
            tracing_subscriber::registry().with(layer).try_init().ok();
        }
    }
    Ok(())
}
