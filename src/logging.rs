use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Name of the log file created inside `log_dir`.
const LOG_FILE: &str = "tonika.log";

/// Initialize logging. `RUST_LOG` wins over the configured level; when
/// `log_dir` is empty, log lines go to stderr.
pub fn init(log_dir: &str, log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .with_context(|| format!("invalid log level '{log_level}'"))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if log_dir.is_empty() {
        builder.with_writer(std::io::stderr).init();
    } else {
        let path = std::path::Path::new(log_dir).join(LOG_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("cannot open log file '{}'", path.display()))?;
        builder.with_ansi(false).with_writer(Arc::new(file)).init();
    }

    Ok(())
}
