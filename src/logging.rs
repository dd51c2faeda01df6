//! Tracing setup for the toolhub binary.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use crate::mcp_client::LoggingConfig;

/// Log file name inside the configured directory.
pub const LOG_FILE_NAME: &str = "toolhub.log";

/// Filter used when neither `RUST_LOG` nor the config sets one.
const DEFAULT_FILTER: &str = "toolhub=info,warn";

/// Initialize the tracing subscriber.
///
/// With a log directory configured:
/// 1. Rotates existing logs (toolhub.log → toolhub.log.1 → … → .keep).
/// 2. Opens a fresh toolhub.log with a line-flushing writer.
///
/// Otherwise logs go to stderr (stdout is left alone). Returns the log file
/// path, if any.
pub fn init_tracing(config: &LoggingConfig) -> std::io::Result<Option<PathBuf>> {
    let (writer, log_path) = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let log_path = dir.join(LOG_FILE_NAME);
            rotate_log_file(&log_path, config.keep);
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)?;
            (BoxMakeWriter::new(FlushingWriter::new(file)), Some(log_path))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.filter.as_deref().unwrap_or(DEFAULT_FILTER))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(std::io::Error::other)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?log_path.as_ref().map(|p| p.display().to_string()),
        pid = std::process::id(),
        "=== toolhub starting ==="
    );
    Ok(log_path)
}

/// Rotate log files: `toolhub.log` → `toolhub.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    if keep == 0 {
        let _ = std::fs::remove_file(base_path);
        return;
    }

    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write, so
/// each log line is on disk even if the process is killed.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
