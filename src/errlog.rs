use chrono::{Local, NaiveDateTime};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Persistent, append-only record of user-visible failures.
#[derive(Debug)]
pub struct ErrorLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ErrorLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ErrorLog {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry stamped with the local time. Failing to write the
    /// error log is reported through tracing and otherwise ignored.
    pub fn record(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::error!("{}", message);
        if let Err(e) = self.record_at(Local::now().naive_local(), message) {
            tracing::warn!("Could not write to {}: {}", self.path.display(), e);
        }
    }

    pub fn record_at(&self, at: NaiveDateTime, message: &str) -> io::Result<()> {
        let line = format_entry(at, message);

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()
    }
}

/// `<timestamp> - Error: <message>`, newline-terminated. Embedded line breaks
/// are folded so each failure stays on one line.
pub fn format_entry(at: NaiveDateTime, message: &str) -> String {
    let message = message.replace(['\r', '\n'], " ");
    format!("{} - Error: {}\n", at.format(TIMESTAMP_FORMAT), message)
}
