//! Watchdog progress reporting.
//!
//! Each supervised process periodically touches a file under the progress
//! directory; the external watchdog acts when a file goes stale. Touching
//! uses the file mtime only; the first failure per file is logged and then
//! silenced (the watchdog is the recovery path, not the log).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::SystemTime;

use tracing::{error, info};

/// Progress reporter for one process.
#[derive(Debug)]
pub struct Progress {
    /// Directory for progress files; empty disables reporting.
    dir: PathBuf,
    state: Mutex<ProgressState>,
}

#[derive(Debug, Default)]
struct ProgressState {
    /// Whether each file could be created (don't keep retrying failures).
    files: HashMap<String, bool>,
    /// Error latch: log syscall failures once, then stay quiet.
    log_errors: bool,
}

impl Progress {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            state: Mutex::new(ProgressState {
                files: HashMap::new(),
                log_errors: true,
            }),
        }
    }

    /// Disabled reporter (empty directory).
    pub fn disabled() -> Self {
        Self::new("")
    }

    /// Touch the named progress file.
    pub fn report(&self, file: &str) {
        if self.dir.as_os_str().is_empty() {
            return; // disabled
        }
        let path = self.dir.join(file);

        let Ok(mut state) = self.state.lock() else {
            return;
        };

        // Create the file on first sight only.
        match state.files.get(file) {
            None => {
                if !path.exists() {
                    info!("Creating progress file: {}", path.display());
                    if let Some(parent) = path.parent() {
                        let _ = std::fs::create_dir_all(parent);
                    }
                    if let Err(e) = std::fs::File::create(&path) {
                        Self::log_err(&mut state, "create", &path, &e);
                        state.files.insert(file.to_string(), false);
                        return;
                    }
                }
                state.files.insert(file.to_string(), true);
            }
            Some(false) => return, // could not be created, don't keep trying
            Some(true) => {}
        }

        // Touch mtime. std has no utimensat wrapper; re-setting the file's
        // modification time via set_modified keeps the watchdog contract.
        let file_handle = match std::fs::OpenOptions::new().write(true).open(&path) {
            Ok(f) => f,
            Err(e) => {
                Self::log_err(&mut state, "open", &path, &e);
                return;
            }
        };
        if let Err(e) = file_handle.set_modified(SystemTime::now()) {
            Self::log_err(&mut state, "set_modified", &path, &e);
        }
    }

    fn log_err(
        state: &mut ProgressState,
        syscall: &str,
        path: &std::path::Path,
        err: &std::io::Error,
    ) {
        if state.log_errors {
            state.log_errors = false;
            error!("ERROR: {} {}: {}", syscall, path.display(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_report_creates_and_touches() {
        let tmp = TempDir::new().unwrap();
        let progress = Progress::new(tmp.path());
        progress.report("minion");
        let path = tmp.path().join("minion");
        assert!(path.exists());

        let first = std::fs::metadata(&path).unwrap().modified().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        progress.report("minion");
        let second = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert!(second >= first);
    }

    #[test]
    fn test_disabled_reporter_is_noop() {
        let progress = Progress::disabled();
        // Must not create anything or panic.
        progress.report("minion");
    }

    #[test]
    fn test_uncreatable_file_latches() {
        // Point at a directory path that cannot hold the file.
        let tmp = TempDir::new().unwrap();
        let blocked = tmp.path().join("blocked");
        std::fs::write(&blocked, b"x").unwrap();
        // "blocked" is a file, so "blocked/sub" can never be created.
        let progress = Progress::new(&blocked);
        progress.report("sub");
        progress.report("sub"); // second call must not retry creation
        assert!(!blocked.join("sub").exists());
    }
}
