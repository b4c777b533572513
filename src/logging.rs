use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Name of the symlink that always points at the newest session log.
const LATEST_LOG_NAME: &str = "sensorlink.log";

/// Global log file handle. When `Some`, `tlog!` writes to both stderr and this file.
pub(crate) static LOG_FILE: Mutex<Option<std::fs::File>> = Mutex::new(None);

/// Wall-clock prefix used by every log line (`HH:MM:SS.mmm`, local time).
pub(crate) fn clock() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}

/// Initialise file logging to the given directory.
/// Creates a timestamped session log and a `sensorlink.log` symlink (Unix only).
/// Returns the path of the new log file.
pub(crate) fn init_file_logging(log_dir: &Path) -> Result<PathBuf, String> {
    std::fs::create_dir_all(log_dir)
        .map_err(|e| format!("Failed to create log dir: {}", e))?;

    let filename = chrono::Local::now()
        .format("%Y%m%d-%H%M%S-sensorlink.log")
        .to_string();
    let log_path = log_dir.join(&filename);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| format!("Failed to create log file: {}", e))?;

    // Windows symlinks require elevated privileges
    #[cfg(unix)]
    {
        let symlink_path = log_dir.join(LATEST_LOG_NAME);
        let _ = std::fs::remove_file(&symlink_path);
        if let Err(e) = std::os::unix::fs::symlink(&filename, &symlink_path) {
            eprintln!("{} [logging] Failed to create {} symlink: {}", clock(), LATEST_LOG_NAME, e);
        }
    }

    if let Ok(mut guard) = LOG_FILE.lock() {
        *guard = Some(file);
    }

    // eprintln directly: tlog! would lock LOG_FILE again
    eprintln!("{} [logging] File logging started: {}", clock(), log_path.display());

    Ok(log_path)
}

/// Stop file logging and close the log file.
pub(crate) fn stop_file_logging() {
    if let Ok(mut guard) = LOG_FILE.lock() {
        if guard.is_some() {
            *guard = None;
            eprintln!("{} [logging] File logging stopped", clock());
        }
    }
}

/// Timestamped logging macro.
/// Prepends `HH:MM:SS.mmm` local time to every message written to stderr.
/// Also writes to the log file when file logging is enabled.
macro_rules! tlog {
    ($($arg:tt)*) => {{
        use std::io::Write as _;
        let msg = format!("{} {}", $crate::logging::clock(), format_args!($($arg)*));
        eprintln!("{}", msg);
        if let Ok(mut guard) = $crate::logging::LOG_FILE.lock() {
            if let Some(ref mut f) = *guard {
                let _ = writeln!(f, "{}", msg);
            }
        }
    }};
}
