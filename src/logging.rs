use crate::util::{env_non_empty, parse_bool_str};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const LOG_FILTER_ENV: &str = "THREADLOOP_LOG";
const LOG_STDERR_ENV: &str = "THREADLOOP_LOG_STDERR";
const LOG_FILE_NAME: &str = "threadloop.log";

/// Installs the global subscriber. Logs go to `<data_dir>/threadloop.log`
/// so they do not interleave with streamed output; stderr is used when
/// `THREADLOOP_LOG_STDERR` is set or the file cannot be created.
///
/// Returns the log file path when logging to a file.
pub fn init(data_dir: &Path) -> Option<PathBuf> {
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let to_stderr = env_non_empty(LOG_STDERR_ENV)
        .and_then(|value| parse_bool_str(&value))
        .unwrap_or(false);

    let log_path = data_dir.join(LOG_FILE_NAME);
    let log_file = if to_stderr {
        None
    } else {
        fs::create_dir_all(data_dir)
            .and_then(|()| File::create(&log_path))
            .ok()
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match log_file {
        Some(file) => {
            let _ = builder
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .try_init();
            Some(log_path)
        }
        None => {
            let _ = builder.with_writer(std::io::stderr).try_init();
            None
        }
    }
}
