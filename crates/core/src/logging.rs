//! Log filter selection and the rolling file sink used by the CLI.

use std::fs;
use std::path::{Path, PathBuf};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";

/// Applied only when no filter was asked for explicitly.
const CONSOLE_NOISE_FILTER: &str = "ort=error,ffmpeg_stderr=error,ffmpeg_encode_stderr=error";
/// The log file keeps ffmpeg's stderr at debug.
const FILE_NOISE_FILTER: &str = "ort=error,ffmpeg_stderr=debug,ffmpeg_encode_stderr=debug";

const LOG_DIR_NAME: &str = "logs";
const LOG_FILE_PREFIX: &str = "tempora";
const LOG_FILE_SUFFIX: &str = "log";
const LOG_RETENTION_FILES: usize = 14;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub console: String,
    pub file: String,
}

impl LogFilters {
    /// `--log-filter` wins over `-v`/`-vv`, which win over `RUST_LOG`.
    pub fn resolve(cli_filter: Option<&str>, verbose: u8, rust_log: Option<&str>) -> Self {
        let explicit = match (cli_filter, verbose) {
            (Some(filter), _) => Some(filter.to_string()),
            (None, 0) => None,
            (None, 1) => Some("debug".to_string()),
            (None, _) => Some("trace".to_string()),
        };

        match explicit {
            Some(filter) => Self {
                console: filter.clone(),
                file: filter,
            },
            None => {
                let base = rust_log.unwrap_or(DEFAULT_LOG_FILTER);
                Self {
                    console: format!("{CONSOLE_NOISE_FILTER},{base}"),
                    file: format!("{FILE_NOISE_FILTER},{base}"),
                }
            }
        }
    }
}

#[derive(Debug)]
pub enum LogFile {
    Ready(RollingFileAppender),
    Unavailable {
        log_dir: Option<PathBuf>,
        reason: String,
    },
}

/// Daily rolling `tempora.*.log` files under `<data_dir>/logs`.
pub fn open_log_file(data_dir: Option<&Path>) -> LogFile {
    let Some(data_dir) = data_dir else {
        return LogFile::Unavailable {
            log_dir: None,
            reason: "data directory is not configured".to_string(),
        };
    };

    let log_dir = data_dir.join(LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return LogFile::Unavailable {
            log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(LOG_RETENTION_FILES)
        .build(&log_dir);

    match appender {
        Ok(appender) => LogFile::Ready(appender),
        Err(error) => LogFile::Unavailable {
            log_dir: Some(log_dir),
            reason: format!("failed to open rolling log file: {error}"),
        },
    }
}
