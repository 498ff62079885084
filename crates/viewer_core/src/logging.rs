//! Process-wide file logging for the viewer runtime.
//!
//! # Responsibility
//! - Start rolling file logs from the `logging` section of the app config.
//! - Record panics raised inside extension code as one-line log events.
//!
//! # Invariants
//! - One logger per process; later boots reuse it when level and directory
//!   agree and get [`LoggingError::Conflict`] otherwise.
//! - Starting the logger never panics.

use crate::config::LoggingConfig;
use flexi_logger::{
    Cleanup, Criterion, FileSpec, FlexiLoggerError, LogSpecification, Logger, LoggerHandle,
    Naming, WriteMode,
};
use log::{error, info, LevelFilter};
use once_cell::sync::OnceCell;
use std::any::Any;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

const LOG_FILE_BASENAME: &str = "viewer";
const ROTATE_AT_BYTES: u64 = 10 * 1024 * 1024;
const KEEP_ROTATED_FILES: usize = 5;
const PANIC_PAYLOAD_LIMIT: usize = 160;

static ACTIVE: OnceCell<ActiveLogger> = OnceCell::new();

/// Level and directory of the running logger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingStatus {
    pub level: LevelFilter,
    pub dir: PathBuf,
}

impl LoggingStatus {
    fn ensure_same(&self, requested: &LoggingStatus) -> Result<(), LoggingError> {
        if self == requested {
            Ok(())
        } else {
            Err(LoggingError::Conflict {
                active: self.clone(),
                requested: requested.clone(),
            })
        }
    }
}

struct ActiveLogger {
    status: LoggingStatus,
    _handle: LoggerHandle,
}

/// Logger setup failures.
#[derive(Debug)]
pub enum LoggingError {
    UnsupportedLevel(String),
    EmptyDir,
    RelativeDir(String),
    CreateDir {
        dir: PathBuf,
        cause: std::io::Error,
    },
    Backend(FlexiLoggerError),
    /// A logger with another level or directory is already running.
    Conflict {
        active: LoggingStatus,
        requested: LoggingStatus,
    },
}

impl Display for LoggingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedLevel(level) => write!(
                f,
                "unsupported log level `{level}`; expected trace|debug|info|warn|error"
            ),
            Self::EmptyDir => write!(f, "log dir cannot be empty"),
            Self::RelativeDir(dir) => write!(f, "log dir must be an absolute path, got `{dir}`"),
            Self::CreateDir { dir, cause } => {
                write!(f, "failed to create log dir `{}`: {cause}", dir.display())
            }
            Self::Backend(cause) => write!(f, "failed to start logger: {cause}"),
            Self::Conflict { active, requested } => write!(
                f,
                "logging already runs at {} in `{}`; refusing to switch to {} in `{}`",
                level_name(active.level),
                active.dir.display(),
                level_name(requested.level),
                requested.dir.display()
            ),
        }
    }
}

impl Error for LoggingError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::CreateDir { cause, .. } => Some(cause),
            Self::Backend(cause) => Some(cause),
            _ => None,
        }
    }
}

/// Starts file logging at `level` in the absolute directory `log_dir`.
///
/// Repeating the call with the same arguments is a no-op.
///
/// # Errors
/// - Bad level or directory, or a directory that cannot be created.
/// - [`LoggingError::Conflict`] when the running logger differs.
pub fn init_logging(level: &str, log_dir: &str) -> Result<(), LoggingError> {
    let requested = LoggingStatus {
        level: normalize_level(level)?,
        dir: normalize_log_dir(log_dir)?,
    };
    let active = ACTIVE.get_or_try_init(|| start(&requested))?;
    active.status.ensure_same(&requested)
}

/// Starts file logging when `config.dir` is set.
///
/// Returns `Ok(false)` when no directory is configured.
pub fn init_from_config(config: &LoggingConfig) -> Result<bool, LoggingError> {
    match config.dir.as_deref() {
        Some(dir) => init_logging(&config.level, dir).map(|()| true),
        None => Ok(false),
    }
}

/// Level and directory of the running logger, if any.
pub fn logging_status() -> Option<LoggingStatus> {
    ACTIVE.get().map(|active| active.status.clone())
}

/// `debug` for debug builds, `info` otherwise.
pub fn default_log_level() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    }
}

pub(crate) fn normalize_level(level: &str) -> Result<LevelFilter, LoggingError> {
    let trimmed = level.trim();
    if trimmed.eq_ignore_ascii_case("warning") {
        return Ok(LevelFilter::Warn);
    }
    match trimmed.parse::<LevelFilter>() {
        Ok(LevelFilter::Off) | Err(_) => Err(LoggingError::UnsupportedLevel(trimmed.to_string())),
        Ok(filter) => Ok(filter),
    }
}

fn normalize_log_dir(log_dir: &str) -> Result<PathBuf, LoggingError> {
    let trimmed = log_dir.trim();
    if trimmed.is_empty() {
        return Err(LoggingError::EmptyDir);
    }
    let path = Path::new(trimmed);
    if !path.is_absolute() {
        return Err(LoggingError::RelativeDir(trimmed.to_string()));
    }
    Ok(path.to_path_buf())
}

fn level_name(level: LevelFilter) -> String {
    level.as_str().to_ascii_lowercase()
}

fn start(status: &LoggingStatus) -> Result<ActiveLogger, LoggingError> {
    std::fs::create_dir_all(&status.dir).map_err(|cause| LoggingError::CreateDir {
        dir: status.dir.clone(),
        cause,
    })?;

    let handle = Logger::with(LogSpecification::builder().default(status.level).build())
        .log_to_file(
            FileSpec::default()
                .directory(status.dir.as_path())
                .basename(LOG_FILE_BASENAME),
        )
        .rotate(
            Criterion::Size(ROTATE_AT_BYTES),
            Naming::Numbers,
            Cleanup::KeepLogFiles(KEEP_ROTATED_FILES),
        )
        .write_mode(WriteMode::BufferAndFlush)
        .append()
        .format_for_files(flexi_logger::detailed_format)
        .start()
        .map_err(LoggingError::Backend)?;

    install_panic_hook();
    info!(
        "event=logging_init module=logging status=ok level={} log_dir={} platform={} version={}",
        level_name(status.level),
        status.dir.display(),
        std::env::consts::OS,
        env!("CARGO_PKG_VERSION")
    );

    Ok(ActiveLogger {
        status: status.clone(),
        _handle: handle,
    })
}

/// Chains a hook that logs the panic before the previous hook runs.
/// Called once, right after the logger starts.
fn install_panic_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        error!(
            "event=panic_captured module=logging status=error location={} payload={}",
            location,
            panic_summary(info.payload())
        );
        previous(info);
    }));
}

fn panic_summary(payload: &(dyn Any + Send)) -> String {
    let text = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload");
    single_line(text, PANIC_PAYLOAD_LIMIT)
}

/// Joins lines and caps the text at `max_chars`.
fn single_line(value: &str, max_chars: usize) -> String {
    let joined = value.replace(['\n', '\r'], " ");
    let mut capped: String = joined.chars().take(max_chars).collect();
    if joined.chars().count() > max_chars {
        capped.push_str("...");
    }
    capped
}

#[cfg(test)]
mod tests {
    use super::{
        init_from_config, init_logging, logging_status, normalize_level, normalize_log_dir,
        panic_summary, single_line, LoggingError,
    };
    use crate::config::LoggingConfig;
    use log::LevelFilter;

    #[test]
    fn levels_normalize_to_filters() {
        assert_eq!(normalize_level("INFO").expect("INFO"), LevelFilter::Info);
        assert_eq!(normalize_level(" warning ").expect("warning"), LevelFilter::Warn);
        assert!(matches!(
            normalize_level("verbose"),
            Err(LoggingError::UnsupportedLevel(_))
        ));
        assert!(normalize_level("off").is_err());
    }

    #[test]
    fn log_dir_must_be_absolute_and_non_empty() {
        assert!(matches!(
            normalize_log_dir("logs/dev"),
            Err(LoggingError::RelativeDir(_))
        ));
        assert!(matches!(normalize_log_dir("  "), Err(LoggingError::EmptyDir)));
    }

    #[test]
    fn panic_payloads_become_one_capped_line() {
        let capped = single_line("line1\nline2\rline3", 8);
        assert_eq!(capped, "line1 li...");

        let owned: Box<dyn std::any::Any + Send> = Box::new(String::from("factory\nfailed"));
        assert_eq!(panic_summary(owned.as_ref()), "factory failed");
        let opaque: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_summary(opaque.as_ref()), "non-string panic payload");
    }

    #[test]
    fn config_without_dir_skips_file_logging() {
        let started = init_from_config(&LoggingConfig::default())
            .expect("missing dir is not an error");
        assert!(!started);
    }

    #[test]
    fn init_is_idempotent_and_rejects_conflicts() {
        let log_dir = tempfile::tempdir().expect("temp dir should be created");
        let log_dir_str = log_dir
            .path()
            .to_str()
            .expect("temp dir should be valid UTF-8")
            .to_string();
        let other_dir = tempfile::tempdir().expect("temp dir should be created");
        let other_dir_str = other_dir
            .path()
            .to_str()
            .expect("temp dir should be valid UTF-8")
            .to_string();

        init_logging("info", &log_dir_str).expect("first init should succeed");
        init_logging("INFO", &log_dir_str).expect("same config should be idempotent");

        let level_error = init_logging("debug", &log_dir_str).expect_err("level conflict");
        assert!(matches!(level_error, LoggingError::Conflict { .. }));
        assert!(level_error.to_string().contains("refusing to switch"));

        let dir_error = init_logging("info", &other_dir_str).expect_err("dir conflict");
        assert!(matches!(dir_error, LoggingError::Conflict { .. }));

        let status = logging_status().expect("logging should be active");
        assert_eq!(status.level, LevelFilter::Info);
        assert_eq!(status.dir, log_dir.path());
    }
}
