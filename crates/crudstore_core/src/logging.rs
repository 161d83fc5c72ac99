//! Process-wide logging bootstrap.
//!
//! # Responsibility
//! - Start rolling file logs once per process from a `LoggingConfig`.
//! - Keep every event metadata-only: entity names, counts, ids, durations.
//!
//! # Invariants
//! - Initialization is idempotent for an identical configuration and
//!   rejects any later, different configuration.
//! - Initialization never panics.
//! - The library itself never initializes logging; hosts call this.
//!
//! # See also
//! - crate::config::UnitOfWorkOptions for the unit-of-work settings.

use flexi_logger::{Cleanup, Criterion, FileSpec, Logger, LoggerHandle, Naming, WriteMode};
use log::{error, info};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const LOG_FILE_BASENAME: &str = "crudstore";
const MAX_PANIC_PAYLOAD_CHARS: usize = 160;

static LOGGING_STATE: OnceCell<LoggingState> = OnceCell::new();
static PANIC_HOOK_INSTALLED: OnceCell<()> = OnceCell::new();

/// File logging settings, loadable from any serde format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Must be absolute.
    pub log_dir: PathBuf,
    pub max_file_size_bytes: u64,
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level().to_string(),
            log_dir: std::env::temp_dir().join("crudstore-logs"),
            max_file_size_bytes: 10 * 1024 * 1024,
            max_files: 5,
        }
    }
}

impl LoggingConfig {
    pub fn new(level: &str, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            level: level.to_string(),
            log_dir: log_dir.into(),
            ..Self::default()
        }
    }
}

struct LoggingState {
    level: &'static str,
    log_dir: PathBuf,
    max_file_size_bytes: u64,
    max_files: usize,
    _logger: LoggerHandle,
}

impl LoggingState {
    fn conflict_with(&self, level: &str, config: &LoggingConfig, log_dir: &Path) -> Option<String> {
        if self.log_dir != log_dir {
            return Some(format!(
                "logging already initialized at `{}`; refusing to switch to `{}`",
                self.log_dir.display(),
                log_dir.display()
            ));
        }
        if self.level != level {
            return Some(format!(
                "logging already initialized with level `{}`; refusing to switch to `{level}`",
                self.level
            ));
        }
        if self.max_file_size_bytes != config.max_file_size_bytes || self.max_files != config.max_files {
            return Some("logging already initialized with a different rotation policy".to_string());
        }
        None
    }
}

/// Shorthand for `init_logging_with(&LoggingConfig::new(level, log_dir))`.
pub fn init_logging(level: &str, log_dir: &str) -> Result<(), String> {
    init_logging_with(&LoggingConfig::new(level, log_dir.trim()))
}

/// Starts file logging.
///
/// # Errors
/// - Unsupported `level`.
/// - `log_dir` empty, relative, or not creatable.
/// - A previous call used a different configuration.
/// - Logger backend setup failure.
pub fn init_logging_with(config: &LoggingConfig) -> Result<(), String> {
    let level = normalize_level(&config.level)?;
    let log_dir = normalize_log_dir(&config.log_dir)?;
    if config.max_files == 0 {
        return Err("max_files must be at least 1".to_string());
    }

    let state = LOGGING_STATE.get_or_try_init(|| start_logger(level, &log_dir, config))?;
    match state.conflict_with(level, config, &log_dir) {
        Some(conflict) => Err(conflict),
        None => Ok(()),
    }
}

fn start_logger(level: &'static str, log_dir: &Path, config: &LoggingConfig) -> Result<LoggingState, String> {
    std::fs::create_dir_all(log_dir).map_err(|err| {
        format!("failed to create log directory `{}`: {err}", log_dir.display())
    })?;

    let logger = Logger::try_with_str(level)
        .map_err(|err| format!("invalid log level `{level}`: {err}"))?
        .log_to_file(
            FileSpec::default()
                .directory(log_dir)
                .basename(LOG_FILE_BASENAME),
        )
        .rotate(
            Criterion::Size(config.max_file_size_bytes),
            Naming::Numbers,
            Cleanup::KeepLogFiles(config.max_files),
        )
        .write_mode(WriteMode::BufferAndFlush)
        .append()
        .format_for_files(flexi_logger::detailed_format)
        .start()
        .map_err(|err| format!("failed to start logger: {err}"))?;

    install_panic_hook_once();

    info!(
        "event=logging_init module=logging status=ok level={level} log_dir={} version={} build_mode={}",
        log_dir.display(),
        env!("CARGO_PKG_VERSION"),
        build_mode()
    );

    Ok(LoggingState {
        level,
        log_dir: log_dir.to_path_buf(),
        max_file_size_bytes: config.max_file_size_bytes,
        max_files: config.max_files,
        _logger: logger,
    })
}

/// Returns `(level, log_dir)` once logging is active.
pub fn logging_status() -> Option<(&'static str, PathBuf)> {
    LOGGING_STATE
        .get()
        .map(|state| (state.level, state.log_dir.clone()))
}

/// `debug` for debug builds, `info` otherwise.
pub fn default_log_level() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    }
}

const LEVELS: [(&str, &str); 6] = [
    ("trace", "trace"),
    ("debug", "debug"),
    ("info", "info"),
    ("warn", "warn"),
    ("warning", "warn"),
    ("error", "error"),
];

fn normalize_level(level: &str) -> Result<&'static str, String> {
    let wanted = level.trim().to_ascii_lowercase();
    LEVELS
        .iter()
        .find(|(alias, _)| *alias == wanted)
        .map(|(_, canonical)| *canonical)
        .ok_or_else(|| format!("log level `{wanted}` is not one of trace|debug|info|warn|error"))
}

fn normalize_log_dir(log_dir: &Path) -> Result<PathBuf, String> {
    match log_dir {
        dir if dir.as_os_str().is_empty() => Err("log_dir is empty".to_string()),
        dir if dir.is_relative() => Err(format!(
            "log_dir `{}` is relative; an absolute path is required",
            dir.display()
        )),
        dir => Ok(dir.to_path_buf()),
    }
}

fn build_mode() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "release"
    }
}

// Chains onto the existing hook; installed at most once per process.
fn install_panic_hook_once() {
    PANIC_HOOK_INSTALLED.get_or_init(|| {
        let chained = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let location = info
                .location()
                .map_or_else(|| "unknown".to_string(), |at| format!("{}:{}", at.file(), at.line()));
            // Payloads may carry entity field values; cap and flatten them.
            let payload = flatten_message(&panic_text(info), MAX_PANIC_PAYLOAD_CHARS);
            error!("event=panic_captured module=logging status=error location={location} payload={payload}");
            chained(info);
        }));
    });
}

fn panic_text(info: &std::panic::PanicHookInfo<'_>) -> String {
    let payload = info.payload();
    payload
        .downcast_ref::<&str>()
        .map(|text| (*text).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<opaque payload>".to_string())
}

fn flatten_message(value: &str, max_chars: usize) -> String {
    let mut chars = value.chars().map(|c| if c == '\n' || c == '\r' { ' ' } else { c });
    let mut flat: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        flat.push_str("...");
    }
    flat
}

#[cfg(test)]
mod tests {
    use super::{
        flatten_message, init_logging, init_logging_with, logging_status, normalize_level,
        normalize_log_dir, LoggingConfig,
    };
    use std::path::Path;

    #[test]
    fn levels_are_case_and_alias_insensitive() {
        assert_eq!(normalize_level("TRACE").expect("upper case level"), "trace");
        assert_eq!(normalize_level(" Warning ").expect("warning alias"), "warn");
        let err = normalize_level("verbose").expect_err("unknown level");
        assert!(err.contains("verbose"));
    }

    #[test]
    fn log_dir_must_be_absolute_and_non_empty() {
        let relative = normalize_log_dir(Path::new("logs/dev")).expect_err("relative dir");
        assert!(relative.contains("relative"));
        assert!(normalize_log_dir(Path::new("")).is_err());
    }

    #[test]
    fn panic_messages_are_flattened_and_capped() {
        assert_eq!(flatten_message("a\nb\rc", 16), "a b c");
        assert_eq!(flatten_message("abcdefghij", 4), "abcd...");
        assert_eq!(flatten_message("abcd", 4), "abcd");
    }

    #[test]
    fn config_fills_missing_keys_with_defaults() {
        let config: LoggingConfig =
            serde_json::from_str(r#"{"level":"warn"}"#).expect("parse logging config");
        assert_eq!(config.level, "warn");
        assert_eq!(config.max_files, 5);
        assert!(config.log_dir.is_absolute());
    }

    // Logging is process-global, so every init scenario lives in one test.
    #[test]
    fn second_init_must_repeat_the_first_config() {
        // The logger outlives the test, so the directories are left behind.
        let dir = std::env::temp_dir().join(format!("crudstore-log-{}", uuid::Uuid::new_v4()));
        let other = dir.with_extension("other");
        let dir_str = dir.to_string_lossy().to_string();
        let other_str = other.to_string_lossy().to_string();

        init_logging("info", &dir_str).expect("first init");
        init_logging("INFO", &dir_str).expect("repeat init");

        let err = init_logging("debug", &dir_str).expect_err("level change");
        assert!(err.contains("refusing to switch"));
        let err = init_logging("info", &other_str).expect_err("directory change");
        assert!(err.contains("refusing to switch"));

        let mut rotation = LoggingConfig::new("info", dir.clone());
        rotation.max_files = 9;
        let err = init_logging_with(&rotation).expect_err("rotation change");
        assert!(err.contains("rotation"));

        let (level, active_dir) = logging_status().expect("logging active");
        assert_eq!(level, "info");
        assert_eq!(active_dir, dir);
    }
}
