// Logging for the plugin host
//
// Records go to the console (stderr), a file, or both, as plain text or
// one JSON object per line. Console and file levels are independent.
//
// ```
// let config = LogConfig {
//     console_level: LevelFilter::Info,
//     file_level: Some(LevelFilter::Debug),
//     format: LogFormat::Json,
//     destination: LogDestination::Both(PathBuf::from("plughost.log")),
// };
// init_logger(config)?;
// ```

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use log::{Level, LevelFilter};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::ConfigManager;

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("Invalid log format: {}. Valid options: text, json", s)),
        }
    }
}

/// Log destination options
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogDestination {
    Console,
    File(PathBuf),
    Both(PathBuf),
}

impl LogDestination {
    fn file(&self) -> Option<&Path> {
        match self {
            LogDestination::Console => None,
            LogDestination::File(path) | LogDestination::Both(path) => Some(path),
        }
    }

    fn console(&self) -> bool {
        !matches!(self, LogDestination::File(_))
    }
}

/// JSON log entry structure
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonLogEntry {
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    pub console_level: LevelFilter,
    pub file_level: Option<LevelFilter>,
    pub format: LogFormat,
    pub destination: LogDestination,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_level: LevelFilter::Info,
            file_level: None,
            format: LogFormat::Text,
            destination: LogDestination::Console,
        }
    }
}

impl LogConfig {
    /// Read the `[logging]` section, keeping defaults for unset keys.
    ///
    /// Recognised keys: `level`, `file`, `file-level`, `format`.
    pub fn from_config(config: &ConfigManager) -> Result<Self> {
        let mut log_config = Self::default();
        if let Some(level) = config.get_log_level("logging", "level")? {
            log_config.console_level = level;
        }
        if let Some(format) = config.get_value("logging", "format") {
            log_config.format = format.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(path) = config.get_path("logging", "file") {
            log_config.destination = LogDestination::Both(path);
            log_config.file_level = Some(
                config
                    .get_log_level("logging", "file-level")?
                    .unwrap_or(LevelFilter::Debug),
            );
        }
        Ok(log_config)
    }

    /// Most verbose level any destination accepts
    pub fn max_level(&self) -> LevelFilter {
        let console = if self.destination.console() {
            self.console_level
        } else {
            LevelFilter::Off
        };
        match self.file_level {
            Some(file_level) if self.destination.file().is_some() => console.max(file_level),
            _ => console,
        }
    }
}

/// Logger writing text or JSON lines to stderr and an optional file
pub struct HostLogger {
    config: LogConfig,
    file: Option<Mutex<File>>,
}

impl HostLogger {
    pub fn new(config: LogConfig) -> Result<Self> {
        let file = match config.destination.file() {
            Some(path) => Some(Mutex::new(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("Failed to open log file: {}", path.display()))?,
            )),
            None => None,
        };
        Ok(Self { config, file })
    }

    fn format_timestamp() -> String {
        let now: DateTime<Local> = Local::now();
        now.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
    }

    fn format_text_message(&self, level: Level, target: &str, message: &str) -> String {
        format!(
            "{} [{}] {}: {}",
            Self::format_timestamp(),
            level.to_string().to_uppercase(),
            target,
            message
        )
    }

    fn format_json_message(&self, level: Level, target: &str, message: &str) -> Result<String> {
        let entry = JsonLogEntry {
            timestamp: Self::format_timestamp(),
            level: level.to_string().to_uppercase(),
            target: target.to_string(),
            message: message.to_string(),
            detail: None,
        };
        serde_json::to_string(&entry).context("Failed to serialize log entry to JSON")
    }

    fn should_log_to_console(&self, level: Level) -> bool {
        self.config.destination.console() && level <= self.config.console_level
    }

    fn should_log_to_file(&self, level: Level) -> bool {
        self.file.is_some() && self.config.file_level.map_or(false, |file_level| level <= file_level)
    }

    fn write_to_file(&self, formatted_message: &str) -> io::Result<()> {
        match &self.file {
            Some(file) => writeln!(file.lock(), "{}", formatted_message),
            None => Ok(()),
        }
    }
}

impl log::Log for HostLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.should_log_to_console(metadata.level()) || self.should_log_to_file(metadata.level())
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let level = record.level();
        let message = record.args().to_string();
        let formatted_message = match self.config.format {
            LogFormat::Text => self.format_text_message(level, record.target(), &message),
            LogFormat::Json => self
                .format_json_message(level, record.target(), &message)
                .unwrap_or_else(|_| self.format_text_message(level, record.target(), &message)),
        };

        if self.should_log_to_console(level) {
            let _ = writeln!(io::stderr(), "{}", formatted_message);
        }
        if self.should_log_to_file(level) {
            if let Err(e) = self.write_to_file(&formatted_message) {
                eprintln!("File logging error: {}", e);
            }
        }
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
        if let Some(file) = &self.file {
            let _ = file.lock().flush();
        }
    }
}

/// Initialize the logging system with the given configuration
pub fn init_logger(config: LogConfig) -> Result<()> {
    let max_level = config.max_level();
    let logger = HostLogger::new(config)?;
    log::set_boxed_logger(Box::new(logger)).context("Failed to set global logger")?;
    log::set_max_level(max_level);
    Ok(())
}

/// Convert string to LevelFilter
pub fn parse_log_level(level_str: &str) -> Result<LevelFilter> {
    match level_str.to_lowercase().as_str() {
        "error" => Ok(LevelFilter::Error),
        "warn" => Ok(LevelFilter::Warn),
        "info" => Ok(LevelFilter::Info),
        "debug" => Ok(LevelFilter::Debug),
        "trace" => Ok(LevelFilter::Trace),
        "off" => Ok(LevelFilter::Off),
        _ => Err(anyhow::anyhow!(
            "Invalid log level: {}. Valid levels: error, warn, info, debug, trace, off",
            level_str
        )),
    }
}
