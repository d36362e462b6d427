//! Core stdout/stderr filter
//!
//! Every line the core prints goes through [`LogFilter::write`]. Crash
//! markers are recorded as the process result; structured lines are
//! re-emitted through `tracing` at the core's own level.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::model::CoreType;

static CRASH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(panic|exception|stack trace|fatal error)").unwrap());

/// `2024-01-01T12:00:00.000Z [INFO] message`
static SINGBOX_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d{3}Z) \[([^\]]+)\] (.+)$").unwrap()
});

/// `2024/01/01 12:00:00.123456 [Warning] message`
static XRAY_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}(?:\.\d+)?) \[([^\]]+)\] (.+)$").unwrap()
});

/// Lines that are routine per-connection noise
const NOISE: [&str; 2] = ["tls handshake error", "connection ends"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn from_core(level: &str) -> Option<LogLevel> {
        match level.to_ascii_lowercase().as_str() {
            "debug" | "trace" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" | "fatal" | "panic" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// How one output line is handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogLine {
    /// Dropped entirely
    Suppressed,
    /// Crash marker; becomes the process result
    Crash(String),
    /// Re-emitted. `last` is what the process result becomes.
    Emit {
        level: LogLevel,
        body: String,
        last: String,
    },
}

/// Classify a single line. `windows` enables the exit-status suppression,
/// since killing a process there surfaces as `exit status 1`.
pub fn classify(core: CoreType, line: &str, windows: bool) -> LogLine {
    let message = line.trim();
    if windows && message.to_ascii_lowercase().contains("exit status 1") {
        return LogLine::Suppressed;
    }
    if CRASH.is_match(message) {
        return LogLine::Crash(message.to_string());
    }
    if message.is_empty() {
        return LogLine::Suppressed;
    }

    let pattern = match core {
        CoreType::Xray => &XRAY_LINE,
        CoreType::SingBox => &SINGBOX_LINE,
    };

    if let Some(caps) = pattern.captures(message) {
        let body = caps[3].to_string();
        let lower = body.to_ascii_lowercase();
        let level = if NOISE.iter().any(|n| lower.contains(n)) {
            LogLevel::Debug
        } else if lower.contains("failed") {
            LogLevel::Error
        } else {
            LogLevel::from_core(&caps[2]).unwrap_or(LogLevel::Debug)
        };
        return LogLine::Emit {
            level,
            body,
            last: String::new(),
        };
    }

    let lower = message.to_ascii_lowercase();
    let level = if lower.contains("failed") && !NOISE.iter().any(|n| lower.contains(n)) {
        LogLevel::Error
    } else {
        LogLevel::Debug
    };
    LogLine::Emit {
        level,
        body: message.to_string(),
        last: message.to_string(),
    }
}

/// Per-process filter holding the last meaningful line
#[derive(Debug)]
pub struct LogFilter {
    core: CoreType,
    last_line: Mutex<String>,
}

impl LogFilter {
    pub fn new(core: CoreType) -> Self {
        LogFilter {
            core,
            last_line: Mutex::new(String::new()),
        }
    }

    pub fn last_line(&self) -> String {
        self.last_line.lock().clone()
    }

    /// Handle one chunk of output, which may span several lines.
    pub fn write(&self, chunk: &str) {
        let core = self.core.as_str();
        for line in chunk.lines() {
            match classify(self.core, line, cfg!(windows)) {
                LogLine::Suppressed => {}
                LogLine::Crash(message) => {
                    debug!(target: "corepanel::core_log", core, "Core crash detected:\n{}", message);
                    *self.last_line.lock() = message;
                }
                LogLine::Emit { level, body, last } => {
                    match level {
                        LogLevel::Debug => debug!(target: "corepanel::core_log", core, "{}", body),
                        LogLevel::Info => info!(target: "corepanel::core_log", core, "{}", body),
                        LogLevel::Warn => warn!(target: "corepanel::core_log", core, "{}", body),
                        LogLevel::Error => error!(target: "corepanel::core_log", core, "{}", body),
                    }
                    *self.last_line.lock() = last;
                }
            }
        }
    }
}
