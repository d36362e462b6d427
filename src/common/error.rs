//! Error types for the control plane

use std::io;
use thiserror::Error;

/// Control plane error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    /// Operational failure of a core process (start, stop, spawn)
    #[error("{core} process error: {message}")]
    Process { core: String, message: String },

    /// The core binary rejected the generated config
    #[error("{core} config validation failed: {output}")]
    Validation { core: String, output: String },

    #[error("Control API error: {0}")]
    Api(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("{0} is not running")]
    NotRunning(String),

    #[error("{0} is already running")]
    AlreadyRunning(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Error::Parse(msg.into())
    }

    pub fn process<C: Into<String>, S: Into<String>>(core: C, msg: S) -> Self {
        Error::Process {
            core: core.into(),
            message: msg.into(),
        }
    }

    pub fn validation<C: Into<String>, S: Into<String>>(core: C, output: S) -> Self {
        Error::Validation {
            core: core.into(),
            output: output.into(),
        }
    }

    pub fn api<S: Into<String>>(msg: S) -> Self {
        Error::Api(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn not_running<S: Into<String>>(core: S) -> Self {
        Error::NotRunning(core.into())
    }

    pub fn already_running<S: Into<String>>(core: S) -> Self {
        Error::AlreadyRunning(core.into())
    }

    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Error::Conflict(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Error::Unsupported(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else {
            Error::Api(e.to_string())
        }
    }
}

impl From<tonic::Status> for Error {
    fn from(s: tonic::Status) -> Self {
        match s.code() {
            tonic::Code::DeadlineExceeded => Error::Timeout(s.message().to_string()),
            _ => Error::Api(format!("{}: {}", s.code(), s.message())),
        }
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(e: tonic::transport::Error) -> Self {
        Error::Api(e.to_string())
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;
