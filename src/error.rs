//! Error types for gwctl

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum GwctlError {
    /// IO error
    Io(io::Error),
    /// Invalid parameter
    InvalidParameter(String),
    /// Configuration error
    ConfigError(String),
    /// Service error (broker, configd, child daemon)
    ServiceError(String),
    /// Permission denied
    PermissionDenied(String),
    /// Parse error
    ParseError(String),
    /// Already exists
    AlreadyExists(String),
    /// Timeout
    Timeout(String),
    /// Request cancelled by caller
    Cancelled,
    /// Not found
    NotFound(String),
    /// Invalid state
    InvalidState(String),
    /// Connection failed
    ConnectionFailed { reason: String },
    /// No daemon by that name
    NoDaemon(String),
    /// Protocol version mismatch
    BadVersion { got: u32, want: u32 },
}

impl fmt::Display for GwctlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GwctlError::Io(e) => write!(f, "IO error: {}", e),
            GwctlError::InvalidParameter(msg) => write!(f, "Invalid parameter: {}", msg),
            GwctlError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            GwctlError::ServiceError(msg) => write!(f, "Service error: {}", msg),
            GwctlError::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            GwctlError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            GwctlError::AlreadyExists(msg) => write!(f, "Already exists: {}", msg),
            GwctlError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            GwctlError::Cancelled => write!(f, "Cancelled"),
            GwctlError::NotFound(msg) => write!(f, "Not found: {}", msg),
            GwctlError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            GwctlError::ConnectionFailed { reason } => write!(f, "Connection failed: {}", reason),
            GwctlError::NoDaemon(name) => write!(f, "No such daemon: {}", name),
            GwctlError::BadVersion { got, want } => {
                write!(f, "Protocol version mismatch: got {}, want {}", got, want)
            }
        }
    }
}

impl std::error::Error for GwctlError {}

impl From<io::Error> for GwctlError {
    fn from(error: io::Error) -> Self {
        GwctlError::Io(error)
    }
}

impl From<serde_json::Error> for GwctlError {
    fn from(error: serde_json::Error) -> Self {
        GwctlError::ParseError(error.to_string())
    }
}

impl From<bincode::Error> for GwctlError {
    fn from(error: bincode::Error) -> Self {
        GwctlError::ParseError(error.to_string())
    }
}

pub type GwctlResult<T> = Result<T, GwctlError>;
