//! Application-level error type for the `flightlink` binary.

use crate::config::ConfigError;
use crate::connection::LinkError;
use crate::port::PortError;
use std::fmt;

/// A specialized `Result` type for command handlers.
pub type AppResult<T> = Result<T, AppError>;

/// Unified application error type.
#[derive(Debug)]
pub enum AppError {
    Config(ConfigError),
    Port(PortError),
    Link(LinkError),
    InvalidArgument(String),
    IoError(std::io::Error),
    SerdeError(serde_json::Error),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "Configuration error: {e}"),
            Self::Port(e) => write!(f, "Port error: {e}"),
            Self::Link(e) => write!(f, "Connection error: {e}"),
            Self::InvalidArgument(details) => write!(f, "Invalid argument: {details}"),
            Self::IoError(e) => write!(f, "An I/O error occurred: {e}"),
            Self::SerdeError(e) => write!(f, "A serialization error occurred: {e}"),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Port(e) => Some(e),
            Self::Link(e) => Some(e),
            Self::InvalidArgument(_) => None,
            Self::IoError(e) => Some(e),
            Self::SerdeError(e) => Some(e),
        }
    }
}

impl AppError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::InvalidArgument(_) | Self::Config(_) => 2,
            Self::Port(PortError::NotFound(_)) => 3,
            _ => 1,
        }
    }
}

// Implement `From` conversions to allow the `?` operator to work seamlessly.
impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::Config(err)
    }
}

impl From<PortError> for AppError {
    fn from(err: PortError) -> Self {
        AppError::Port(err)
    }
}

impl From<LinkError> for AppError {
    fn from(err: LinkError) -> Self {
        AppError::Link(err)
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::IoError(err)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::SerdeError(err)
    }
}
