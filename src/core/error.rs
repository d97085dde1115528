//! Unified error handling for modserve
//!
//! This module provides a centralized error type system so that the wire,
//! dispatch, orchestration and broker layers share one taxonomy and one
//! mapping to protocol error codes.

use std::fmt;

/// Wire error codes carried in the `error-code` field of a response.
///
/// Code 0 means success; everything else maps to one `ServiceError` variant.
/// The broker's failover loop compares against `NOT_FOUND` only.
pub mod code {
    pub const OK: u32 = 0;
    pub const INTERNAL: u32 = 1;
    pub const DECODE: u32 = 2;
    pub const NOT_FOUND: u32 = 3;
    pub const UNAUTHORIZED: u32 = 4;
    pub const LOAD: u32 = 5;
    pub const ILLEGAL_STATE: u32 = 6;
    pub const FAULT: u32 = 7;
    pub const CONFIGURATION: u32 = 8;
    pub const REMOTE: u32 = 9;
}

/// Unified error types for the service runtime
#[derive(Debug)]
pub enum ServiceError {
    /// Configuration-related errors
    Configuration(String),

    /// Network and I/O errors
    Network(std::io::Error),

    /// Malformed wire payload; carries the offending fragment
    Decode(String),

    /// Name or pattern resolution miss; drives broker failover and
    /// composed-batch fault marking
    NotFound(String),

    /// Authentication/Authorization failures; never retried across targets
    Unauthorized(String),

    /// Orchestration fault raised by a sub-request
    Fault(String),

    /// Response writer protocol violation; a programming error, not a
    /// user-facing condition
    IllegalState(String),

    /// Bad bundle or manifest during a load pass
    Load(String),

    /// Remote target transport failure
    Remote(String),

    /// Internal system errors
    Internal(String),
}

impl ServiceError {
    /// The numeric code this error carries on the wire.
    pub fn wire_code(&self) -> u32 {
        match self {
            ServiceError::Configuration(_) => code::CONFIGURATION,
            ServiceError::Network(_) => code::REMOTE,
            ServiceError::Decode(_) => code::DECODE,
            ServiceError::NotFound(_) => code::NOT_FOUND,
            ServiceError::Unauthorized(_) => code::UNAUTHORIZED,
            ServiceError::Fault(_) => code::FAULT,
            ServiceError::IllegalState(_) => code::ILLEGAL_STATE,
            ServiceError::Load(_) => code::LOAD,
            ServiceError::Remote(_) => code::REMOTE,
            ServiceError::Internal(_) => code::INTERNAL,
        }
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::Configuration(msg) => write!(f, "Configuration error: {msg}"),
            ServiceError::Network(err) => write!(f, "Network error: {err}"),
            ServiceError::Decode(msg) => write!(f, "Decode error: {msg}"),
            ServiceError::NotFound(msg) => write!(f, "Service not found: {msg}"),
            ServiceError::Unauthorized(msg) => write!(f, "Unauthorized: {msg}"),
            ServiceError::Fault(msg) => write!(f, "Orchestration fault: {msg}"),
            ServiceError::IllegalState(msg) => write!(f, "Illegal state: {msg}"),
            ServiceError::Load(msg) => write!(f, "Load error: {msg}"),
            ServiceError::Remote(msg) => write!(f, "Remote target error: {msg}"),
            ServiceError::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl std::error::Error for ServiceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServiceError::Network(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        ServiceError::Network(err)
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Decode(err.to_string())
    }
}

/// Result type alias for runtime operations
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Helper trait for adding context to errors
pub trait ErrorContext<T> {
    fn with_context(self, context: &str) -> ServiceResult<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: fmt::Display,
{
    fn with_context(self, context: &str) -> ServiceResult<T> {
        self.map_err(|e| ServiceError::Internal(format!("{context}: {e}")))
    }
}

/// Convenience macros for error creation
#[macro_export]
macro_rules! load_error {
    ($msg:expr) => {
        $crate::core::error::ServiceError::Load($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::error::ServiceError::Load(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::core::error::ServiceError::Internal($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::error::ServiceError::Internal(format!($fmt, $($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_are_stable() {
        assert_eq!(
            ServiceError::NotFound("x".into()).wire_code(),
            code::NOT_FOUND
        );
        assert_eq!(ServiceError::Decode("x".into()).wire_code(), code::DECODE);
        assert_eq!(
            ServiceError::Unauthorized("x".into()).wire_code(),
            code::UNAUTHORIZED
        );
        assert_eq!(ServiceError::Fault("x".into()).wire_code(), code::FAULT);
    }

    #[test]
    fn display_and_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ServiceError = io_error.into();
        assert!(matches!(err, ServiceError::Network(_)));
        assert!(err.to_string().contains("Network error"));

        let result: ServiceResult<()> = Err(internal_error!("boom {}", 42));
        assert!(result.unwrap_err().to_string().contains("boom 42"));
    }

    #[test]
    fn with_context_wraps_message() {
        let r: Result<(), String> = Err("inner".to_string());
        let err = r.with_context("loading bundle").unwrap_err();
        assert!(err.to_string().contains("loading bundle: inner"));
    }
}
