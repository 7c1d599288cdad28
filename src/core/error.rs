//! Unified error handling for rampart.
//!
//! One crate-wide error type covering the mediation layer's failure
//! taxonomy, so modules do not depend on each other for error handling.

use std::fmt;

/// Error kinds surfaced by the mediation layer.
#[derive(Debug)]
pub enum WafError {
    /// Request or response wire data the reparser cannot repair.
    /// Recovered by diverting the transaction to a 400.
    Malformed(String),

    /// The engine manager declined to hand out an engine, or the engine
    /// refused a connection/transaction. Recovered by session bypass.
    EngineDeclined(String),

    /// An engine callback arrived after the corresponding commit point.
    TooLate(&'static str),

    /// A stream edit targets bytes already forwarded or bytes that will
    /// never arrive.
    EditOutOfRange(String),

    /// A host-proxy primitive returned failure.
    ProxyApi(String),

    /// Configuration or CLI errors.
    Config(String),

    /// I/O errors from the log and settings paths.
    Io(std::io::Error),

    /// Broken internal invariants; logged as bugs, transaction continues.
    Internal(String),
}

impl fmt::Display for WafError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WafError::Malformed(msg) => write!(f, "malformed input: {msg}"),
            WafError::EngineDeclined(msg) => write!(f, "engine declined: {msg}"),
            WafError::TooLate(what) => write!(f, "too late: {what}"),
            WafError::EditOutOfRange(msg) => write!(f, "edit out of range: {msg}"),
            WafError::ProxyApi(msg) => write!(f, "proxy API failure: {msg}"),
            WafError::Config(msg) => write!(f, "configuration error: {msg}"),
            WafError::Io(err) => write!(f, "I/O error: {err}"),
            WafError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for WafError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WafError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WafError {
    fn from(err: std::io::Error) -> Self {
        WafError::Io(err)
    }
}

impl From<WafError> for Box<pingora_error::Error> {
    fn from(err: WafError) -> Self {
        pingora_error::Error::new_str(match err {
            WafError::Malformed(_) => "malformed input",
            WafError::EngineDeclined(_) => "engine declined",
            WafError::TooLate(_) => "callback after commit point",
            WafError::EditOutOfRange(_) => "edit out of range",
            WafError::ProxyApi(_) => "proxy API failure",
            WafError::Config(_) => "configuration error",
            WafError::Io(_) => "I/O error",
            WafError::Internal(_) => "internal error",
        })
    }
}

/// Result type alias for mediation operations.
pub type WafResult<T> = std::result::Result<T, WafError>;

/// Helper trait for adding context to errors.
pub trait ErrorContext<T> {
    fn with_context(self, context: &str) -> WafResult<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: fmt::Display,
{
    fn with_context(self, context: &str) -> WafResult<T> {
        self.map_err(|e| WafError::Internal(format!("{context}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_kind() {
        let err = WafError::Malformed("no terminator".to_string());
        assert!(err.to_string().contains("malformed input"));

        let err = WafError::TooLate("response headers sent");
        assert!(err.to_string().contains("too late"));
    }

    #[test]
    fn io_errors_convert_and_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: WafError = io.into();
        assert!(matches!(err, WafError::Io(_)));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn context_wraps_into_internal() {
        let res: Result<(), String> = Err("boom".to_string());
        let err = res.with_context("notifying engine").unwrap_err();
        assert!(err.to_string().contains("notifying engine"));
    }
}
