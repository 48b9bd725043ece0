//! Error types for the remote proxy.

use std::time::Duration;
use thiserror::Error;

/// Proxy error type.
///
/// `NotConnected`, `PreconditionFailed` and post-teardown `Aborted` are
/// returned synchronously by the facade. Every other kind reaches the caller
/// through [`CompletionHandler::on_failure`](crate::CompletionHandler::on_failure).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    /// No live connection to the remote service
    #[error("Not connected to the remote service")]
    NotConnected,

    /// Command-specific precondition unmet (module not opened, slot busy)
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// Remote service answered with a failure code
    #[error("Remote failure (code {0})")]
    RemoteFailure(i32),

    /// No answer or progress within the deadline
    #[error("Timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Connection dropped while the command was in flight
    #[error("Remote service disconnected")]
    Disconnected,

    /// Explicit teardown
    #[error("Aborted")]
    Aborted,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ProxyError {
    /// Returns true for failures the caller may reasonably retry once the
    /// connection is back.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProxyError::NotConnected | ProxyError::Timeout(_) | ProxyError::Disconnected
        )
    }
}

/// Synchronous fault raised by a [`RemoteChannel`](crate::RemoteChannel) call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Remote call rejected (code {code}): {message}")]
pub struct RemoteFault {
    pub code: i32,
    pub message: String,
}

impl RemoteFault {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;
