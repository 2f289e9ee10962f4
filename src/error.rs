//! Error types for Mitmock

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for Mitmock operations
pub type Result<T> = std::result::Result<T, MitmError>;

/// Errors that can occur while recording or mocking HTTP traffic
#[derive(Debug, Error)]
pub enum MitmError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// HTTP transport error raised by hyper
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Request/response too large
    #[error("Data too large: {size} bytes exceeds limit of {limit} bytes")]
    DataTooLarge {
        /// Actual size
        size: usize,
        /// Size limit
        limit: usize,
    },

    /// The upstream target of a recorded request could not be determined
    #[error("Could not determine the host name from Host header: {0}")]
    MissingHost(String),

    /// A stream was given where a comparable request body is required
    #[error("A stream cannot be used to verify the request body, specify the bytes instead")]
    StreamedRequestBody,

    /// Invalid header name or value
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Invalid status code or response head
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Fixture could not be interpreted
    #[error("Invalid fixture: {0}")]
    InvalidFixture(String),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The real upstream request failed
    #[error("Upstream request failed: {0}")]
    Upstream(String),

    /// Operation not supported by this crate
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The peer of a hijacked connection went away
    #[error("Connection closed")]
    ConnectionClosed,

    /// Interception was disabled while traffic was still flowing
    #[error("Interception disabled")]
    Disabled,

    /// A request handler panicked while processing an intercepted request
    #[error("Request handler panicked")]
    HandlerPanicked,

    /// A mock declared that the exchange should fail
    #[error("Mock error: {0}")]
    Mock(#[from] MockError),

    /// The assertion body driving the session failed
    #[error("Assertion failed: {0:#}")]
    Assertion(anyhow::Error),

    /// The observed conversation did not satisfy the expectation
    #[error("Conversation mismatch:\n{0}")]
    Mismatch(String),
}

/// An error value declared by a mock, or raised by a function-style handler.
///
/// Unlike [`MitmError`] this is plain data: it is cloned into conversations
/// and compared against expectations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct MockError {
    /// Error class name, `Error` unless given
    pub name: String,
    /// Human readable message
    pub message: String,
    /// Optional machine readable code such as `ECONNRESET`
    pub code: Option<String>,
}

impl MockError {
    /// Create an error with the given message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: "Error".to_string(),
            message: message.into(),
            code: None,
        }
    }

    /// Set the error class name
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the error code
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Convert an arbitrary handler failure into a mock error
    pub fn from_failure(error: &anyhow::Error) -> Self {
        match error.downcast_ref::<MockError>() {
            Some(mock) => mock.clone(),
            None => Self::new(format!("{error:#}")),
        }
    }
}

impl fmt::Display for MockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{}: {} ({code})", self.name, self.message),
            None => write!(f, "{}: {}", self.name, self.message),
        }
    }
}

/// Render an error together with its source chain
pub(crate) fn error_chain(error: &dyn std::error::Error) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}
