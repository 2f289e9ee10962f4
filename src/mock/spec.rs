//! Response specifications

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use serde_json::Value;

use crate::message::{Body, Headers};
use crate::network::{InterceptedRequest, ResponseSink};
use crate::MockError;

/// Stream of body chunks; an item error fails the mock
pub type BodyStream = BoxStream<'static, std::result::Result<Bytes, MockError>>;

/// Function given direct control of an intercepted request and its response
pub type ResponseHandler = Arc<
    dyn Fn(InterceptedRequest, ResponseSink) -> BoxFuture<'static, anyhow::Result<()>>
        + Send
        + Sync,
>;

/// A body as declared by a test
pub enum BodySpec {
    /// Raw bytes
    Bytes(Bytes),
    /// Text
    Text(String),
    /// Structured JSON
    Json(Value),
    /// Chunks produced asynchronously
    Stream(BodyStream),
}

impl BodySpec {
    /// Wrap a stream of chunks
    pub fn stream<S>(stream: S) -> Self
    where
        S: futures_util::Stream<Item = std::result::Result<Bytes, MockError>> + Send + 'static,
    {
        Self::Stream(Box::pin(stream))
    }

    /// Whether the body is a JSON array or object
    #[must_use]
    pub fn is_structured(&self) -> bool {
        matches!(self, Self::Json(Value::Array(_) | Value::Object(_)))
    }

    /// Comparable form of the body; `None` for streams
    #[must_use]
    pub fn to_body(&self) -> Option<Body> {
        match self {
            Self::Bytes(bytes) => Some(Body::Bytes(bytes.clone())),
            Self::Text(text) => Some(Body::Text(text.clone())),
            Self::Json(value) => Some(Body::Json(value.clone())),
            Self::Stream(_) => None,
        }
    }
}

impl fmt::Debug for BodySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(bytes).finish(),
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<Body> for BodySpec {
    fn from(body: Body) -> Self {
        match body {
            Body::Bytes(bytes) => Self::Bytes(bytes),
            Body::Text(text) => Self::Text(text),
            Body::Json(value) => Self::Json(value),
        }
    }
}

impl From<&str> for BodySpec {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for BodySpec {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Bytes> for BodySpec {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for BodySpec {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl From<Value> for BodySpec {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

/// A structured mock response; absent fields take their defaults
#[derive(Debug, Default)]
pub struct ResponseProperties {
    /// Status code, 200 when absent
    pub status_code: Option<u16>,
    /// Reason phrase, derived from the status code when absent
    pub status_message: Option<String>,
    /// Protocol such as `HTTP/1.1`
    pub protocol: Option<String>,
    /// Headers
    pub headers: Headers,
    /// Body
    pub body: Option<BodySpec>,
}

impl ResponseProperties {
    /// Empty properties
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the status code
    #[must_use]
    pub fn status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    /// Set the reason phrase
    #[must_use]
    pub fn status_message(mut self, message: impl Into<String>) -> Self {
        self.status_message = Some(message.into());
        self
    }

    /// Add a header
    #[must_use]
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Set the body
    #[must_use]
    pub fn body(mut self, body: impl Into<BodySpec>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// What to answer an intercepted request with
pub enum ResponseSpec {
    /// A structured response
    Response(ResponseProperties),
    /// Literal HTTP response bytes
    Raw(Bytes),
    /// Fail the connection with this error
    Error(MockError),
    /// Hand the request and response over to a function
    Handler(ResponseHandler),
}

impl ResponseSpec {
    /// Respond with a bare status code
    #[must_use]
    pub fn status(status_code: u16) -> Self {
        Self::Response(ResponseProperties::new().status(status_code))
    }

    /// Respond 200 with a JSON body
    #[must_use]
    pub fn json(value: Value) -> Self {
        Self::Response(ResponseProperties::new().body(value))
    }

    /// Respond 200 with a text body
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Response(ResponseProperties::new().body(text.into()))
    }

    /// Respond with literal HTTP response bytes
    #[must_use]
    pub fn raw(bytes: impl Into<Bytes>) -> Self {
        Self::Raw(bytes.into())
    }

    /// Fail the connection
    #[must_use]
    pub fn error(error: MockError) -> Self {
        Self::Error(error)
    }

    /// Let a function produce the response
    pub fn handler<F, Fut>(handler: F) -> Self
    where
        F: Fn(InterceptedRequest, ResponseSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::Handler(Arc::new(move |request, response| {
            Box::pin(handler(request, response))
        }))
    }

    /// Whether this is a function handler
    #[must_use]
    pub fn is_handler(&self) -> bool {
        matches!(self, Self::Handler(_))
    }
}

impl fmt::Debug for ResponseSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Response(properties) => f.debug_tuple("Response").field(properties).finish(),
            Self::Raw(bytes) => f.debug_tuple("Raw").field(bytes).finish(),
            Self::Error(error) => f.debug_tuple("Error").field(error).finish(),
            Self::Handler(_) => f.write_str("Handler(..)"),
        }
    }
}

impl From<u16> for ResponseSpec {
    fn from(status_code: u16) -> Self {
        Self::status(status_code)
    }
}

impl From<ResponseProperties> for ResponseSpec {
    fn from(properties: ResponseProperties) -> Self {
        Self::Response(properties)
    }
}

impl From<MockError> for ResponseSpec {
    fn from(error: MockError) -> Self {
        Self::Error(error)
    }
}

impl From<Value> for ResponseSpec {
    fn from(value: Value) -> Self {
        Self::json(value)
    }
}
