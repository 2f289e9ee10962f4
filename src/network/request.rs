//! Request side of an intercepted request

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::header::HeaderMap;
use hyper::{Method, Request, Version};

use super::hijack::HijackedSocket;
use crate::message::Headers;
use crate::{MitmError, Result};

/// Body of an intercepted request: the live stream, or chunks buffered
/// after it was consumed
#[derive(Debug)]
pub enum RequestBody {
    /// Streaming from the client
    Incoming(Incoming),
    /// Replayed from memory
    Buffered(VecDeque<Bytes>),
}

impl RequestBody {
    /// An already drained body
    #[must_use]
    pub fn empty() -> Self {
        Self::Buffered(VecDeque::new())
    }
}

impl From<Vec<Bytes>> for RequestBody {
    fn from(chunks: Vec<Bytes>) -> Self {
        Self::Buffered(chunks.into())
    }
}

impl Body for RequestBody {
    type Data = Bytes;
    type Error = MitmError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>>>> {
        match self.get_mut() {
            Self::Incoming(body) => Pin::new(body)
                .poll_frame(cx)
                .map(|frame| frame.map(|frame| frame.map_err(MitmError::from))),
            Self::Buffered(chunks) => Poll::Ready(chunks.pop_front().map(|chunk| Ok(Frame::data(chunk)))),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            Self::Incoming(body) => body.is_end_stream(),
            Self::Buffered(chunks) => chunks.is_empty(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            Self::Incoming(body) => body.size_hint(),
            Self::Buffered(chunks) => SizeHint::with_exact(chunks.iter().map(|c| c.len() as u64).sum()),
        }
    }
}

/// A request that arrived on a hijacked connection
#[derive(Debug)]
pub struct InterceptedRequest {
    method: Method,
    path: String,
    version: Version,
    headers: HeaderMap,
    body: RequestBody,
    socket: HijackedSocket,
}

impl InterceptedRequest {
    pub(crate) fn from_hyper(request: Request<Incoming>, socket: HijackedSocket) -> Self {
        let (parts, body) = request.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map_or_else(|| parts.uri.path().to_string(), ToString::to_string);

        Self {
            method: parts.method,
            path,
            version: parts.version,
            headers: parts.headers,
            body: RequestBody::Incoming(body),
            socket,
        }
    }

    /// Build a request from parts
    #[must_use]
    pub fn new(
        method: Method,
        path: impl Into<String>,
        headers: HeaderMap,
        body: RequestBody,
        socket: HijackedSocket,
    ) -> Self {
        Self {
            method,
            path: path.into(),
            version: Version::HTTP_11,
            headers,
            body,
            socket,
        }
    }

    /// Request method
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Path and query, as sent on the request line
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Protocol string such as `HTTP/1.1`
    pub fn protocol(&self) -> String {
        format!("{:?}", self.version)
    }

    /// Raw headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Headers with canonical names
    pub fn canonical_headers(&self) -> Headers {
        Headers::from_header_map(&self.headers)
    }

    /// Socket of the hijacked connection
    pub fn socket(&self) -> &HijackedSocket {
        &self.socket
    }

    /// Mutable access to the body
    pub fn body_mut(&mut self) -> &mut RequestBody {
        &mut self.body
    }

    /// Take the body, leaving an empty one behind
    pub fn take_body(&mut self) -> RequestBody {
        std::mem::replace(&mut self.body, RequestBody::empty())
    }

    /// Make already consumed chunks readable again
    pub fn replay_body(&mut self, chunks: Vec<Bytes>) {
        self.body = RequestBody::from(chunks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::consume_body;
    use crate::network::ConnectOptions;

    #[tokio::test]
    async fn test_replayed_body_reads_again() {
        let socket = HijackedSocket::new(7, ConnectOptions::new("example.com", 80, false));
        let mut request = InterceptedRequest::new(
            Method::POST,
            "/items?page=2",
            HeaderMap::new(),
            RequestBody::from(vec![Bytes::from("a"), Bytes::from("b")]),
            socket,
        );

        let first = consume_body(request.take_body(), 1024).await.into_result().unwrap();
        assert_eq!(first, Bytes::from("ab"));
        assert!(request.body_mut().is_end_stream());

        request.replay_body(vec![Bytes::from("ab")]);
        let again = consume_body(request.take_body(), 1024).await.into_result().unwrap();
        assert_eq!(again, Bytes::from("ab"));
        assert_eq!(request.protocol(), "HTTP/1.1");
        assert_eq!(request.path(), "/items?page=2");
    }
}
