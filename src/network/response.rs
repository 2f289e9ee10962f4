//! Response side of an intercepted request

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use hyper::body::{Body, Frame};
use hyper::header::HeaderMap;
use hyper::{Response, StatusCode};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::hijack::HijackedSocket;
use super::observer::{RawObservation, RawTap};
use crate::message::header_pair;
use crate::{MitmError, Result};

type BodySender = mpsc::UnboundedSender<Result<Bytes>>;

/// Body of an intercepted response, fed by its [`ResponseSink`]
#[derive(Debug)]
pub struct ChannelBody {
    rx: mpsc::UnboundedReceiver<Result<Bytes>>,
    tap: RawTap,
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = MitmError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>>>> {
        self.rx
            .poll_recv(cx)
            .map(|item| item.map(|chunk| chunk.map(Frame::data)))
    }
}

impl Drop for ChannelBody {
    fn drop(&mut self) {
        self.tap.mark_body_released();
    }
}

/// Writable handle for the response to an intercepted request.
///
/// Status and headers are buffered until the head is sent, which happens on
/// [`write_head`](Self::write_head) or implicitly on the first write or end.
/// Body chunks stream to the client as they are written. A sink dropped
/// without [`end`](Self::end) closes the connection.
#[derive(Debug)]
pub struct ResponseSink {
    status: StatusCode,
    headers: HeaderMap,
    head: Option<oneshot::Sender<Response<ChannelBody>>>,
    body: Option<BodySender>,
    socket: HijackedSocket,
    tap: RawTap,
    finished: Option<oneshot::Sender<()>>,
    finish_rx: Option<oneshot::Receiver<()>>,
    ended: bool,
}

impl ResponseSink {
    pub(crate) fn new(
        socket: HijackedSocket,
        tap: RawTap,
    ) -> (Self, oneshot::Receiver<Response<ChannelBody>>) {
        let (head_tx, head_rx) = oneshot::channel();
        let (finished, finish_rx) = oneshot::channel();
        let sink = Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            head: Some(head_tx),
            body: None,
            socket,
            tap,
            finished: Some(finished),
            finish_rx: Some(finish_rx),
            ended: false,
        };
        (sink, head_rx)
    }

    /// Socket of the hijacked connection this response travels on
    pub fn socket(&self) -> &HijackedSocket {
        &self.socket
    }

    /// Status code to send
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Whether the head has been sent
    pub fn headers_sent(&self) -> bool {
        self.head.is_none()
    }

    /// Whether the response was ended or destroyed
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Set the status code
    ///
    /// # Errors
    ///
    /// Returns error if the code is invalid or the head was already sent
    pub fn set_status(&mut self, status: u16) -> Result<()> {
        self.ensure_head_pending()?;
        self.status = StatusCode::from_u16(status)
            .map_err(|e| MitmError::InvalidResponse(format!("status {status}: {e}")))?;
        Ok(())
    }

    /// Replace all values of a header
    ///
    /// # Errors
    ///
    /// Returns error if the header is invalid or the head was already sent
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<()> {
        self.ensure_head_pending()?;
        let (name, value) = header_pair(name, value)?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Add a header value
    ///
    /// # Errors
    ///
    /// Returns error if the header is invalid or the head was already sent
    pub fn append_header(&mut self, name: &str, value: &str) -> Result<()> {
        self.ensure_head_pending()?;
        let (name, value) = header_pair(name, value)?;
        self.headers.append(name, value);
        Ok(())
    }

    fn ensure_head_pending(&self) -> Result<()> {
        if self.headers_sent() {
            return Err(MitmError::InvalidResponse(
                "headers were already sent".to_string(),
            ));
        }
        Ok(())
    }

    /// Send the status line and headers
    ///
    /// # Errors
    ///
    /// Returns error if the client connection is gone
    pub fn write_head(&mut self) -> Result<()> {
        let Some(head) = self.head.take() else {
            return Ok(());
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let mut response = Response::new(ChannelBody {
            rx,
            tap: self.tap.clone(),
        });
        *response.status_mut() = self.status;
        *response.headers_mut() = std::mem::take(&mut self.headers);

        head.send(response).map_err(|_| MitmError::ConnectionClosed)?;
        self.body = Some(tx);
        Ok(())
    }

    /// Write a body chunk, sending the head first if needed
    ///
    /// # Errors
    ///
    /// Returns error if the response already ended or the client is gone
    pub fn write(&mut self, chunk: impl Into<Bytes>) -> Result<()> {
        if self.ended {
            return Err(MitmError::InvalidResponse("write after end".to_string()));
        }
        self.write_head()?;

        let chunk = chunk.into();
        if chunk.is_empty() {
            return Ok(());
        }
        match &self.body {
            Some(body) => body.send(Ok(chunk)).map_err(|_| MitmError::ConnectionClosed),
            None => Err(MitmError::ConnectionClosed),
        }
    }

    /// Finish the response
    ///
    /// # Errors
    ///
    /// Returns error if the client connection is gone; the response counts
    /// as ended either way
    pub fn end(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let result = self.write_head();
        self.body = None;
        self.ended = true;
        self.tap.mark_ended();
        self.notify_finished();
        result
    }

    /// Write a final chunk and finish the response
    ///
    /// # Errors
    ///
    /// Returns error if the client connection is gone
    pub fn end_with(&mut self, chunk: impl Into<Bytes>) -> Result<()> {
        let written = self.write(chunk);
        let ended = self.end();
        written.and(ended)
    }

    /// Abort the response and close the connection
    pub fn destroy(&mut self) {
        if self.ended {
            return;
        }
        debug!(socket = self.socket.id(), "Destroying response");
        self.ended = true;
        self.tap.mark_destroyed();
        self.head = None;
        if let Some(body) = self.body.take() {
            let _ = body.send(Err(MitmError::ConnectionClosed));
        }
        self.notify_finished();
    }

    /// Capture the raw bytes this response puts on the wire
    pub fn observe(&self) -> RawObservation {
        self.tap.observe()
    }

    /// Resolves once the response ended or was destroyed
    pub(crate) fn on_finish(&mut self) -> oneshot::Receiver<()> {
        self.finish_rx.take().unwrap_or_else(|| oneshot::channel().1)
    }

    fn notify_finished(&mut self) {
        if let Some(finished) = self.finished.take() {
            let _ = finished.send(());
        }
    }
}

impl Drop for ResponseSink {
    fn drop(&mut self) {
        self.destroy();
    }
}
