//! Raw-byte observer
//!
//! Captures the bytes a response actually put on the wire. Delivery happens
//! exactly once, when the response has logically ended and its last byte has
//! been written: either the trailer of a chunked response was seen, or the
//! body was released by hyper and the transport flushed afterwards. A destroyed
//! response delivers nothing; a transport that closes mid-response delivers
//! what was captured.

use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;

const CHUNKED_TRAILER: &[u8] = b"0\r\n\r\n";

#[derive(Debug, Default)]
struct TapState {
    capturing: bool,
    buffer: BytesMut,
    chunked: Option<bool>,
    trailer_seen: bool,
    body_released: bool,
    flushed: bool,
    ended: bool,
    waiter: Option<oneshot::Sender<Option<Bytes>>>,
}

impl TapState {
    fn deliver(&mut self, raw: Option<Bytes>) {
        self.capturing = false;
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(raw);
        }
    }

    fn try_deliver(&mut self) {
        if self.capturing && self.ended && (self.trailer_seen || (self.body_released && self.flushed)) {
            let raw = self.buffer.split().freeze();
            self.deliver(Some(raw));
        }
    }
}

/// Write-path hook shared by a hijacked connection and its current response
#[derive(Debug, Clone, Default)]
pub struct RawTap {
    state: Arc<Mutex<TapState>>,
}

impl RawTap {
    /// Create an idle tap
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut TapState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Start capturing the next response
    pub fn observe(&self) -> RawObservation {
        let (tx, rx) = oneshot::channel();
        self.with_state(|state| {
            *state = TapState {
                capturing: true,
                waiter: Some(tx),
                ..TapState::default()
            };
        });
        RawObservation { rx }
    }

    pub(crate) fn record_write(&self, chunk: &[u8]) {
        self.with_state(|state| {
            if !state.capturing {
                return;
            }
            state.buffer.extend_from_slice(chunk);
            if state.chunked.is_none() {
                state.chunked = head_is_chunked(&state.buffer);
            }
            if state.chunked == Some(true) && state.buffer.ends_with(CHUNKED_TRAILER) {
                state.trailer_seen = true;
            }
            state.try_deliver();
        });
    }

    pub(crate) fn record_flush(&self) {
        self.with_state(|state| {
            if state.body_released {
                state.flushed = true;
            }
            state.try_deliver();
        });
    }

    /// The response handler called `end`
    pub(crate) fn mark_ended(&self) {
        self.with_state(|state| {
            state.ended = true;
            state.try_deliver();
        });
    }

    /// hyper dropped the response body, so no more body bytes will be queued
    pub(crate) fn mark_body_released(&self) {
        self.with_state(|state| state.body_released = true);
    }

    /// The response handler destroyed the response
    pub(crate) fn mark_destroyed(&self) {
        self.with_state(|state| {
            if state.capturing {
                state.ended = true;
                state.deliver(None);
            }
        });
    }

    /// The transport went away
    pub(crate) fn mark_closed(&self) {
        self.with_state(|state| {
            if state.capturing {
                let raw = (!state.buffer.is_empty()).then(|| state.buffer.split().freeze());
                state.deliver(raw);
            }
        });
    }
}

/// Whether a complete response head declares chunked framing; `None` while
/// the head is still partial
fn head_is_chunked(buffer: &[u8]) -> Option<bool> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut head = httparse::Response::new(&mut headers);
    match head.parse(buffer) {
        Ok(httparse::Status::Partial) => None,
        Ok(httparse::Status::Complete(_)) => Some(head.headers.iter().any(|header| {
            header.name.eq_ignore_ascii_case("transfer-encoding")
                && String::from_utf8_lossy(header.value)
                    .to_ascii_lowercase()
                    .contains("chunked")
        })),
        Err(_) => Some(false),
    }
}

/// Pending delivery of one response's raw bytes
#[derive(Debug)]
pub struct RawObservation {
    rx: oneshot::Receiver<Option<Bytes>>,
}

impl RawObservation {
    /// Wait for the raw bytes; `None` when the response was destroyed or
    /// nothing reached the wire
    pub async fn wait(self) -> Option<Bytes> {
        self.rx.await.ok().flatten()
    }
}
