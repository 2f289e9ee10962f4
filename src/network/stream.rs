//! Client-side transport of a hijacked connection

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, Waker};

use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;

use super::observer::RawTap;

#[derive(Debug, Default)]
struct FaultState {
    error: Option<String>,
    waker: Option<Waker>,
}

/// Connection-level failure injected into a hijacked connection
#[derive(Debug, Clone, Default)]
pub(crate) struct FaultSlot {
    state: Arc<Mutex<FaultState>>,
}

impl FaultSlot {
    pub(crate) fn raise(&self, message: String) {
        let waker = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.error.get_or_insert(message);
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn poll_fault(&self, cx: &Context<'_>) -> Option<io::Error> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match &state.error {
            Some(message) => Some(io::Error::new(io::ErrorKind::ConnectionReset, message.clone())),
            None => {
                state.waker = Some(cx.waker().clone());
                None
            }
        }
    }
}

/// Either an in-memory pipe to the interception layer, or a real socket
#[derive(Debug)]
pub(crate) enum HijackedStream {
    Intercepted { io: DuplexStream, fault: FaultSlot },
    Bypassed(TcpStream),
}

impl AsyncRead for HijackedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Intercepted { io, fault } => {
                if let Some(error) = fault.poll_fault(cx) {
                    return Poll::Ready(Err(error));
                }
                Pin::new(io).poll_read(cx, buf)
            }
            Self::Bypassed(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for HijackedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Intercepted { io, fault } => {
                if let Some(error) = fault.poll_fault(cx) {
                    return Poll::Ready(Err(error));
                }
                Pin::new(io).poll_write(cx, buf)
            }
            Self::Bypassed(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Intercepted { io, .. } => Pin::new(io).poll_flush(cx),
            Self::Bypassed(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Intercepted { io, .. } => Pin::new(io).poll_shutdown(cx),
            Self::Bypassed(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Connection handed to the hyper client by [`super::HijackConnector`]
#[derive(Debug)]
pub struct HijackedIo {
    inner: TokioIo<HijackedStream>,
}

impl HijackedIo {
    pub(crate) fn new(stream: HijackedStream) -> Self {
        Self {
            inner: TokioIo::new(stream),
        }
    }
}

impl hyper::rt::Read for HijackedIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        hyper::rt::Read::poll_read(Pin::new(&mut self.get_mut().inner), cx, buf)
    }
}

impl hyper::rt::Write for HijackedIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        hyper::rt::Write::poll_write(Pin::new(&mut self.get_mut().inner), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        hyper::rt::Write::poll_flush(Pin::new(&mut self.get_mut().inner), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        hyper::rt::Write::poll_shutdown(Pin::new(&mut self.get_mut().inner), cx)
    }
}

impl Connection for HijackedIo {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// Server-side transport that copies every accepted write into a [`RawTap`]
pub(crate) struct TappedIo<T> {
    inner: T,
    tap: RawTap,
}

impl<T> TappedIo<T> {
    pub(crate) fn new(inner: T, tap: RawTap) -> Self {
        Self { inner, tap }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for TappedIo<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for TappedIo<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = &poll {
            this.tap.record_write(&buf[..*written]);
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_flush(cx);
        if let Poll::Ready(Ok(())) = &poll {
            this.tap.record_flush();
        }
        poll
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
