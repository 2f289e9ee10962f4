//! Connection hijacking
//!
//! A [`Hijacker`] owns the interception layer of one session. Every dial made
//! through its [`HijackConnector`] is announced as a [`HijackEvent::Connect`];
//! the receiver either bypasses it to the real network or lets it be
//! intercepted, in which case the connection is served in-process by a hyper
//! HTTP/1 server and each request it carries is announced as a
//! [`HijackEvent::Request`].

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::DuplexStream;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::observer::RawTap;
use super::request::InterceptedRequest;
use super::response::ResponseSink;
use super::stream::{FaultSlot, HijackedIo, HijackedStream, TappedIo};
use crate::config::LimitsConfig;
use crate::{MitmError, Result};

/// HTTP client whose connections go through a [`Hijacker`]
pub type HttpClient = Client<HijackConnector, Full<Bytes>>;

/// Something that happened on the interception layer
#[derive(Debug)]
pub enum HijackEvent {
    /// A connection is being dialed
    Connect(PendingConnect),
    /// A request arrived on an intercepted connection
    Request(InterceptedRequest, ResponseSink),
}

/// Dial options of a hijacked connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Target host name
    pub host: String,
    /// Target port
    pub port: u16,
    /// Whether the dial asked for TLS
    pub encrypted: bool,
}

impl ConnectOptions {
    /// Create dial options
    pub fn new(host: impl Into<String>, port: u16, encrypted: bool) -> Self {
        Self {
            host: host.into(),
            port,
            encrypted,
        }
    }

    /// Derive dial options from a request URI; `https` means encrypted and
    /// ports default to 80/443
    ///
    /// # Errors
    ///
    /// Returns error if the URI has no host
    pub fn from_uri(uri: &Uri) -> Result<Self> {
        let encrypted = uri.scheme_str() == Some("https");
        let host = uri
            .host()
            .ok_or_else(|| MitmError::MissingHost(uri.to_string()))?
            .trim_start_matches('[')
            .trim_end_matches(']');
        let port = uri.port_u16().unwrap_or(if encrypted { 443 } else { 80 });
        Ok(Self::new(host, port, encrypted))
    }
}

/// Handle to one hijacked connection
#[derive(Debug, Clone)]
pub struct HijackedSocket {
    id: u64,
    options: Arc<ConnectOptions>,
    fault: FaultSlot,
}

impl HijackedSocket {
    /// Create a socket handle that is not attached to any transport
    #[must_use]
    pub fn new(id: u64, options: ConnectOptions) -> Self {
        Self {
            id,
            options: Arc::new(options),
            fault: FaultSlot::default(),
        }
    }

    /// Session-unique connection number
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Options the connection was dialed with
    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// Fail the connection: the client sees this error on its next read or
    /// write
    pub fn emit_error(&self, message: impl Into<String>) {
        let message = message.into();
        debug!(socket = self.id, %message, "Emitting error on hijacked socket");
        self.fault.raise(message);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Intercept,
    Bypass,
}

/// A dial awaiting a decision; dropping it intercepts the connection
#[derive(Debug)]
pub struct PendingConnect {
    socket: HijackedSocket,
    reply: Option<oneshot::Sender<Verdict>>,
}

impl PendingConnect {
    #[cfg(test)]
    pub(crate) fn detached(options: ConnectOptions) -> (Self, oneshot::Receiver<Verdict>) {
        let (reply, verdict) = oneshot::channel();
        let pending = Self {
            socket: HijackedSocket::new(0, options),
            reply: Some(reply),
        };
        (pending, verdict)
    }

    /// Socket handle of the connection
    pub fn socket(&self) -> &HijackedSocket {
        &self.socket
    }

    /// Let this connection reach the real network untouched
    pub fn bypass(mut self) {
        self.reply(Verdict::Bypass);
    }

    /// Intercept this connection
    pub fn intercept(mut self) {
        self.reply(Verdict::Intercept);
    }

    fn reply(&mut self, verdict: Verdict) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(verdict);
        }
    }
}

impl Drop for PendingConnect {
    fn drop(&mut self) {
        self.reply(Verdict::Intercept);
    }
}

#[derive(Debug)]
struct Shared {
    events: Mutex<Option<mpsc::UnboundedSender<HijackEvent>>>,
    next_socket: AtomicU64,
    buffer_size: usize,
}

impl Shared {
    fn sender(&self) -> Option<mpsc::UnboundedSender<HijackEvent>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn emit(&self, event: HijackEvent) -> Result<()> {
        self.sender()
            .ok_or(MitmError::Disabled)?
            .send(event)
            .map_err(|_| MitmError::Disabled)
    }

    async fn connect(self: Arc<Self>, uri: Uri) -> Result<HijackedIo> {
        let options = ConnectOptions::from_uri(&uri)?;
        let Some(events) = self.sender() else {
            return dial(&options).await;
        };

        let socket = HijackedSocket::new(self.next_socket.fetch_add(1, Ordering::Relaxed), options);
        let (reply, verdict) = oneshot::channel();
        let pending = PendingConnect {
            socket: socket.clone(),
            reply: Some(reply),
        };
        if events.send(HijackEvent::Connect(pending)).is_err() {
            return dial(socket.options()).await;
        }

        match verdict.await.unwrap_or(Verdict::Intercept) {
            Verdict::Bypass => {
                debug!(
                    socket = socket.id,
                    host = %socket.options.host,
                    port = socket.options.port,
                    "Bypassing connection"
                );
                dial(socket.options()).await
            }
            Verdict::Intercept => {
                debug!(
                    socket = socket.id,
                    host = %socket.options.host,
                    port = socket.options.port,
                    "Intercepting connection"
                );
                let (client, server) = tokio::io::duplex(self.buffer_size);
                let fault = socket.fault.clone();
                tokio::spawn(serve_connection(self, server, socket));
                Ok(HijackedIo::new(HijackedStream::Intercepted { io: client, fault }))
            }
        }
    }
}

async fn dial(options: &ConnectOptions) -> Result<HijackedIo> {
    if options.encrypted {
        return Err(MitmError::Unsupported(format!(
            "cannot reach {}:{} without TLS",
            options.host, options.port
        )));
    }
    let stream = TcpStream::connect((options.host.as_str(), options.port)).await?;
    stream.set_nodelay(true)?;
    Ok(HijackedIo::new(HijackedStream::Bypassed(stream)))
}

async fn serve_connection(shared: Arc<Shared>, io: DuplexStream, socket: HijackedSocket) {
    let tap = RawTap::new();
    let service = {
        let tap = tap.clone();
        let socket = socket.clone();
        service_fn(move |request: Request<Incoming>| {
            let shared = Arc::clone(&shared);
            let socket = socket.clone();
            let tap = tap.clone();
            async move {
                let (sink, head) = ResponseSink::new(socket.clone(), tap);
                let request = InterceptedRequest::from_hyper(request, socket);
                shared.emit(HijackEvent::Request(request, sink))?;
                head.await.map_err(|_| MitmError::ConnectionClosed)
            }
        })
    };

    let io = TokioIo::new(TappedIo::new(io, tap.clone()));
    if let Err(e) = http1::Builder::new()
        .keep_alive(true)
        .serve_connection(io, service)
        .await
    {
        debug!(socket = socket.id, "Hijacked connection ended: {}", e);
    }
    tap.mark_closed();
}

/// Session-scoped interception layer
#[derive(Debug)]
pub struct Hijacker {
    shared: Arc<Shared>,
    events: mpsc::UnboundedReceiver<HijackEvent>,
}

impl Hijacker {
    /// Enable interception
    #[must_use]
    pub fn new(limits: &LimitsConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        info!("Interception enabled");
        Self {
            shared: Arc::new(Shared {
                events: Mutex::new(Some(tx)),
                next_socket: AtomicU64::new(1),
                buffer_size: limits.connection_buffer_size,
            }),
            events: rx,
        }
    }

    /// Connector that routes dials through this layer
    #[must_use]
    pub fn connector(&self) -> HijackConnector {
        HijackConnector {
            shared: Arc::clone(&self.shared),
        }
    }

    /// HTTP client whose connections go through this layer
    #[must_use]
    pub fn client(&self) -> HttpClient {
        Client::builder(TokioExecutor::new()).build(self.connector())
    }

    /// Next event, or `None` once disabled
    pub async fn next_event(&mut self) -> Option<HijackEvent> {
        self.events.recv().await
    }

    /// Whether interception is active
    pub fn is_enabled(&self) -> bool {
        self.shared.sender().is_some()
    }

    /// Stop interception; dials still waiting for a decision are bypassed
    /// and unhandled requests are dropped
    pub fn disable(&mut self) {
        let was_enabled = self
            .shared
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        self.events.close();
        while let Ok(event) = self.events.try_recv() {
            if let HijackEvent::Connect(pending) = event {
                pending.bypass();
            }
        }
        if was_enabled {
            info!("Interception disabled");
        }
    }
}

impl Drop for Hijacker {
    fn drop(&mut self) {
        self.disable();
    }
}

/// hyper connector that announces every dial to its [`Hijacker`]
#[derive(Debug, Clone)]
pub struct HijackConnector {
    shared: Arc<Shared>,
}

impl tower_service::Service<Uri> for HijackConnector {
    type Response = HijackedIo;
    type Error = MitmError;
    type Future = Pin<Box<dyn Future<Output = Result<HijackedIo>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        Box::pin(Arc::clone(&self.shared).connect(uri))
    }
}
