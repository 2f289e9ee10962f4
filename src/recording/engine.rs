//! Recording engine for capturing traffic

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use bytes::Bytes;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::collect::consume_body;
use crate::config::LimitsConfig;
use crate::dispatch::RequestHandler;
use crate::message::{Body, Fixture, Headers, MessageRecord, RecordedExchange};
use crate::network::{
    ForwardRequest, ForwardedResponse, HijackConnector, InterceptedRequest, PendingConnect,
    ResponseSink, UpstreamClient,
};
use crate::{MitmError, Result};

/// Records every intercepted request together with the response of its real
/// upstream.
///
/// Each request is forwarded over exactly one bypassed connection: the dial
/// announced right after forwarding starts goes to the network, every other
/// dial stays intercepted.
pub struct RecordingEngine {
    bypass_next_connect: AtomicBool,
    exchanges: Mutex<Vec<RecordedExchange>>,
    upstream: UpstreamClient,
    limits: LimitsConfig,
}

impl RecordingEngine {
    /// Create a recording engine forwarding through `connector`
    #[must_use]
    pub fn new(connector: HijackConnector, limits: LimitsConfig) -> Self {
        Self {
            bypass_next_connect: AtomicBool::new(false),
            exchanges: Mutex::new(Vec::new()),
            upstream: UpstreamClient::new(connector, limits.max_response_size),
            limits,
        }
    }

    /// Number of exchanges recorded so far
    pub async fn exchange_count(&self) -> usize {
        self.exchanges.lock().await.len()
    }

    /// Drain the recorded exchanges into a trimmed fixture
    pub async fn finish(&self) -> Fixture {
        let exchanges = std::mem::take(&mut *self.exchanges.lock().await);
        info!("Recorded {} exchange(s)", exchanges.len());
        Fixture::from_recorded(exchanges)
    }

    async fn record(&self, mut request: InterceptedRequest, response: &mut ResponseSink) -> Result<()> {
        let options = request.socket().options().clone();
        let index = {
            let mut exchanges = self.exchanges.lock().await;
            exchanges.push(RecordedExchange {
                request: MessageRecord {
                    url: Some(request.path().to_string()),
                    method: Some(request.method().to_string()),
                    headers: request.canonical_headers(),
                    host: Some(options.host.clone()),
                    port: Some(options.port),
                    encrypted: options.encrypted.then_some(true),
                    ..MessageRecord::default()
                },
                response: MessageRecord::default(),
            });
            exchanges.len() - 1
        };

        let body = consume_body(request.take_body(), self.limits.max_request_size)
            .await
            .into_result()?;
        let (host, port) = upstream_target(request.headers(), options.encrypted)?;

        self.bypass_next_connect.store(true, Ordering::SeqCst);
        let forwarded = self
            .upstream
            .forward_request(&ForwardRequest {
                method: request.method(),
                host: &host,
                port,
                encrypted: options.encrypted,
                path: request.path(),
                headers: request.headers(),
                body: &body,
            })
            .await;
        self.bypass_next_connect.store(false, Ordering::SeqCst);
        let forwarded = forwarded?;
        debug!(
            "Recorded {} {} -> {}",
            request.method(),
            request.path(),
            forwarded.status
        );

        let headers = Headers::from_header_map(&forwarded.headers);
        {
            let mut exchanges = self.exchanges.lock().await;
            if let Some(exchange) = exchanges.get_mut(index) {
                exchange.request.body = non_empty(body);
                exchange.response = MessageRecord {
                    status_code: Some(forwarded.status.as_u16()),
                    headers: headers.clone(),
                    body: non_empty(forwarded.body.clone()),
                    ..MessageRecord::default()
                };
            }
        }

        tokio::task::yield_now().await;
        replay_response(response, &forwarded, &headers)
    }
}

impl RequestHandler for RecordingEngine {
    fn on_connect(&self, pending: PendingConnect) {
        if self.bypass_next_connect.swap(false, Ordering::SeqCst) {
            pending.bypass();
        } else {
            pending.intercept();
        }
    }

    async fn handle(&self, request: InterceptedRequest, mut response: ResponseSink) -> Result<()> {
        let socket = request.socket().clone();
        let result = self.record(request, &mut response).await;
        if let Err(e) = &result {
            socket.emit_error(e.to_string());
            response.destroy();
        }
        result
    }
}

fn host_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^([^:]*)(?::(\d+))?").expect("host pattern is valid"))
}

/// Split the Host header into the real upstream host and port
fn upstream_target(headers: &hyper::HeaderMap, encrypted: bool) -> Result<(String, u16)> {
    let raw = headers
        .get(hyper::header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let captures = host_pattern()
        .captures(raw)
        .filter(|captures| captures.get(1).is_some_and(|host| !host.as_str().is_empty()))
        .ok_or_else(|| MitmError::MissingHost(raw.to_string()))?;

    let host = captures.get(1).map_or("", |host| host.as_str()).to_string();
    let port = match captures.get(2) {
        Some(port) => port
            .as_str()
            .parse()
            .map_err(|_| MitmError::MissingHost(raw.to_string()))?,
        None if encrypted => 443,
        None => 80,
    };
    Ok((host, port))
}

fn non_empty(body: Bytes) -> Option<Body> {
    (!body.is_empty()).then_some(Body::Bytes(body))
}

fn replay_response(
    response: &mut ResponseSink,
    forwarded: &ForwardedResponse,
    headers: &Headers,
) -> Result<()> {
    response.set_status(forwarded.status.as_u16())?;
    for (name, value) in headers.iter() {
        response.append_header(name, value)?;
    }
    response.end_with(forwarded.body.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::{HeaderValue, HOST};
    use hyper::HeaderMap;

    fn host_headers(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn test_upstream_target_from_host_header() {
        assert_eq!(
            upstream_target(&host_headers("example.com"), false).unwrap(),
            ("example.com".to_string(), 80)
        );
        assert_eq!(
            upstream_target(&host_headers("example.com"), true).unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            upstream_target(&host_headers("localhost:8080"), false).unwrap(),
            ("localhost".to_string(), 8080)
        );
    }

    #[test]
    fn test_missing_host_rejected() {
        assert!(matches!(
            upstream_target(&HeaderMap::new(), false),
            Err(MitmError::MissingHost(_))
        ));
        assert!(matches!(
            upstream_target(&host_headers(":8080"), false),
            Err(MitmError::MissingHost(_))
        ));
        assert!(matches!(
            upstream_target(&host_headers("example.com:99999"), false),
            Err(MitmError::MissingHost(_))
        ));
    }

    #[tokio::test]
    async fn test_one_connect_bypassed_per_forward() {
        use crate::network::{ConnectOptions, Verdict};

        let hijacker = crate::network::Hijacker::new(&LimitsConfig::default());
        let engine = RecordingEngine::new(hijacker.connector(), LimitsConfig::default());
        let dial = || PendingConnect::detached(ConnectOptions::new("example.com", 80, false));

        let (pending, verdict) = dial();
        engine.on_connect(pending);
        assert_eq!(verdict.await.unwrap(), Verdict::Intercept);

        engine.bypass_next_connect.store(true, Ordering::SeqCst);
        let (pending, verdict) = dial();
        engine.on_connect(pending);
        assert_eq!(verdict.await.unwrap(), Verdict::Bypass);

        let (pending, verdict) = dial();
        engine.on_connect(pending);
        assert_eq!(verdict.await.unwrap(), Verdict::Intercept);
    }

    #[tokio::test]
    async fn test_nothing_recorded() {
        let hijacker = crate::network::Hijacker::new(&LimitsConfig::default());
        let engine = RecordingEngine::new(hijacker.connector(), LimitsConfig::default());

        assert_eq!(engine.exchange_count().await, 0);
        assert_eq!(engine.finish().await, Fixture::Many(Vec::new()));
    }
}
