//! HTTP client for forwarding recorded requests to their real upstream

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::HeaderMap;
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, warn};

use super::hijack::{HijackConnector, HttpClient};
use crate::collect::consume_body;
use crate::error::error_chain;
use crate::{MitmError, Result};

/// HTTP client for the upstream leg of recorded requests.
///
/// It dials through the session's [`HijackConnector`] and never reuses a
/// connection, so every forwarded request announces exactly one dial that
/// the recorder can bypass.
pub struct UpstreamClient {
    client: HttpClient,
    max_response_size: usize,
}

impl UpstreamClient {
    /// Create a new upstream client
    #[must_use]
    pub fn new(connector: HijackConnector, max_response_size: usize) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        Self {
            client,
            max_response_size,
        }
    }

    /// Forward a request to the target endpoint
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or its response cannot be read
    pub async fn forward_request(&self, request: &ForwardRequest<'_>) -> Result<ForwardedResponse> {
        let scheme = if request.encrypted { "https" } else { "http" };
        let uri = build_uri(scheme, request.host, request.port, request.path)?;

        debug!("Forwarding {} to {}", request.method, uri);

        let mut request_builder = Request::builder().method(request.method.clone()).uri(uri);
        for (name, value) in request.headers {
            request_builder = request_builder.header(name, value);
        }

        let http_request = request_builder
            .body(Full::new(request.body.clone()))
            .map_err(|e| MitmError::Upstream(format!("Failed to build request: {e}")))?;

        let response = self.client.request(http_request).await.map_err(|e| {
            warn!("Request failed: {}", error_chain(&e));
            MitmError::Upstream(error_chain(&e))
        })?;

        let (parts, body) = response.into_parts();
        let body = consume_body(body, self.max_response_size)
            .await
            .into_result()?;

        Ok(ForwardedResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }
}

/// Request to be forwarded
#[derive(Debug)]
pub struct ForwardRequest<'a> {
    /// HTTP method
    pub method: &'a Method,
    /// Target host
    pub host: &'a str,
    /// Target port
    pub port: u16,
    /// Whether the target expects TLS
    pub encrypted: bool,
    /// Path and query
    pub path: &'a str,
    /// Request headers, forwarded as received
    pub headers: &'a HeaderMap,
    /// Request body
    pub body: &'a Bytes,
}

/// Response from forwarded request
#[derive(Debug, Clone)]
pub struct ForwardedResponse {
    /// HTTP status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

/// Build a URI from components
fn build_uri(scheme: &str, host: &str, port: u16, path: &str) -> Result<Uri> {
    let host = if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    };
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    let uri = format!("{scheme}://{host}:{port}{path}");

    uri.parse::<Uri>()
        .map_err(|e| MitmError::Upstream(format!("Invalid URI '{uri}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_uri_simple() {
        let uri = build_uri("http", "example.com", 80, "/api/test").unwrap();
        assert_eq!(uri.to_string(), "http://example.com:80/api/test");
    }

    #[test]
    fn test_build_uri_with_query() {
        let uri = build_uri("http", "example.com", 8080, "/api/test?key1=value1&key2=value%202")
            .unwrap();
        assert_eq!(
            uri.to_string(),
            "http://example.com:8080/api/test?key1=value1&key2=value%202"
        );
    }

    #[test]
    fn test_build_uri_ipv6_and_relative_path() {
        let uri = build_uri("https", "::1", 443, "health").unwrap();
        assert_eq!(uri.to_string(), "https://[::1]:443/health");
    }

    #[test]
    fn test_build_uri_invalid() {
        assert!(matches!(
            build_uri("http", "exa mple.com", 80, "/"),
            Err(MitmError::Upstream(_))
        ));
    }
}
