//! Request matchers and their resolution

use hyper::Uri;

use super::spec::BodySpec;
use crate::message::{Body, Headers};
use crate::{MitmError, Result};

/// Expected properties of a request; absent fields are not compared
#[derive(Debug, Default)]
pub struct RequestProperties {
    /// Url, optionally prefixed by the method (`"POST /items"`) and
    /// optionally absolute (`"https://example.com/items"`)
    pub url: Option<String>,
    /// Method
    pub method: Option<String>,
    /// Headers that must be present with these values
    pub headers: Headers,
    /// Remote host
    pub host: Option<String>,
    /// Remote port
    pub port: Option<u16>,
    /// Whether the connection is encrypted
    pub encrypted: Option<bool>,
    /// Body
    pub body: Option<BodySpec>,
}

impl RequestProperties {
    /// Expect a url
    #[must_use]
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Expect a header
    #[must_use]
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Expect a body
    #[must_use]
    pub fn body(mut self, body: impl Into<BodySpec>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// How a test describes the request it expects
#[derive(Debug)]
pub enum RequestMatcher {
    /// Shorthand for a url
    Url(String),
    /// Full properties
    Properties(RequestProperties),
}

impl From<&str> for RequestMatcher {
    fn from(url: &str) -> Self {
        Self::Url(url.to_string())
    }
}

impl From<String> for RequestMatcher {
    fn from(url: String) -> Self {
        Self::Url(url)
    }
}

impl From<RequestProperties> for RequestMatcher {
    fn from(properties: RequestProperties) -> Self {
        Self::Properties(properties)
    }
}

impl RequestMatcher {
    /// Check that the matcher can be resolved
    ///
    /// # Errors
    ///
    /// Returns error if a stream is given as the expected body
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Properties(RequestProperties {
                body: Some(BodySpec::Stream(_)),
                ..
            }) => Err(MitmError::StreamedRequestBody),
            _ => Ok(()),
        }
    }

    /// Resolve into a fully qualified expectation
    ///
    /// # Errors
    ///
    /// Returns error if a stream is given as the expected body
    pub fn resolve(self) -> Result<ExpectedRequest> {
        let properties = match self {
            Self::Url(url) => RequestProperties::url(url),
            Self::Properties(properties) => properties,
        };

        let mut expected = ExpectedRequest {
            method: properties.method,
            url: properties.url,
            headers: properties.headers,
            host: properties.host,
            port: properties.port,
            encrypted: properties.encrypted,
            body: None,
        };

        if let Some((method, url)) = expected.url.as_deref().and_then(split_method) {
            expected.method = expected.method.or(Some(method));
            expected.url = Some(url);
        }

        if let Some(uri) = expected.url.as_deref().and_then(parse_absolute_url) {
            expected.apply_absolute_url(&uri);
        }

        match properties.body {
            Some(BodySpec::Stream(_)) => return Err(MitmError::StreamedRequestBody),
            Some(body) => {
                if body.is_structured() && !expected.headers.has("Content-Type") {
                    expected.headers.append("Content-Type", "application/json");
                }
                expected.body = body.to_body();
            }
            None => {}
        }

        Ok(expected)
    }
}

/// `"GET /path"` splits into the method and the rest
fn split_method(url: &str) -> Option<(String, String)> {
    let (method, rest) = url.split_once(' ')?;
    if method.is_empty() || !method.bytes().all(|b| b.is_ascii_uppercase()) {
        return None;
    }
    Some((method.to_string(), rest.to_string()))
}

fn parse_absolute_url(url: &str) -> Option<Uri> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return None;
    }
    url.parse::<Uri>().ok()
}

/// A resolved request expectation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpectedRequest {
    /// Method
    pub method: Option<String>,
    /// Path and query
    pub url: Option<String>,
    /// Headers that must be present with these values
    pub headers: Headers,
    /// Remote host
    pub host: Option<String>,
    /// Remote port
    pub port: Option<u16>,
    /// Whether the connection is encrypted
    pub encrypted: Option<bool>,
    /// Body
    pub body: Option<Body>,
}

impl ExpectedRequest {
    fn apply_absolute_url(&mut self, uri: &Uri) {
        let hostname = uri.host().unwrap_or_default();
        if !self.headers.has("Host") {
            let authority = match uri.port_u16() {
                Some(port) => format!("{hostname}:{port}"),
                None => hostname.to_string(),
            };
            self.headers.append("Host", authority);
        }
        if self.host.is_none() {
            self.host = Some(hostname.trim_start_matches('[').trim_end_matches(']').to_string());
        }
        if self.port.is_none() {
            self.port = uri.port_u16();
        }
        if uri.scheme_str() == Some("https") && self.encrypted.is_none() {
            self.encrypted = Some(true);
        }
        self.url = Some(
            uri.path_and_query()
                .map_or_else(|| "/".to_string(), ToString::to_string),
        );
    }
}
