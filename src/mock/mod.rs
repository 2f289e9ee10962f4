//! Mock mode
//!
//! Declared request descriptions are consumed in order, one per intercepted
//! request. Each request is answered from its description and the exchange
//! that actually went over the wire is appended to the conversation.

mod engine;
mod request;
mod response;
mod spec;

pub use engine::MockEngine;
pub use request::{ExpectedRequest, RequestMatcher, RequestProperties};
pub use response::MockResponse;
pub use spec::{BodySpec, BodyStream, ResponseHandler, ResponseProperties, ResponseSpec};

use crate::message::{CanonicalMessage, Fixture, MessageRecord, TrimmedExchange};
use crate::Result;

/// One expected request and what to answer it with
#[derive(Debug, Default)]
pub struct RequestDescription {
    /// The expected request; `None` expects nothing in particular
    pub request: Option<RequestMatcher>,
    /// The response; `None` answers with an empty 200
    pub response: Option<ResponseSpec>,
}

impl RequestDescription {
    /// Expect a request
    pub fn new(request: impl Into<RequestMatcher>) -> Self {
        Self {
            request: Some(request.into()),
            response: None,
        }
    }

    /// Answer with `response`
    #[must_use]
    pub fn respond(mut self, response: impl Into<ResponseSpec>) -> Self {
        self.response = Some(response.into());
        self
    }

    /// Check that the description can be resolved
    ///
    /// # Errors
    ///
    /// Returns error if a stream is given as the expected request body
    pub fn validate(&self) -> Result<()> {
        self.request.as_ref().map_or(Ok(()), RequestMatcher::validate)
    }

    /// Descriptions that replay every exchange of a fixture
    pub fn from_fixture(fixture: Fixture) -> Vec<Self> {
        fixture.into_exchanges().into_iter().map(Self::from).collect()
    }
}

impl From<&str> for RequestDescription {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

impl From<TrimmedExchange> for RequestDescription {
    fn from(exchange: TrimmedExchange) -> Self {
        let request = match exchange.request {
            CanonicalMessage::Url(url) => RequestMatcher::Url(url),
            other => RequestMatcher::Properties(request_properties(other.into_record())),
        };
        let response = match exchange.response {
            CanonicalMessage::StatusCode(status_code) => ResponseSpec::status(status_code),
            other => ResponseSpec::Response(response_properties(other.into_record())),
        };

        Self {
            request: Some(request),
            response: Some(response),
        }
    }
}

fn request_properties(record: MessageRecord) -> RequestProperties {
    RequestProperties {
        url: record.url,
        method: record.method,
        headers: record.headers,
        host: record.host,
        port: record.port,
        encrypted: record.encrypted,
        body: record.body.map(Into::into),
    }
}

fn response_properties(record: MessageRecord) -> ResponseProperties {
    ResponseProperties {
        status_code: record.status_code,
        status_message: None,
        protocol: record.protocol,
        headers: record.headers,
        body: record.body.map(Into::into),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fixture_becomes_descriptions() {
        let fixture = Fixture::parse(
            r#"[
                {"request": "GET /a", "response": 404},
                {
                    "request": {"url": "POST /b", "headers": {"Host": "example.com"}, "body": {"x": 1}},
                    "response": {"headers": {"X-Id": "7"}, "body": [1, 2]}
                },
                "GET /c"
            ]"#,
        )
        .unwrap();

        let mut descriptions = RequestDescription::from_fixture(fixture);
        assert_eq!(descriptions.len(), 3);

        let first = descriptions.remove(0);
        let expected = first.request.unwrap().resolve().unwrap();
        assert_eq!(expected.method.as_deref(), Some("GET"));
        let response = MockResponse::materialize(first.response, 1024).await.unwrap();
        assert_eq!(response.status_code, 404);

        let second = descriptions.remove(0);
        let expected = second.request.unwrap().resolve().unwrap();
        assert_eq!(expected.url.as_deref(), Some("/b"));
        assert_eq!(expected.headers.get("Content-Type"), Some("application/json"));
        let response = MockResponse::materialize(second.response, 1024).await.unwrap();
        assert_eq!(response.headers.get("X-Id"), Some("7"));
        assert_eq!(response.body.as_deref(), Some(&b"[1,2]"[..]));

        let third = descriptions.remove(0);
        let response = MockResponse::materialize(third.response, 1024).await.unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, None);
    }

    #[test]
    fn test_builder() {
        let description = RequestDescription::new("GET /").respond(ResponseSpec::json(json!({})));
        assert!(description.validate().is_ok());
        assert!(matches!(description.response, Some(ResponseSpec::Response(_))));
    }
}
