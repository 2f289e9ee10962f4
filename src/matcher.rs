//! Reconciliation of an observed conversation with its expectation

use std::fmt::Write as _;

use serde_json::Value;

use crate::conversation::{Conversation, Exchange, ExchangeResponse, ExpectationSpec, ExpectedExchange};
use crate::message::{Body, Headers, MessageRecord};
use crate::mock::{ExpectedRequest, MockResponse};
use crate::{MitmError, Result};

/// Decides whether a conversation satisfies an expectation
pub trait ConversationMatcher: Send + Sync {
    /// Compare `conversation` against `expectation`
    ///
    /// # Errors
    ///
    /// Returns [`MitmError::Mismatch`] describing the differences
    fn satisfy(&self, conversation: &Conversation, expectation: &ExpectationSpec) -> Result<()>;
}

/// Exchange-by-exchange comparison.
///
/// Expected headers are a subset of the observed ones; fields an
/// expectation leaves out are not compared. Responses are only compared for
/// declared exchanges that were never requested.
#[derive(Debug, Clone, Copy, Default)]
pub struct SatisfyMatcher;

impl ConversationMatcher for SatisfyMatcher {
    fn satisfy(&self, conversation: &Conversation, expectation: &ExpectationSpec) -> Result<()> {
        let mut diff = Diff::default();
        let count = conversation.len().max(expectation.len());

        for index in 0..count {
            match (conversation.exchanges.get(index), expectation.exchanges.get(index)) {
                (Some(observed), Some(expected)) => compare_exchange(&mut diff, index, observed, expected),
                (Some(observed), None) => diff.line(
                    index,
                    format!(
                        "{} was requested but no response was configured",
                        describe_record(&observed.request)
                    ),
                ),
                (None, Some(expected)) => diff.line(
                    index,
                    format!(
                        "{} was declared but never requested",
                        describe_expected(&expected.request)
                    ),
                ),
                (None, None) => {}
            }
        }

        diff.into_result()
    }
}

#[derive(Default)]
struct Diff {
    text: String,
}

impl Diff {
    fn line(&mut self, index: usize, message: impl AsRef<str>) {
        let _ = writeln!(self.text, "  exchange {}: {}", index + 1, message.as_ref());
    }

    fn field<T: std::fmt::Debug + PartialEq>(
        &mut self,
        index: usize,
        name: &str,
        expected: Option<&T>,
        actual: Option<&T>,
    ) {
        if let Some(expected) = expected {
            if actual != Some(expected) {
                self.line(index, format!("{name}: expected {expected:?}, got {actual:?}"));
            }
        }
    }

    fn into_result(self) -> Result<()> {
        if self.text.is_empty() {
            Ok(())
        } else {
            Err(MitmError::Mismatch(self.text))
        }
    }
}

fn compare_exchange(diff: &mut Diff, index: usize, observed: &Exchange, expected: &ExpectedExchange) {
    compare_request(diff, index, &observed.request, &expected.request);

    let Some(expected_response) = &expected.response else {
        return;
    };
    match (&observed.response, expected_response) {
        (None, _) => diff.line(index, "no response configured"),
        (Some(ExchangeResponse::Response(actual)), ExchangeResponse::Response(expected)) => {
            compare_response(diff, index, actual, expected);
        }
        (Some(ExchangeResponse::Error(actual)), ExchangeResponse::Error(expected)) => {
            if actual.message != expected.message {
                diff.line(index, format!("error: expected {expected}, got {actual}"));
            }
        }
        (Some(ExchangeResponse::Error(actual)), ExchangeResponse::Response(expected)) => diff.line(
            index,
            format!("expected status {}, got error {actual}", expected.status_code),
        ),
        (Some(ExchangeResponse::Response(actual)), ExchangeResponse::Error(expected)) => diff.line(
            index,
            format!("expected error {expected}, got status {}", actual.status_code),
        ),
    }
}

fn compare_request(diff: &mut Diff, index: usize, observed: &MessageRecord, expected: &ExpectedRequest) {
    if let Some(method) = &expected.method {
        let matches = observed
            .method
            .as_deref()
            .is_some_and(|actual| actual.eq_ignore_ascii_case(method));
        if !matches {
            diff.line(
                index,
                format!("method: expected {method:?}, got {:?}", observed.method),
            );
        }
    }
    diff.field(index, "url", expected.url.as_ref(), observed.url.as_ref());
    compare_headers(diff, index, &observed.headers, &expected.headers);
    diff.field(index, "host", expected.host.as_ref(), observed.host.as_ref());
    diff.field(index, "port", expected.port.as_ref(), observed.port.as_ref());
    diff.field(
        index,
        "encrypted",
        expected.encrypted.as_ref(),
        Some(&observed.encrypted.unwrap_or(false)),
    );

    if let Some(body) = &expected.body {
        let actual = observed.body.as_ref().map(Body::to_bytes).unwrap_or_default();
        if !body_matches(body, &actual) {
            diff.line(
                index,
                format!(
                    "request body: expected {}, got {:?}",
                    describe_body(body),
                    String::from_utf8_lossy(&actual)
                ),
            );
        }
    }
}

fn compare_response(diff: &mut Diff, index: usize, actual: &MockResponse, expected: &MockResponse) {
    if actual.status_code != expected.status_code {
        diff.line(
            index,
            format!(
                "status: expected {}, got {}",
                expected.status_code, actual.status_code
            ),
        );
    }
    compare_headers(diff, index, &actual.headers, &expected.headers);
    if actual.body != expected.body {
        diff.line(
            index,
            format!(
                "response body: expected {:?}, got {:?}",
                lossy(expected.body.as_deref()),
                lossy(actual.body.as_deref())
            ),
        );
    }
}

fn compare_headers(diff: &mut Diff, index: usize, actual: &Headers, expected: &Headers) {
    for (name, value) in expected.iter() {
        if !actual.get_all(name).any(|actual| actual == value) {
            diff.line(
                index,
                format!("header {name}: expected {value:?}, got {:?}", actual.get(name)),
            );
        }
    }
}

fn body_matches(expected: &Body, actual: &[u8]) -> bool {
    match expected {
        Body::Bytes(bytes) => bytes.as_ref() == actual,
        Body::Text(text) => text.as_bytes() == actual,
        Body::Json(value) => serde_json::from_slice::<Value>(actual).is_ok_and(|actual| &actual == value),
    }
}

fn describe_body(body: &Body) -> String {
    match body {
        Body::Bytes(bytes) => format!("{:?}", String::from_utf8_lossy(bytes)),
        Body::Text(text) => format!("{text:?}"),
        Body::Json(value) => value.to_string(),
    }
}

fn lossy(body: Option<&[u8]>) -> String {
    body.map(String::from_utf8_lossy).unwrap_or_default().into_owned()
}

fn describe_record(record: &MessageRecord) -> String {
    format!(
        "{} {}",
        record.method.as_deref().unwrap_or("?"),
        record.url.as_deref().unwrap_or("?")
    )
}

fn describe_expected(request: &ExpectedRequest) -> String {
    format!(
        "{} {}",
        request.method.as_deref().unwrap_or("?"),
        request.url.as_deref().unwrap_or("?")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;

    use crate::MockError;

    fn observed(method: &str, url: &str, body: Option<&str>) -> Exchange {
        Exchange {
            request: MessageRecord {
                method: Some(method.to_string()),
                url: Some(url.to_string()),
                host: Some("example.com".to_string()),
                port: Some(80),
                encrypted: Some(false),
                body: body.map(|body| Body::Bytes(Bytes::copy_from_slice(body.as_bytes()))),
                ..MessageRecord::default()
            },
            response: Some(ExchangeResponse::Response(MockResponse::default())),
        }
    }

    fn expected(method: &str, url: &str) -> ExpectedExchange {
        ExpectedExchange {
            request: ExpectedRequest {
                method: Some(method.to_string()),
                url: Some(url.to_string()),
                ..ExpectedRequest::default()
            },
            response: None,
        }
    }

    #[test]
    fn test_matching_conversation() {
        let conversation = Conversation {
            exchanges: vec![observed("GET", "/a", None), observed("POST", "/b", Some("{\"x\":1}"))],
        };
        let mut second = expected("POST", "/b");
        second.request.body = Some(Body::Json(json!({"x": 1})));
        let expectation = ExpectationSpec {
            exchanges: vec![expected("get", "/a"), second],
        };

        assert!(SatisfyMatcher.satisfy(&conversation, &expectation).is_ok());
    }

    #[test]
    fn test_every_difference_reported() {
        let conversation = Conversation {
            exchanges: vec![observed("GET", "/a", Some("hello"))],
        };
        let mut first = expected("GET", "/z");
        first.request.headers.append("X-Token", "abc");
        first.request.body = Some(Body::Text("bye".into()));
        let expectation = ExpectationSpec {
            exchanges: vec![first],
        };

        let Err(MitmError::Mismatch(diff)) = SatisfyMatcher.satisfy(&conversation, &expectation) else {
            panic!("expected mismatch");
        };
        assert!(diff.contains("url"));
        assert!(diff.contains("X-Token"));
        assert!(diff.contains("request body"));
    }

    #[test]
    fn test_declared_but_never_requested() {
        let mut leftover = expected("GET", "/b");
        leftover.response = Some(ExchangeResponse::Response(MockResponse::default()));
        let conversation = Conversation {
            exchanges: vec![observed("GET", "/a", None)],
        };
        let expectation = ExpectationSpec {
            exchanges: vec![expected("GET", "/a"), leftover],
        };

        let Err(MitmError::Mismatch(diff)) = SatisfyMatcher.satisfy(&conversation, &expectation) else {
            panic!("expected mismatch");
        };
        assert!(diff.contains("exchange 2: GET /b was declared but never requested"));
    }

    #[test]
    fn test_request_without_configured_response() {
        let mut unexpected = observed("GET", "/a", None);
        unexpected.response = None;
        let conversation = Conversation {
            exchanges: vec![unexpected],
        };

        let Err(MitmError::Mismatch(diff)) =
            SatisfyMatcher.satisfy(&conversation, &ExpectationSpec::default())
        else {
            panic!("expected mismatch");
        };
        assert!(diff.contains("no response was configured"));
    }

    #[test]
    fn test_expected_error_compared_by_message() {
        let mut exchange = observed("GET", "/a", None);
        exchange.response = Some(ExchangeResponse::Error(MockError::new("reset").with_code("ECONNRESET")));
        let mut declared = expected("GET", "/a");
        declared.response = Some(ExchangeResponse::Error(MockError::new("reset")));

        let conversation = Conversation {
            exchanges: vec![exchange],
        };
        let expectation = ExpectationSpec {
            exchanges: vec![declared],
        };
        assert!(SatisfyMatcher.satisfy(&conversation, &expectation).is_ok());
    }
}
