//! Message normalization
//!
//! Reduces a recorded message to its minimal canonical form: transport
//! headers dropped, textual bodies decoded, JSON bodies parsed, defaults
//! removed and degenerate messages collapsed to a bare url or status code.

use serde::Serialize;
use serde_json::Value;

use super::{
    is_json_content_type, is_textual_content_type, value_to_u16, Body, Headers, MessageRecord,
    TrimmedExchange,
};
use crate::{MitmError, Result};

/// Headers that describe the transport rather than the exchange
const TRANSPORT_HEADERS: [&str; 4] = ["Content-Length", "Transfer-Encoding", "Connection", "Date"];

/// Whether a byte sequence decodes cleanly as UTF-8 once percent-encoded
#[must_use]
pub fn can_be_interpreted_as_utf8(bytes: &[u8]) -> bool {
    let encoded = urlencoding::encode_binary(bytes);
    urlencoding::decode(&encoded).is_ok()
}

/// A message in canonical form
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CanonicalMessage {
    /// Only a url (possibly `"METHOD url"`) remained
    Url(String),
    /// Only a status code remained
    StatusCode(u16),
    /// Any other shape
    Message(MessageRecord),
}

impl CanonicalMessage {
    /// Normalize again; canonical messages are fixed points
    #[must_use]
    pub fn trim(self) -> Self {
        match self {
            Self::Message(record) => trim_message(record),
            scalar => scalar,
        }
    }

    /// Whether nothing is left of the message
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Message(record) if record.field_count() == 0)
    }

    /// Expand back into a record
    #[must_use]
    pub fn into_record(self) -> MessageRecord {
        match self {
            Self::Url(url) => MessageRecord {
                url: Some(url),
                ..MessageRecord::default()
            },
            Self::StatusCode(status_code) => MessageRecord {
                status_code: Some(status_code),
                ..MessageRecord::default()
            },
            Self::Message(record) => record,
        }
    }

    /// Parse a canonical message from fixture JSON
    ///
    /// # Errors
    ///
    /// Returns error if the value is neither a string, a status code nor an
    /// object describing a message
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self::Message(MessageRecord::default())),
            Value::String(url) => Ok(Self::Url(url.clone())),
            Value::Number(_) => value_to_u16(value)
                .map(Self::StatusCode)
                .ok_or_else(|| MitmError::InvalidFixture(format!("invalid status code: {value}"))),
            Value::Object(_) => MessageRecord::from_json(value).map(Self::Message),
            other => Err(MitmError::InvalidFixture(format!(
                "cannot interpret {other} as a message"
            ))),
        }
    }
}

/// Normalize a message record
#[must_use]
pub fn trim_message(mut message: MessageRecord) -> CanonicalMessage {
    if let Some(body) = message.body.take() {
        message.body = trim_body(body, &mut message.headers);
    }

    if message.status_code == Some(200) {
        message.status_code = None;
    }

    for name in TRANSPORT_HEADERS {
        message.headers.remove(name);
    }

    if let (Some(method), Some(url)) = (&message.method, &message.url) {
        message.url = Some(format!("{method} {url}"));
        message.method = None;
    }

    if message.field_count() == 1 {
        if let Some(url) = message.url.take() {
            return CanonicalMessage::Url(url);
        }
        if let Some(status_code) = message.status_code {
            return CanonicalMessage::StatusCode(status_code);
        }
    }

    CanonicalMessage::Message(message)
}

fn trim_body(body: Body, headers: &mut Headers) -> Option<Body> {
    if body.is_empty() {
        return None;
    }

    let content_type = headers.get("Content-Type").map(str::to_string);
    let textual = content_type.as_deref().is_some_and(is_textual_content_type);

    let mut body = match body {
        Body::Bytes(bytes) if textual && can_be_interpreted_as_utf8(&bytes) => {
            match std::str::from_utf8(&bytes) {
                Ok(text) => Body::Text(text.to_string()),
                Err(_) => Body::Bytes(bytes),
            }
        }
        other => other,
    };

    if let Some(content_type) = content_type.as_deref().filter(|ct| is_json_content_type(ct)) {
        let parsed = match &body {
            Body::Text(text) if looks_like_json_container(text) => {
                serde_json::from_str::<Value>(text).ok()
            }
            _ => None,
        };
        if let Some(value) = parsed {
            body = Body::Json(value);
            if content_type == "application/json" {
                headers.remove("Content-Type");
            }
        }
    }

    Some(body)
}

fn looks_like_json_container(text: &str) -> bool {
    text.trim_start().starts_with(['[', '{'])
}

/// A request and its response as observed, before normalization
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordedExchange {
    /// The request
    pub request: MessageRecord,
    /// The response
    pub response: MessageRecord,
}

impl RecordedExchange {
    /// Normalize both halves
    #[must_use]
    pub fn trim(self) -> TrimmedExchange {
        TrimmedExchange {
            request: trim_message(self.request),
            response: trim_message(self.response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use proptest::prelude::*;
    use serde_json::json;

    fn record_with(headers: &[(&str, &str)], body: Option<Body>) -> MessageRecord {
        MessageRecord {
            headers: headers.iter().copied().collect(),
            body,
            ..MessageRecord::default()
        }
    }

    #[test]
    fn test_utf8_probe() {
        assert!(can_be_interpreted_as_utf8("héllo wörld".as_bytes()));
        assert!(can_be_interpreted_as_utf8(b""));
        assert!(!can_be_interpreted_as_utf8(&[0xff, 0xfe, 0x00]));
        assert!(!can_be_interpreted_as_utf8(&[0xc3]));
    }

    #[test]
    fn test_request_collapses_to_url() {
        let request = MessageRecord {
            method: Some("GET".into()),
            url: Some("/".into()),
            headers: [("Content-Length", "0"), ("Connection", "close")].into_iter().collect(),
            body: Some(Body::Bytes(Bytes::new())),
            ..MessageRecord::default()
        };
        assert_eq!(trim_message(request), CanonicalMessage::Url("GET /".into()));
    }

    #[test]
    fn test_response_collapses_to_status_code() {
        let response = MessageRecord {
            status_code: Some(404),
            headers: [("Date", "Mon, 01 Jan 2024 00:00:00 GMT")].into_iter().collect(),
            ..MessageRecord::default()
        };
        assert_eq!(trim_message(response), CanonicalMessage::StatusCode(404));
    }

    #[test]
    fn test_default_status_removed() {
        let response = MessageRecord {
            status_code: Some(200),
            ..MessageRecord::default()
        };
        assert!(trim_message(response).is_empty());
    }

    #[test]
    fn test_textual_body_decoded() {
        let record = record_with(
            &[("Content-Type", "text/plain; charset=utf-8")],
            Some(Body::Bytes(Bytes::from_static(b"hello"))),
        );
        let CanonicalMessage::Message(trimmed) = trim_message(record) else {
            panic!("expected message");
        };
        assert_eq!(trimmed.body, Some(Body::Text("hello".into())));
        assert_eq!(trimmed.content_type(), Some("text/plain; charset=utf-8"));
    }

    #[test]
    fn test_binary_body_kept() {
        let record = record_with(
            &[("Content-Type", "text/plain")],
            Some(Body::Bytes(Bytes::from_static(&[0xff, 0x00]))),
        );
        let CanonicalMessage::Message(trimmed) = trim_message(record) else {
            panic!("expected message");
        };
        assert_eq!(trimmed.body, Some(Body::Bytes(Bytes::from_static(&[0xff, 0x00]))));
    }

    #[test]
    fn test_json_body_parsed_and_content_type_dropped() {
        let record = record_with(
            &[("Content-Type", "application/json")],
            Some(Body::Bytes(Bytes::from_static(b" {\"a\":1}"))),
        );
        let CanonicalMessage::Message(trimmed) = trim_message(record) else {
            panic!("expected message");
        };
        assert_eq!(trimmed.body, Some(Body::Json(json!({"a": 1}))));
        assert!(trimmed.headers.is_empty());
    }

    #[test]
    fn test_json_with_charset_keeps_content_type() {
        let record = record_with(
            &[("Content-Type", "application/json; charset=utf-8")],
            Some(Body::Text("[1,2]".into())),
        );
        let CanonicalMessage::Message(trimmed) = trim_message(record) else {
            panic!("expected message");
        };
        assert_eq!(trimmed.body, Some(Body::Json(json!([1, 2]))));
        assert_eq!(trimmed.content_type(), Some("application/json; charset=utf-8"));
    }

    #[test]
    fn test_invalid_json_left_as_text() {
        let record = record_with(
            &[("Content-Type", "application/json")],
            Some(Body::Text("{not json".into())),
        );
        let CanonicalMessage::Message(trimmed) = trim_message(record) else {
            panic!("expected message");
        };
        assert_eq!(trimmed.body, Some(Body::Text("{not json".into())));
        assert_eq!(trimmed.content_type(), Some("application/json"));
    }

    #[test]
    fn test_json_scalar_not_parsed() {
        let record = record_with(
            &[("Content-Type", "application/json")],
            Some(Body::Text("42".into())),
        );
        let CanonicalMessage::Message(trimmed) = trim_message(record) else {
            panic!("expected message");
        };
        assert_eq!(trimmed.body, Some(Body::Text("42".into())));
    }

    #[test]
    fn test_exchange_trim() {
        let exchange = RecordedExchange {
            request: MessageRecord {
                method: Some("GET".into()),
                url: Some("/".into()),
                headers: [("Host", "example.com")].into_iter().collect(),
                host: Some("example.com".into()),
                port: Some(80),
                ..MessageRecord::default()
            },
            response: MessageRecord {
                status_code: Some(200),
                headers: [("Content-Type", "text/plain"), ("Content-Length", "2")]
                    .into_iter()
                    .collect(),
                body: Some(Body::Bytes(Bytes::from_static(b"ok"))),
                ..MessageRecord::default()
            },
        };

        let trimmed = exchange.trim();
        let value = serde_json::to_value(&trimmed).unwrap();
        assert_eq!(
            value,
            json!({
                "request": {
                    "url": "GET /",
                    "headers": {"Host": "example.com"},
                    "host": "example.com",
                    "port": 80
                },
                "response": {
                    "headers": {"Content-Type": "text/plain"},
                    "body": "ok"
                }
            })
        );
    }

    #[test]
    fn test_canonical_from_json() {
        assert_eq!(
            CanonicalMessage::from_json(&json!("GET /")).unwrap(),
            CanonicalMessage::Url("GET /".into())
        );
        assert_eq!(
            CanonicalMessage::from_json(&json!(503)).unwrap(),
            CanonicalMessage::StatusCode(503)
        );
        assert!(CanonicalMessage::from_json(&json!(70000)).is_err());
        assert!(CanonicalMessage::from_json(&json!(true)).is_err());
    }

    fn arb_record() -> impl Strategy<Value = MessageRecord> {
        let header = (
            prop::sample::select(vec![
                "Content-Type",
                "Content-Length",
                "Date",
                "X-Trace",
                "Connection",
            ]),
            prop::sample::select(vec![
                "application/json",
                "text/plain",
                "application/octet-stream",
                "7",
            ]),
        );
        let body = prop_oneof![
            Just(None),
            prop::collection::vec(any::<u8>(), 0..16)
                .prop_map(|bytes| Some(Body::Bytes(Bytes::from(bytes)))),
            prop::sample::select(vec!["", "{\"a\":1}", "[1]", "plain", "{broken"])
                .prop_map(|text| Some(Body::Text(text.to_string()))),
        ];
        (
            prop::option::of(prop::sample::select(vec!["GET", "POST"])),
            prop::option::of(prop::sample::select(vec!["/", "/a?b=c"])),
            prop::option::of(prop::sample::select(vec![200_u16, 201, 404])),
            prop::collection::vec(header, 0..4),
            body,
        )
            .prop_map(|(method, url, status_code, headers, body)| MessageRecord {
                method: method.map(str::to_string),
                url: url.map(str::to_string),
                status_code,
                headers: headers.into_iter().collect(),
                body,
                ..MessageRecord::default()
            })
    }

    proptest! {
        #[test]
        fn prop_trim_is_idempotent(record in arb_record()) {
            let once = trim_message(record);
            let twice = once.clone().trim();
            prop_assert_eq!(once, twice);
        }
    }
}
