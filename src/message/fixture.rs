//! Fixtures: trimmed exchanges serialized as JSON

use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::Value;

use super::trim::{CanonicalMessage, RecordedExchange};
use crate::{MitmError, Result};

/// A normalized exchange; an empty response is omitted when serialized
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrimmedExchange {
    /// Canonical request
    pub request: CanonicalMessage,
    /// Canonical response
    #[serde(skip_serializing_if = "CanonicalMessage::is_empty")]
    pub response: CanonicalMessage,
}

impl TrimmedExchange {
    /// Normalize both halves again
    #[must_use]
    pub fn trim(self) -> Self {
        Self {
            request: self.request.trim(),
            response: self.response.trim(),
        }
    }

    /// Parse an exchange; a bare string stands for a request url
    ///
    /// # Errors
    ///
    /// Returns error if the value does not describe an exchange
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::String(url) => Ok(Self {
                request: CanonicalMessage::Url(url.clone()),
                response: CanonicalMessage::from_json(&Value::Null)?,
            }),
            Value::Object(object) => {
                let request = object.get("request").ok_or_else(|| {
                    MitmError::InvalidFixture("exchange is missing a request".to_string())
                })?;
                Ok(Self {
                    request: CanonicalMessage::from_json(request)?,
                    response: CanonicalMessage::from_json(
                        object.get("response").unwrap_or(&Value::Null),
                    )?,
                })
            }
            other => Err(MitmError::InvalidFixture(format!(
                "cannot interpret {other} as an exchange"
            ))),
        }
    }
}

/// Recorded traffic: one exchange, or a list of them
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Fixture {
    /// Exactly one exchange was recorded
    Single(TrimmedExchange),
    /// Zero or several exchanges were recorded
    Many(Vec<TrimmedExchange>),
}

impl Fixture {
    /// Normalize recorded exchanges, unwrapping a single one
    #[must_use]
    pub fn from_recorded(exchanges: Vec<RecordedExchange>) -> Self {
        Self::from_exchanges(exchanges.into_iter().map(RecordedExchange::trim).collect())
    }

    /// Wrap already trimmed exchanges, unwrapping a single one
    #[must_use]
    pub fn from_exchanges(mut exchanges: Vec<TrimmedExchange>) -> Self {
        if exchanges.len() == 1 {
            if let Some(exchange) = exchanges.pop() {
                return Self::Single(exchange);
            }
        }
        Self::Many(exchanges)
    }

    /// The exchanges in order
    #[must_use]
    pub fn exchanges(&self) -> &[TrimmedExchange] {
        match self {
            Self::Single(exchange) => std::slice::from_ref(exchange),
            Self::Many(exchanges) => exchanges,
        }
    }

    /// Consume into the exchanges in order
    #[must_use]
    pub fn into_exchanges(self) -> Vec<TrimmedExchange> {
        match self {
            Self::Single(exchange) => vec![exchange],
            Self::Many(exchanges) => exchanges,
        }
    }

    /// Normalize every exchange again
    #[must_use]
    pub fn trim(self) -> Self {
        Self::from_exchanges(self.into_exchanges().into_iter().map(TrimmedExchange::trim).collect())
    }

    /// Parse a fixture from JSON
    ///
    /// # Errors
    ///
    /// Returns error if the value is not an exchange or a list of exchanges
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Array(items) => items
                .iter()
                .map(TrimmedExchange::from_json)
                .collect::<Result<Vec<_>>>()
                .map(Self::Many),
            other => TrimmedExchange::from_json(other).map(Self::Single),
        }
    }

    /// Parse a fixture from JSON text
    ///
    /// # Errors
    ///
    /// Returns error if the text is not JSON or does not describe a fixture
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_json(&value)
    }

    /// Pretty-print with the given indentation width
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_pretty_json(&self, indent_width: usize) -> Result<String> {
        let indent = " ".repeat(indent_width);
        let mut buffer = Vec::new();
        let formatter = PrettyFormatter::with_indent(indent.as_bytes());
        let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
        self.serialize(&mut serializer)?;
        String::from_utf8(buffer).map_err(|e| MitmError::InvalidFixture(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Body, MessageRecord};
    use serde_json::json;

    #[test]
    fn test_single_exchange_unwrapped() {
        let fixture = Fixture::from_recorded(vec![RecordedExchange {
            request: MessageRecord {
                method: Some("GET".into()),
                url: Some("/".into()),
                ..MessageRecord::default()
            },
            response: MessageRecord {
                status_code: Some(200),
                ..MessageRecord::default()
            },
        }]);

        assert!(matches!(fixture, Fixture::Single(_)));
        assert_eq!(serde_json::to_value(&fixture).unwrap(), json!({"request": "GET /"}));
    }

    #[test]
    fn test_empty_fixture_is_list() {
        let fixture = Fixture::from_recorded(Vec::new());
        assert_eq!(serde_json::to_value(&fixture).unwrap(), json!([]));
        assert!(fixture.exchanges().is_empty());
    }

    #[test]
    fn test_parse_fixture() {
        let fixture = Fixture::parse(
            r#"[
                "GET /health",
                {"request": "POST /items", "response": 201},
                {"request": {"url": "GET /blob"}, "response": {"body": {"$binary": "cafe"}}}
            ]"#,
        )
        .unwrap();

        let exchanges = fixture.exchanges();
        assert_eq!(exchanges.len(), 3);
        assert!(exchanges[0].response.is_empty());
        assert_eq!(exchanges[1].response, CanonicalMessage::StatusCode(201));
        let CanonicalMessage::Message(blob) = &exchanges[2].response else {
            panic!("expected message");
        };
        assert_eq!(blob.body, Some(Body::from(vec![0xca, 0xfe])));
    }

    #[test]
    fn test_missing_request_rejected() {
        assert!(matches!(
            Fixture::parse(r#"{"response": 200}"#),
            Err(MitmError::InvalidFixture(_))
        ));
    }

    #[test]
    fn test_pretty_json_indent() {
        let fixture = Fixture::parse(r#"{"request": "GET /", "response": 404}"#).unwrap();
        let text = fixture.to_pretty_json(2).unwrap();
        assert_eq!(text, "{\n  \"request\": \"GET /\",\n  \"response\": 404\n}");
    }
}
