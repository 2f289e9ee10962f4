//! Mock response building

use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::StreamBody;
use hyper::body::Frame;
use hyper::StatusCode;

use super::spec::{BodySpec, ResponseProperties, ResponseSpec};
use crate::collect::consume_body;
use crate::message::{Headers, MessageRecord};
use crate::{MitmError, MockError};

/// A fully defaulted response, as delivered or as observed on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct MockResponse {
    /// Status code
    pub status_code: u16,
    /// Reason phrase
    pub status_message: String,
    /// Protocol name, e.g. `HTTP`
    pub protocol_name: String,
    /// Protocol version, e.g. `1.1`
    pub protocol_version: String,
    /// Headers
    pub headers: Headers,
    /// Body, absent when empty
    pub body: Option<Bytes>,
}

impl Default for MockResponse {
    fn default() -> Self {
        Self {
            status_code: 200,
            status_message: reason_phrase(200),
            protocol_name: "HTTP".to_string(),
            protocol_version: "1.1".to_string(),
            headers: Headers::new(),
            body: None,
        }
    }
}

fn reason_phrase(status_code: u16) -> String {
    StatusCode::from_u16(status_code)
        .ok()
        .and_then(|status| status.canonical_reason())
        .unwrap_or_default()
        .to_string()
}

impl MockResponse {
    /// Turn a response spec into a mock response, or the error it
    /// declares.
    ///
    /// Stream bodies are drained first and a stream failure becomes the
    /// error. A structured body without a declared content type gets
    /// `application/json`. A function handler has no static response and
    /// yields the default one.
    ///
    /// # Errors
    ///
    /// Returns the declared error, or the failure of a body stream
    pub async fn materialize(spec: Option<ResponseSpec>, limit: usize) -> Result<Self, MockError> {
        match spec {
            None | Some(ResponseSpec::Handler(_)) => Ok(Self::default()),
            Some(ResponseSpec::Error(error)) => Err(error),
            Some(ResponseSpec::Raw(raw)) => Ok(Self::from_raw(Some(&raw))),
            Some(ResponseSpec::Response(properties)) => Self::from_properties(properties, limit).await,
        }
    }

    async fn from_properties(properties: ResponseProperties, limit: usize) -> Result<Self, MockError> {
        let ResponseProperties {
            status_code,
            status_message,
            protocol,
            mut headers,
            body,
        } = properties;

        let body = match body {
            None => None,
            Some(BodySpec::Stream(stream)) => Some(drain(stream, limit).await?),
            Some(body) => {
                if body.is_structured() && !headers.has("Content-Type") {
                    headers.append("Content-Type", "application/json");
                }
                body.to_body().map(|body| body.to_bytes())
            }
        };

        let status_code = status_code.unwrap_or(200);
        let (protocol_name, protocol_version) = protocol
            .as_deref()
            .and_then(|protocol| protocol.split_once('/'))
            .map_or_else(
                || ("HTTP".to_string(), "1.1".to_string()),
                |(name, version)| (name.to_string(), version.to_string()),
            );

        Ok(Self {
            status_code,
            status_message: status_message.unwrap_or_else(|| reason_phrase(status_code)),
            protocol_name,
            protocol_version,
            headers,
            body: body.filter(|body| !body.is_empty()),
        })
    }

    /// Reconstruct a response from the bytes written on the wire.
    ///
    /// Chunked bodies are de-chunked; a truncated capture keeps what could be
    /// decoded. Nothing captured yields the default response.
    #[must_use]
    pub fn from_raw(raw: Option<&[u8]>) -> Self {
        let Some(raw) = raw else {
            return Self::default();
        };

        let mut header_buf = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Response::new(&mut header_buf);
        let Ok(httparse::Status::Complete(body_offset)) = parsed.parse(raw) else {
            return Self {
                body: Some(Bytes::copy_from_slice(raw)).filter(|body| !body.is_empty()),
                ..Self::default()
            };
        };

        let status_code = parsed.code.unwrap_or(200);
        let headers: Headers = parsed
            .headers
            .iter()
            .map(|header| (header.name, String::from_utf8_lossy(header.value).into_owned()))
            .collect();

        let body_data = &raw[body_offset..];
        let chunked = headers
            .get_all("Transfer-Encoding")
            .any(|value| value.to_ascii_lowercase().contains("chunked"));
        let body = if chunked {
            decode_chunked_body(body_data)
        } else {
            match headers.get("Content-Length").and_then(|len| len.trim().parse::<usize>().ok()) {
                Some(len) => body_data[..len.min(body_data.len())].to_vec(),
                None => body_data.to_vec(),
            }
        };

        Self {
            status_code,
            status_message: parsed
                .reason
                .map_or_else(|| reason_phrase(status_code), ToString::to_string),
            protocol_name: "HTTP".to_string(),
            protocol_version: format!("1.{}", parsed.version.unwrap_or(1)),
            headers,
            body: Some(Bytes::from(body)).filter(|body| !body.is_empty()),
        }
    }

    /// Project into a message record
    #[must_use]
    pub fn to_record(&self) -> MessageRecord {
        MessageRecord {
            status_code: Some(self.status_code),
            protocol: Some(format!("{}/{}", self.protocol_name, self.protocol_version)),
            headers: self.headers.clone(),
            body: self.body.clone().map(Into::into),
            ..MessageRecord::default()
        }
    }
}

async fn drain(stream: super::spec::BodyStream, limit: usize) -> Result<Bytes, MockError> {
    let body = StreamBody::new(stream.map_ok(Frame::data));
    consume_body(body, limit)
        .await
        .into_result()
        .map_err(|error| match error {
            MitmError::Mock(error) => error,
            other => MockError::new(other.to_string()),
        })
}

/// Decode as much of a chunked body as is present
fn decode_chunked_body(data: &[u8]) -> Vec<u8> {
    let mut decoded = Vec::new();
    let mut pos = 0;

    while let Some(line_end) = find_crlf(data, pos) {
        // chunk extensions after ';' are ignored
        let size_line = &data[pos..line_end];
        let size_part = size_line
            .iter()
            .position(|&b| b == b';')
            .map_or(size_line, |semi| &size_line[..semi]);
        let Some(chunk_size) = std::str::from_utf8(size_part)
            .ok()
            .and_then(|size| usize::from_str_radix(size.trim(), 16).ok())
        else {
            break;
        };

        pos = line_end + 2;
        if chunk_size == 0 {
            break;
        }

        let Some(end) = pos.checked_add(chunk_size).filter(|end| *end <= data.len()) else {
            decoded.extend_from_slice(&data[pos.min(data.len())..]);
            break;
        };
        decoded.extend_from_slice(&data[pos..end]);
        pos = end + 2;
    }

    decoded
}

fn find_crlf(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(2)
        .position(|window| window == b"\r\n")
        .map(|offset| from + offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use serde_json::json;

    #[tokio::test]
    async fn test_defaults_applied() {
        let response = MockResponse::materialize(Some(ResponseSpec::status(404)), 1024)
            .await
            .unwrap();
        assert_eq!(response.status_code, 404);
        assert_eq!(response.status_message, "Not Found");
        assert_eq!(response.protocol_name, "HTTP");
        assert_eq!(response.protocol_version, "1.1");
        assert_eq!(response.body, None);

        let response = MockResponse::materialize(None, 1024).await.unwrap();
        assert_eq!(response, MockResponse::default());
    }

    #[tokio::test]
    async fn test_structured_body_gets_json_content_type() {
        let response = MockResponse::materialize(Some(ResponseSpec::json(json!({"a": 1}))), 1024)
            .await
            .unwrap();
        assert_eq!(response.headers.get("Content-Type"), Some("application/json"));
        assert_eq!(response.body, Some(Bytes::from_static(b"{\"a\":1}")));

        let properties = ResponseProperties::new()
            .header("Content-Type", "application/vnd.api+json")
            .body(json!([1]));
        let response = MockResponse::materialize(Some(properties.into()), 1024).await.unwrap();
        assert_eq!(response.headers.get_all("Content-Type").count(), 1);
    }

    #[tokio::test]
    async fn test_text_body_has_no_implied_content_type() {
        let response = MockResponse::materialize(Some(ResponseSpec::text("hi")), 1024)
            .await
            .unwrap();
        assert!(!response.headers.has("Content-Type"));
        assert_eq!(response.body, Some(Bytes::from_static(b"hi")));
    }

    #[tokio::test]
    async fn test_stream_body_drained() {
        let chunks = stream::iter(vec![Ok(Bytes::from("a")), Ok(Bytes::from("b"))]);
        let properties = ResponseProperties::new().body(BodySpec::stream(chunks));
        let response = MockResponse::materialize(Some(properties.into()), 1024).await.unwrap();
        assert_eq!(response.body, Some(Bytes::from_static(b"ab")));
        assert!(!response.headers.has("Content-Type"));
    }

    #[tokio::test]
    async fn test_stream_error_becomes_mock_error() {
        let chunks = stream::iter(vec![Ok(Bytes::from("a")), Err(MockError::new("upstream hung up"))]);
        let properties = ResponseProperties::new().body(BodySpec::stream(chunks));
        let error = MockResponse::materialize(Some(properties.into()), 1024)
            .await
            .unwrap_err();
        assert_eq!(error.message, "upstream hung up");
    }

    #[tokio::test]
    async fn test_declared_error_returned() {
        let declared = MockError::new("socket hang up").with_code("ECONNRESET");
        let error = MockResponse::materialize(Some(declared.clone().into()), 1024)
            .await
            .unwrap_err();
        assert_eq!(error, declared);
    }

    #[test]
    fn test_from_raw_chunked() {
        let raw = b"HTTP/1.1 201 Created\r\nx-id: 9\r\ntransfer-encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let response = MockResponse::from_raw(Some(raw));
        assert_eq!(response.status_code, 201);
        assert_eq!(response.status_message, "Created");
        assert_eq!(response.headers.get("X-Id"), Some("9"));
        assert_eq!(response.body, Some(Bytes::from_static(b"hello world")));
    }

    #[test]
    fn test_from_raw_content_length() {
        let raw = b"HTTP/1.0 404 Nope\r\ncontent-length: 2\r\n\r\nno";
        let response = MockResponse::from_raw(Some(raw));
        assert_eq!(response.status_code, 404);
        assert_eq!(response.status_message, "Nope");
        assert_eq!(response.protocol_version, "1.0");
        assert_eq!(response.body, Some(Bytes::from_static(b"no")));
    }

    #[test]
    fn test_from_raw_truncated_chunked() {
        let raw = b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n5\r\nhel";
        let response = MockResponse::from_raw(Some(raw));
        assert_eq!(response.body, Some(Bytes::from_static(b"hel")));
    }

    #[tokio::test]
    async fn test_from_raw_oversized_chunk_size() {
        let raw: &[u8] = b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\nffffffffffffffff\r\nab";
        let response = MockResponse::from_raw(Some(raw));
        assert_eq!(response.body, Some(Bytes::from_static(b"ab")));

        let response = MockResponse::materialize(Some(ResponseSpec::raw(raw)), 1024)
            .await
            .unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, Some(Bytes::from_static(b"ab")));
    }

    #[test]
    fn test_from_raw_nothing() {
        assert_eq!(MockResponse::from_raw(None), MockResponse::default());
    }

    #[test]
    fn test_to_record() {
        let record = MockResponse::from_raw(Some(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok"))
            .to_record();
        assert_eq!(record.status_code, Some(200));
        assert_eq!(record.protocol.as_deref(), Some("HTTP/1.1"));
        assert_eq!(record.headers.get("Content-Length"), Some("2"));
    }
}
