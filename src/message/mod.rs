//! HTTP message object model
//!
//! Headers with canonical name formatting, bodies that may be raw bytes,
//! decoded text or parsed JSON, and the record shape used for both observed
//! and recorded messages.

mod fixture;
mod trim;

pub use fixture::{Fixture, TrimmedExchange};
pub use trim::{can_be_interpreted_as_utf8, trim_message, CanonicalMessage, RecordedExchange};

use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use hyper::HeaderMap;
use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::{MitmError, Result};

/// Header names whose canonical form is not plain word capitalization
const SPECIAL_HEADER_NAMES: &[(&str, &str)] = &[
    ("content-id", "Content-ID"),
    ("content-md5", "Content-MD5"),
    ("dnt", "DNT"),
    ("etag", "ETag"),
    ("message-id", "Message-ID"),
    ("mime-version", "MIME-Version"),
    ("te", "TE"),
    ("www-authenticate", "WWW-Authenticate"),
    ("x-ua-compatible", "X-UA-Compatible"),
    ("x-xss-protection", "X-XSS-Protection"),
];

/// Key used to serialize raw byte bodies inside JSON fixtures
pub const BINARY_BODY_KEY: &str = "$binary";

/// Canonicalize a header name, e.g. `content-type` becomes `Content-Type`
#[must_use]
pub fn format_header_name(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    if let Some((_, special)) = SPECIAL_HEADER_NAMES.iter().find(|(l, _)| *l == lower) {
        return (*special).to_string();
    }

    lower
        .split('-')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn mime_essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Whether a content type denotes a textual body
#[must_use]
pub fn is_textual_content_type(content_type: &str) -> bool {
    let essence = mime_essence(content_type);
    essence.starts_with("text/")
        || essence.ends_with("+json")
        || essence.ends_with("+xml")
        || matches!(
            essence.as_str(),
            "application/json"
                | "application/javascript"
                | "application/x-javascript"
                | "application/ecmascript"
                | "application/xml"
                | "application/x-www-form-urlencoded"
        )
}

/// Whether a content type is `application/json`, optionally with parameters
#[must_use]
pub fn is_json_content_type(content_type: &str) -> bool {
    content_type == "application/json" || content_type.starts_with("application/json;")
}

/// Ordered, multi-valued header list with case-insensitive lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Create an empty header list
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy a hyper header map, canonicalizing names
    #[must_use]
    pub fn from_header_map(map: &HeaderMap) -> Self {
        map.iter()
            .map(|(name, value)| {
                (
                    format_header_name(name.as_str()),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect()
    }

    /// Convert into a hyper header map
    ///
    /// # Errors
    ///
    /// Returns error if a name or value is not valid in HTTP
    pub fn to_header_map(&self) -> Result<HeaderMap> {
        let mut map = HeaderMap::with_capacity(self.entries.len());
        for (name, value) in &self.entries {
            let (name, value) = header_pair(name, value)?;
            map.append(name, value);
        }
        Ok(map)
    }

    /// First value of a header
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of a header, in order
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether a header is present
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Add a value, keeping existing values of the same header
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.entries.push((format_header_name(name), value.into()));
    }

    /// Replace all values of a header with a single value
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.append(name, value);
    }

    /// Remove all values of a header, returning whether any existed
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before != self.entries.len()
    }

    /// Number of header values
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no headers
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(name, value)` pairs in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Distinct header names in order of first appearance
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for (name, _) in &self.entries {
            if !names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                names.push(name);
            }
        }
        names
    }

    /// Parse headers from a JSON object; arrays denote repeated headers
    ///
    /// # Errors
    ///
    /// Returns error if the value is not an object of scalars or arrays
    pub fn from_json(value: &Value) -> Result<Self> {
        let Value::Object(object) = value else {
            return Err(MitmError::InvalidFixture(format!(
                "headers must be an object, got {value}"
            )));
        };

        let mut headers = Self::new();
        for (name, value) in object {
            match value {
                Value::Array(values) => {
                    for value in values {
                        headers.append(name, scalar_to_string(value)?);
                    }
                }
                value => headers.append(name, scalar_to_string(value)?),
            }
        }
        Ok(headers)
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.append(name.as_ref(), value);
        }
        headers
    }
}

impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let names = self.names();
        let mut map = serializer.serialize_map(Some(names.len()))?;
        for name in names {
            let values: Vec<&str> = self.get_all(name).collect();
            if let [single] = values.as_slice() {
                map.serialize_entry(name, single)?;
            } else {
                map.serialize_entry(name, &values)?;
            }
        }
        map.end()
    }
}

fn scalar_to_string(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(MitmError::InvalidFixture(format!(
            "header value must be a scalar, got {other}"
        ))),
    }
}

/// Validate a header pair for use with hyper
///
/// # Errors
///
/// Returns error if the name or value is not valid in HTTP
pub fn header_pair(name: &str, value: &str) -> Result<(HeaderName, HeaderValue)> {
    let header_name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| MitmError::InvalidHeader(format!("{name}: {e}")))?;
    let header_value = HeaderValue::from_str(value)
        .map_err(|e| MitmError::InvalidHeader(format!("{name}: {e}")))?;
    Ok((header_name, header_value))
}

/// A message body
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Raw bytes
    Bytes(Bytes),
    /// Decoded UTF-8 text
    Text(String),
    /// Parsed JSON value
    Json(Value),
}

impl Body {
    /// Whether the body carries no payload
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Bytes(bytes) => bytes.is_empty(),
            Self::Text(text) => text.is_empty(),
            Self::Json(_) => false,
        }
    }

    /// Whether the body is a JSON array or object
    #[must_use]
    pub fn is_structured(&self) -> bool {
        matches!(self, Self::Json(Value::Array(_) | Value::Object(_)))
    }

    /// Encode the body as it would travel on the wire
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Bytes(bytes) => bytes.clone(),
            Self::Text(text) => Bytes::from(text.clone()),
            Self::Json(value) => Bytes::from(value.to_string()),
        }
    }

    /// Parse a fixture body: strings are text, `{"$binary": hex}` is raw
    /// bytes, anything else is JSON
    ///
    /// # Errors
    ///
    /// Returns error if a binary body is not valid hex
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::String(text) => Ok(Self::Text(text.clone())),
            Value::Object(object) if object.len() == 1 => {
                match object.get(BINARY_BODY_KEY).and_then(Value::as_str) {
                    Some(encoded) => hex::decode(encoded)
                        .map(|bytes| Self::Bytes(Bytes::from(bytes)))
                        .map_err(|e| MitmError::InvalidFixture(format!("binary body: {e}"))),
                    None => Ok(Self::Json(value.clone())),
                }
            }
            other => Ok(Self::Json(other.clone())),
        }
    }
}

impl Serialize for Body {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Bytes(bytes) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(BINARY_BODY_KEY, &hex::encode(bytes))?;
                map.end()
            }
            Self::Text(text) => serializer.serialize_str(text),
            Self::Json(value) => value.serialize(serializer),
        }
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl From<Value> for Body {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

/// A request or response projected into plain fields.
///
/// Requests carry `url` (either a path, or `"METHOD path"` once collapsed),
/// `method`, and the connection metadata `host`/`port`/`encrypted`.
/// Responses carry `status_code`. Absent fields are omitted when serialized.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageRecord {
    /// Request url, possibly prefixed by its method
    pub url: Option<String>,
    /// Request method
    pub method: Option<String>,
    /// Protocol, e.g. `HTTP/1.1`
    pub protocol: Option<String>,
    /// Response status code
    pub status_code: Option<u16>,
    /// Headers
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

impl MessageRecord {
    /// Number of populated fields
    #[must_use]
    pub fn field_count(&self) -> usize {
        [
            self.url.is_some(),
            self.method.is_some(),
            self.protocol.is_some(),
            self.status_code.is_some(),
            !self.headers.is_empty(),
            self.host.is_some(),
            self.port.is_some(),
            self.encrypted.is_some(),
            self.body.is_some(),
        ]
        .into_iter()
        .filter(|populated| *populated)
        .count()
    }

    /// Declared content type
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("Content-Type")
    }

    /// Parse a record from a JSON object
    ///
    /// # Errors
    ///
    /// Returns error if the value is not an object or a field has the wrong type
    pub fn from_json(value: &Value) -> Result<Self> {
        let Value::Object(object) = value else {
            return Err(MitmError::InvalidFixture(format!(
                "message must be an object, got {value}"
            )));
        };

        let string_field = |key: &str| -> Result<Option<String>> {
            match object.get(key) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::String(s)) => Ok(Some(s.clone())),
                Some(other) => Err(MitmError::InvalidFixture(format!(
                    "{key} must be a string, got {other}"
                ))),
            }
        };
        let port_field = |key: &str| -> Result<Option<u16>> {
            match object.get(key) {
                None | Some(Value::Null) => Ok(None),
                Some(value) => value_to_u16(value)
                    .map(Some)
                    .ok_or_else(|| MitmError::InvalidFixture(format!("invalid {key}: {value}"))),
            }
        };

        Ok(Self {
            url: string_field("url")?,
            method: string_field("method")?,
            protocol: string_field("protocol")?,
            status_code: port_field("statusCode")?,
            headers: object
                .get("headers")
                .map(Headers::from_json)
                .transpose()?
                .unwrap_or_default(),
            host: string_field("host")?,
            port: port_field("port")?,
            encrypted: object.get("encrypted").and_then(Value::as_bool),
            body: object
                .get("body")
                .filter(|body| !body.is_null())
                .map(Body::from_json)
                .transpose()?,
        })
    }
}

/// Numbers and numeric strings in the `u16` range
pub(crate) fn value_to_u16(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

impl Serialize for MessageRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut record = serializer.serialize_struct("MessageRecord", self.field_count())?;
        if let Some(url) = &self.url {
            record.serialize_field("url", url)?;
        }
        if let Some(method) = &self.method {
            record.serialize_field("method", method)?;
        }
        if let Some(protocol) = &self.protocol {
            record.serialize_field("protocol", protocol)?;
        }
        if let Some(status_code) = &self.status_code {
            record.serialize_field("statusCode", status_code)?;
        }
        if !self.headers.is_empty() {
            record.serialize_field("headers", &self.headers)?;
        }
        if let Some(host) = &self.host {
            record.serialize_field("host", host)?;
        }
        if let Some(port) = &self.port {
            record.serialize_field("port", port)?;
        }
        if let Some(encrypted) = &self.encrypted {
            record.serialize_field("encrypted", encrypted)?;
        }
        if let Some(body) = &self.body {
            record.serialize_field("body", body)?;
        }
        record.end()
    }
}
