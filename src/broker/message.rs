//! Wire-level message types: properties, headers and deliveries.

use std::collections::BTreeMap;
use std::time::Duration;

/// A single header value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeaderValue {
    Int(i64),
    Str(String),
    Bool(bool),
}

impl HeaderValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(value) => Some(*value),
            HeaderValue::Str(value) => value.parse().ok(),
            HeaderValue::Bool(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(value) => Some(value),
            _ => None,
        }
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<u32> for HeaderValue {
    fn from(value: u32) -> Self {
        HeaderValue::Int(i64::from(value))
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Str(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Str(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

/// Message headers, ordered for stable logging.
pub type Headers = BTreeMap<String, HeaderValue>;

/// Publish properties carried with every message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Properties {
    /// Application message id.
    pub message_id: Option<String>,
    /// Delivery mode 2 when true.
    pub persistent: bool,
    /// Content type of the body (e.g. `application/json`).
    pub content_type: Option<String>,
    /// Per-message TTL.
    pub expiration: Option<Duration>,
    pub headers: Headers,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&HeaderValue> {
        self.headers.get(key)
    }
}

/// A message handed to a consumer. Must be acked or nacked on the same channel.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub delivery_tag: u64,
    /// Set when this message was delivered before and not acknowledged.
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: Properties,
    pub body: Vec<u8>,
}

impl Delivery {
    /// Get the body as a string (if valid UTF-8).
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Integer header lookup, tolerant of string-encoded numbers.
    pub fn header_i64(&self, key: &str) -> Option<i64> {
        self.properties.header(key).and_then(HeaderValue::as_i64)
    }
}

/// Record of a `basic.publish` as seen by the broker.
#[derive(Clone, Debug)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: Properties,
    pub body: Vec<u8>,
}

impl PublishedMessage {
    pub fn header_i64(&self, key: &str) -> Option<i64> {
        self.properties.header(key).and_then(HeaderValue::as_i64)
    }

    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.properties.header(key).and_then(HeaderValue::as_str)
    }
}
