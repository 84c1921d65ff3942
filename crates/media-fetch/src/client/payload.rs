//! Response body decoding.
//!
//! Some upstreams mislabel their content type, so decoding of unknown types
//! degrades (JSON, then raw bytes, then empty) instead of failing.

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;

use crate::error::FetchResult;

/// A decoded response body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Structured JSON.
    Json(serde_json::Value),
    /// XML, HTML or plain text, undecoded.
    Text(String),
    /// Anything else that was not JSON.
    Binary(Bytes),
    /// No usable body.
    Empty,
}

impl Payload {
    #[must_use]
    pub const fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Deserialize into `T`.
    ///
    /// Text and binary payloads are parsed as JSON; `Empty` deserializes from `null`.
    pub fn into_json<T: DeserializeOwned>(self) -> FetchResult<T> {
        let value = match self {
            Self::Json(value) => serde_json::from_value(value)?,
            Self::Text(text) => serde_json::from_str(&text)?,
            Self::Binary(bytes) => serde_json::from_slice(&bytes)?,
            Self::Empty => serde_json::from_value(serde_json::Value::Null)?,
        };
        Ok(value)
    }
}

/// How a content type is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContentKind {
    Json,
    Text,
    Unknown,
}

pub(crate) fn content_kind(content_type: Option<&str>) -> ContentKind {
    let Some(content_type) = content_type else {
        return ContentKind::Unknown;
    };
    let mime = content_type.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();

    if mime == "application/json" || mime.ends_with("+json") {
        ContentKind::Json
    } else if mime.starts_with("text/") || mime.contains("xml") || mime.contains("html") {
        ContentKind::Text
    } else {
        ContentKind::Unknown
    }
}

/// Decode `body` according to `content_type`.
///
/// Only a JSON-labelled body that fails to parse is an error.
pub(crate) fn negotiate(content_type: Option<&str>, body: Bytes) -> FetchResult<Payload> {
    if body.is_empty() {
        return Ok(Payload::Empty);
    }

    match content_kind(content_type) {
        ContentKind::Json => Ok(Payload::Json(serde_json::from_slice(&body)?)),
        ContentKind::Text => Ok(Payload::Text(String::from_utf8_lossy(&body).into_owned())),
        ContentKind::Unknown => Ok(serde_json::from_slice(&body)
            .map(Payload::Json)
            .unwrap_or(Payload::Binary(body))),
    }
}

/// Read and decode a successful response.
pub(crate) async fn decode(response: reqwest::Response) -> FetchResult<Payload> {
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.bytes().await?;

    negotiate(content_type.as_deref(), body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_kind() {
        assert_eq!(content_kind(Some("application/json; charset=utf-8")), ContentKind::Json);
        assert_eq!(content_kind(Some("application/vnd.api+json")), ContentKind::Json);
        assert_eq!(content_kind(Some("text/plain")), ContentKind::Text);
        assert_eq!(content_kind(Some("application/xml")), ContentKind::Text);
        assert_eq!(content_kind(Some("TEXT/HTML")), ContentKind::Text);
        assert_eq!(content_kind(Some("application/octet-stream")), ContentKind::Unknown);
        assert_eq!(content_kind(None), ContentKind::Unknown);
    }

    #[test]
    fn test_plain_text_never_parsed() {
        let payload = negotiate(Some("text/plain"), Bytes::from_static(b"{\"a\":1}")).unwrap();
        assert_eq!(payload, Payload::Text("{\"a\":1}".to_string()));
    }

    #[test]
    fn test_unknown_tries_json_then_bytes() {
        let json = negotiate(None, Bytes::from_static(b"[1,2]")).unwrap();
        assert_eq!(json, Payload::Json(serde_json::json!([1, 2])));

        let raw = negotiate(None, Bytes::from_static(&[0x89, 0x50, 0x4e, 0x47])).unwrap();
        assert_eq!(raw.as_bytes().map(|b| b.len()), Some(4));

        let empty = negotiate(Some("application/octet-stream"), Bytes::new()).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_mislabelled_json_is_an_error() {
        assert!(negotiate(Some("application/json"), Bytes::from_static(b"{ nope")).is_err());
    }

    #[test]
    fn test_into_json_from_text() {
        #[derive(serde::Deserialize)]
        struct Movie {
            id: u32,
        }

        let movie: Movie = Payload::Text("{\"id\":603}".to_string()).into_json().unwrap();
        assert_eq!(movie.id, 603);

        let none: Option<Movie> = Payload::Empty.into_json().unwrap();
        assert!(none.is_none());
    }
}
