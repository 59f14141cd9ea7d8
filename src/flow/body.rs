//! Request body classification by declared content type.

use std::collections::HashMap;

use bytes::Bytes;
use url::form_urlencoded;

use crate::error::BodyParseError;

/// A request body after preprocessing.
#[derive(Clone, Debug, Default)]
pub enum RequestBody {
    /// Not read: the method carries no body, or body parsing is disabled.
    #[default]
    Absent,
    /// `text/plain`.
    Text(String),
    /// `application/json`.
    Json(serde_json::Value),
    /// `application/x-www-form-urlencoded`.
    Form(HashMap<String, String>),
    /// Form body with at least one pair missing its key or value.
    MalformedForm,
    /// Any other content type, untouched.
    Binary(Bytes),
    /// The bytes did not match the declared content type.
    Invalid(BodyParseError),
}

impl RequestBody {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_form(&self) -> Option<&HashMap<String, String>> {
        match self {
            Self::Form(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Deserializes a JSON body into `T`.
    pub fn deserialize<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        self.as_json().and_then(|v| T::deserialize(v).ok())
    }
}

/// Media type without parameters, lowercased: `"Text/Plain; charset=utf-8"` → `"text/plain"`.
pub(crate) fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// An empty payload stays [`RequestBody::Absent`] whatever its content type.
pub(crate) fn classify(content_type: Option<&str>, bytes: Bytes) -> RequestBody {
    if bytes.is_empty() {
        return RequestBody::Absent;
    }
    let media = content_type.map(media_type).unwrap_or_default();
    match media.as_str() {
        "text/plain" => RequestBody::Text(String::from_utf8_lossy(&bytes).into_owned()),
        "application/json" => match serde_json::from_slice(&bytes) {
            Ok(value) => RequestBody::Json(value),
            Err(e) => RequestBody::Invalid(BodyParseError::Json(e.to_string())),
        },
        "application/x-www-form-urlencoded" => match parse_form(&bytes) {
            Some(form) => RequestBody::Form(form),
            None => RequestBody::MalformedForm,
        },
        _ => RequestBody::Binary(bytes),
    }
}

/// All-or-nothing: one pair without a key or value rejects the whole body.
pub(crate) fn parse_form(raw: &[u8]) -> Option<HashMap<String, String>> {
    for pair in raw.split(|b| *b == b'&') {
        let eq = pair.iter().position(|b| *b == b'=')?;
        let (key, value) = (&pair[..eq], &pair[eq + 1..]);
        if key.is_empty() || value.is_empty() {
            return None;
        }
    }
    Some(form_urlencoded::parse(raw).into_owned().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_media_type() {
        let body = classify(Some("text/plain; charset=utf-8"), Bytes::from_static(b"hi"));
        assert_eq!(body.as_text(), Some("hi"));

        let body = classify(Some("Application/JSON"), Bytes::from_static(br#"{"a":1}"#));
        assert_eq!(body.as_json().unwrap()["a"], 1);

        let body = classify(None, Bytes::from_static(b"\x00\x01"));
        assert_eq!(body.as_bytes().map(|b| b.len()), Some(2));
    }

    #[test]
    fn invalid_json_is_explicit() {
        let body = classify(Some("application/json"), Bytes::from_static(b"{nope"));
        assert!(matches!(body, RequestBody::Invalid(BodyParseError::Json(_))));
    }

    #[test]
    fn form_decodes_pairs() {
        let form = parse_form(b"name=ada+lovelace&city=London%20UK").unwrap();
        assert_eq!(form["name"], "ada lovelace");
        assert_eq!(form["city"], "London UK");
    }

    #[test]
    fn malformed_form_is_never_partial() {
        assert!(parse_form(b"a=1&b").is_none());
        assert!(parse_form(b"a=1&=2").is_none());
        assert!(parse_form(b"a=1&b=").is_none());
        assert!(matches!(
            classify(Some("application/x-www-form-urlencoded"), Bytes::from_static(b"a=1&&b=2")),
            RequestBody::MalformedForm
        ));
    }
}
