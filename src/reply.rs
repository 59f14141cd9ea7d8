//! Reply values and the [`IntoReply`] conversion trait.
//!
//! A handler hands back whatever it wants sent; the flow decides how each
//! kind of value travels on the wire:
//!
//! | Variant | Body | `Content-Type` |
//! |---|---|---|
//! | [`Reply::Empty`] | none | unchanged |
//! | [`Reply::Text`] | as-is | unchanged (`text/plain` by default) |
//! | [`Reply::Binary`] | as-is | unchanged |
//! | [`Reply::Bool`] / [`Reply::Number`] | stringified | unchanged |
//! | [`Reply::Json`] | serialized | `application/json` |
//! | [`Reply::Stream`] | piped to completion | unchanged |
//! | [`Reply::Unrecognized`] | none, plus a warning | unchanged |

use std::any::Any;
use std::fmt;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use serde::Serialize;

use crate::error::BoxError;

/// Body type handed to hyper.
pub type ReplyBody = UnsyncBoxBody<Bytes, BoxError>;

/// A body produced chunk by chunk.
pub type ReplyStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send + 'static>>;

/// Everything a flow can send.
pub enum Reply {
    Empty,
    Text(String),
    Binary(Bytes),
    Json(serde_json::Value),
    Bool(bool),
    /// A number, already rendered in its wire form.
    Number(String),
    Stream(ReplyStream),
    /// A dynamically-typed value of a type the flow does not know how to send.
    Unrecognized(&'static str),
}

impl Reply {
    /// Serializes `value` into a JSON reply.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Self::Json)
    }

    /// Wraps a chunk stream.
    pub fn stream<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        Self::Stream(Box::pin(stream.map_err(Into::into)))
    }

    /// Classifies a value that crossed a dynamically-typed boundary.
    ///
    /// Known types map onto their variant; anything else becomes
    /// [`Reply::Unrecognized`] and is sent as an empty body.
    pub fn from_any(value: Box<dyn Any + Send>) -> Self {
        macro_rules! try_number {
            ($value:ident, $($ty:ty),*) => {
                $(
                    let $value = match $value.downcast::<$ty>() {
                        Ok(n) => return Self::Number(n.to_string()),
                        Err(other) => other,
                    };
                )*
            };
        }

        let value = match value.downcast::<Reply>() {
            Ok(reply) => return *reply,
            Err(other) => other,
        };
        let value = match value.downcast::<String>() {
            Ok(s) => return Self::Text(*s),
            Err(other) => other,
        };
        let value = match value.downcast::<&'static str>() {
            Ok(s) => return Self::Text((*s).to_owned()),
            Err(other) => other,
        };
        let value = match value.downcast::<Bytes>() {
            Ok(b) => return Self::Binary(*b),
            Err(other) => other,
        };
        let value = match value.downcast::<Vec<u8>>() {
            Ok(b) => return Self::Binary(Bytes::from(*b)),
            Err(other) => other,
        };
        let value = match value.downcast::<bool>() {
            Ok(b) => return Self::Bool(*b),
            Err(other) => other,
        };
        let value = match value.downcast::<serde_json::Value>() {
            Ok(v) => return Self::from(*v),
            Err(other) => other,
        };
        let value = match value.downcast::<()>() {
            Ok(_) => return Self::Empty,
            Err(other) => other,
        };
        try_number!(value, i32, i64, u32, u64, usize, f32, f64);
        drop(value);
        Self::Unrecognized("unknown")
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Text(_) => "text",
            Self::Binary(_) => "binary",
            Self::Json(_) => "json",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::Stream(_) => "stream",
            Self::Unrecognized(_) => "unrecognized",
        }
    }

    pub(crate) fn into_payload(self) -> Payload {
        match self {
            Self::Empty => Payload::None,
            Self::Text(s) => Payload::Fixed(Bytes::from(s)),
            Self::Binary(b) => Payload::Fixed(b),
            Self::Bool(b) => Payload::Fixed(Bytes::from(b.to_string())),
            Self::Number(n) => Payload::Fixed(Bytes::from(n)),
            Self::Json(value) => match serde_json::to_vec(&value) {
                Ok(bytes) => Payload::Json(Bytes::from(bytes)),
                Err(e) => {
                    tracing::error!(error = %e, "reply is not serializable, sending empty body");
                    Payload::None
                }
            },
            Self::Stream(stream) => Payload::Stream(stream),
            Self::Unrecognized(type_name) => {
                tracing::warn!(type_name, "unknown type to send, sending empty body");
                Payload::None
            }
        }
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.debug_tuple("Text").field(s).finish(),
            Self::Binary(b) => f.debug_tuple("Binary").field(b).finish(),
            Self::Json(v) => f.debug_tuple("Json").field(v).finish(),
            Self::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Self::Number(n) => f.debug_tuple("Number").field(n).finish(),
            Self::Unrecognized(t) => f.debug_tuple("Unrecognized").field(t).finish(),
            Self::Empty => f.write_str("Empty"),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// A reply lowered to what goes on the wire.
pub(crate) enum Payload {
    None,
    Fixed(Bytes),
    Json(Bytes),
    Stream(ReplyStream),
}

impl Payload {
    pub(crate) fn into_body(self) -> ReplyBody {
        match self {
            Self::None => Empty::new().map_err(|never| match never {}).boxed_unsync(),
            Self::Fixed(b) | Self::Json(b) => {
                Full::new(b).map_err(|never| match never {}).boxed_unsync()
            }
            Self::Stream(stream) => StreamBody::new(stream.map_ok(Frame::data)).boxed_unsync(),
        }
    }
}

// ── Conversions ───────────────────────────────────────────────────────────────

impl From<()> for Reply {
    fn from(_: ()) -> Self { Self::Empty }
}

impl From<String> for Reply {
    fn from(s: String) -> Self { Self::Text(s) }
}

impl From<&'static str> for Reply {
    fn from(s: &'static str) -> Self { Self::Text(s.to_owned()) }
}

impl From<Bytes> for Reply {
    fn from(b: Bytes) -> Self { Self::Binary(b) }
}

impl From<Vec<u8>> for Reply {
    fn from(b: Vec<u8>) -> Self { Self::Binary(Bytes::from(b)) }
}

impl From<bool> for Reply {
    fn from(b: bool) -> Self { Self::Bool(b) }
}

macro_rules! number_reply {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Reply {
                fn from(n: $ty) -> Self { Self::Number(n.to_string()) }
            }
        )*
    };
}

number_reply!(i32, i64, u32, u64, usize, f32, f64);

/// JSON values keep their shape: strings are sent as text, scalars are
/// stringified, `null` is an empty body, arrays and objects are serialized.
impl From<serde_json::Value> for Reply {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Self::Empty,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n.to_string()),
            Value::String(s) => Self::Text(s),
            structured => Self::Json(structured),
        }
    }
}

impl<T: Into<Reply>> From<Option<T>> for Reply {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Empty, Into::into)
    }
}

// ── IntoReply ─────────────────────────────────────────────────────────────────

/// Conversion of a handler's return value into a [`Reply`].
///
/// `Err` values are routed to the error dispatcher instead of being sent.
///
/// # Example: typed JSON with serde
///
/// ```rust,no_run
/// use bareflow::{Flow, Json};
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct User { id: u64, name: String }
///
/// async fn get_user(_flow: Flow) -> Json<User> {
///     Json(User { id: 1, name: "alice".into() })
/// }
/// ```
pub trait IntoReply {
    fn into_reply(self) -> Result<Reply, BoxError>;
}

macro_rules! into_reply_via_from {
    ($($ty:ty),*) => {
        $(
            impl IntoReply for $ty {
                fn into_reply(self) -> Result<Reply, BoxError> { Ok(self.into()) }
            }
        )*
    };
}

into_reply_via_from!(
    Reply, (), String, &'static str, Bytes, Vec<u8>, bool, serde_json::Value,
    i32, i64, u32, u64, usize, f32, f64
);

impl<T, E> IntoReply for Result<T, E>
where
    T: IntoReply,
    E: Into<BoxError>,
{
    fn into_reply(self) -> Result<Reply, BoxError> {
        self.map_err(Into::into)?.into_reply()
    }
}

impl<T: IntoReply> IntoReply for Option<T> {
    fn into_reply(self) -> Result<Reply, BoxError> {
        self.map_or(Ok(Reply::Empty), IntoReply::into_reply)
    }
}

/// Serializes `T` as a JSON reply.
pub struct Json<T>(pub T);

impl<T: Serialize> IntoReply for Json<T> {
    fn into_reply(self) -> Result<Reply, BoxError> {
        Ok(Reply::json(&self.0)?)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn scalars_are_stringified() {
        assert!(matches!(Reply::from(42u64), Reply::Number(n) if n == "42"));
        assert!(matches!(Reply::from(1.5f64), Reply::Number(n) if n == "1.5"));
        assert!(matches!(Reply::from(json!(true)), Reply::Bool(true)));
        assert!(matches!(Reply::from(json!("hi")), Reply::Text(s) if s == "hi"));
        assert!(matches!(Reply::from(json!(null)), Reply::Empty));
        assert!(matches!(Reply::from(json!([1, 2])), Reply::Json(_)));
    }

    #[test]
    fn dynamic_values_are_classified() {
        assert!(matches!(Reply::from_any(Box::new("x")), Reply::Text(_)));
        assert!(matches!(Reply::from_any(Box::new(7i64)), Reply::Number(n) if n == "7"));
        assert!(matches!(Reply::from_any(Box::new(vec![1u8, 2])), Reply::Binary(b) if b.len() == 2));
        assert!(matches!(Reply::from_any(Box::new(json!({"a": 1}))), Reply::Json(_)));

        struct Opaque;
        assert!(matches!(Reply::from_any(Box::new(Opaque)), Reply::Unrecognized(_)));
    }

    #[test]
    fn results_split_into_reply_or_error() {
        let ok: Result<&'static str, std::io::Error> = Ok("fine");
        assert!(matches!(ok.into_reply(), Ok(Reply::Text(_))));

        let err: Result<(), std::io::Error> = Err(std::io::Error::other("boom"));
        assert_eq!(err.into_reply().unwrap_err().to_string(), "boom");
    }

    #[test]
    fn json_wrapper_serializes() {
        #[derive(Serialize)]
        struct User { id: u32 }
        let reply = Json(User { id: 3 }).into_reply().unwrap();
        assert!(matches!(reply, Reply::Json(v) if v == json!({"id": 3})));
    }
}
