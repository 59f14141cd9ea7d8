//! Protocol-upgrade subsystem seam.
//!
//! The server does not speak WebSocket itself. A subsystem that does (one
//! built on `tokio-tungstenite`, say) plugs in through [`UpgradeSubsystem`]:
//! it is started once the listener is bound and closed first thing during
//! graceful shutdown, before in-flight HTTP requests are drained.
//!
//! [`MessageRouter`] covers the part every such subsystem needs: inbound JSON
//! messages carry a `type` field, one handler is registered per type, and a
//! handler's answer goes back as `{"type": "<type>_RESPONSE", ...}`.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, error};

use crate::error::{BoxError, MessageError};
use crate::handler::BoxFuture;

/// A long-lived subsystem sharing the server's lifecycle.
pub trait UpgradeSubsystem: Send + Sync + 'static {
    /// Called once the HTTP listener is bound.
    fn start_listening(&self) -> BoxFuture<Result<(), BoxError>>;

    /// Called when shutdown begins. Should close every upgraded connection.
    fn close(&self) -> BoxFuture<()>;
}

type MessageHandler = Arc<dyn Fn(Value) -> BoxFuture<Result<Option<Value>, BoxError>> + Send + Sync>;

/// Routes decoded JSON messages to per-type handlers.
#[derive(Clone, Default)]
pub struct MessageRouter {
    handlers: HashMap<String, MessageHandler>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for one message type. A handler returning
    /// `Ok(None)` sends no reply.
    pub fn on<F, Fut, E>(&mut self, kind: &str, handler: F) -> Result<&mut Self, MessageError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        if self.handlers.contains_key(kind) {
            return Err(MessageError::DuplicateType(kind.to_owned()));
        }
        let handler = Arc::new(handler);
        let erased: MessageHandler =
            Arc::new(move |message: Value| -> BoxFuture<Result<Option<Value>, BoxError>> {
                let fut = handler(message);
                Box::pin(async move { fut.await.map_err(Into::into) })
            });
        self.handlers.insert(kind.to_owned(), erased);
        Ok(self)
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Decodes `raw`, runs the handler for its `type`, and renders the reply.
    ///
    /// An object answer is merged into the reply; any other value is placed
    /// under `data`.
    pub async fn handle(&self, raw: &str) -> Result<Option<String>, MessageError> {
        let message: Value = serde_json::from_str(raw)?;
        let kind = message
            .get("type")
            .and_then(Value::as_str)
            .filter(|k| !k.is_empty())
            .ok_or(MessageError::MissingType)?
            .to_owned();
        let handler = self
            .handlers
            .get(&kind)
            .ok_or_else(|| MessageError::UnknownType(kind.clone()))?;

        debug!(%kind, "routing message");
        let answer = handler(message)
            .await
            .map_err(|source| MessageError::Handler { kind: kind.clone(), source })?;
        let Some(answer) = answer else { return Ok(None) };

        let mut reply = Map::new();
        reply.insert("type".to_owned(), Value::String(format!("{kind}_RESPONSE")));
        match answer {
            Value::Object(fields) => {
                for (k, v) in fields {
                    if k != "type" {
                        reply.insert(k, v);
                    }
                }
            }
            other => {
                reply.insert("data".to_owned(), other);
            }
        }
        Ok(Some(Value::Object(reply).to_string()))
    }

    /// [`handle`](Self::handle), logging failures instead of returning them.
    pub async fn dispatch(&self, raw: &str) -> Option<String> {
        match self.handle(raw).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(error = %e, "message dropped");
                None
            }
        }
    }
}

impl fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRouter")
            .field("types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn router() -> MessageRouter {
        let mut router = MessageRouter::new();
        router
            .on("PING", |msg| async move {
                Ok::<_, BoxError>(Some(json!({"type": "ignored", "echo": msg["n"]})))
            })
            .unwrap()
            .on("COUNT", |_| async { Ok::<_, BoxError>(Some(json!(3))) })
            .unwrap()
            .on("FIRE", |_| async { Ok::<_, BoxError>(None) })
            .unwrap();
        router
    }

    #[tokio::test]
    async fn replies_with_response_type() {
        let reply = router().handle(r#"{"type":"PING","n":5}"#).await.unwrap().unwrap();
        let reply: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply, json!({"type": "PING_RESPONSE", "echo": 5}));

        let count = router().handle(r#"{"type":"COUNT"}"#).await.unwrap().unwrap();
        assert_eq!(serde_json::from_str::<Value>(&count).unwrap(), json!({"type": "COUNT_RESPONSE", "data": 3}));

        assert_eq!(router().handle(r#"{"type":"FIRE"}"#).await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejects_bad_messages() {
        let router = router();
        assert!(matches!(router.handle("nope").await, Err(MessageError::Decode(_))));
        assert!(matches!(router.handle(r#"{"n":1}"#).await, Err(MessageError::MissingType)));
        assert!(matches!(router.handle(r#"{"type":"X"}"#).await, Err(MessageError::UnknownType(k)) if k == "X"));
        assert_eq!(router.dispatch(r#"{"type":"X"}"#).await, None);
    }

    #[test]
    fn duplicate_type_is_rejected() {
        let mut router = router();
        let err = router.on("PING", |_| async { Ok::<_, BoxError>(None) }).unwrap_err();
        assert!(matches!(err, MessageError::DuplicateType(k) if k == "PING"));
    }
}
