//! Error dispatcher.
//!
//! Every error raised by a middleware or a handler ends up here, together
//! with the flow it belongs to and an optional status override (`400` for
//! unreadable bodies). The installed [`ErrorHandler`] decides what the client
//! sees. If the flow was already sent, whatever the handler sends is dropped
//! by the send guard.
//!
//! The default handler exposes the error's message and debug representation.
//! Install your own with [`Server::error_handler`](crate::Server::error_handler)
//! before exposing a service to untrusted clients.

use std::fmt;
use std::sync::Arc;

use serde_json::json;
use tracing::warn;

use crate::error::BoxError;
use crate::flow::Flow;
use crate::reply::Reply;

/// `(error, flow, status_override)`.
pub type ErrorHandler = Arc<dyn Fn(BoxError, Flow, Option<u16>) + Send + Sync + 'static>;

/// Answers with the override status (or `500`) and a JSON description:
///
/// ```json
/// {"message": "…", "stack": "…", "causes": ["…"]}
/// ```
pub fn default_error_handler(error: BoxError, flow: Flow, status: Option<u16>) {
    let mut causes = Vec::new();
    let mut source = error.source();
    while let Some(cause) = source {
        causes.push(cause.to_string());
        source = cause.source();
    }
    let body = json!({
        "message": error.to_string(),
        "stack": format!("{error:?}"),
        "causes": causes,
    });
    flow.status(status.unwrap_or(500));
    flow.send(Reply::Json(body));
}

#[derive(Clone)]
pub(crate) struct Dispatcher {
    handler: ErrorHandler,
}

impl Dispatcher {
    pub(crate) fn new(handler: ErrorHandler) -> Self {
        Self { handler }
    }

    pub(crate) fn dispatch(&self, error: BoxError, flow: Flow, status: Option<u16>) {
        warn!(request_id = %flow.id(), error = %error, status, "request failed");
        (self.handler)(error, flow, status);
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(Arc::new(default_error_handler))
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}
