//! # bareflow
//!
//! The request-processing core of an HTTP service: one [`Flow`] per request,
//! a compiled middleware pipeline, a route table that can grow while the
//! server is live, and graceful shutdown.
//!
//! ## The contract
//!
//! hyper owns the wire. bareflow owns what happens between "a request
//! arrived" and "exactly one response left":
//!
//! - **Flow**: request accessors plus a response builder that finalizes once.
//!   Late sends (a handler finishing after its timeout fired, an error after
//!   a reply) are logged and dropped.
//! - **Pipeline**: CORS, body parsing, cookies and reverse DNS run first, then
//!   your middleware, strictly in order. Any step that sends ends the chain.
//! - **Routing**: `matchit` radix trees behind a [`Matcher`] seam, published
//!   atomically so routes added at runtime never show up half-built.
//! - **Errors**: one dispatcher turns middleware and handler errors into
//!   responses.
//! - **Context**: an optional per-request [`context::Execution`] reachable
//!   from any task spawned with [`context::spawn`].
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use bareflow::{Flow, Json, RouteOptions, Server, ServerConfig};
//! use serde::Serialize;
//!
//! #[derive(Serialize)]
//! struct User { id: String }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), bareflow::Error> {
//!     let server = Server::new(ServerConfig::default()).middleware(auth);
//!     server
//!         .router()
//!         .get("/users/:id", get_user)?
//!         .post_with("/reports", RouteOptions::timeout(Duration::from_secs(2)), build_report)?;
//!     server.serve().await
//! }
//!
//! async fn auth(flow: Flow) {
//!     if flow.request_header("authorization").is_none() {
//!         flow.status(401).send("missing credentials");
//!     }
//! }
//!
//! async fn get_user(flow: Flow) -> Json<User> {
//!     Json(User { id: flow.param("id").unwrap_or_default() })
//! }
//!
//! async fn build_report(_flow: Flow) -> &'static str {
//!     "done"
//! }
//! ```

mod config;
mod dispatch;
mod error;
mod flow;
mod handler;
mod matcher;
mod method;
mod reply;
mod router;
mod server;

pub mod context;
pub mod middleware;
pub mod upgrade;

pub use config::{ServerConfig, TimeFormat};
pub use dispatch::{ErrorHandler, default_error_handler};
pub use error::{BodyParseError, BoxError, ConfigError, Error, MessageError, RouteError};
pub use flow::{
    CacheOptions, Cacheability, DEFAULT_EXPIRATION_SECONDS, ExpirationKind, Flow, RequestBody,
    Revalidation, Stage, TIMEOUT_BODY,
};
pub use handler::{BoxFuture, Handler};
pub use matcher::{Matched, Matcher, RadixMatcher};
pub use method::Method;
pub use middleware::Middleware;
pub use reply::{IntoReply, Json, Reply, ReplyBody, ReplyStream};
pub use router::{REDACTED, RouteEntry, RouteOptions, Router, Runtime};
pub use server::{NOT_FOUND_BODY, Server, ServerHandle};
