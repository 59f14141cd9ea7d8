//! Error types.
//!
//! Application-level failures raised by handlers and middleware travel as
//! [`BoxError`] into the error dispatcher and come out as HTTP responses.
//! The typed errors here cover everything else: route declarations that are
//! malformed, request bodies that don't match their content type, config
//! files that don't parse, and the server's own I/O.

use std::path::PathBuf;

use crate::method::Method;

/// Type-erased error produced by handlers and middleware.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The error type returned by the server's fallible infrastructure
/// operations: binding, accepting, loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("upgrade subsystem failed to start: {0}")]
    Upgrade(#[source] BoxError),
}

/// A route declaration was rejected. Nothing was registered.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("route path `{path}` for method {method} must start with '/'")]
    MissingLeadingSlash { method: Method, path: String },

    #[error("declared route `{path}` for method {method} contains an empty segment ('//')")]
    EmptySegment { method: Method, path: String },

    #[error("per-route timeout for {method} `{path}` must be a non-zero duration")]
    ZeroTimeout { method: Method, path: String },

    #[error("a declaration needs at least one method (route `{path}`)")]
    NoMethods { path: String },

    #[error("route {method} `{path}` conflicts with an existing route: {source}")]
    Conflict {
        method: Method,
        path: String,
        #[source]
        source: BoxError,
    },

    #[error("runtime route {method} `{path}` refused: the server is not listening")]
    NotListening { method: Method, path: String },
}

/// The request body did not match its declared content type.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BodyParseError {
    #[error("invalid JSON body: {0}")]
    Json(String),

    #[error("failed to read request body: {0}")]
    Read(String),
}

/// Loading a [`ServerConfig`](crate::ServerConfig) failed.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// A message reaching a [`MessageRouter`](crate::upgrade::MessageRouter)
/// could not be routed or handled.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("a handler for message type `{0}` is already registered")]
    DuplicateType(String),

    #[error("message is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("message has no string `type` field")]
    MissingType,

    #[error("no handler for message type `{0}`")]
    UnknownType(String),

    #[error("handler for message type `{kind}` failed: {source}")]
    Handler {
        kind: String,
        #[source]
        source: BoxError,
    },
}
