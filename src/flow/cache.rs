//! `Cache-Control` directive construction.

use serde::{Deserialize, Serialize};

/// Seconds used when an expiration kind is given without a value.
pub const DEFAULT_EXPIRATION_SECONDS: u64 = 3600;

/// Who may store the response.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Cacheability {
    Public,
    Private,
    NoCache,
    NoStore,
}

impl Cacheability {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public  => "public",
            Self::Private => "private",
            Self::NoCache => "no-cache",
            Self::NoStore => "no-store",
        }
    }
}

/// Directive carrying the `=seconds` value.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExpirationKind {
    MaxAge,
    SMaxage,
    MaxStale,
    MinFresh,
    StaleWhileRevalidate,
    StaleIfError,
}

impl ExpirationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MaxAge               => "max-age",
            Self::SMaxage              => "s-maxage",
            Self::MaxStale             => "max-stale",
            Self::MinFresh             => "min-fresh",
            Self::StaleWhileRevalidate => "stale-while-revalidate",
            Self::StaleIfError         => "stale-if-error",
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Revalidation {
    MustRevalidate,
    ProxyRevalidate,
    Immutable,
}

impl Revalidation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MustRevalidate  => "must-revalidate",
            Self::ProxyRevalidate => "proxy-revalidate",
            Self::Immutable       => "immutable",
        }
    }
}

/// Cache policy for a response, applied with
/// [`Flow::set_cache`](crate::Flow::set_cache) or per route through
/// [`RouteOptions::cache`](crate::RouteOptions::cache).
///
/// ```rust
/// use bareflow::{CacheOptions, Cacheability, ExpirationKind, Revalidation};
///
/// let opts = CacheOptions {
///     cacheability: Some(Cacheability::Private),
///     expiration_kind: Some(ExpirationKind::MaxAge),
///     expiration_seconds: Some(3800),
///     revalidation: Some(Revalidation::MustRevalidate),
/// };
/// assert_eq!(opts.directive().as_deref(), Some("private, max-age=3800, must-revalidate"));
/// ```
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct CacheOptions {
    pub cacheability: Option<Cacheability>,
    pub expiration_kind: Option<ExpirationKind>,
    pub expiration_seconds: Option<u64>,
    pub revalidation: Option<Revalidation>,
}

impl CacheOptions {
    /// The `Cache-Control` value, or `None` when no directive is configured.
    pub fn directive(&self) -> Option<String> {
        let mut parts = Vec::with_capacity(3);
        if let Some(c) = self.cacheability {
            parts.push(c.as_str().to_owned());
        }
        if let Some(kind) = self.expiration_kind {
            let seconds = self.expiration_seconds.unwrap_or(DEFAULT_EXPIRATION_SECONDS);
            parts.push(format!("{}={seconds}", kind.as_str()));
        }
        if let Some(r) = self.revalidation {
            parts.push(r.as_str().to_owned());
        }
        (!parts.is_empty()).then(|| parts.join(", "))
    }
}
