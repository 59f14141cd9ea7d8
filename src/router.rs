//! Route table.
//!
//! Routes live in two places:
//!
//! - the **registry**, an ordered list of every declared route, behind a
//!   mutex that serializes registrations;
//! - the **live table**, a [`Matcher`] built from the registry and published
//!   through an [`ArcSwap`]. Requests read it lock-free.
//!
//! Every registration resets an unpublished matcher, re-inserts the registry
//! plus the new routes, and swaps it in only if every insert succeeded. The
//! retired table is reset and kept for the next rebuild once no request
//! still reads it. A request sees either the complete old table or the
//! complete new one, never a half-built matcher, and a rejected declaration
//! leaves both the registry and the live table untouched.
//!
//! Before the server listens, routes are declared with [`Router::get`] and
//! friends; declaring the same method and path twice is a conflict. Once it
//! listens, [`Router::runtime`] adds or replaces routes on the running table.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::RouteError;
use crate::flow::CacheOptions;
use crate::handler::{BoxedHandler, Handler};
use crate::matcher::{Matcher, RadixMatcher, normalize_path, normalize_pattern};
use crate::method::Method;

/// Per-verb shorthands over `route` and `route_with`, shared by [`Router`]
/// and [`Runtime`].
macro_rules! verb_methods {
    ($ret:ty) => {
        verb_methods! {
            @returns $ret;
            get, get_with => Get;
            post, post_with => Post;
            put, put_with => Put;
            patch, patch_with => Patch;
            delete, delete_with => Delete;
            options, options_with => Options;
            head, head_with => Head;
        }
    };
    (@returns $ret:ty; $($name:ident, $with:ident => $method:ident;)*) => {
        $(
            #[doc = concat!("Shorthand for `route(Method::", stringify!($method), ", ..)`.")]
            pub fn $name(&self, path: &str, handler: impl Handler) -> Result<$ret, RouteError> {
                self.route(Method::$method, path, handler)
            }

            #[doc = concat!("Shorthand for `route_with(Method::", stringify!($method), ", ..)`.")]
            pub fn $with(
                &self,
                path: &str,
                options: RouteOptions,
                handler: impl Handler,
            ) -> Result<$ret, RouteError> {
                self.route_with(Method::$method, path, options, handler)
            }
        )*
    };
}

/// Replacement for path parameters that try to escape their segment.
pub const REDACTED: &str = "REDACTED";

/// Per-route behavior applied after matching and before the handler runs.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RouteOptions {
    pub cache: Option<CacheOptions>,
    /// Finalize `503` if the handler hasn't answered in time. Must be non-zero.
    #[serde(with = "millis")]
    pub timeout: Option<Duration>,
    pub disable_cache: bool,
}

impl RouteOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self { timeout: Some(timeout), ..Self::default() }
    }

    pub fn cache(cache: CacheOptions) -> Self {
        Self { cache: Some(cache), ..Self::default() }
    }

    pub fn no_cache() -> Self {
        Self { disable_cache: true, ..Self::default() }
    }
}

/// `timeout` travels as whole milliseconds in config files.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// One registered route.
pub struct RouteEntry {
    pub(crate) method: Method,
    pub(crate) pattern: String,
    pub(crate) options: RouteOptions,
    pub(crate) handler: BoxedHandler,
}

impl RouteEntry {
    pub fn method(&self) -> Method {
        self.method
    }

    /// The normalized pattern, in `{name}` syntax.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// `METHOD?path`, the route's identity.
    fn key(&self) -> String {
        format!("{}?{}", self.method, self.pattern)
    }
}

impl fmt::Debug for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteEntry")
            .field("method", &self.method)
            .field("pattern", &self.pattern)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

type Table = Box<dyn Matcher<Arc<RouteEntry>>>;
type MatcherFactory = Arc<dyn Fn() -> Table + Send + Sync>;

/// The authoritative route list, plus a retired matcher ready for reuse.
struct Registry {
    entries: Vec<Arc<RouteEntry>>,
    spare: Option<Table>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Mode {
    /// Before listening: duplicates conflict.
    Static,
    /// While listening: duplicates replace.
    Runtime,
}

/// The application router. A cheap handle: clones share the same table.
#[derive(Clone)]
pub struct Router {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Mutex<Registry>,
    live: ArcSwap<Table>,
    factory: MatcherFactory,
    listening: AtomicBool,
}

impl Router {
    /// A router backed by [`RadixMatcher`].
    pub fn new() -> Self {
        Self::with_matcher(RadixMatcher::<Arc<RouteEntry>>::default)
    }

    /// A router backed by a custom matcher. `factory` supplies a new matcher
    /// whenever no retired one can be reset and reused.
    pub fn with_matcher<M, F>(factory: F) -> Self
    where
        M: Matcher<Arc<RouteEntry>>,
        F: Fn() -> M + Send + Sync + 'static,
    {
        let factory: MatcherFactory = Arc::new(move || Box::new(factory()) as Table);
        let empty = factory();
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry { entries: Vec::new(), spare: None }),
                live: ArcSwap::from_pointee(empty),
                factory,
                listening: AtomicBool::new(false),
            }),
        }
    }

    /// Registers a handler for one method.
    ///
    /// Path parameters use `{name}` or `:name`:
    ///
    /// ```rust,no_run
    /// # use bareflow::{Flow, Method, Router};
    /// # async fn get_user(_: Flow) {}
    /// # async fn create_user(_: Flow) {}
    /// # fn main() -> Result<(), bareflow::RouteError> {
    /// let router = Router::new();
    /// router
    ///     .get("/users/{id}", get_user)?
    ///     .route(Method::Post, "/users", create_user)?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn route(&self, method: Method, path: &str, handler: impl Handler) -> Result<&Self, RouteError> {
        self.route_with(method, path, RouteOptions::default(), handler)
    }

    pub fn route_with(
        &self,
        method: Method,
        path: &str,
        options: RouteOptions,
        handler: impl Handler,
    ) -> Result<&Self, RouteError> {
        self.declare(&[method], path, options, handler)
    }

    /// Registers one handler for several methods at once. Repeated methods are
    /// registered once. Either every method is registered or none is.
    pub fn declare(
        &self,
        methods: &[Method],
        path: &str,
        options: RouteOptions,
        handler: impl Handler,
    ) -> Result<&Self, RouteError> {
        self.register(Mode::Static, methods, path, options, handler.into_boxed_handler())?;
        Ok(self)
    }

    verb_methods!(&Self);

    /// The registration surface for a server that is already listening.
    pub fn runtime(&self) -> Runtime<'_> {
        Runtime { router: self }
    }

    /// Registered route keys (`METHOD?path`) in declaration order.
    pub fn routes(&self) -> Vec<String> {
        self.inner.registry.lock().entries.iter().map(|e| e.key()).collect()
    }

    pub(crate) fn set_listening(&self, listening: bool) {
        self.inner.listening.store(listening, Ordering::Release);
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::Acquire)
    }

    /// Looks up a route, decoding and sanitizing its parameters.
    pub(crate) fn lookup(
        &self,
        method: Method,
        path: &str,
    ) -> Option<(Arc<RouteEntry>, HashMap<String, String>)> {
        let live = self.inner.live.load();
        let matched = live.at(method, normalize_path(path))?;
        let params = matched
            .params
            .into_iter()
            .map(|(name, raw)| {
                let value = sanitize(&name, &raw);
                (name, value)
            })
            .collect();
        Some((Arc::clone(matched.value), params))
    }

    fn register(
        &self,
        mode: Mode,
        methods: &[Method],
        path: &str,
        options: RouteOptions,
        handler: BoxedHandler,
    ) -> Result<(), RouteError> {
        let Some(&first) = methods.first() else {
            return Err(RouteError::NoMethods { path: path.to_owned() });
        };
        validate(first, path, &options)?;
        if mode == Mode::Runtime && !self.is_listening() {
            warn!(method = %first, path, "runtime route refused, server is not listening");
            return Err(RouteError::NotListening { method: first, path: path.to_owned() });
        }

        let pattern = normalize_pattern(path);
        let mut seen = Vec::with_capacity(methods.len());
        let entries: Vec<_> = methods
            .iter()
            .filter(|m| {
                let fresh = !seen.contains(*m);
                seen.push(**m);
                fresh
            })
            .map(|&method| {
                Arc::new(RouteEntry {
                    method,
                    pattern: pattern.clone(),
                    options: options.clone(),
                    handler: Arc::clone(&handler),
                })
            })
            .collect();

        let mut registry = self.inner.registry.lock();
        let mut next = registry.entries.clone();
        for entry in entries {
            let existing = next.iter().position(|e| e.key() == entry.key());
            match (mode, existing) {
                (Mode::Runtime, Some(i)) => next[i] = entry,
                _ => next.push(entry),
            }
        }

        let mut table = registry.spare.take().unwrap_or_else(|| (self.inner.factory)());
        if let Err(e) = fill(&mut table, &next) {
            table.reset();
            registry.spare = Some(table);
            return Err(e);
        }

        let retired = self.inner.live.swap(Arc::new(table));
        registry.spare = Arc::try_unwrap(retired).ok().map(|mut t| {
            t.reset();
            t
        });
        registry.entries = next;
        debug!(?mode, %pattern, routes = registry.entries.len(), "route table published");
        Ok(())
    }
}

fn fill(table: &mut Table, entries: &[Arc<RouteEntry>]) -> Result<(), RouteError> {
    for entry in entries {
        table
            .insert(entry.method, &entry.pattern, Arc::clone(entry))
            .map_err(|source| RouteError::Conflict {
                method: entry.method,
                path: entry.pattern.clone(),
                source,
            })?;
    }
    Ok(())
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes())
            .field("listening", &self.is_listening())
            .finish()
    }
}

/// Route registration against a listening server. Re-declaring an existing
/// method and path replaces its handler and options.
#[derive(Clone, Copy)]
pub struct Runtime<'a> {
    router: &'a Router,
}

impl Runtime<'_> {
    pub fn route(&self, method: Method, path: &str, handler: impl Handler) -> Result<Self, RouteError> {
        self.route_with(method, path, RouteOptions::default(), handler)
    }

    pub fn route_with(
        &self,
        method: Method,
        path: &str,
        options: RouteOptions,
        handler: impl Handler,
    ) -> Result<Self, RouteError> {
        self.declare(&[method], path, options, handler)
    }

    pub fn declare(
        &self,
        methods: &[Method],
        path: &str,
        options: RouteOptions,
        handler: impl Handler,
    ) -> Result<Self, RouteError> {
        self.router
            .register(Mode::Runtime, methods, path, options, handler.into_boxed_handler())?;
        Ok(*self)
    }

    verb_methods!(Self);
}

fn validate(method: Method, path: &str, options: &RouteOptions) -> Result<(), RouteError> {
    if !path.starts_with('/') {
        return Err(RouteError::MissingLeadingSlash { method, path: path.to_owned() });
    }
    if path.contains("//") {
        return Err(RouteError::EmptySegment { method, path: path.to_owned() });
    }
    if options.timeout.is_some_and(|t| t.is_zero()) {
        return Err(RouteError::ZeroTimeout { method, path: path.to_owned() });
    }
    Ok(())
}

/// Percent-decodes a parameter and redacts traversal attempts.
fn sanitize(name: &str, raw: &str) -> String {
    let decoded = percent_decode_str(raw).decode_utf8_lossy();
    let traversal = decoded.contains('\0')
        || decoded.contains("../")
        || decoded.contains("..\\")
        || decoded.split(['/', '\\']).any(|segment| segment == "..");
    if traversal {
        warn!(param = name, "path traversal sequence in route parameter, value redacted");
        return REDACTED.to_owned();
    }
    decoded.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Flow;

    async fn noop(_: Flow) {}

    fn hit(router: &Router, method: Method, path: &str) -> Option<HashMap<String, String>> {
        router.lookup(method, path).map(|(_, params)| params)
    }

    #[test]
    fn trailing_slash_is_ignored() {
        let router = Router::new();
        router.get("/a/", noop).unwrap();
        assert_eq!(router.routes(), vec!["GET?/a"]);
        assert!(hit(&router, Method::Get, "/a").is_some());
        assert!(hit(&router, Method::Get, "/a/").is_some());
    }

    #[test]
    fn colon_params_are_accepted() {
        let router = Router::new();
        router.get("/users/:id/posts/{post}", noop).unwrap();
        let params = hit(&router, Method::Get, "/users/7/posts/hello%20world").unwrap();
        assert_eq!(params["id"], "7");
        assert_eq!(params["post"], "hello world");
    }

    #[test]
    fn invalid_declarations_register_nothing() {
        let router = Router::new();
        assert!(matches!(router.get("users", noop), Err(RouteError::MissingLeadingSlash { .. })));
        assert!(matches!(router.get("/a//b", noop), Err(RouteError::EmptySegment { .. })));
        assert!(matches!(
            router.get_with("/slow", RouteOptions::timeout(Duration::ZERO), noop),
            Err(RouteError::ZeroTimeout { .. })
        ));
        assert!(matches!(
            router.declare(&[], "/x", RouteOptions::default(), noop),
            Err(RouteError::NoMethods { .. })
        ));
        assert!(router.routes().is_empty());
    }

    #[test]
    fn static_duplicate_conflicts_atomically() {
        let router = Router::new();
        router.get("/a", noop).unwrap();
        let err = router.declare(&[Method::Post, Method::Get], "/a", RouteOptions::default(), noop);
        assert!(matches!(err, Err(RouteError::Conflict { method: Method::Get, .. })));
        // The POST half of the declaration was not kept either.
        assert_eq!(router.routes(), vec!["GET?/a"]);
        assert!(hit(&router, Method::Post, "/a").is_none());

        // The rejected table is recycled for the next declaration.
        router.post("/a", noop).unwrap();
        assert!(hit(&router, Method::Get, "/a").is_some());
        assert!(hit(&router, Method::Post, "/a").is_some());
    }

    #[test]
    fn held_tables_survive_republication() {
        let router = Router::new();
        router.get("/old", noop).unwrap();
        let held = router.inner.live.load_full();

        router.get("/new", noop).unwrap();
        router.get("/newer", noop).unwrap();

        assert!(held.at(Method::Get, "/old").is_some());
        assert!(held.at(Method::Get, "/new").is_none());
        assert!(hit(&router, Method::Get, "/old").is_some());
        assert!(hit(&router, Method::Get, "/newer").is_some());
    }

    #[test]
    fn declare_dedups_methods() {
        let router = Router::new();
        router
            .declare(&[Method::Get, Method::Head, Method::Get], "/h", RouteOptions::default(), noop)
            .unwrap();
        assert_eq!(router.routes(), vec!["GET?/h", "HEAD?/h"]);
    }

    #[test]
    fn runtime_needs_listening_server() {
        let router = Router::new();
        assert!(matches!(router.runtime().get("/late", noop), Err(RouteError::NotListening { .. })));

        router.set_listening(true);
        router.get("/a", noop).unwrap();
        router.runtime().get("/late", noop).unwrap();
        router.runtime().get_with("/a", RouteOptions::no_cache(), noop).unwrap();

        assert_eq!(router.routes(), vec!["GET?/a", "GET?/late"]);

        let chained = router.runtime().put("/doc", noop).and_then(|rt| rt.patch("/doc", noop));
        assert!(chained.is_ok());
        assert!(hit(&router, Method::Patch, "/doc").is_some());
        let (entry, _) = router.lookup(Method::Get, "/a").unwrap();
        assert!(entry.options.disable_cache);
        assert!(hit(&router, Method::Get, "/late").is_some());
    }

    #[test]
    fn traversal_params_are_redacted() {
        let router = Router::new();
        router.get("/files/{name}", noop).unwrap();
        router.get("/raw/{*rest}", noop).unwrap();

        assert_eq!(hit(&router, Method::Get, "/files/..%2Fetc").unwrap()["name"], REDACTED);
        assert_eq!(hit(&router, Method::Get, "/files/a%00b").unwrap()["name"], REDACTED);
        assert_eq!(hit(&router, Method::Get, "/raw/x/../y").unwrap()["rest"], REDACTED);
        assert_eq!(hit(&router, Method::Get, "/files/v1..2").unwrap()["name"], "v1..2");
    }

    #[test]
    fn route_options_parse_from_config() {
        let opts: RouteOptions = serde_json::from_str(r#"{"timeout":200,"disable_cache":true}"#).unwrap();
        assert_eq!(opts.timeout, Some(Duration::from_millis(200)));
        assert!(opts.disable_cache);
    }
}
