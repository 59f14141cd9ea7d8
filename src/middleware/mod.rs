//! Middleware pipeline.
//!
//! Every request runs one compiled list of [`Step`]s before routing. The
//! built-in preprocessing steps come first, in a fixed order, followed by
//! user middleware in registration order:
//!
//! ```text
//! Cors → ReadBody → Cookies → ReverseDns → user[0] → user[1] → …
//! ```
//!
//! Steps run strictly one after another: a step is awaited to completion
//! before the next begins. Before each step the executor checks whether the
//! flow has been sent; the first step that finalizes the response (a CORS
//! pre-flight, an auth check answering `401`, a failing step whose error was
//! dispatched) ends the pipeline and skips routing.
//!
//! The list is compiled once when the server starts. Middleware added to a
//! [`Server`](crate::Server) afterwards is not picked up.

pub mod cookies;
pub mod cors;

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::error::BoxError;
use crate::flow::{Flow, Stage};
use crate::handler::BoxFuture;

use cookies::CookieOptions;
use cors::Cors;

// ── Middleware erasure ───────────────────────────────────────────────────────

/// What a middleware may return: `()` or `Result<(), E>`.
pub trait MiddlewareOutcome: Send + 'static {
    fn into_outcome(self) -> Result<(), BoxError>;
}

impl MiddlewareOutcome for () {
    fn into_outcome(self) -> Result<(), BoxError> {
        Ok(())
    }
}

impl<E: Into<BoxError> + Send + 'static> MiddlewareOutcome for Result<(), E> {
    fn into_outcome(self) -> Result<(), BoxError> {
        self.map_err(Into::into)
    }
}

#[doc(hidden)]
pub trait ErasedMiddleware {
    fn call(&self, flow: Flow) -> BoxFuture<Result<(), BoxError>>;
}

#[doc(hidden)]
pub type BoxedMiddleware = Arc<dyn ErasedMiddleware + Send + Sync + 'static>;

/// Implemented for every valid middleware:
///
/// ```text
/// async fn name(flow: Flow)                        // infallible
/// async fn name(flow: Flow) -> Result<(), E>       // E: Into<BoxError>
/// ```
///
/// A middleware that wants to answer the request itself calls `flow.send(..)`.
pub trait Middleware: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_middleware(self) -> BoxedMiddleware;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut> private::Sealed for F
where
    F: Fn(Flow) -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: MiddlewareOutcome,
{
}

impl<F, Fut> Middleware for F
where
    F: Fn(Flow) -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: MiddlewareOutcome,
{
    fn into_boxed_middleware(self) -> BoxedMiddleware {
        Arc::new(FnMiddleware(self))
    }
}

struct FnMiddleware<F>(F);

impl<F, Fut> ErasedMiddleware for FnMiddleware<F>
where
    F: Fn(Flow) -> Fut + Send + Sync,
    Fut: Future + Send + 'static,
    Fut::Output: MiddlewareOutcome,
{
    fn call(&self, flow: Flow) -> BoxFuture<Result<(), BoxError>> {
        let fut = (self.0)(flow);
        Box::pin(async move { fut.await.into_outcome() })
    }
}

// ── Reverse DNS seam ─────────────────────────────────────────────────────────

/// Resolves a peer address to host names. The first name becomes the flow's
/// [`remote_client`](Flow::remote_client).
pub trait ReverseResolve: Send + Sync + 'static {
    fn reverse(&self, ip: IpAddr) -> BoxFuture<Result<Vec<String>, BoxError>>;
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

/// One compiled pipeline step.
pub(crate) enum Step {
    Cors(Cors),
    ReadBody,
    Cookies(CookieOptions),
    ReverseDns(Arc<dyn ReverseResolve>),
    User(BoxedMiddleware),
}

impl Step {
    fn name(&self) -> &'static str {
        match self {
            Self::Cors(_) => "cors",
            Self::ReadBody => "read_body",
            Self::Cookies(_) => "cookies",
            Self::ReverseDns(_) => "reverse_dns",
            Self::User(_) => "middleware",
        }
    }
}

/// The frozen step list plus the dispatcher errors are routed to.
#[derive(Clone)]
pub(crate) struct Pipeline {
    steps: Arc<[Step]>,
    /// Index of the first user middleware, `steps.len()` when there is none.
    first_user: usize,
    dispatcher: Dispatcher,
}

impl Pipeline {
    /// Builds the step list: preprocessing enabled by `config`, then `user`.
    pub(crate) fn compile(
        config: &ServerConfig,
        user: &[BoxedMiddleware],
        resolver: Option<Arc<dyn ReverseResolve>>,
        dispatcher: Dispatcher,
    ) -> Self {
        let mut steps = Vec::with_capacity(user.len() + 4);
        if let Some(cors) = &config.cors {
            steps.push(Step::Cors(Cors::new(cors.clone())));
        }
        if config.parse_body {
            steps.push(Step::ReadBody);
        }
        if config.cookies {
            steps.push(Step::Cookies(config.cookies_options.clone()));
        }
        if config.reverse_dns {
            match resolver {
                Some(resolver) => steps.push(Step::ReverseDns(resolver)),
                None => warn!("reverse_dns is enabled but no resolver is attached, skipping"),
            }
        }
        let first_user = steps.len();
        steps.extend(user.iter().cloned().map(Step::User));
        debug!(steps = steps.len(), user = user.len(), "middleware pipeline compiled");
        Self { steps: steps.into(), first_user, dispatcher }
    }

    pub(crate) fn len(&self) -> usize {
        self.steps.len()
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Runs every step in order until one finalizes the flow.
    pub(crate) async fn run(&self, flow: &Flow) {
        for i in 0..self.steps.len() {
            if flow.is_sent() {
                trace!(request_id = %flow.id(), step = i, "flow sent, pipeline stopped");
                return;
            }
            if i == self.first_user {
                flow.set_stage(Stage::Middleware);
            }
            self.resolve_middleware(flow, i).await;
        }
        if self.first_user == self.steps.len() {
            flow.set_stage(Stage::Middleware);
        }
    }

    /// Invokes step `i`, awaits it, and dispatches its error if it failed.
    pub(crate) async fn resolve_middleware(&self, flow: &Flow, i: usize) {
        let Some(step) = self.steps.get(i) else { return };
        trace!(request_id = %flow.id(), step = i, kind = step.name(), "running step");

        let outcome = match step {
            Step::Cors(cors) => {
                cors.apply(flow);
                Ok(())
            }
            Step::ReadBody => match flow.read_body().await {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.dispatcher.dispatch(Box::new(e), flow.clone(), Some(400));
                    return;
                }
            },
            Step::Cookies(options) => {
                flow.attach_cookie_jar(options.clone());
                Ok(())
            }
            Step::ReverseDns(resolver) => {
                resolve_remote(resolver.as_ref(), flow).await;
                Ok(())
            }
            Step::User(middleware) => middleware.call(flow.clone()).await,
        };

        if let Err(e) = outcome {
            self.dispatcher.dispatch(e, flow.clone(), None);
        }
    }
}

async fn resolve_remote(resolver: &dyn ReverseResolve, flow: &Flow) {
    let Some(ip) = flow.remote_ip() else { return };
    match resolver.reverse(ip).await {
        Ok(names) => {
            if let Some(name) = names.into_iter().next() {
                flow.set_remote_client(name);
            }
        }
        Err(e) => debug!(%ip, error = %e, "reverse lookup failed"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::flow::testing::{body_text, flow};

    fn counting(counter: &Arc<AtomicUsize>) -> BoxedMiddleware {
        let counter = Arc::clone(counter);
        (move |_flow: Flow| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .into_boxed_middleware()
    }

    fn bare_config() -> ServerConfig {
        ServerConfig { parse_body: false, ..ServerConfig::default() }
    }

    #[tokio::test]
    async fn stops_after_step_that_sends() {
        let calls = Arc::new(AtomicUsize::new(0));
        let deny = (|flow: Flow| async move { flow.status(401).send("denied") }).into_boxed_middleware();
        let user = [counting(&calls), deny, counting(&calls)];
        let pipeline = Pipeline::compile(&bare_config(), &user, None, Dispatcher::default());

        let (f, rx) = flow("GET", "/", &[], b"");
        pipeline.run(&f).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let response = rx.await.unwrap();
        assert_eq!(response.status(), 401);
        assert_eq!(body_text(response).await, "denied");
    }

    #[tokio::test]
    async fn failing_step_is_dispatched() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fail = (|_flow: Flow| async move { Err::<(), _>(std::io::Error::other("nope")) })
            .into_boxed_middleware();
        let user = [fail, counting(&calls)];
        let pipeline = Pipeline::compile(&bare_config(), &user, None, Dispatcher::default());

        let (f, rx) = flow("GET", "/", &[], b"");
        pipeline.run(&f).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let response = rx.await.unwrap();
        assert_eq!(response.status(), 500);
        assert!(body_text(response).await.contains("nope"));
    }

    #[tokio::test]
    async fn bad_json_body_is_a_400() {
        let pipeline = Pipeline::compile(&ServerConfig::default(), &[], None, Dispatcher::default());
        let (f, rx) = flow("POST", "/", &[("content-type", "application/json")], b"{oops");
        pipeline.run(&f).await;
        assert_eq!(rx.await.unwrap().status(), 400);
    }

    #[tokio::test]
    async fn preprocessing_runs_before_user_steps() {
        let config = ServerConfig { cookies: true, ..ServerConfig::default() };
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let observer = {
            let seen = Arc::clone(&seen);
            (move |flow: Flow| {
                let seen = Arc::clone(&seen);
                async move {
                    *seen.lock() = Some((flow.cookie("sid"), flow.body().as_text().map(str::to_owned)));
                }
            })
            .into_boxed_middleware()
        };
        let pipeline = Pipeline::compile(&config, &[observer], None, Dispatcher::default());
        assert_eq!(pipeline.len(), 3);
        assert_eq!(pipeline.first_user, 2);

        let (f, _rx) = flow("POST", "/", &[("cookie", "sid=9"), ("content-type", "text/plain")], b"hi");
        pipeline.run(&f).await;
        assert_eq!(*seen.lock(), Some((Some("9".to_owned()), Some("hi".to_owned()))));
        assert_eq!(f.stage(), Stage::Middleware);
    }

    #[tokio::test]
    async fn reverse_dns_sets_remote_client() {
        struct Fixed;
        impl ReverseResolve for Fixed {
            fn reverse(&self, _ip: IpAddr) -> BoxFuture<Result<Vec<String>, BoxError>> {
                Box::pin(async { Ok(vec!["localhost".to_owned(), "alias".to_owned()]) })
            }
        }

        let config = ServerConfig { reverse_dns: true, ..bare_config() };
        let pipeline = Pipeline::compile(&config, &[], Some(Arc::new(Fixed)), Dispatcher::default());
        assert_eq!(pipeline.first_user, pipeline.len());
        let (f, _rx) = flow("GET", "/", &[], b"");
        pipeline.run(&f).await;
        assert_eq!(f.remote_client().as_deref(), Some("localhost"));
        assert_eq!(f.stage(), Stage::Middleware);
    }
}
