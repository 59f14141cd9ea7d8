//! HTTP server, request lifecycle and graceful shutdown.
//!
//! # Lifecycle of one request
//!
//! ```text
//! Accepted → Preprocessing → Middleware ─┬─────────────────────────────▶ Sent
//!                                        └▶ Routing → Handler ──────────▶ Sent
//! ```
//!
//! Preprocessing and middleware always run first. If any step finalizes the
//! flow, routing and the handler are skipped. Otherwise the live route table
//! is consulted: no match answers `404`, a match applies the route's options
//! (cache policy, timeout) and runs the handler. The handler's value is sent;
//! its error goes to the error dispatcher.
//!
//! Each lifecycle runs on its own task. The connection only waits for the
//! flow's response, so a per-route timeout can answer `503` while the
//! handler is still busy. A panic anywhere in the lifecycle loses that one
//! request, which is answered `500`, and nothing else.
//!
//! # Graceful shutdown
//!
//! On SIGTERM / Ctrl-C ([`Server::serve`]) or [`ServerHandle::shutdown`]:
//!
//! 1. Stop accepting connections. Runtime route registration is refused from here on.
//! 2. Close the upgrade subsystem, if one is attached.
//! 3. Close the listener.
//! 4. Let in-flight requests finish, close idle keep-alive connections, and
//!    wait for every connection task.
//!
//! Under Kubernetes, set `terminationGracePeriodSeconds` longer than your
//! slowest request.

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, trace};

use crate::config::ServerConfig;
use crate::context::{self, Propagator};
use crate::dispatch::{Dispatcher, ErrorHandler, default_error_handler};
use crate::error::{BoxError, Error};
use crate::flow::{Flow, FlowOptions, Stage};
use crate::middleware::{BoxedMiddleware, Middleware, Pipeline, ReverseResolve};
use crate::reply::{Reply, ReplyBody};
use crate::router::Router;
use crate::upgrade::UpgradeSubsystem;

/// Body of the `404` sent when no route matches.
pub const NOT_FOUND_BODY: &str = "Not Found";

/// The HTTP server builder.
///
/// ```rust,no_run
/// use bareflow::{Flow, Server, ServerConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), bareflow::Error> {
///     let server = Server::new(ServerConfig::default());
///     server.router().get("/hello/:name", |flow: Flow| async move {
///         format!("hello {}", flow.param("name").unwrap_or_default())
///     })?;
///     server.serve().await
/// }
/// ```
pub struct Server {
    config: ServerConfig,
    router: Router,
    middlewares: Vec<BoxedMiddleware>,
    error_handler: ErrorHandler,
    upgrade: Option<Arc<dyn UpgradeSubsystem>>,
    resolver: Option<Arc<dyn ReverseResolve>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            router: Router::new(),
            middlewares: Vec::new(),
            error_handler: Arc::new(default_error_handler),
            upgrade: None,
            resolver: None,
        }
    }

    /// Replaces the route table, e.g. with one built on a custom matcher.
    pub fn with_router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    /// The route table. Register routes here before starting; use
    /// [`Router::runtime`] on the handle's router afterwards.
    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Appends a middleware. Runs after the built-in preprocessing steps, in
    /// registration order.
    pub fn middleware(mut self, middleware: impl Middleware) -> Self {
        self.middlewares.push(middleware.into_boxed_middleware());
        self
    }

    pub fn middleware_count(&self) -> usize {
        self.middlewares.len()
    }

    /// Replaces the error dispatcher's handler.
    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(BoxError, Flow, Option<u16>) + Send + Sync + 'static,
    {
        self.error_handler = Arc::new(handler);
        self
    }

    pub fn upgrade(mut self, subsystem: impl UpgradeSubsystem) -> Self {
        self.upgrade = Some(Arc::new(subsystem));
        self
    }

    /// Resolver used when `reverse_dns` is enabled.
    pub fn reverse_resolver(mut self, resolver: impl ReverseResolve) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Binds the listener and starts serving in the background.
    pub async fn start(self) -> Result<ServerHandle, Error> {
        let listener = TcpListener::bind(self.config.bind_address()).await?;
        let local_addr = listener.local_addr()?;

        let pipeline = Pipeline::compile(
            &self.config,
            &self.middlewares,
            self.resolver,
            Dispatcher::new(self.error_handler),
        );
        let app = Arc::new(App {
            router: self.router.clone(),
            pipeline,
            propagator: Propagator::new(self.config.enable_context),
            flow_options: FlowOptions {
                time_format: self.config.time_format,
                logging: self.config.logging,
            },
        });

        if let Some(upgrade) = &self.upgrade {
            upgrade.start_listening().await.map_err(Error::Upgrade)?;
        }
        self.router.set_listening(true);
        info!(
            addr = %local_addr,
            routes = self.router.routes().len(),
            steps = app.pipeline.len(),
            context = self.config.enable_context,
            "bareflow listening"
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, app, shutdown_rx, self.upgrade));
        Ok(ServerHandle { local_addr, router: self.router, shutdown: Some(shutdown_tx), task })
    }

    /// Serves until SIGTERM or Ctrl-C, then shuts down gracefully.
    pub async fn serve(self) -> Result<(), Error> {
        self.start().await?.run_until(shutdown_signal()).await
    }
}

/// A running server. Dropping the handle shuts the server down.
pub struct ServerHandle {
    local_addr: SocketAddr,
    router: Router,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), Error>>,
}

impl ServerHandle {
    /// The bound address, with the OS-assigned port when `port` was `0`.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The live route table.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Shuts down gracefully and waits until fully closed.
    pub async fn shutdown(mut self) -> Result<(), Error> {
        if let Some(tx) = self.shutdown.take() {
            // The loop may already be gone after a fatal accept error.
            let _ = tx.send(());
        }
        join_outcome((&mut self.task).await)
    }

    /// Serves until `signal` resolves, then shuts down gracefully.
    pub async fn run_until(mut self, signal: impl Future<Output = ()>) -> Result<(), Error> {
        tokio::select! {
            () = signal => {}
            joined = &mut self.task => return join_outcome(joined),
        }
        self.shutdown().await
    }
}

fn join_outcome(joined: Result<Result<(), Error>, tokio::task::JoinError>) -> Result<(), Error> {
    joined.map_err(|e| Error::Io(io::Error::other(e)))?
}

// ── Accept loop ───────────────────────────────────────────────────────────────

async fn accept_loop(
    listener: TcpListener,
    app: Arc<App>,
    mut shutdown: oneshot::Receiver<()>,
    upgrade: Option<Arc<dyn UpgradeSubsystem>>,
) -> Result<(), Error> {
    let builder = ConnBuilder::new(TokioExecutor::new());
    let graceful = GracefulShutdown::new();
    let mut tasks = JoinSet::new();

    let outcome = loop {
        tokio::select! {
            // Shutdown first, so a pending signal stops accepting even if
            // more connections are queued.
            biased;

            _ = &mut shutdown => {
                info!(in_flight = tasks.len(), "shutdown requested, draining connections");
                break Ok(());
            }

            res = listener.accept() => {
                let (stream, remote_addr) = match res {
                    Ok(v) => v,
                    Err(e) if is_transient(&e) => {
                        debug!(error = %e, "transient accept error");
                        continue;
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed, shutting down");
                        break Err(Error::Io(e));
                    }
                };

                let app = Arc::clone(&app);
                let svc = service_fn(move |req| {
                    let app = Arc::clone(&app);
                    async move { Ok::<_, Infallible>(app.respond(req, remote_addr.ip()).await) }
                });
                let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), svc);
                let conn = graceful.watch(conn.into_owned());
                tasks.spawn(async move {
                    if let Err(e) = conn.await {
                        debug!(peer = %remote_addr, error = %e, "connection closed with error");
                    }
                });
            }

            // Reap finished connection tasks so the set doesn't grow unbounded.
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    };

    app.router.set_listening(false);
    if let Some(upgrade) = upgrade {
        upgrade.close().await;
    }
    drop(listener);
    graceful.shutdown().await;
    while tasks.join_next().await.is_some() {}

    info!("bareflow stopped");
    outcome
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

// ── Request lifecycle ─────────────────────────────────────────────────────────

/// Everything a request needs, frozen at start.
struct App {
    router: Router,
    pipeline: Pipeline,
    propagator: Propagator,
    flow_options: FlowOptions,
}

impl App {
    /// Runs the lifecycle on its own task and answers with whatever the flow
    /// sends first.
    async fn respond(self: Arc<Self>, req: hyper::Request<Incoming>, remote: IpAddr) -> http::Response<ReplyBody> {
        let (flow, mut outlet) = Flow::new(req, Some(remote), self.flow_options);
        let id = flow.id();
        // hyper drops this future when the client disconnects; the lifecycle
        // task lives on, so its timer must not answer a gone peer.
        let _disarm = DisarmOnDrop(flow.clone());

        let app = Arc::clone(&self);
        let mut task = tokio::spawn(
            self.propagator.scope("request", async move { app.lifecycle(flow).await }),
        );

        tokio::select! {
            biased;

            sent = &mut outlet => {
                if let Ok(response) = sent {
                    return response;
                }
            }

            joined = &mut task => {
                if let Ok(response) = outlet.try_recv() {
                    return response;
                }
                if let Err(e) = joined {
                    error!(request_id = %id, error = %e, "request task failed");
                }
            }
        }
        error!(request_id = %id, "request ended without a response, sending 500");
        internal_error(&id)
    }

    async fn lifecycle(&self, flow: Flow) {
        if let Some(execution) = context::current() {
            execution.set("id", flow.id());
        }

        flow.set_stage(Stage::Preprocessing);
        self.pipeline.run(&flow).await;
        if flow.is_sent() {
            return;
        }

        flow.set_stage(Stage::Routing);
        let path = flow.path();
        let Some((route, params)) = flow.method().and_then(|m| self.router.lookup(m, &path)) else {
            trace!(request_id = %flow.id(), %path, "no route");
            flow.status(404).send(NOT_FOUND_BODY);
            return;
        };

        flow.set_params(params);
        let options = &route.options;
        if options.disable_cache {
            flow.disable_cache();
        }
        if let Some(cache) = &options.cache {
            flow.set_cache(cache);
        }
        if let Some(timeout) = options.timeout {
            flow.attach_timeout(timeout);
        }

        flow.set_stage(Stage::Handler);
        match route.handler.call(flow.clone()).await {
            // A handler that sent on its own usually returns `()`; that's not a second send.
            Ok(Reply::Empty) if flow.is_sent() => {}
            Ok(reply) => flow.send(reply),
            Err(e) => self.pipeline.dispatcher().dispatch(e, flow, None),
        }
    }
}

struct DisarmOnDrop(Flow);

impl Drop for DisarmOnDrop {
    fn drop(&mut self) {
        self.0.disarm_timer();
    }
}

fn internal_error(id: &str) -> http::Response<ReplyBody> {
    let mut response = http::Response::new(crate::reply::Payload::None.into_body());
    *response.status_mut() = http::StatusCode::INTERNAL_SERVER_ERROR;
    if let Ok(value) = http::HeaderValue::from_str(id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on SIGTERM or Ctrl-C. A signal that can't be installed is logged
/// and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Ctrl-C received"),
        () = sigterm => info!("SIGTERM received"),
    }
}
