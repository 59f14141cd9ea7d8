//! The per-request unit of work.
//!
//! A [`Flow`] bundles everything known about one inbound request with the
//! builder of its one outbound response. It is a cheap handle: clones share
//! the same state, so a handler can pass it into helpers or background work
//! without lifetimes getting in the way.
//!
//! # Exactly one response
//!
//! The first call that finalizes ([`send`](Flow::send) and friends) claims
//! the response. Every later attempt is a logged no-op, whether it comes
//! from the handler, the error dispatcher, or a per-route timer that lost the
//! race. A finalize aimed at a peer that already hung up is logged and
//! absorbed too; nothing in this module returns an error for transport
//! problems.
//!
//! ```text
//!             ┌──────────── handler / middleware / dispatcher ───────────┐
//! request ──▶ Flow ── status / headers / cache / cookies ──▶ send ──▶ oneshot ──▶ hyper
//!             └──────────── per-route timer (503 on overtime) ───────────┘
//! ```

mod body;
mod cache;
mod headers;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, SET_COOKIE};
use http_body_util::BodyExt;
use http_body_util::combinators::UnsyncBoxBody;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};
use url::form_urlencoded;

use crate::config::TimeFormat;
use crate::error::{BodyParseError, BoxError};
use crate::method::Method;
use crate::middleware::cookies::{CookieJar, CookieOptions, Unsigned, parse_cookie_header};
use crate::reply::{Payload, Reply, ReplyBody};

pub use body::RequestBody;
pub use cache::{
    CacheOptions, Cacheability, DEFAULT_EXPIRATION_SECONDS, ExpirationKind, Revalidation,
};

use headers::HeaderBag;

/// Body sent when a per-route timeout fires.
pub const TIMEOUT_BODY: &str = "Server aborted connection by overtime";

pub(crate) type InboundBody = UnsyncBoxBody<Bytes, BoxError>;
pub(crate) type Outlet = oneshot::Receiver<http::Response<ReplyBody>>;

/// Where a flow is in the request lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    Accepted,
    Preprocessing,
    Middleware,
    Routing,
    Handler,
    /// Terminal.
    Sent,
}

/// Why a finalize attempt was dropped.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum SendRejection {
    AlreadySent,
    PeerGone,
}

/// Per-server settings every flow needs at finalize time.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct FlowOptions {
    pub(crate) time_format: Option<TimeFormat>,
    pub(crate) logging: bool,
}

/// One request and its response builder. See the [module docs](self).
#[derive(Clone)]
pub struct Flow {
    inner: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    started: Instant,
    options: FlowOptions,
}

struct State {
    id: String,
    method: http::Method,
    path: String,
    params: HashMap<String, String>,
    query: HashMap<String, String>,
    request_headers: http::HeaderMap,
    pending_body: Option<InboundBody>,
    body: RequestBody,
    remote_ip: Option<IpAddr>,
    remote_client: Option<String>,
    cookies: HashMap<String, String>,
    jar: Option<CookieJar>,

    status: u16,
    headers: HeaderBag,
    cache: bool,
    sent: bool,
    stage: Stage,
    outlet: Option<oneshot::Sender<http::Response<ReplyBody>>>,
    timer: Option<AbortHandle>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.abort();
        }
    }
}

impl Flow {
    /// Wraps an inbound request. The returned outlet yields the response once
    /// the flow is finalized.
    pub(crate) fn new<B>(
        request: http::Request<B>,
        remote_ip: Option<IpAddr>,
        options: FlowOptions,
    ) -> (Self, Outlet)
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = request.into_parts();
        let id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_owned);
        let query = parts
            .uri
            .query()
            .map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();

        let mut headers = HeaderBag::default();
        headers.add("Content-Type", "text/plain; charset=utf-8");
        headers.add("X-Request-Id", id.clone());

        let (tx, rx) = oneshot::channel();
        let state = State {
            id,
            method: parts.method,
            path: parts.uri.path().to_owned(),
            params: HashMap::new(),
            query,
            request_headers: parts.headers,
            pending_body: Some(body.map_err(Into::into).boxed_unsync()),
            body: RequestBody::Absent,
            remote_ip,
            remote_client: None,
            cookies: HashMap::new(),
            jar: None,
            status: 200,
            headers,
            cache: true,
            sent: false,
            stage: Stage::Accepted,
            outlet: Some(tx),
            timer: None,
        };
        let inner = Arc::new(Shared { state: Mutex::new(state), started: Instant::now(), options });
        (Self { inner }, rx)
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    /// Request identity: the inbound `X-Request-Id`, or a generated UUID.
    pub fn id(&self) -> String {
        self.inner.state.lock().id.clone()
    }

    /// The routable method, `None` for verbs no route can match.
    pub fn method(&self) -> Option<Method> {
        Method::from_http(&self.inner.state.lock().method)
    }

    /// The method exactly as received, including verbs outside [`Method`].
    pub fn raw_method(&self) -> http::Method {
        self.inner.state.lock().method.clone()
    }

    pub fn path(&self) -> String {
        self.inner.state.lock().path.clone()
    }

    /// Named path parameter. For `/users/{id}`, `param("id")` on `/users/42` is `"42"`.
    pub fn param(&self, name: &str) -> Option<String> {
        self.inner.state.lock().params.get(name).cloned()
    }

    pub fn params(&self) -> HashMap<String, String> {
        self.inner.state.lock().params.clone()
    }

    pub fn query(&self, name: &str) -> Option<String> {
        self.inner.state.lock().query.get(name).cloned()
    }

    pub fn queries(&self) -> HashMap<String, String> {
        self.inner.state.lock().query.clone()
    }

    /// Case-insensitive request header lookup; repeated headers are joined with `", "`.
    pub fn request_header(&self, name: &str) -> Option<String> {
        let state = self.inner.state.lock();
        let mut values = state.request_headers.get_all(name).iter().filter_map(|v| v.to_str().ok());
        let first = values.next()?.to_owned();
        Some(values.fold(first, |mut acc, v| {
            acc.push_str(", ");
            acc.push_str(v);
            acc
        }))
    }

    /// All request headers, multi-valued ones joined with `", "`.
    pub fn request_headers(&self) -> HashMap<String, String> {
        let state = self.inner.state.lock();
        let mut out: HashMap<String, String> = HashMap::new();
        for (name, value) in &state.request_headers {
            let Ok(value) = value.to_str() else { continue };
            out.entry(name.as_str().to_owned())
                .and_modify(|v| {
                    v.push_str(", ");
                    v.push_str(value);
                })
                .or_insert_with(|| value.to_owned());
        }
        out
    }

    /// The classified request body. [`RequestBody::Absent`] until preprocessing has read it.
    pub fn body(&self) -> RequestBody {
        self.inner.state.lock().body.clone()
    }

    pub fn remote_ip(&self) -> Option<IpAddr> {
        self.inner.state.lock().remote_ip
    }

    /// Host name of the peer, when reverse DNS is enabled and resolved.
    pub fn remote_client(&self) -> Option<String> {
        self.inner.state.lock().remote_client.clone()
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        self.inner.state.lock().cookies.get(name).cloned()
    }

    pub fn cookies(&self) -> HashMap<String, String> {
        self.inner.state.lock().cookies.clone()
    }

    pub fn stage(&self) -> Stage {
        self.inner.state.lock().stage
    }

    pub fn is_sent(&self) -> bool {
        self.inner.state.lock().sent
    }

    /// Time since the request was accepted.
    pub fn elapsed(&self) -> Duration {
        self.inner.started.elapsed()
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    /// Sets the response status. Chainable: `flow.status(201).send("created")`.
    pub fn status(&self, code: u16) -> &Self {
        self.edit("status", |state| state.status = code)
    }

    pub fn status_code(&self) -> u16 {
        self.inner.state.lock().status
    }

    /// Overwrites a response header.
    pub fn set_header(&self, name: &str, value: impl ToString) -> &Self {
        let value = value.to_string();
        self.edit("set_header", |state| state.headers.set(name, value))
    }

    /// Appends to a response header with `", "`.
    pub fn add_header(&self, name: &str, value: impl ToString) -> &Self {
        let value = value.to_string();
        self.edit("add_header", |state| state.headers.add(name, value))
    }

    pub fn set_headers<'a, I, V>(&self, headers: I) -> &Self
    where
        I: IntoIterator<Item = (&'a str, V)>,
        V: ToString,
    {
        self.edit("set_headers", |state| {
            for (name, value) in headers {
                state.headers.set(name, value.to_string());
            }
        })
    }

    pub fn add_headers<'a, I, V>(&self, headers: I) -> &Self
    where
        I: IntoIterator<Item = (&'a str, V)>,
        V: ToString,
    {
        self.edit("add_headers", |state| {
            for (name, value) in headers {
                state.headers.add(name, value.to_string());
            }
        })
    }

    /// Current value of a response header.
    pub fn header(&self, name: &str) -> Option<String> {
        self.inner.state.lock().headers.get(name).map(str::to_owned)
    }

    pub fn remove_header(&self, name: &str) -> &Self {
        self.edit("remove_header", |state| {
            state.headers.remove(name);
        })
    }

    /// Sets `Cache-Control` from a cache policy.
    pub fn set_cache(&self, opts: &CacheOptions) -> &Self {
        if let Some(directive) = opts.directive() {
            self.set_header("Cache-Control", directive);
        }
        self
    }

    /// Forces `no-store` at finalize, overriding any `Cache-Control` set before or after.
    pub fn disable_cache(&self) -> &Self {
        self.edit("disable_cache", |state| state.cache = false)
    }

    /// Arms the overtime timer: if the response isn't finalized within
    /// `timeout`, it is finalized as `503` with [`TIMEOUT_BODY`]. Re-arming
    /// replaces the previous timer. Nothing is armed once the response is
    /// sent or the client is gone.
    pub fn attach_timeout(&self, timeout: Duration) {
        if self.is_sent() || self.peer_gone() {
            debug!(request_id = %self.id(), ?timeout, "timeout not armed, flow is finished");
            return;
        }
        let weak: Weak<Shared> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                let flow = Flow { inner };
                if flow.peer_gone() {
                    debug!(request_id = %flow.id(), ?timeout, "route timeout elapsed after the client left");
                    return;
                }
                debug!(request_id = %flow.id(), ?timeout, "route timeout elapsed");
                flow.finalize(Some(503), Reply::Text(TIMEOUT_BODY.to_owned()));
            }
        });
        let previous = self.inner.state.lock().timer.replace(task.abort_handle());
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Cancels a pending overtime timer.
    pub(crate) fn disarm_timer(&self) {
        if let Some(timer) = self.inner.state.lock().timer.take() {
            timer.abort();
        }
    }

    /// Whether the connection stopped waiting for this response.
    fn peer_gone(&self) -> bool {
        self.inner.state.lock().outlet.as_ref().is_some_and(|outlet| outlet.is_closed())
    }

    /// Applies an outbound change unless the response already went out.
    fn edit(&self, op: &'static str, change: impl FnOnce(&mut State)) -> &Self {
        let mut state = self.inner.state.lock();
        if state.sent {
            debug!(request_id = %state.id, op, "response already sent, change ignored");
        } else {
            change(&mut *state);
        }
        self
    }

    // ── Cookies ───────────────────────────────────────────────────────────────

    /// Queues a `Set-Cookie` line. `None` uses the jar's configured defaults.
    pub fn set_cookie(&self, name: &str, value: &str, opts: Option<&CookieOptions>) -> &Self {
        self.edit("set_cookie", |state| state.jar().set(name, value, opts))
    }

    /// Expires a cookie on the client.
    pub fn clear_cookie(&self, name: &str, opts: Option<&CookieOptions>) -> &Self {
        self.edit("clear_cookie", |state| state.jar().clear(name, opts))
    }

    /// Verifies a signed cookie value against the configured secrets.
    pub fn unsign_cookie(&self, value: &str) -> Option<Unsigned> {
        self.inner.state.lock().jar().unsign(value)
    }

    // ── Finalize ──────────────────────────────────────────────────────────────

    /// Finalizes the response with `reply`. Only the first call per flow has
    /// any effect.
    pub fn send(&self, reply: impl Into<Reply>) {
        self.finalize(None, reply.into());
    }

    /// Finalizes with `code` and an empty body.
    pub fn send_status(&self, code: u16) {
        self.finalize(Some(code), Reply::Empty);
    }

    /// Serializes `value` and finalizes with `Content-Type: application/json`.
    pub fn json<T: serde::Serialize + ?Sized>(&self, value: &T) -> Result<(), serde_json::Error> {
        self.finalize(None, Reply::json(value)?);
        Ok(())
    }

    pub(crate) fn finalize(&self, status: Option<u16>, reply: Reply) {
        let kind = reply.kind();
        let mut state = self.inner.state.lock();

        let outlet = match state.claim() {
            Ok(outlet) => outlet,
            Err(SendRejection::AlreadySent) => {
                warn!(request_id = %state.id, kind, "trying to send with the response already sent");
                return;
            }
            Err(SendRejection::PeerGone) => {
                error!(request_id = %state.id, kind, "trying to send into a closed client stream");
                return;
            }
        };
        if let Some(code) = status {
            state.status = code;
        }

        let payload = reply.into_payload();
        match &payload {
            Payload::Json(bytes) => {
                state.headers.set("Content-Type", "application/json");
                state.headers.set("Content-Length", bytes.len().to_string());
            }
            Payload::Fixed(bytes) => state.headers.set("Content-Length", bytes.len().to_string()),
            Payload::None | Payload::Stream(_) => {}
        }
        if !state.cache {
            state.headers.set("Cache-Control", "no-store");
            state.headers.set("Expire", "0");
            state.headers.set("Pragma", "no-cache");
        }
        if state.status >= 400 && state.status != 404 && state.status != 410 {
            state.headers.remove("Cache-Control");
        }
        if let Some(format) = self.inner.options.time_format {
            let elapsed = format.measure(self.inner.started.elapsed());
            state.headers.set("X-Processing-Time", elapsed.to_string());
            state.headers.set("X-Processing-Time-Mode", format.as_str());
        }

        let response = state.build_response(payload.into_body());
        let status = response.status().as_u16();
        state.stage = Stage::Sent;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }

        if outlet.send(response).is_err() {
            error!(request_id = %state.id, "client went away before the response was written");
            return;
        }
        if self.inner.options.logging {
            info!(
                target: "bareflow::http",
                request_id = %state.id,
                method = %state.method,
                path = %state.path,
                status,
                remote = ?state.remote_ip,
                remote_client = state.remote_client.as_deref().unwrap_or(""),
                elapsed_ms = self.inner.started.elapsed().as_secs_f64() * 1e3,
                "request completed"
            );
        }
    }

    // ── Lifecycle hooks (crate-internal) ─────────────────────────────────────

    pub(crate) fn set_stage(&self, stage: Stage) {
        let mut state = self.inner.state.lock();
        if state.stage != Stage::Sent {
            state.stage = stage;
        }
    }

    pub(crate) fn set_params(&self, params: HashMap<String, String>) {
        self.inner.state.lock().params = params;
    }

    pub(crate) fn set_remote_client(&self, name: String) {
        self.inner.state.lock().remote_client = Some(name);
    }

    pub(crate) fn attach_cookie_jar(&self, options: CookieOptions) {
        let mut state = self.inner.state.lock();
        let parsed = state
            .request_headers
            .get_all(http::header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|raw| parse_cookie_header(raw).into_iter())
            .collect();
        state.cookies = parsed;
        state.jar = Some(CookieJar::new(options));
    }

    /// Buffers and classifies the request body. Only `POST`, `PUT` and
    /// `PATCH` bodies are read.
    pub(crate) async fn read_body(&self) -> Result<(), BodyParseError> {
        let (pending, content_type) = {
            let mut state = self.inner.state.lock();
            let carries_body = Method::from_http(&state.method).is_some_and(Method::carries_body);
            if !carries_body {
                return Ok(());
            }
            let content_type = state
                .request_headers
                .get(http::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            (state.pending_body.take(), content_type)
        };
        let Some(pending) = pending else { return Ok(()) };

        let bytes = pending
            .collect()
            .await
            .map_err(|e| BodyParseError::Read(e.to_string()))?
            .to_bytes();
        let classified = body::classify(content_type.as_deref(), bytes);
        let outcome = match &classified {
            RequestBody::Invalid(e) => Err(e.clone()),
            _ => Ok(()),
        };
        self.inner.state.lock().body = classified;
        outcome
    }
}

impl State {
    fn jar(&mut self) -> &mut CookieJar {
        self.jar.get_or_insert_with(|| CookieJar::new(CookieOptions::default()))
    }

    fn claim(&mut self) -> Result<oneshot::Sender<http::Response<ReplyBody>>, SendRejection> {
        if self.sent {
            return Err(SendRejection::AlreadySent);
        }
        self.sent = true;
        match self.outlet.take() {
            Some(outlet) if !outlet.is_closed() => Ok(outlet),
            _ => Err(SendRejection::PeerGone),
        }
    }

    fn build_response(&self, body: ReplyBody) -> http::Response<ReplyBody> {
        let mut response = http::Response::new(body);
        *response.status_mut() = http::StatusCode::from_u16(self.status).unwrap_or_else(|_| {
            warn!(status = self.status, "invalid status code, sending 500");
            http::StatusCode::INTERNAL_SERVER_ERROR
        });

        let headers = response.headers_mut();
        for (name, value) in self.headers.iter() {
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = name, "dropping header with invalid name or value"),
            }
        }
        for line in self.jar.iter().flat_map(|jar| jar.outgoing()) {
            match HeaderValue::from_str(line) {
                Ok(value) => {
                    headers.append(SET_COOKIE, value);
                }
                Err(_) => warn!("dropping Set-Cookie line with invalid characters"),
            }
        }
        response
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use http_body_util::Full;

    use super::*;

    /// A flow over an in-memory request, plus its outlet.
    pub(crate) fn flow(method: &str, uri: &str, headers: &[(&str, &str)], body: &'static [u8]) -> (Flow, Outlet) {
        flow_with(method, uri, headers, body, FlowOptions::default())
    }

    pub(crate) fn flow_with(
        method: &str,
        uri: &str,
        headers: &[(&str, &str)],
        body: &'static [u8],
        options: FlowOptions,
    ) -> (Flow, Outlet) {
        let mut builder = http::Request::builder().method(method).uri(uri);
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        let request = builder.body(Full::new(Bytes::from_static(body))).unwrap();
        Flow::new(request, Some(IpAddr::from([127, 0, 0, 1])), options)
    }

    pub(crate) async fn body_text(response: http::Response<ReplyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }
}
