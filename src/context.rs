//! Execution context propagation.
//!
//! An [`Execution`] is a small identity and key/value bag that follows one
//! logical unit of work (usually one request) across `.await` points and
//! into tasks it spawns. It lives in tokio task-local storage, so code deep
//! in a call chain can reach it without threading it through arguments, and
//! concurrent requests never see each other's bag.
//!
//! ```rust,no_run
//! use bareflow::context;
//!
//! async fn audit() {
//!     if let Some(execution) = context::current() {
//!         let user = execution.get("user");
//!         // …
//!     }
//! }
//! ```
//!
//! Plain `tokio::spawn` starts a task with no context. Use [`spawn`] (or wrap
//! the future with [`bind`]) to carry it along.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::Either;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::error;

tokio::task_local! {
    static CURRENT: Arc<Execution>;
}

/// One logical unit of work.
pub struct Execution {
    id: String,
    kind: String,
    store: Mutex<HashMap<String, Value>>,
}

impl Execution {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.into(),
            store: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// What started this execution, e.g. `"request"`.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.store.lock().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.store.lock().insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.store.lock().remove(key)
    }
}

impl fmt::Debug for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Execution")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("store", &*self.store.lock())
            .finish()
    }
}

/// Installs fresh executions around futures, or does nothing when disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct Propagator {
    enabled: bool,
}

impl Propagator {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Runs `fut` as the root of a new execution of the given kind.
    pub fn scope<F: Future>(&self, kind: &str, fut: F) -> impl Future<Output = F::Output> + use<F> {
        if self.enabled {
            Either::Left(CURRENT.scope(Arc::new(Execution::new(kind)), fut))
        } else {
            Either::Right(fut)
        }
    }
}

/// The execution the calling task runs under, if any.
pub fn current() -> Option<Arc<Execution>> {
    CURRENT.try_with(Arc::clone).ok()
}

/// Wraps `fut` so it runs under the current execution wherever it is polled.
pub fn bind<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    match current() {
        Some(execution) => Either::Left(CURRENT.scope(execution, fut)),
        None => Either::Right(fut),
    }
}

/// Spawns a task that inherits the current execution.
///
/// A panic inside the task is logged and resolves the handle to `None`; it
/// never takes the request or the server down with it.
pub fn spawn<F>(fut: F) -> JoinHandle<Option<F::Output>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let execution = current();
    let bound = bind(fut);
    tokio::spawn(async move {
        match AssertUnwindSafe(bound).catch_unwind().await {
            Ok(output) => Some(output),
            Err(_) => {
                error!(execution = execution.as_ref().map(|e| e.id()), "background task panicked");
                None
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn disabled_propagator_installs_nothing() {
        let seen = Propagator::new(false).scope("request", async { current().is_some() }).await;
        assert!(!seen);
    }

    #[tokio::test]
    async fn values_survive_async_hops_and_spawns() {
        let propagator = Propagator::new(true);
        let value = propagator
            .scope("request", async {
                current().unwrap().set("user", "ada");
                tokio::time::sleep(Duration::from_millis(1)).await;
                spawn(async { current().and_then(|e| e.get("user")) }).await.unwrap().flatten()
            })
            .await;
        assert_eq!(value, Some(Value::from("ada")));
    }

    #[tokio::test]
    async fn concurrent_scopes_are_isolated() {
        let propagator = Propagator::new(true);
        let run = |name: &'static str| {
            propagator.scope("request", async move {
                current().unwrap().set("name", name);
                tokio::task::yield_now().await;
                current().unwrap().get("name")
            })
        };
        let (a, b) = tokio::join!(run("a"), run("b"));
        assert_eq!(a, Some(Value::from("a")));
        assert_eq!(b, Some(Value::from("b")));
    }

    async fn explode() -> u8 {
        panic!("boom")
    }

    #[tokio::test]
    async fn spawned_panic_is_contained() {
        assert_eq!(spawn(explode()).await.unwrap(), None);
        assert_eq!(spawn(async { 7u8 }).await.unwrap(), Some(7));
    }
}
