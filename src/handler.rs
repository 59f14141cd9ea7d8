//! Handler trait and type erasure.
//!
//! The route table holds handlers of different concrete types side by side,
//! so each one is hidden behind a trait object:
//!
//! ```text
//! async fn hello(flow: Flow) -> impl IntoReply { … }   ← user writes this
//!        ↓ router.get("/", hello)
//! hello.into_boxed_handler()                          ← Handler blanket impl
//!        ↓
//! Arc::new(FnHandler(hello))                          ← stored as BoxedHandler
//!        ↓
//! handler.call(flow)  at request time                 ← one vtable dispatch
//!        ↓
//! Box::pin(async { hello(flow).await.into_reply() })  ← BoxFuture
//! ```
//!
//! A handler may also finalize the flow itself (`flow.send(..)`) and return
//! `()`; the reply it returns afterwards is dropped by the send guard.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::BoxError;
use crate::flow::Flow;
use crate::reply::{IntoReply, Reply};

/// A heap-allocated, type-erased future. Returned by the object-safe seams
/// ([`ReverseResolve`](crate::middleware::ReverseResolve), [`UpgradeSubsystem`](crate::upgrade::UpgradeSubsystem)).
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Internal dispatch interface.
///
/// `#[doc(hidden)] pub` because it appears in the return type of the public
/// `Handler` trait's `into_boxed_handler` method.
#[doc(hidden)]
pub trait ErasedHandler {
    fn call(&self, flow: Flow) -> BoxFuture<Result<Reply, BoxError>>;
}

#[doc(hidden)]
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

/// Implemented for every valid route handler.
///
/// Automatically satisfied for any function or closure shaped like
///
/// ```text
/// async fn name(flow: Flow) -> impl IntoReply
/// ```
///
/// The trait is sealed: only the blanket impl below can satisfy it.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut, R> private::Sealed for F
where
    F: Fn(Flow) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoReply + Send + 'static,
{
}

impl<F, Fut, R> Handler for F
where
    F: Fn(Flow) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoReply + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

struct FnHandler<F>(F);

impl<F, Fut, R> ErasedHandler for FnHandler<F>
where
    F: Fn(Flow) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoReply + Send + 'static,
{
    fn call(&self, flow: Flow) -> BoxFuture<Result<Reply, BoxError>> {
        let fut = (self.0)(flow);
        Box::pin(async move { fut.await.into_reply() })
    }
}
