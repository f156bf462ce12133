//! Handler shapes and their type-erased form.
//!
//! A handler is a function of the worker instance and at most one decoded
//! argument, returning `Result<R, E>`:
//!
//! ```rust,ignore
//! impl OrdersWorker {
//!     async fn on_order(self: Arc<Self>, order: Order) -> Result<Receipt, OrderError> { ... }
//!     async fn on_tick(self: Arc<Self>) -> Result<(), OrderError> { ... }
//!     fn on_ping(self: Arc<Self>) -> Result<(), OrderError> { ... } // via sync_handler
//! }
//! ```
//!
//! Arity is fixed by the function's type when the handler is registered and
//! stored as a [`HandlerKind`] variant. Functions with more than one argument
//! do not implement [`Handler`] and are rejected at compile time.

use crate::codec::PayloadCodec;
use crate::error::{BoxError, CodecError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

/// A type alias for a boxed, pinned future that is `Send`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a handler invocation produces: its encoded return value or its error.
pub type HandlerOutput = Result<Option<serde_json::Value>, BoxError>;

/// Type-erased zero-argument handler.
pub trait ErasedZeroArg: Send + Sync {
    fn call(&self) -> BoxFuture<'static, HandlerOutput>;
}

/// Type-erased one-argument handler. Decoding happens before the call.
pub trait ErasedOneArg: Send + Sync {
    fn call(&self, payload: &[u8]) -> Result<BoxFuture<'static, HandlerOutput>, CodecError>;

    /// Name of the argument type, for diagnostics.
    fn arg_type(&self) -> &'static str;
}

/// A handler with its arity resolved at registration.
#[derive(Clone)]
pub enum HandlerKind {
    ZeroArg(Arc<dyn ErasedZeroArg>),
    OneArg(Arc<dyn ErasedOneArg>),
}

impl HandlerKind {
    /// Number of declared arguments (0 or 1).
    pub fn arity(&self) -> usize {
        match self {
            HandlerKind::ZeroArg(_) => 0,
            HandlerKind::OneArg(_) => 1,
        }
    }

    /// Argument type name for one-argument handlers.
    pub fn arg_type(&self) -> Option<&'static str> {
        match self {
            HandlerKind::ZeroArg(_) => None,
            HandlerKind::OneArg(handler) => Some(handler.arg_type()),
        }
    }
}

impl fmt::Debug for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerKind::ZeroArg(_) => f.write_str("ZeroArg"),
            HandlerKind::OneArg(handler) => write!(f, "OneArg({})", handler.arg_type()),
        }
    }
}

/// Functions that can be bound to a queue or topic on worker `W`.
///
/// `M` is a marker distinguishing the supported shapes; it is inferred.
pub trait Handler<W, M>: Send + Sync + 'static {
    fn into_kind(self, worker: Arc<W>) -> HandlerKind;
}

/// Marker: async handler without a payload argument.
pub struct NoArg;

/// Marker: async handler taking a decoded `T`.
pub struct WithArg<T>(PhantomData<fn() -> T>);

/// Marker: synchronous handler without a payload argument.
pub struct SyncNoArg;

/// Marker: synchronous handler taking a decoded `T`.
pub struct SyncWithArg<T>(PhantomData<fn() -> T>);

/// Adapts a synchronous function into a handler.
pub struct SyncHandler<F>(F);

/// Wrap a synchronous function so it can be registered as a handler.
pub fn sync_handler<F>(f: F) -> SyncHandler<F> {
    SyncHandler(f)
}

fn encode_return<R: Serialize>(value: R) -> Option<serde_json::Value> {
    serde_json::to_value(value).ok().filter(|v| !v.is_null())
}

fn finish<R, E>(result: Result<R, E>) -> HandlerOutput
where
    R: Serialize,
    E: Into<BoxError>,
{
    result.map(encode_return).map_err(Into::into)
}

struct AsyncZeroArg<W, F> {
    worker: Arc<W>,
    f: F,
}

impl<W, F, Fut, R, E> ErasedZeroArg for AsyncZeroArg<W, F>
where
    W: Send + Sync + 'static,
    F: Fn(Arc<W>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: Serialize + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    fn call(&self) -> BoxFuture<'static, HandlerOutput> {
        let fut = (self.f)(Arc::clone(&self.worker));
        Box::pin(async move { finish(fut.await) })
    }
}

struct AsyncOneArg<W, F, T> {
    worker: Arc<W>,
    f: F,
    _arg: PhantomData<fn() -> T>,
}

impl<W, F, T, Fut, R, E> ErasedOneArg for AsyncOneArg<W, F, T>
where
    W: Send + Sync + 'static,
    F: Fn(Arc<W>, T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: Serialize + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    fn call(&self, payload: &[u8]) -> Result<BoxFuture<'static, HandlerOutput>, CodecError> {
        let arg: T = PayloadCodec::decode(payload)?;
        let fut = (self.f)(Arc::clone(&self.worker), arg);
        Ok(Box::pin(async move { finish(fut.await) }))
    }

    fn arg_type(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

struct BlockingZeroArg<W, F> {
    worker: Arc<W>,
    f: F,
}

impl<W, F, R, E> ErasedZeroArg for BlockingZeroArg<W, F>
where
    W: Send + Sync + 'static,
    F: Fn(Arc<W>) -> Result<R, E> + Send + Sync + 'static,
    R: Serialize,
    E: Into<BoxError>,
{
    fn call(&self) -> BoxFuture<'static, HandlerOutput> {
        let output = finish((self.f)(Arc::clone(&self.worker)));
        Box::pin(std::future::ready(output))
    }
}

struct BlockingOneArg<W, F, T> {
    worker: Arc<W>,
    f: F,
    _arg: PhantomData<fn() -> T>,
}

impl<W, F, T, R, E> ErasedOneArg for BlockingOneArg<W, F, T>
where
    W: Send + Sync + 'static,
    F: Fn(Arc<W>, T) -> Result<R, E> + Send + Sync + 'static,
    T: DeserializeOwned + 'static,
    R: Serialize,
    E: Into<BoxError>,
{
    fn call(&self, payload: &[u8]) -> Result<BoxFuture<'static, HandlerOutput>, CodecError> {
        let arg: T = PayloadCodec::decode(payload)?;
        let output = finish((self.f)(Arc::clone(&self.worker), arg));
        Ok(Box::pin(std::future::ready(output)))
    }

    fn arg_type(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

impl<W, F, Fut, R, E> Handler<W, NoArg> for F
where
    W: Send + Sync + 'static,
    F: Fn(Arc<W>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: Serialize + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    fn into_kind(self, worker: Arc<W>) -> HandlerKind {
        HandlerKind::ZeroArg(Arc::new(AsyncZeroArg { worker, f: self }))
    }
}

impl<W, F, T, Fut, R, E> Handler<W, WithArg<T>> for F
where
    W: Send + Sync + 'static,
    F: Fn(Arc<W>, T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: Serialize + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    fn into_kind(self, worker: Arc<W>) -> HandlerKind {
        HandlerKind::OneArg(Arc::new(AsyncOneArg {
            worker,
            f: self,
            _arg: PhantomData,
        }))
    }
}

impl<W, F, R, E> Handler<W, SyncNoArg> for SyncHandler<F>
where
    W: Send + Sync + 'static,
    F: Fn(Arc<W>) -> Result<R, E> + Send + Sync + 'static,
    R: Serialize + 'static,
    E: Into<BoxError> + 'static,
{
    fn into_kind(self, worker: Arc<W>) -> HandlerKind {
        HandlerKind::ZeroArg(Arc::new(BlockingZeroArg { worker, f: self.0 }))
    }
}

impl<W, F, T, R, E> Handler<W, SyncWithArg<T>> for SyncHandler<F>
where
    W: Send + Sync + 'static,
    F: Fn(Arc<W>, T) -> Result<R, E> + Send + Sync + 'static,
    T: DeserializeOwned + 'static,
    R: Serialize + 'static,
    E: Into<BoxError> + 'static,
{
    fn into_kind(self, worker: Arc<W>) -> HandlerKind {
        HandlerKind::OneArg(Arc::new(BlockingOneArg {
            worker,
            f: self.0,
            _arg: PhantomData,
        }))
    }
}
