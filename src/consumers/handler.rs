//! The `Handler` trait is heavily inspired by `tide`'s approach to endpoint handlers.
use super::{HandlerError, Incoming};
use std::future::Future;

/// Implementers of the `Handler` trait process the messages pushed to an asynchronous
/// consumer (see [`ConsumerFactory::create_async_consumer`]).
///
/// # Scope
///
/// `handle` does not get access to the underlying channel.
/// The consumer takes care of acking/nacking the message with the broker according to the
/// outcome of processing (check out [`HandlerError`] for more details).
///
/// # Implementors
///
/// While you can implement `Handler` for a struct or enum, most of the time you will be relying
/// on [`ClosureHandler`], which implements `Handle` for async functions with a matching
/// signature - `async fn(Incoming<'_>) -> Result<(), impl Into<HandlerError>>`.
///
/// [`ConsumerFactory::create_async_consumer`]: crate::consumers::ConsumerFactory::create_async_consumer
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, incoming: Incoming<'_>) -> Result<(), HandlerError>;
}

/// Implement the [`Handler`] trait for all Boxed handlers.
///
/// E.g. Box<dyn Handler>.
#[async_trait::async_trait]
impl<H> Handler for Box<H>
where
    H: Handler + ?Sized,
{
    async fn handle(&self, incoming: Incoming<'_>) -> Result<(), HandlerError> {
        H::handle(self, incoming).await
    }
}

/// `AsyncClosure` is implemented for all functions of the form:
/// ```ignore
/// async fn(incoming: Incoming<'_>) -> Result<(), impl Into<HandlerError>>;
/// ```
///
/// When combined with the [`ClosureHandler`] type, you get a [`Handler`].
pub trait AsyncClosure<'a>: Send + Sync + 'static {
    type Output: Future<Output = Result<(), Self::Err>> + Send + 'a;
    type Err: Into<HandlerError> + 'static;
    fn call(&'a self, incoming: Incoming<'a>) -> Self::Output;
}

impl<'a, F, Fut, Err> AsyncClosure<'a> for F
where
    F: Send + Sync + 'static,
    F: Fn(Incoming<'a>) -> Fut,
    Fut: Future<Output = Result<(), Err>> + Send + 'a,
    Err: Into<HandlerError> + 'static,
{
    type Err = Err;
    type Output = Fut;

    fn call(&'a self, incoming: Incoming<'a>) -> Self::Output {
        (self)(incoming)
    }
}

/// Wrapper type to turn an [`AsyncClosure`] into a [`Handler`].
pub struct ClosureHandler<H>(pub H);

#[async_trait::async_trait]
impl<F> Handler for ClosureHandler<F>
where
    F: for<'a> AsyncClosure<'a>,
{
    async fn handle(&self, incoming: Incoming<'_>) -> Result<(), HandlerError> {
        self.0.call(incoming).await.map_err(|e| e.into())
    }
}

/// Implementers of `SyncHandler` process the messages pushed to a synchronous consumer
/// (see [`ConsumerFactory::create_consumer`]), one message at a time.
///
/// It is implemented for every function with a matching signature -
/// `fn(Incoming<'_>) -> Result<(), impl Into<HandlerError>>`.
///
/// [`ConsumerFactory::create_consumer`]: crate::consumers::ConsumerFactory::create_consumer
pub trait SyncHandler: Send + Sync + 'static {
    fn handle(&self, incoming: Incoming<'_>) -> Result<(), HandlerError>;
}

impl<F, Err> SyncHandler for F
where
    F: for<'a> Fn(Incoming<'a>) -> Result<(), Err> + Send + Sync + 'static,
    Err: Into<HandlerError>,
{
    fn handle(&self, incoming: Incoming<'_>) -> Result<(), HandlerError> {
        (self)(incoming).map_err(Into::into)
    }
}
