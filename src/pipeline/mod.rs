//! Request-processing pipeline.
//!
//! A pipeline is a terminal [`Handler`] wrapped by any number of
//! [`Stage`]s. Each stage returns a new handler with the same signature,
//! so stages compose freely.

mod echo;
mod errors;
mod identity;
mod panic;
mod rate_limit;
mod request;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

pub use echo::EchoHandler;
pub use errors::ErrorStage;
pub(crate) use errors::error_response;
pub use identity::RequestIdStage;
pub use panic::PanicStage;
pub use rate_limit::{
    peer_address_identity, IdentityFn, RateLimiterBuilder, RateLimiterStage, ShutdownHandle,
};
pub use request::{Request, Response};

/// Something that turns a request into a response or an error.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle one request.
    async fn call(&self, request: Request) -> Result<Response>;
}

/// Shared, type-erased handler.
pub type BoxHandler = Arc<dyn Handler>;

/// A pipeline stage wraps a handler and returns a new one.
pub trait Stage: Send + Sync {
    /// Wrap `next`, producing a handler that runs this stage first.
    fn wrap(&self, next: BoxHandler) -> BoxHandler;
}

/// Wrap `handler` in `stages`. The first stage is the outermost.
pub fn chain(handler: BoxHandler, stages: &[&dyn Stage]) -> BoxHandler {
    stages
        .iter()
        .rev()
        .fold(handler, |next, stage| stage.wrap(next))
}

/// Handler backed by an async closure.
pub struct FnHandler<F> {
    f: F,
}

/// Build a handler from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> BoxHandler
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    async fn call(&self, request: Request) -> Result<Response> {
        (self.f)(request).await
    }
}
