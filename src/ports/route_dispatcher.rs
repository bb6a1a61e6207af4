use std::future::Future;

use async_trait::async_trait;
use eyre::Result;

use crate::core::outcome::Outcome;

/// RouteDispatcher defines the port the embedding application implements
///
/// It receives the unmodified `request` outcome of a stream, at most once,
/// and resolves it to a terminal outcome. Awaiting the pending body is the
/// dispatcher's business. An `Err` (or a panic) is rendered as an internal
/// error carrying the failure's message.
#[async_trait]
pub trait RouteDispatcher: Send + Sync + 'static {
    async fn dispatch(&self, request: Outcome) -> Result<Outcome>;
}

/// Any async closure over an outcome is a dispatcher.
#[async_trait]
impl<F, Fut> RouteDispatcher for F
where
    F: Fn(Outcome) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome>> + Send + 'static,
{
    async fn dispatch(&self, request: Outcome) -> Result<Outcome> {
        (self)(request).await
    }
}
