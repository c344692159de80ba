// Dispatch seam between the gateway and the pool

use async_trait::async_trait;
use muxpool_pool::{Pool, PoolError, PoolStatus};
use muxpool_protocol::{Request, Response};

/// Something that can carry a request to a worker and report pool status.
///
/// [`Pool`] is the production implementation; tests substitute scripted ones.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Forward a request and wait for its correlated response
    async fn dispatch(&self, request: Request) -> Result<Response, PoolError>;

    /// Current pool status
    fn status(&self) -> PoolStatus;

    /// Stop accepting work and reject whatever is in flight
    async fn shutdown(&self) {}
}

#[async_trait]
impl Dispatcher for Pool {
    async fn dispatch(&self, request: Request) -> Result<Response, PoolError> {
        Pool::dispatch(self, request).await
    }

    fn status(&self) -> PoolStatus {
        Pool::status(self)
    }

    async fn shutdown(&self) {
        Pool::shutdown(self).await
    }
}
