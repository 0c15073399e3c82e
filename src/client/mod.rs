//! Remote execution platform contract.
//!
//! The driver only needs two calls: hand over a payload and ask how the
//! resulting execution is doing. [`http::HttpExecutionClient`] speaks the
//! platform's REST API; tests substitute their own implementations.

pub mod http;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{ExecutionHandle, ExecutionStatus, Payload};

#[async_trait]
pub trait ExecutionClient: Send + Sync {
    /// Submit one execution request.
    ///
    /// A rejected request is not an error: it yields a handle whose `id` is
    /// `None`, with the platform's explanation in `message`/`details`.
    async fn submit(&self, payload: &Payload) -> Result<ExecutionHandle>;

    /// Current status of a submitted execution. Errors are treated as
    /// transient by the caller and retried.
    async fn status(&self, handle: &ExecutionHandle) -> Result<ExecutionStatus>;
}

pub use http::HttpExecutionClient;
