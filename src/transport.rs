//! The remote call the gateway wraps.

use async_trait::async_trait;
use cache::Arguments;
use resilience::RemoteError;
use serde_json::Value;
use std::sync::Arc;

/// Performs one attempt of a logical operation against the remote API.
///
/// Implementations own HTTP, authentication and wire encoding. They must
/// classify every failure (see [`RemoteError`]) and must not retry on their
/// own; the gateway does that.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, operation: &str, arguments: &Arguments) -> Result<Value, RemoteError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn call(&self, operation: &str, arguments: &Arguments) -> Result<Value, RemoteError> {
        (**self).call(operation, arguments).await
    }
}
