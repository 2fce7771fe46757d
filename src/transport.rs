use bytes::Bytes;

use crate::error::TransportError;
use crate::model::Container;

/// Fetches the encrypted payload of a container from its storage host.
///
/// Request-level retries and backoff are the implementor's business. A
/// rejected session must surface as [`TransportError::Status`] with code 401.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, container: &Container) -> Result<Bytes, TransportError>;
}
