use crate::types::{Endpoint, RequestOutcome};
use async_trait::async_trait;

/// Transport capability injected into the engine.
///
/// `send` issues one logical request and always produces an outcome:
/// transport failures are outcomes too, never errors. Latency covers only
/// the time from just before sending to the end of the response body, so it
/// never includes time spent waiting for a worker slot.
#[async_trait]
pub trait Requester: Send + Sync {
    async fn send(&self, endpoint: &Endpoint) -> RequestOutcome;
}
