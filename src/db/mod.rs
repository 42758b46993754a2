//! Storage seams for the evaluation engine.

use async_trait::async_trait;

use crate::error::Error;
use crate::rate_limiting::payload::ScriptPayload;

pub mod valkey;

pub use valkey::ValkeyConnectionInfo;

#[async_trait]
pub trait HealthCheckable {
    /// Verifies connectivity to the backing store within a bounded time.
    async fn health(&self) -> Result<(), Error>;
}

/// One atomic evaluation round trip against the counting store.
#[async_trait]
pub trait RateLimitScriptQueries: Send + Sync {
    /// Runs the limit script and returns the raw result slots.
    async fn run_limit_script(&self, payload: &ScriptPayload) -> Result<Vec<i64>, Error>;
}
