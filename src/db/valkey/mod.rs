//! Valkey (Redis-compatible) backend for the counting store.

mod execute;
mod script;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::time::timeout;

use crate::db::{HealthCheckable, RateLimitScriptQueries};
use crate::error::{Error, ErrorDetails};
use crate::rate_limiting::payload::ScriptPayload;

pub use script::{ScriptState, SCRIPT_SHA_KEY};

/// Connection info for the Valkey counting store.
///
/// Uses `ConnectionManager` which provides:
/// - Automatic reconnection on connection loss
/// - Connection multiplexing for efficient async operations
/// - No connection pool management needed
#[derive(Clone)]
pub enum ValkeyConnectionInfo {
    Enabled {
        connection: Box<ConnectionManager>,
        scripts: Arc<ScriptState>,
    },
    Disabled,
}

impl ValkeyConnectionInfo {
    /// Connects and loads the limit script. A script SHA mismatch at this
    /// point is startup-fatal: serving with divergent counting semantics
    /// is worse than not starting.
    pub async fn new(valkey_url: &str) -> Result<Self, Error> {
        let client = Client::open(valkey_url).map_err(|e| {
            Error::new(ErrorDetails::StoreUnreachable {
                message: format!("failed to create Valkey client: {e}"),
            })
        })?;

        let mut connection = ConnectionManager::new(client).await.map_err(|e| {
            Error::new(ErrorDetails::StoreUnreachable {
                message: format!("failed to connect to Valkey: {e}"),
            })
        })?;

        let scripts = Arc::new(ScriptState::new());
        scripts.ensure_loaded(&mut connection).await?;

        Ok(Self::Enabled {
            connection: Box::new(connection),
            scripts,
        })
    }

    /// For embedding without a store. Every script run reports the store
    /// as unreachable, which routes evaluations into the fallback handler.
    pub fn new_disabled() -> Self {
        Self::Disabled
    }

    pub fn get_connection(&self) -> Option<&ConnectionManager> {
        match self {
            Self::Enabled { connection, .. } => Some(connection),
            Self::Disabled => None,
        }
    }
}

#[async_trait]
impl RateLimitScriptQueries for ValkeyConnectionInfo {
    async fn run_limit_script(&self, payload: &ScriptPayload) -> Result<Vec<i64>, Error> {
        match self {
            Self::Disabled => Err(Error::new(ErrorDetails::StoreUnreachable {
                message: "Valkey connection is disabled".to_string(),
            })),
            Self::Enabled {
                connection,
                scripts,
            } => {
                let mut conn = (**connection).clone();
                execute::execute_limit_script(&mut conn, scripts, payload).await
            }
        }
    }
}

const HEALTH_CHECK_TIMEOUT_MS: u64 = 1000;

#[async_trait]
impl HealthCheckable for ValkeyConnectionInfo {
    async fn health(&self) -> Result<(), Error> {
        match self {
            Self::Disabled => Ok(()),
            Self::Enabled { connection, .. } => {
                let check = async {
                    let mut conn = (**connection).clone();
                    let _: String = conn.ping().await.map_err(|e| {
                        Error::new(ErrorDetails::StoreUnreachable {
                            message: format!("Valkey health check failed: {e}"),
                        })
                    })?;
                    Ok(())
                };

                match timeout(Duration::from_millis(HEALTH_CHECK_TIMEOUT_MS), check).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(Error::new(ErrorDetails::StoreUnreachable {
                        message: "Valkey health check timed out".to_string(),
                    })),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_connection_reports_unreachable() {
        use crate::rate_limiting::payload::{build_payload, ScriptRequest};
        use crate::rate_limiting::{LimitDimensions, LimitScope};

        let client = ValkeyConnectionInfo::new_disabled();
        let payload = build_payload(&ScriptRequest {
            dimensions: LimitDimensions {
                scope: LimitScope::Tenant,
                tenant_id: "tenant-01".to_string(),
                user_id: None,
                api_path: None,
            },
            timestamp: "2025-11-23T10:15:30Z".parse().unwrap(),
            limit_per_second: Some(1),
            limit_per_minute: None,
            limit_per_day: None,
            quota_per_day: None,
            quota_per_month: None,
            increment: 1,
        })
        .unwrap();

        let err = client.run_limit_script(&payload).await.unwrap_err();
        assert!(err.triggers_fallback());
    }

    #[tokio::test]
    async fn test_disabled_connection_is_healthy() {
        let client = ValkeyConnectionInfo::new_disabled();
        assert!(client.health().await.is_ok());
    }
}
