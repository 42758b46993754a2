//! Lifecycle of the limit script on the store side.
//!
//! Every instance computes the script SHA locally and loads the script at
//! startup. The SHA is also published under a well-known key so operators
//! and other instances can verify which script version the store carries.
//! A loaded SHA that differs from the local one means the store would run
//! different counting semantics, which is refused outright.

use std::sync::atomic::{AtomicBool, Ordering};

use redis::aio::ConnectionLike;
use redis::Script;
use tokio::sync::Mutex;

use crate::error::{Error, ErrorDetails};

pub(super) const LIMIT_SCRIPT_SOURCE: &str = include_str!("lua/tenant_limits.lua");

/// Key under which the expected script SHA is published.
pub const SCRIPT_SHA_KEY: &str = "rl:script:tenant-limits:sha";

pub struct ScriptState {
    hash: String,
    loaded: AtomicBool,
    load_guard: Mutex<()>,
}

impl Default for ScriptState {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptState {
    pub fn new() -> Self {
        ScriptState {
            hash: Script::new(LIMIT_SCRIPT_SOURCE).get_hash().to_string(),
            loaded: AtomicBool::new(false),
            load_guard: Mutex::new(()),
        }
    }

    /// Locally computed SHA-1 of the script source.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Idempotent load: cheap once initialized, double-checked under an
    /// async mutex so concurrent first calls load only once.
    pub async fn ensure_loaded<C: ConnectionLike + Send>(&self, conn: &mut C) -> Result<(), Error> {
        if self.loaded.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.load_guard.lock().await;
        if self.loaded.load(Ordering::Acquire) {
            return Ok(());
        }
        self.load_and_publish(conn).await?;
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    /// Forced reload after the store reported NOSCRIPT (cache flush,
    /// failover to a node without the script).
    pub async fn reload<C: ConnectionLike + Send>(&self, conn: &mut C) -> Result<(), Error> {
        let _guard = self.load_guard.lock().await;
        self.loaded.store(false, Ordering::Release);
        self.load_and_publish(conn).await?;
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    async fn load_and_publish<C: ConnectionLike + Send>(&self, conn: &mut C) -> Result<(), Error> {
        let loaded_sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(LIMIT_SCRIPT_SOURCE)
            .query_async(conn)
            .await
            .map_err(super::execute::store_error)?;

        if loaded_sha != self.hash {
            return Err(Error::new(ErrorDetails::ScriptIntegrity {
                expected: self.hash.clone(),
                loaded: loaded_sha,
            }));
        }

        let () = redis::cmd("SET")
            .arg(SCRIPT_SHA_KEY)
            .arg(&self.hash)
            .query_async(conn)
            .await
            .map_err(super::execute::store_error)?;

        // Concurrent startups may race on the published SHA; re-assert ours
        // if the readback diverged.
        let persisted_sha: Option<String> = redis::cmd("GET")
            .arg(SCRIPT_SHA_KEY)
            .query_async(conn)
            .await
            .map_err(super::execute::store_error)?;
        if persisted_sha.as_deref() != Some(self.hash.as_str()) {
            tracing::warn!(
                expected = %self.hash,
                persisted = ?persisted_sha,
                "published limit script SHA diverged, re-asserting"
            );
            let () = redis::cmd("SET")
                .arg(SCRIPT_SHA_KEY)
                .arg(&self.hash)
                .query_async(conn)
                .await
                .map_err(super::execute::store_error)?;
        }

        tracing::info!(sha = %self.hash, "limit script loaded");
        Ok(())
    }

    #[cfg(test)]
    pub(super) fn mark_loaded(&self) {
        self.loaded.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis_test::{MockCmd, MockRedisConnection};

    fn load_sequence(sha: &str) -> Vec<MockCmd> {
        vec![
            MockCmd::new(
                redis::cmd("SCRIPT").arg("LOAD").arg(LIMIT_SCRIPT_SOURCE),
                Ok(sha.to_string()),
            ),
            MockCmd::new(
                redis::cmd("SET").arg(SCRIPT_SHA_KEY).arg(sha),
                Ok("OK"),
            ),
            MockCmd::new(redis::cmd("GET").arg(SCRIPT_SHA_KEY), Ok(sha.to_string())),
        ]
    }

    #[tokio::test]
    async fn test_ensure_loaded_publishes_sha_once() {
        let state = ScriptState::new();
        let mut mock = MockRedisConnection::new(load_sequence(state.hash()))
            .assert_all_commands_consumed();
        state.ensure_loaded(&mut mock).await.unwrap();
        // Second call must not touch the connection
        state.ensure_loaded(&mut mock).await.unwrap();
    }

    #[tokio::test]
    async fn test_sha_mismatch_is_integrity_error() {
        let state = ScriptState::new();
        let mut mock = MockRedisConnection::new(vec![MockCmd::new(
            redis::cmd("SCRIPT").arg("LOAD").arg(LIMIT_SCRIPT_SOURCE),
            Ok("deadbeef"),
        )]);
        let err = state.ensure_loaded(&mut mock).await.unwrap_err();
        match err.get_details() {
            ErrorDetails::ScriptIntegrity { expected, loaded } => {
                assert_eq!(expected, state.hash());
                assert_eq!(loaded, "deadbeef");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // A failed load leaves the state uninitialized so the next call retries
        let mut retry_mock = MockRedisConnection::new(load_sequence(state.hash()));
        state.ensure_loaded(&mut retry_mock).await.unwrap();
    }

    #[tokio::test]
    async fn test_divergent_published_sha_is_reasserted() {
        let state = ScriptState::new();
        let sha = state.hash().to_string();
        let mut mock = MockRedisConnection::new(vec![
            MockCmd::new(
                redis::cmd("SCRIPT").arg("LOAD").arg(LIMIT_SCRIPT_SOURCE),
                Ok(sha.clone()),
            ),
            MockCmd::new(redis::cmd("SET").arg(SCRIPT_SHA_KEY).arg(&sha), Ok("OK")),
            MockCmd::new(
                redis::cmd("GET").arg(SCRIPT_SHA_KEY),
                Ok("someotherinstance"),
            ),
            MockCmd::new(redis::cmd("SET").arg(SCRIPT_SHA_KEY).arg(&sha), Ok("OK")),
        ])
        .assert_all_commands_consumed();
        state.ensure_loaded(&mut mock).await.unwrap();
    }

    #[tokio::test]
    async fn test_reload_loads_again_after_initialization() {
        let state = ScriptState::new();
        let sha = state.hash().to_string();
        state.mark_loaded();
        let mut mock =
            MockRedisConnection::new(load_sequence(&sha)).assert_all_commands_consumed();
        state.reload(&mut mock).await.unwrap();
    }
}
