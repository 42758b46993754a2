//! EVALSHA execution with NOSCRIPT recovery.

use redis::aio::ConnectionLike;
use redis::{ErrorKind, RedisError, ServerErrorKind};

use crate::error::{Error, ErrorDetails};
use crate::rate_limiting::payload::ScriptPayload;
use crate::rate_limiting::result::validate_raw_result;

use super::script::ScriptState;

#[derive(Debug, PartialEq, Eq)]
pub(super) enum StoreErrorClass {
    /// The store does not know the script SHA; reload and retry.
    NoScript,
    /// Transport-level failure; the fallback handler takes over.
    Unreachable,
    /// Anything else (script runtime error, wrong types); hard failure.
    Other,
}

pub(super) fn classify_store_error(error: &RedisError) -> StoreErrorClass {
    if error.kind() == ErrorKind::Server(ServerErrorKind::NoScript) {
        StoreErrorClass::NoScript
    } else if error.is_io_error()
        || error.is_timeout()
        || error.is_connection_refusal()
        || error.is_connection_dropped()
    {
        StoreErrorClass::Unreachable
    } else {
        StoreErrorClass::Other
    }
}

pub(super) fn store_error(error: RedisError) -> Error {
    match classify_store_error(&error) {
        StoreErrorClass::Unreachable => Error::new(ErrorDetails::StoreUnreachable {
            message: error.to_string(),
        }),
        _ => Error::new(ErrorDetails::StoreExecutionFailure {
            message: error.to_string(),
        }),
    }
}

/// Runs one limit script invocation against any async Redis-compatible
/// connection. On NOSCRIPT the script is reloaded and the call retried
/// exactly once; a second NOSCRIPT is surfaced as an execution failure.
pub(super) async fn execute_limit_script<C: ConnectionLike + Send>(
    conn: &mut C,
    scripts: &ScriptState,
    payload: &ScriptPayload,
) -> Result<Vec<i64>, Error> {
    scripts.ensure_loaded(conn).await?;

    let raw = match evalsha(conn, scripts, payload).await {
        Ok(raw) => raw,
        Err(error) if classify_store_error(&error) == StoreErrorClass::NoScript => {
            tracing::warn!("limit script missing from store, reloading and retrying");
            scripts.reload(conn).await?;
            evalsha(conn, scripts, payload).await.map_err(store_error)?
        }
        Err(error) => return Err(store_error(error)),
    };

    validate_raw_result(&raw)?;
    Ok(raw)
}

async fn evalsha<C: ConnectionLike + Send>(
    conn: &mut C,
    scripts: &ScriptState,
    payload: &ScriptPayload,
) -> Result<Vec<i64>, RedisError> {
    let mut cmd = redis::cmd("EVALSHA");
    cmd.arg(scripts.hash()).arg(payload.keys.len());
    for key in &payload.keys {
        cmd.arg(key);
    }
    for arg in &payload.args {
        cmd.arg(arg);
    }
    cmd.query_async(conn).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiting::payload::build_payload;
    use crate::rate_limiting::payload::ScriptRequest;
    use crate::rate_limiting::{LimitDimensions, LimitScope};
    use redis::Value;
    use redis_test::{MockCmd, MockRedisConnection};

    use crate::db::valkey::script::{LIMIT_SCRIPT_SOURCE, SCRIPT_SHA_KEY};

    fn payload() -> ScriptPayload {
        build_payload(&ScriptRequest {
            dimensions: LimitDimensions {
                scope: LimitScope::Tenant,
                tenant_id: "tenant-01".to_string(),
                user_id: None,
                api_path: None,
            },
            timestamp: "2025-11-23T10:15:30Z".parse().unwrap(),
            limit_per_second: Some(10),
            limit_per_minute: None,
            limit_per_day: None,
            quota_per_day: Some(100),
            quota_per_month: None,
            increment: 1,
        })
        .unwrap()
    }

    fn evalsha_cmd(scripts: &ScriptState, payload: &ScriptPayload) -> redis::Cmd {
        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(scripts.hash()).arg(payload.keys.len());
        for key in &payload.keys {
            cmd.arg(key);
        }
        for arg in &payload.args {
            cmd.arg(arg);
        }
        cmd
    }

    fn result_value() -> Value {
        let mut slots = vec![0i64; 16];
        for offset in [0, 4, 8, 12, 14] {
            slots[offset] = 1;
        }
        Value::Array(slots.into_iter().map(Value::Int).collect())
    }

    fn noscript_error() -> RedisError {
        RedisError::from((
            ErrorKind::Server(ServerErrorKind::NoScript),
            "NOSCRIPT",
            "No matching script".to_string(),
        ))
    }

    #[tokio::test]
    async fn test_execute_sends_evalsha_with_payload() {
        let scripts = ScriptState::new();
        scripts.mark_loaded();
        let payload = payload();
        let mut mock = MockRedisConnection::new(vec![MockCmd::new(
            evalsha_cmd(&scripts, &payload),
            Ok(result_value()),
        )])
        .assert_all_commands_consumed();

        let raw = execute_limit_script(&mut mock, &scripts, &payload)
            .await
            .unwrap();
        assert_eq!(raw.len(), 16);
        assert_eq!(raw[0], 1);
    }

    #[tokio::test]
    async fn test_noscript_reloads_and_retries_once() {
        let scripts = ScriptState::new();
        scripts.mark_loaded();
        let payload = payload();
        let sha = scripts.hash().to_string();
        let mut mock = MockRedisConnection::new(vec![
            MockCmd::new::<_, Value>(evalsha_cmd(&scripts, &payload), Err(noscript_error())),
            MockCmd::new(
                redis::cmd("SCRIPT").arg("LOAD").arg(LIMIT_SCRIPT_SOURCE),
                Ok(sha.clone()),
            ),
            MockCmd::new(redis::cmd("SET").arg(SCRIPT_SHA_KEY).arg(&sha), Ok("OK")),
            MockCmd::new(redis::cmd("GET").arg(SCRIPT_SHA_KEY), Ok(sha.clone())),
            MockCmd::new(evalsha_cmd(&scripts, &payload), Ok(result_value())),
        ])
        .assert_all_commands_consumed();

        let raw = execute_limit_script(&mut mock, &scripts, &payload)
            .await
            .unwrap();
        assert_eq!(raw.len(), 16);
    }

    #[tokio::test]
    async fn test_io_error_maps_to_store_unreachable() {
        let scripts = ScriptState::new();
        scripts.mark_loaded();
        let payload = payload();
        let io_error: RedisError =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        let mut mock = MockRedisConnection::new(vec![MockCmd::new::<_, Value>(
            evalsha_cmd(&scripts, &payload),
            Err(io_error),
        )]);

        let err = execute_limit_script(&mut mock, &scripts, &payload)
            .await
            .unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::StoreUnreachable { .. }
        ));
        assert!(err.triggers_fallback());
    }

    #[tokio::test]
    async fn test_script_runtime_error_is_execution_failure() {
        let scripts = ScriptState::new();
        scripts.mark_loaded();
        let payload = payload();
        let script_error = RedisError::from((
            ErrorKind::Server(ServerErrorKind::ResponseError),
            "ERR",
            "user_script:12: attempt to compare nil".to_string(),
        ));
        let mut mock = MockRedisConnection::new(vec![MockCmd::new::<_, Value>(
            evalsha_cmd(&scripts, &payload),
            Err(script_error),
        )]);

        let err = execute_limit_script(&mut mock, &scripts, &payload)
            .await
            .unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::StoreExecutionFailure { .. }
        ));
        assert!(!err.triggers_fallback());
    }

    #[tokio::test]
    async fn test_short_reply_is_malformed_result() {
        let scripts = ScriptState::new();
        scripts.mark_loaded();
        let payload = payload();
        let short = Value::Array(vec![Value::Int(1); 8]);
        let mut mock = MockRedisConnection::new(vec![MockCmd::new(
            evalsha_cmd(&scripts, &payload),
            Ok(short),
        )]);

        let err = execute_limit_script(&mut mock, &scripts, &payload)
            .await
            .unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::MalformedResult { .. }
        ));
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(
            classify_store_error(&noscript_error()),
            StoreErrorClass::NoScript
        );
        let io_error: RedisError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken pipe").into();
        assert_eq!(
            classify_store_error(&io_error),
            StoreErrorClass::Unreachable
        );
        let response_error = RedisError::from((
            ErrorKind::Server(ServerErrorKind::ResponseError),
            "ERR",
            "bad reply".to_string(),
        ));
        assert_eq!(
            classify_store_error(&response_error),
            StoreErrorClass::Other
        );
    }
}
