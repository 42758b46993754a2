//! Marshaling of one evaluation into the KEYS/ARGV of the counting script.
//!
//! The script contract is positional: 8 keys (current+previous per window,
//! then the two quota keys) and 14 arguments in the order
//! `[limitSec, limitMin, limitDay, quotaDay, quotaMonth, ttlSec, ttlMin,
//! ttlDay, ttlQuotaDay, ttlQuotaMonth, weightSec, weightMin, weightDay,
//! increment]`. Changing either order is a wire-protocol break.

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::{Error, ErrorDetails};
use crate::rate_limiting::keys::{quota_key, rate_limit_key};
use crate::rate_limiting::{LimitDimensions, QuotaPeriod, RateLimitWindow};

/// Sentinel the script treats as "dimension disabled".
pub const DISABLED_LIMIT: i64 = -1;

/// One evaluation request against the counting store.
#[derive(Clone, Debug, PartialEq)]
pub struct ScriptRequest {
    pub dimensions: LimitDimensions,
    pub timestamp: DateTime<Utc>,
    pub limit_per_second: Option<i64>,
    pub limit_per_minute: Option<i64>,
    pub limit_per_day: Option<i64>,
    pub quota_per_day: Option<i64>,
    pub quota_per_month: Option<i64>,
    pub increment: i64,
}

/// Current/previous keys, TTL and previous-bucket weight for one window.
#[derive(Clone, Debug, PartialEq)]
pub struct WindowPayload {
    pub current_key: String,
    pub previous_key: String,
    pub limit: i64,
    pub ttl_seconds: i64,
    pub previous_weight: f64,
}

impl WindowPayload {
    /// Lua receives the weight as a string; six decimals keep the wire
    /// format stable across platforms.
    pub fn weight_arg(&self) -> String {
        format!("{:.6}", self.previous_weight)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct WindowPayloads {
    pub second: WindowPayload,
    pub minute: WindowPayload,
    pub day: WindowPayload,
}

/// Fully marshaled script invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct ScriptPayload {
    pub keys: Vec<String>,
    pub args: Vec<String>,
    pub windows: WindowPayloads,
}

pub fn build_payload(request: &ScriptRequest) -> Result<ScriptPayload, Error> {
    if request.increment <= 0 {
        return Err(Error::new(ErrorDetails::InvalidRequest {
            message: format!("increment must be at least 1, got {}", request.increment),
        }));
    }

    let second = window_payload(request, RateLimitWindow::Second, request.limit_per_second)?;
    let minute = window_payload(request, RateLimitWindow::Minute, request.limit_per_minute)?;
    let day = window_payload(request, RateLimitWindow::Day, request.limit_per_day)?;

    let quota_day_key = quota_key(&request.dimensions, QuotaPeriod::Daily, request.timestamp)?;
    let quota_month_key = quota_key(&request.dimensions, QuotaPeriod::Monthly, request.timestamp)?;
    let quota_day_ttl = QuotaPeriod::Daily.seconds_until_rollover(request.timestamp);
    let quota_month_ttl = QuotaPeriod::Monthly.seconds_until_rollover(request.timestamp);

    let keys = vec![
        second.current_key.clone(),
        second.previous_key.clone(),
        minute.current_key.clone(),
        minute.previous_key.clone(),
        day.current_key.clone(),
        day.previous_key.clone(),
        quota_day_key,
        quota_month_key,
    ];

    let args = vec![
        second.limit.to_string(),
        minute.limit.to_string(),
        day.limit.to_string(),
        normalized_limit(request.quota_per_day).to_string(),
        normalized_limit(request.quota_per_month).to_string(),
        second.ttl_seconds.to_string(),
        minute.ttl_seconds.to_string(),
        day.ttl_seconds.to_string(),
        quota_day_ttl.to_string(),
        quota_month_ttl.to_string(),
        second.weight_arg(),
        minute.weight_arg(),
        day.weight_arg(),
        request.increment.to_string(),
    ];

    Ok(ScriptPayload {
        keys,
        args,
        windows: WindowPayloads {
            second,
            minute,
            day,
        },
    })
}

/// `None` and non-positive limits both mean "disabled" on the wire.
pub fn normalized_limit(limit: Option<i64>) -> i64 {
    match limit {
        Some(value) if value > 0 => value,
        _ => DISABLED_LIMIT,
    }
}

fn window_payload(
    request: &ScriptRequest,
    window: RateLimitWindow,
    limit: Option<i64>,
) -> Result<WindowPayload, Error> {
    let current_key = rate_limit_key(&request.dimensions, window, request.timestamp)?;
    let previous_timestamp = request.timestamp - TimeDelta::seconds(window.duration_seconds());
    let previous_key = rate_limit_key(&request.dimensions, window, previous_timestamp)?;
    Ok(WindowPayload {
        current_key,
        previous_key,
        limit: normalized_limit(limit),
        // Keeps both buckets alive for one full rotation
        ttl_seconds: window.duration_seconds() * 2,
        previous_weight: previous_bucket_weight(window, request.timestamp),
    })
}

/// Sliding-window interpolation: the previous bucket contributes less as
/// the current bucket matures.
fn previous_bucket_weight(window: RateLimitWindow, timestamp: DateTime<Utc>) -> f64 {
    let bucket_start = window.bucket_start(timestamp);
    let elapsed_millis = (timestamp - bucket_start).num_milliseconds() as f64;
    let window_millis = window.duration_seconds() as f64 * 1_000.0;
    (1.0 - elapsed_millis / window_millis).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiting::LimitScope;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn request() -> ScriptRequest {
        ScriptRequest {
            dimensions: LimitDimensions {
                scope: LimitScope::TenantApi,
                tenant_id: "tenant-01".to_string(),
                user_id: None,
                api_path: Some("/v1/report".to_string()),
            },
            timestamp: ts("2025-11-23T10:15:30Z"),
            limit_per_second: Some(10),
            limit_per_minute: Some(100),
            limit_per_day: None,
            quota_per_day: Some(5_000),
            quota_per_month: None,
            increment: 1,
        }
    }

    #[test]
    fn test_payload_keys_in_script_order() {
        let payload = build_payload(&request()).unwrap();
        assert_eq!(
            payload.keys,
            vec![
                "rl:tenant_api:tenant-01:-:/v1/report:20251123101530",
                "rl:tenant_api:tenant-01:-:/v1/report:20251123101529",
                "rl:tenant_api:tenant-01:-:/v1/report:202511231015",
                "rl:tenant_api:tenant-01:-:/v1/report:202511231014",
                "rl:tenant_api:tenant-01:-:/v1/report:20251123",
                "rl:tenant_api:tenant-01:-:/v1/report:20251122",
                "qt:tenant_api:tenant-01:-:/v1/report:20251123",
                "qt:tenant_api:tenant-01:-:/v1/report:202511",
            ]
        );
    }

    #[test]
    fn test_payload_args_in_script_order() {
        let payload = build_payload(&request()).unwrap();
        assert_eq!(payload.args.len(), 14);
        // limits
        assert_eq!(&payload.args[0..5], &["10", "100", "-1", "5000", "-1"]);
        // window TTLs are 2x the duration
        assert_eq!(&payload.args[5..8], &["2", "120", "172800"]);
        // quota TTLs run to the next UTC boundary
        let seconds_left_in_day = (ts("2025-11-24T00:00:00Z") - ts("2025-11-23T10:15:30Z"))
            .num_seconds()
            .to_string();
        let seconds_left_in_month = (ts("2025-12-01T00:00:00Z") - ts("2025-11-23T10:15:30Z"))
            .num_seconds()
            .to_string();
        assert_eq!(payload.args[8], seconds_left_in_day);
        assert_eq!(payload.args[9], seconds_left_in_month);
        assert_eq!(payload.args[13], "1");
    }

    #[test]
    fn test_previous_bucket_weights() {
        // At :30.000 the second bucket just started, the minute bucket is
        // half spent, the day bucket is 10h15m30s in.
        let payload = build_payload(&request()).unwrap();
        assert_eq!(payload.args[10], "1.000000");
        assert_eq!(payload.args[11], "0.500000");
        let day_elapsed_ms = (10 * 3600 + 15 * 60 + 30) as f64 * 1000.0;
        let expected = format!("{:.6}", 1.0 - day_elapsed_ms / 86_400_000.0);
        assert_eq!(payload.args[12], expected);
    }

    #[test]
    fn test_previous_bucket_weight_approaches_zero_at_bucket_end() {
        let mut req = request();
        req.timestamp = ts("2025-11-23T10:15:59.999Z");
        let payload = build_payload(&req).unwrap();
        // 1ms left in the second bucket, 1ms left in the minute bucket
        assert_eq!(payload.args[10], "0.001000");
        let minute_weight = format!("{:.6}", 1.0 - 59_999.0 / 60_000.0);
        assert_eq!(payload.args[11], minute_weight);
    }

    #[test]
    fn test_all_limits_disabled_normalize_to_minus_one() {
        let mut req = request();
        req.limit_per_second = Some(0);
        req.limit_per_minute = Some(-5);
        req.quota_per_day = None;
        let payload = build_payload(&req).unwrap();
        assert_eq!(&payload.args[0..5], &["-1", "-1", "-1", "-1", "-1"]);
    }

    #[test]
    fn test_non_positive_increment_rejected_before_keys() {
        let mut req = request();
        req.increment = 0;
        // Even with an invalid tenant the increment check fires first
        req.dimensions.tenant_id = "bad:tenant".to_string();
        let err = build_payload(&req).unwrap_err();
        match err.get_details() {
            ErrorDetails::InvalidRequest { message } => {
                assert!(message.contains("increment"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_previous_keys_cross_bucket_boundaries() {
        let mut req = request();
        req.timestamp = ts("2025-11-23T00:00:00Z");
        let payload = build_payload(&req).unwrap();
        // Previous day bucket falls on the prior calendar day
        assert_eq!(
            payload.keys[5],
            "rl:tenant_api:tenant-01:-:/v1/report:20251122"
        );
        // Previous minute bucket crosses the hour
        assert_eq!(
            payload.keys[3],
            "rl:tenant_api:tenant-01:-:/v1/report:202511222359"
        );
    }
}
