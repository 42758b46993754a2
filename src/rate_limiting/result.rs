//! Mapping of the raw script reply into typed counters.

use serde::Serialize;

use crate::error::{Error, ErrorDetails};
use crate::rate_limiting::payload::{normalized_limit, ScriptRequest};

/// Slot layout of the script reply: four values per window, two per quota.
const SECOND_OFFSET: usize = 0;
const MINUTE_OFFSET: usize = 4;
const DAY_OFFSET: usize = 8;
const DAILY_QUOTA_OFFSET: usize = 12;
const MONTHLY_QUOTA_OFFSET: usize = 14;
pub const MIN_SCRIPT_RESULT_LEN: usize = 16;

/// Counters observed for one sliding window.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct WindowCounters {
    pub allowed: bool,
    /// Weighted count: current bucket plus the decayed previous bucket.
    pub effective_count: i64,
    pub current_bucket_count: i64,
    pub previous_bucket_count: i64,
}

/// Counters observed for one cumulative quota period.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct QuotaCounters {
    pub allowed: bool,
    pub total_count: i64,
}

/// Per-dimension outcome of one script run. `None` means the dimension was
/// disabled for this request and was not evaluated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ScriptResult {
    pub second: Option<WindowCounters>,
    pub minute: Option<WindowCounters>,
    pub day: Option<WindowCounters>,
    pub daily_quota: Option<QuotaCounters>,
    pub monthly_quota: Option<QuotaCounters>,
}

/// The script must return at least 16 integer slots; anything shorter is a
/// contract violation and a hard failure, never a silent allow.
pub fn validate_raw_result(raw: &[i64]) -> Result<(), Error> {
    if raw.len() < MIN_SCRIPT_RESULT_LEN {
        return Err(Error::new(ErrorDetails::MalformedResult {
            message: format!(
                "expected at least {MIN_SCRIPT_RESULT_LEN} result slots, got {}",
                raw.len()
            ),
        }));
    }
    Ok(())
}

/// Maps the raw reply, honoring which dimensions the request enabled.
pub fn map_script_result(request: &ScriptRequest, raw: &[i64]) -> Result<ScriptResult, Error> {
    validate_raw_result(raw)?;
    Ok(ScriptResult {
        second: window_counters(raw, SECOND_OFFSET, request.limit_per_second),
        minute: window_counters(raw, MINUTE_OFFSET, request.limit_per_minute),
        day: window_counters(raw, DAY_OFFSET, request.limit_per_day),
        daily_quota: quota_counters(raw, DAILY_QUOTA_OFFSET, request.quota_per_day),
        monthly_quota: quota_counters(raw, MONTHLY_QUOTA_OFFSET, request.quota_per_month),
    })
}

fn window_counters(raw: &[i64], offset: usize, limit: Option<i64>) -> Option<WindowCounters> {
    if normalized_limit(limit) <= 0 {
        return None;
    }
    Some(WindowCounters {
        allowed: raw[offset] == 1,
        effective_count: raw[offset + 1],
        current_bucket_count: raw[offset + 2],
        previous_bucket_count: raw[offset + 3],
    })
}

fn quota_counters(raw: &[i64], offset: usize, limit: Option<i64>) -> Option<QuotaCounters> {
    if normalized_limit(limit) <= 0 {
        return None;
    }
    Some(QuotaCounters {
        allowed: raw[offset] == 1,
        total_count: raw[offset + 1],
    })
}
