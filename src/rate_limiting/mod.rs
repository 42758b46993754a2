//! Rate limit and quota evaluation.
//!
//! The types in this module tree are deliberately layered: `keys` and
//! `payload` are pure functions from a request to store keys and script
//! arguments, `result` maps the raw script reply back into typed counters,
//! and `check` orchestrates the whole admission decision including the
//! degraded-mode `fallback` path and `policy` resolution.

use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

pub mod check;
pub mod fallback;
pub mod hooks;
pub mod keys;
pub mod payload;
pub mod policy;
pub mod result;

pub use check::{
    QuotaUsage, QuotaUsages, RateLimitCheckInput, RateLimitCheckResult, RateLimitCommand,
    RateLimitDecision, RateLimitGate, RateLimiter, WindowUsage, WindowUsages,
};
pub use fallback::FallbackHandler;
pub use hooks::{DecisionHook, NoopDecisionHook, TracingDecisionHook};
pub use payload::{ScriptPayload, ScriptRequest};
pub use policy::{
    LimitOverride, PolicyResolver, PolicySnapshot, PolicyStore, TenantRecord, TenantStatus,
};
pub use result::{QuotaCounters, ScriptResult, WindowCounters};

/// Which dimensions a counter applies to. The scope decides whether the
/// user and API path segments of the counting key are mandatory.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    Tenant,
    TenantUser,
    TenantApi,
}

impl LimitScope {
    /// Identifier embedded into the counting key. Must remain stable:
    /// keys already written to the store depend on it.
    pub fn code(&self) -> &'static str {
        match self {
            LimitScope::Tenant => "tenant",
            LimitScope::TenantUser => "tenant_user",
            LimitScope::TenantApi => "tenant_api",
        }
    }

    pub fn requires_user_id(&self) -> bool {
        matches!(self, LimitScope::TenantUser)
    }

    pub fn requires_api_path(&self) -> bool {
        matches!(self, LimitScope::TenantApi)
    }
}

/// What is being limited: the dimension tuple identifying one counter family.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct LimitDimensions {
    pub scope: LimitScope,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub api_path: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        };
        write!(f, "{s}")
    }
}

/// Sliding-window granularities. Each window is approximated by two fixed
/// buckets (current + previous) blended by elapsed time, so the bucket label
/// format and the duration must stay in lockstep.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitWindow {
    Second,
    Minute,
    Day,
}

impl RateLimitWindow {
    pub fn duration_seconds(&self) -> i64 {
        match self {
            RateLimitWindow::Second => 1,
            RateLimitWindow::Minute => 60,
            RateLimitWindow::Day => 86_400,
        }
    }

    /// UTC bucket label used as the final key segment. Formatting already
    /// truncates to the window granularity.
    pub fn bucket_label(&self, timestamp: DateTime<Utc>) -> String {
        let pattern = match self {
            RateLimitWindow::Second => "%Y%m%d%H%M%S",
            RateLimitWindow::Minute => "%Y%m%d%H%M",
            RateLimitWindow::Day => "%Y%m%d",
        };
        timestamp.format(pattern).to_string()
    }

    /// Start of the bucket containing `timestamp` (UTC truncation).
    pub fn bucket_start(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let duration = self.duration_seconds();
        let into_bucket = timestamp.timestamp().rem_euclid(duration);
        let truncated = timestamp - TimeDelta::seconds(into_bucket);
        // Drop subsecond precision as well
        truncated - TimeDelta::nanoseconds(i64::from(truncated.timestamp_subsec_nanos()))
    }
}

/// Cumulative quota periods. Unlike windows these do not slide: the counter
/// resets at the UTC period boundary, so the TTL is "seconds until rollover".
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QuotaPeriod {
    Daily,
    Monthly,
}

impl QuotaPeriod {
    pub fn bucket_label(&self, timestamp: DateTime<Utc>) -> String {
        let pattern = match self {
            QuotaPeriod::Daily => "%Y%m%d",
            QuotaPeriod::Monthly => "%Y%m",
        };
        timestamp.format(pattern).to_string()
    }

    /// Seconds until the next UTC period boundary, floored at 1 so the
    /// counter always carries a TTL.
    pub fn seconds_until_rollover(&self, timestamp: DateTime<Utc>) -> i64 {
        let boundary = match self {
            QuotaPeriod::Daily => start_of_next_day(timestamp),
            QuotaPeriod::Monthly => start_of_next_month(timestamp),
        };
        boundary
            .map(|next| (next - timestamp).num_seconds().max(1))
            .unwrap_or(1)
    }
}

fn start_of_next_day(timestamp: DateTime<Utc>) -> Option<DateTime<Utc>> {
    timestamp
        .date_naive()
        .succ_opt()?
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
}

fn start_of_next_month(timestamp: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let date = timestamp.date_naive();
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_scope_requirements() {
        assert!(!LimitScope::Tenant.requires_user_id());
        assert!(!LimitScope::Tenant.requires_api_path());
        assert!(LimitScope::TenantUser.requires_user_id());
        assert!(!LimitScope::TenantUser.requires_api_path());
        assert!(!LimitScope::TenantApi.requires_user_id());
        assert!(LimitScope::TenantApi.requires_api_path());
    }

    #[test]
    fn test_window_bucket_labels() {
        let timestamp = ts("2025-11-23T10:15:30.250Z");
        assert_eq!(
            RateLimitWindow::Second.bucket_label(timestamp),
            "20251123101530"
        );
        assert_eq!(
            RateLimitWindow::Minute.bucket_label(timestamp),
            "202511231015"
        );
        assert_eq!(RateLimitWindow::Day.bucket_label(timestamp), "20251123");
    }

    #[test]
    fn test_window_bucket_start_truncates_to_utc_boundary() {
        let timestamp = ts("2025-11-23T10:15:30.250Z");
        assert_eq!(
            RateLimitWindow::Second.bucket_start(timestamp),
            ts("2025-11-23T10:15:30Z")
        );
        assert_eq!(
            RateLimitWindow::Minute.bucket_start(timestamp),
            ts("2025-11-23T10:15:00Z")
        );
        assert_eq!(
            RateLimitWindow::Day.bucket_start(timestamp),
            ts("2025-11-23T00:00:00Z")
        );
    }

    #[test]
    fn test_quota_bucket_labels() {
        let timestamp = ts("2025-11-23T10:15:30Z");
        assert_eq!(QuotaPeriod::Daily.bucket_label(timestamp), "20251123");
        assert_eq!(QuotaPeriod::Monthly.bucket_label(timestamp), "202511");
    }

    #[test]
    fn test_daily_quota_rollover_seconds() {
        let timestamp = ts("2025-11-23T23:59:30Z");
        assert_eq!(QuotaPeriod::Daily.seconds_until_rollover(timestamp), 30);
    }

    #[test]
    fn test_monthly_quota_rollover_crosses_year() {
        let timestamp = ts("2025-12-31T23:59:00Z");
        assert_eq!(QuotaPeriod::Monthly.seconds_until_rollover(timestamp), 60);
    }

    #[test]
    fn test_quota_rollover_floors_at_one_second() {
        // 500ms before midnight truncates to 0 whole seconds
        let timestamp = ts("2025-11-23T23:59:59.500Z");
        assert_eq!(QuotaPeriod::Daily.seconds_until_rollover(timestamp), 1);
    }

    #[test]
    fn test_http_method_display() {
        assert_eq!(HttpMethod::Get.to_string(), "GET");
        assert_eq!(HttpMethod::Delete.to_string(), "DELETE");
    }
}
