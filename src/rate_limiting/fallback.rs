//! Degraded-mode evaluation used when the counting store is unreachable.
//!
//! The static-limit policy keeps approximate per-instance counters in
//! memory, keyed by the same strings the real store would use (prefixed
//! `fallback:`) so the two paths stay directly comparable. Counters are
//! per-process: with multiple instances the effective limit scales with the
//! instance count, which is accepted for a degraded mode.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;

use crate::config::{FallbackConfig, FallbackPolicy};
use crate::error::Error;
use crate::rate_limiting::keys::{quota_key, rate_limit_key};
use crate::rate_limiting::payload::{normalized_limit, ScriptRequest};
use crate::rate_limiting::result::{QuotaCounters, ScriptResult, WindowCounters};
use crate::rate_limiting::{QuotaPeriod, RateLimitWindow};

struct FallbackBucket {
    expires_at: DateTime<Utc>,
    counter: AtomicI64,
}

impl FallbackBucket {
    fn new(expires_at: DateTime<Utc>) -> Self {
        FallbackBucket {
            expires_at,
            counter: AtomicI64::new(0),
        }
    }
}

pub struct FallbackHandler {
    config: FallbackConfig,
    buckets: DashMap<String, FallbackBucket>,
}

impl FallbackHandler {
    pub fn new(config: FallbackConfig) -> Self {
        FallbackHandler {
            config,
            buckets: DashMap::new(),
        }
    }

    pub fn policy(&self) -> FallbackPolicy {
        self.config.policy
    }

    pub fn handle(&self, request: &ScriptRequest) -> Result<ScriptResult, Error> {
        match self.config.policy {
            FallbackPolicy::AllowAll => Ok(self.fixed_result(request, true)),
            FallbackPolicy::BlockAll => Ok(self.fixed_result(request, false)),
            FallbackPolicy::StaticLimit => self.static_limit_result(request),
        }
    }

    /// AllowAll reports zero counts; BlockAll reports the limit itself so
    /// callers see the dimension as exactly exhausted.
    fn fixed_result(&self, request: &ScriptRequest, allowed: bool) -> ScriptResult {
        ScriptResult {
            second: fixed_window(allowed, request.limit_per_second),
            minute: fixed_window(allowed, request.limit_per_minute),
            day: fixed_window(allowed, request.limit_per_day),
            daily_quota: fixed_quota(allowed, request.quota_per_day),
            monthly_quota: fixed_quota(allowed, request.quota_per_month),
        }
    }

    fn static_limit_result(&self, request: &ScriptRequest) -> Result<ScriptResult, Error> {
        let timestamp = request.timestamp;
        self.sweep_expired(timestamp);
        let config = &self.config;
        Ok(ScriptResult {
            second: self.static_window(
                request,
                RateLimitWindow::Second,
                config.static_limit_per_second.or(request.limit_per_second),
            )?,
            minute: self.static_window(
                request,
                RateLimitWindow::Minute,
                config.static_limit_per_minute.or(request.limit_per_minute),
            )?,
            day: self.static_window(
                request,
                RateLimitWindow::Day,
                config.static_limit_per_day.or(request.limit_per_day),
            )?,
            daily_quota: self.static_quota(
                request,
                QuotaPeriod::Daily,
                config.static_quota_per_day.or(request.quota_per_day),
            )?,
            monthly_quota: self.static_quota(
                request,
                QuotaPeriod::Monthly,
                config.static_quota_per_month.or(request.quota_per_month),
            )?,
        })
    }

    fn static_window(
        &self,
        request: &ScriptRequest,
        window: RateLimitWindow,
        limit: Option<i64>,
    ) -> Result<Option<WindowCounters>, Error> {
        let limit = normalized_limit(limit);
        if limit <= 0 {
            return Ok(None);
        }
        let bucket_start = window.bucket_start(request.timestamp);
        let expires_at = bucket_start + TimeDelta::seconds(window.duration_seconds());
        let key = format!(
            "fallback:{}",
            rate_limit_key(&request.dimensions, window, bucket_start)?
        );
        let count = self.count(key, request, expires_at);
        Ok(Some(WindowCounters {
            allowed: count <= limit,
            effective_count: count,
            current_bucket_count: count,
            previous_bucket_count: 0,
        }))
    }

    fn static_quota(
        &self,
        request: &ScriptRequest,
        period: QuotaPeriod,
        limit: Option<i64>,
    ) -> Result<Option<QuotaCounters>, Error> {
        let limit = normalized_limit(limit);
        if limit <= 0 {
            return Ok(None);
        }
        let expires_at = request.timestamp
            + TimeDelta::seconds(period.seconds_until_rollover(request.timestamp));
        let key = format!(
            "fallback:{}",
            quota_key(&request.dimensions, period, request.timestamp)?
        );
        let total = self.count(key, request, expires_at);
        Ok(Some(QuotaCounters {
            allowed: total <= limit,
            total_count: total,
        }))
    }

    /// Increments the bucket under the shard entry lock, replacing it when
    /// a newer bucket period supersedes it. Note the second condition also
    /// replaces a still-live bucket whose stored expiry lands marginally
    /// earlier than the newly computed one (quota expiries are truncated to
    /// whole seconds), so a quota counter can reset early within its period.
    fn count(&self, key: String, request: &ScriptRequest, expires_at: DateTime<Utc>) -> i64 {
        let mut bucket = self
            .buckets
            .entry(key)
            .or_insert_with(|| FallbackBucket::new(expires_at));
        if bucket.expires_at < request.timestamp || bucket.expires_at < expires_at {
            *bucket = FallbackBucket::new(expires_at);
        }
        bucket.counter.fetch_add(request.increment, Ordering::Relaxed) + request.increment
    }

    fn sweep_expired(&self, now: DateTime<Utc>) {
        self.buckets.retain(|_, bucket| bucket.expires_at >= now);
    }
}

fn fixed_window(allowed: bool, limit: Option<i64>) -> Option<WindowCounters> {
    let limit = normalized_limit(limit);
    if limit <= 0 {
        return None;
    }
    Some(WindowCounters {
        allowed,
        effective_count: if allowed { 0 } else { limit },
        current_bucket_count: 0,
        previous_bucket_count: 0,
    })
}

fn fixed_quota(allowed: bool, limit: Option<i64>) -> Option<QuotaCounters> {
    let limit = normalized_limit(limit);
    if limit <= 0 {
        return None;
    }
    Some(QuotaCounters {
        allowed,
        total_count: if allowed { 0 } else { limit },
    })
}
