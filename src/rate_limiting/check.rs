//! Admission decision orchestration.
//!
//! `RateLimiter::evaluate` drives one script round trip and derives the
//! decision; `RateLimitGate::check` additionally resolves the policy
//! snapshot first, which is the usual entry point for callers that only
//! know the request dimensions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::RateLimitScriptQueries;
use crate::error::Error;
use crate::rate_limiting::fallback::FallbackHandler;
use crate::rate_limiting::hooks::DecisionHook;
use crate::rate_limiting::payload::{build_payload, ScriptRequest};
use crate::rate_limiting::policy::{PolicyResolver, PolicySnapshot, PolicyStore};
use crate::rate_limiting::result::{map_script_result, ScriptResult};
use crate::rate_limiting::{HttpMethod, LimitDimensions, LimitScope};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitDecision {
    Allowed,
    RateLimitExceeded,
    QuotaExceeded,
    FallbackAllow,
    FallbackBlock,
}

/// One evaluation request with its already-resolved policy snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitCommand {
    pub scope: LimitScope,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub api_path: Option<String>,
    pub http_method: HttpMethod,
    pub timestamp: DateTime<Utc>,
    pub increment: i64,
    pub policy: PolicySnapshot,
}

/// Evaluation request for `RateLimitGate`, before policy resolution.
#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitCheckInput {
    pub scope: LimitScope,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub api_path: Option<String>,
    pub http_method: HttpMethod,
    pub timestamp: DateTime<Utc>,
    pub increment: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct WindowUsage {
    pub allowed: bool,
    pub limit: Option<i64>,
    pub effective_count: i64,
    pub current_bucket_count: i64,
    pub previous_bucket_count: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct QuotaUsage {
    pub allowed: bool,
    pub limit: Option<i64>,
    pub total_count: i64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct WindowUsages {
    pub second: Option<WindowUsage>,
    pub minute: Option<WindowUsage>,
    pub day: Option<WindowUsage>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct QuotaUsages {
    pub daily: Option<QuotaUsage>,
    pub monthly: Option<QuotaUsage>,
}

/// Aggregate outcome of one evaluation. Constructed fresh per call and
/// never persisted by the engine itself.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct RateLimitCheckResult {
    pub decision: RateLimitDecision,
    pub allowed: bool,
    pub windows: WindowUsages,
    pub quotas: QuotaUsages,
    pub fallback_applied: bool,
}

pub struct RateLimiter<S> {
    store: S,
    fallback: FallbackHandler,
    hook: Arc<dyn DecisionHook>,
}

impl<S: RateLimitScriptQueries> RateLimiter<S> {
    pub fn new(store: S, fallback: FallbackHandler, hook: Arc<dyn DecisionHook>) -> Self {
        RateLimiter {
            store,
            fallback,
            hook,
        }
    }

    pub async fn evaluate(&self, command: &RateLimitCommand) -> Result<RateLimitCheckResult, Error> {
        let request = script_request(command);
        let payload = build_payload(&request)?;

        let (script_result, fallback_applied) = match self.store.run_limit_script(&payload).await {
            Ok(raw) => (map_script_result(&request, &raw)?, false),
            Err(error) if error.triggers_fallback() => (self.fallback.handle(&request)?, true),
            Err(error) => return Err(error),
        };

        let windows = map_windows(&script_result, &command.policy);
        let quotas = map_quotas(&script_result, &command.policy);
        let allowed = is_allowed(&windows, &quotas);
        let decision = derive_decision(&windows, &quotas, allowed, fallback_applied);
        let result = RateLimitCheckResult {
            decision,
            allowed,
            windows,
            quotas,
            fallback_applied,
        };

        self.hook.record(command, &result);
        if !result.allowed {
            self.hook.limit_hit(command, &result);
        }
        Ok(result)
    }
}

/// Policy resolution plus evaluation in one call.
pub struct RateLimitGate<P, S> {
    resolver: PolicyResolver<P>,
    limiter: RateLimiter<S>,
}

impl<P: PolicyStore, S: RateLimitScriptQueries> RateLimitGate<P, S> {
    pub fn new(resolver: PolicyResolver<P>, limiter: RateLimiter<S>) -> Self {
        RateLimitGate { resolver, limiter }
    }

    pub async fn check(&self, input: RateLimitCheckInput) -> Result<RateLimitCheckResult, Error> {
        let policy = self
            .resolver
            .resolve(
                &input.tenant_id,
                input.http_method,
                input.api_path.as_deref(),
            )
            .await?;
        let command = RateLimitCommand {
            scope: input.scope,
            tenant_id: input.tenant_id,
            user_id: input.user_id,
            api_path: input.api_path,
            http_method: input.http_method,
            timestamp: input.timestamp,
            increment: input.increment,
            policy,
        };
        self.limiter.evaluate(&command).await
    }
}

fn script_request(command: &RateLimitCommand) -> ScriptRequest {
    ScriptRequest {
        dimensions: LimitDimensions {
            scope: command.scope,
            tenant_id: command.tenant_id.clone(),
            user_id: command.user_id.clone(),
            api_path: command.api_path.clone(),
        },
        timestamp: command.timestamp,
        limit_per_second: command.policy.limit_per_second,
        limit_per_minute: command.policy.limit_per_minute,
        limit_per_day: command.policy.limit_per_day,
        quota_per_day: command.policy.quota_per_day,
        quota_per_month: command.policy.quota_per_month,
        increment: command.increment,
    }
}

fn map_windows(result: &ScriptResult, policy: &PolicySnapshot) -> WindowUsages {
    let usage = |counters: &Option<crate::rate_limiting::result::WindowCounters>,
                 limit: Option<i64>| {
        counters.map(|window| WindowUsage {
            allowed: window.allowed,
            limit,
            effective_count: window.effective_count,
            current_bucket_count: window.current_bucket_count,
            previous_bucket_count: window.previous_bucket_count,
        })
    };
    WindowUsages {
        second: usage(&result.second, policy.limit_per_second),
        minute: usage(&result.minute, policy.limit_per_minute),
        day: usage(&result.day, policy.limit_per_day),
    }
}

fn map_quotas(result: &ScriptResult, policy: &PolicySnapshot) -> QuotaUsages {
    let usage = |counters: &Option<crate::rate_limiting::result::QuotaCounters>,
                 limit: Option<i64>| {
        counters.map(|quota| QuotaUsage {
            allowed: quota.allowed,
            limit,
            total_count: quota.total_count,
        })
    };
    QuotaUsages {
        daily: usage(&result.daily_quota, policy.quota_per_day),
        monthly: usage(&result.monthly_quota, policy.quota_per_month),
    }
}

/// Absent dimensions are vacuously allowed.
fn is_allowed(windows: &WindowUsages, quotas: &QuotaUsages) -> bool {
    [windows.second, windows.minute, windows.day]
        .iter()
        .flatten()
        .all(|usage| usage.allowed)
        && [quotas.daily, quotas.monthly]
            .iter()
            .flatten()
            .all(|usage| usage.allowed)
}

/// Quota exhaustion outranks window exhaustion when both fire; fallback
/// decisions outrank both.
fn derive_decision(
    windows: &WindowUsages,
    quotas: &QuotaUsages,
    allowed: bool,
    fallback_applied: bool,
) -> RateLimitDecision {
    let quota_exceeded = [quotas.daily, quotas.monthly]
        .iter()
        .flatten()
        .any(|usage| !usage.allowed);
    let window_exceeded = [windows.second, windows.minute, windows.day]
        .iter()
        .flatten()
        .any(|usage| !usage.allowed);

    match (fallback_applied, allowed) {
        (true, true) => RateLimitDecision::FallbackAllow,
        (true, false) => RateLimitDecision::FallbackBlock,
        (false, false) if quota_exceeded => RateLimitDecision::QuotaExceeded,
        (false, false) if window_exceeded => RateLimitDecision::RateLimitExceeded,
        _ => RateLimitDecision::Allowed,
    }
}
