//! Observation hooks invoked after each admission decision.
//!
//! Hooks are fire-and-forget: they must never fail the admission path, so
//! the trait is infallible and implementations swallow their own errors.
//! Persistence of limit-hit audit records lives behind this seam.

use crate::rate_limiting::check::{RateLimitCheckResult, RateLimitCommand};

pub trait DecisionHook: Send + Sync {
    /// Called for every completed evaluation.
    fn record(&self, command: &RateLimitCommand, result: &RateLimitCheckResult);

    /// Called additionally when the decision blocked the request.
    fn limit_hit(&self, command: &RateLimitCommand, result: &RateLimitCheckResult);
}

pub struct NoopDecisionHook;

impl DecisionHook for NoopDecisionHook {
    fn record(&self, _command: &RateLimitCommand, _result: &RateLimitCheckResult) {}

    fn limit_hit(&self, _command: &RateLimitCommand, _result: &RateLimitCheckResult) {}
}

/// Emits a structured tracing event per decision and a warn-level event on
/// blocks, carrying enough fields to reconstruct the decision downstream.
pub struct TracingDecisionHook;

impl DecisionHook for TracingDecisionHook {
    fn record(&self, command: &RateLimitCommand, result: &RateLimitCheckResult) {
        tracing::debug!(
            tenant_id = command.tenant_id,
            user_id = ?command.user_id,
            api_path = ?command.api_path,
            scope = command.scope.code(),
            decision = ?result.decision,
            allowed = result.allowed,
            fallback_applied = result.fallback_applied,
            "rate limit decision"
        );
    }

    fn limit_hit(&self, command: &RateLimitCommand, result: &RateLimitCheckResult) {
        // Usage details go out as JSON so log pipelines can index them
        let windows = serde_json::to_string(&result.windows).unwrap_or_default();
        let quotas = serde_json::to_string(&result.quotas).unwrap_or_default();
        tracing::warn!(
            tenant_id = command.tenant_id,
            user_id = ?command.user_id,
            api_path = ?command.api_path,
            scope = command.scope.code(),
            decision = ?result.decision,
            fallback_applied = result.fallback_applied,
            windows,
            quotas,
            occurred_at = %command.timestamp,
            "request blocked by rate limit"
        );
    }
}
