//! Policy resolution: which limits apply to one request.
//!
//! Precedence is per field, not per record: a tenant override that only
//! sets the per-minute limit still inherits the remaining limits from the
//! plan override and plan defaults.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};
use crate::rate_limiting::HttpMethod;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Suspended,
    Deleted,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Active => "active",
            TenantStatus::Suspended => "suspended",
            TenantStatus::Deleted => "deleted",
        }
    }
}

/// Tenant record as seen by the evaluation engine: status gate, plan
/// identity, and the plan's default limits.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct TenantRecord {
    pub tenant_id: String,
    pub status: TenantStatus,
    pub plan_id: String,
    pub plan_defaults: PolicySnapshot,
}

/// Partial limit override attached to a tenant or plan for one API route.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct LimitOverride {
    pub limit_per_second: Option<i64>,
    pub limit_per_minute: Option<i64>,
    pub limit_per_day: Option<i64>,
    pub quota_per_day: Option<i64>,
    pub quota_per_month: Option<i64>,
}

/// The resolved, request-scoped limit set consumed by one evaluation.
/// `None` or a non-positive value disables that dimension.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct PolicySnapshot {
    pub limit_per_second: Option<i64>,
    pub limit_per_minute: Option<i64>,
    pub limit_per_day: Option<i64>,
    pub quota_per_day: Option<i64>,
    pub quota_per_month: Option<i64>,
}

/// Backing storage for tenants and per-route overrides. Implemented by an
/// external collaborator (relational database, config service, cache).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn fetch_tenant(&self, tenant_id: &str) -> Result<Option<TenantRecord>, Error>;

    async fn fetch_tenant_override(
        &self,
        tenant_id: &str,
        method: HttpMethod,
        api_path: &str,
    ) -> Result<Option<LimitOverride>, Error>;

    async fn fetch_plan_override(
        &self,
        plan_id: &str,
        method: HttpMethod,
        api_path: &str,
    ) -> Result<Option<LimitOverride>, Error>;
}

pub struct PolicyResolver<S> {
    store: S,
}

impl<S: PolicyStore> PolicyResolver<S> {
    pub fn new(store: S) -> Self {
        PolicyResolver { store }
    }

    /// Validates the tenant and merges overrides into a snapshot. Policy
    /// failures are caller-facing errors and never divert into the
    /// store-outage fallback path.
    pub async fn resolve(
        &self,
        tenant_id: &str,
        method: HttpMethod,
        api_path: Option<&str>,
    ) -> Result<PolicySnapshot, Error> {
        let tenant = self
            .store
            .fetch_tenant(tenant_id)
            .await?
            .ok_or_else(|| {
                Error::new(ErrorDetails::TenantNotFound {
                    tenant_id: tenant_id.to_string(),
                })
            })?;

        if tenant.status != TenantStatus::Active {
            return Err(Error::new(ErrorDetails::TenantInactive {
                tenant_id: tenant_id.to_string(),
                status: tenant.status.as_str().to_string(),
            }));
        }

        let (tenant_override, plan_override) = match api_path {
            Some(path) => (
                self.store
                    .fetch_tenant_override(tenant_id, method, path)
                    .await?,
                self.store
                    .fetch_plan_override(&tenant.plan_id, method, path)
                    .await?,
            ),
            None => (None, None),
        };
        let tenant_override = tenant_override.unwrap_or_default();
        let plan_override = plan_override.unwrap_or_default();
        let defaults = tenant.plan_defaults;

        let snapshot = PolicySnapshot {
            limit_per_second: tenant_override
                .limit_per_second
                .or(plan_override.limit_per_second)
                .or(defaults.limit_per_second),
            limit_per_minute: tenant_override
                .limit_per_minute
                .or(plan_override.limit_per_minute)
                .or(defaults.limit_per_minute),
            limit_per_day: tenant_override
                .limit_per_day
                .or(plan_override.limit_per_day)
                .or(defaults.limit_per_day),
            quota_per_day: tenant_override
                .quota_per_day
                .or(plan_override.quota_per_day)
                .or(defaults.quota_per_day),
            quota_per_month: tenant_override
                .quota_per_month
                .or(plan_override.quota_per_month)
                .or(defaults.quota_per_month),
        };
        tracing::debug!(
            tenant_id,
            ?api_path,
            %method,
            ?snapshot,
            "resolved rate limit policy snapshot"
        );
        Ok(snapshot)
    }
}
