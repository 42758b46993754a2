//! Deserializable configuration for the evaluation engine.
//!
//! Only the degraded-mode behavior is configured here. Limit values
//! themselves come from the policy resolver at request time, not from
//! static configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};

/// What the engine does when the counting store cannot be reached.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Admit everything. Counters are reported as zero.
    #[default]
    AllowAll,
    /// Reject everything that carries at least one enabled limit.
    BlockAll,
    /// Enforce conservative static limits from in-memory counters.
    StaticLimit,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FallbackConfig {
    #[serde(default)]
    pub policy: FallbackPolicy,
    /// Static limits used by `FallbackPolicy::StaticLimit`. Each configured
    /// value overrides the corresponding limit from the request's policy.
    #[serde(default)]
    pub static_limit_per_second: Option<i64>,
    #[serde(default)]
    pub static_limit_per_minute: Option<i64>,
    #[serde(default)]
    pub static_limit_per_day: Option<i64>,
    #[serde(default)]
    pub static_quota_per_day: Option<i64>,
    #[serde(default)]
    pub static_quota_per_month: Option<i64>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TenantGateConfig {
    #[serde(default)]
    pub fallback: FallbackConfig,
}

impl TenantGateConfig {
    pub fn from_toml(contents: &str) -> Result<Self, Error> {
        toml::from_str(contents).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("failed to parse configuration: {e}"),
            })
        })
    }
}
