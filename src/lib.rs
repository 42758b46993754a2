//! Multi-tenant rate limit and quota evaluation engine.
//!
//! The admission path is a single atomic Lua script executed against a
//! Redis-compatible store: three two-bucket sliding windows (second, minute,
//! day) plus two cumulative quotas (daily, monthly) are incremented and
//! checked in one round trip. When the store is unreachable, a configurable
//! fallback handler keeps the admission path available.

pub mod config;
pub mod db;
pub mod error;
pub mod rate_limiting;
