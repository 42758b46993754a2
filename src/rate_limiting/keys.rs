//! Deterministic counting-key construction.
//!
//! Keys are colon-delimited, so every raw input segment is validated and
//! rejected rather than escaped. Escaping would let two logically distinct
//! dimension tuples normalize to the same key.

use chrono::{DateTime, Utc};

use crate::error::{Error, ErrorDetails};
use crate::rate_limiting::{LimitDimensions, QuotaPeriod, RateLimitWindow};

/// Segment used when a scope has no user dimension.
pub const USER_PLACEHOLDER: &str = "-";
/// Segment used when a scope applies to every API path.
pub const API_WILDCARD: &str = "*";

/// `rl:{scope}:{tenant}:{user}:{api}:{bucket}`
pub fn rate_limit_key(
    dimensions: &LimitDimensions,
    window: RateLimitWindow,
    timestamp: DateTime<Utc>,
) -> Result<String, Error> {
    let segments = normalize(dimensions)?;
    Ok(compose("rl", &segments, &window.bucket_label(timestamp)))
}

/// `qt:{scope}:{tenant}:{user}:{api}:{period}`
pub fn quota_key(
    dimensions: &LimitDimensions,
    period: QuotaPeriod,
    timestamp: DateTime<Utc>,
) -> Result<String, Error> {
    let segments = normalize(dimensions)?;
    Ok(compose("qt", &segments, &period.bucket_label(timestamp)))
}

struct NormalizedSegments {
    scope_code: &'static str,
    tenant: String,
    user: String,
    api_path: String,
}

fn normalize(dimensions: &LimitDimensions) -> Result<NormalizedSegments, Error> {
    let scope = dimensions.scope;
    let tenant = sanitize_identifier("tenant_id", Some(dimensions.tenant_id.as_str()))?;

    // The scope decides whether the segment is mandatory; an optional value
    // supplied anyway still participates in the key.
    let user = if scope.requires_user_id() || dimensions.user_id.is_some() {
        sanitize_identifier("user_id", dimensions.user_id.as_deref())?
    } else {
        USER_PLACEHOLDER.to_string()
    };

    let api_path = if scope.requires_api_path() || dimensions.api_path.is_some() {
        sanitize_api_path(dimensions.api_path.as_deref())?
    } else {
        API_WILDCARD.to_string()
    };

    Ok(NormalizedSegments {
        scope_code: scope.code(),
        tenant,
        user,
        api_path,
    })
}

fn compose(prefix: &str, segments: &NormalizedSegments, bucket: &str) -> String {
    format!(
        "{prefix}:{}:{}:{}:{}:{bucket}",
        segments.scope_code, segments.tenant, segments.user, segments.api_path
    )
}

fn sanitize_identifier(field: &str, raw: Option<&str>) -> Result<String, Error> {
    let trimmed = raw.map(str::trim).unwrap_or_default();
    if trimmed.is_empty() {
        return Err(invalid_key(field, "value is required to build a counting key"));
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(invalid_key(field, "contains characters outside [A-Za-z0-9._-]"));
    }
    Ok(trimmed.to_string())
}

fn sanitize_api_path(raw: Option<&str>) -> Result<String, Error> {
    let trimmed = raw.map(str::trim).unwrap_or_default();
    if trimmed.is_empty() {
        return Err(invalid_key(
            "api_path",
            "value is required to build a counting key",
        ));
    }
    if trimmed == API_WILDCARD {
        return Ok(API_WILDCARD.to_string());
    }
    if trimmed.contains(':') {
        return Err(invalid_key("api_path", "must not contain ':'"));
    }

    // Collapse repeated slashes, force a leading slash, strip the trailing
    // slash unless the path is the root.
    let mut normalized = String::with_capacity(trimmed.len() + 1);
    if !trimmed.starts_with('/') {
        normalized.push('/');
    }
    let mut previous_was_slash = false;
    for c in trimmed.chars() {
        if c == '/' {
            if !previous_was_slash {
                normalized.push('/');
            }
            previous_was_slash = true;
        } else {
            normalized.push(c);
            previous_was_slash = false;
        }
    }
    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }

    let valid = normalized.starts_with('/')
        && normalized[1..]
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '*' | '/' | '-'));
    if !valid {
        return Err(invalid_key(
            "api_path",
            "contains characters outside [A-Za-z0-9._*/-]",
        ));
    }
    Ok(normalized)
}

fn invalid_key(field: &str, message: &str) -> Error {
    Error::new(ErrorDetails::InvalidKey {
        field: field.to_string(),
        message: message.to_string(),
    })
}
