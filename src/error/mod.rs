use std::sync::Arc;

use http::StatusCode;
use serde::Serialize;
use thiserror::Error;

#[derive(Clone, Debug, Error, Serialize)]
#[cfg_attr(test, derive(PartialEq))]
#[error(transparent)]
// As long as the struct member is private, we force people to use the `new`
// method and log the error. We arc `ErrorDetails` to make it cloneable.
pub struct Error(Arc<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Arc::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn log(&self) {
        self.0.log();
    }

    /// Only `StoreUnreachable` should divert the admission path into the
    /// fallback handler. Script bugs and caller errors are surfaced as-is.
    pub fn triggers_fallback(&self) -> bool {
        matches!(self.get_details(), ErrorDetails::StoreUnreachable { .. })
    }
}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, Error, Serialize)]
#[cfg_attr(test, derive(PartialEq))]
pub enum ErrorDetails {
    Config {
        message: String,
    },
    InvalidKey {
        field: String,
        message: String,
    },
    InvalidRequest {
        message: String,
    },
    MalformedResult {
        message: String,
    },
    ScriptIntegrity {
        expected: String,
        loaded: String,
    },
    StoreExecutionFailure {
        message: String,
    },
    StoreUnreachable {
        message: String,
    },
    TenantInactive {
        tenant_id: String,
        status: String,
    },
    TenantNotFound {
        tenant_id: String,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::InvalidKey { .. } => tracing::Level::WARN,
            ErrorDetails::InvalidRequest { .. } => tracing::Level::WARN,
            ErrorDetails::MalformedResult { .. } => tracing::Level::ERROR,
            ErrorDetails::ScriptIntegrity { .. } => tracing::Level::ERROR,
            ErrorDetails::StoreExecutionFailure { .. } => tracing::Level::ERROR,
            ErrorDetails::StoreUnreachable { .. } => tracing::Level::WARN,
            ErrorDetails::TenantInactive { .. } => tracing::Level::WARN,
            ErrorDetails::TenantNotFound { .. } => tracing::Level::WARN,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InvalidKey { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::MalformedResult { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::ScriptIntegrity { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::StoreExecutionFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::StoreUnreachable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::TenantInactive { .. } => StatusCode::FORBIDDEN,
            ErrorDetails::TenantNotFound { .. } => StatusCode::NOT_FOUND,
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::Config { message } => {
                write!(f, "Configuration error: {message}")
            }
            ErrorDetails::InvalidKey { field, message } => {
                write!(f, "Invalid counting key segment `{field}`: {message}")
            }
            ErrorDetails::InvalidRequest { message } => {
                write!(f, "Invalid rate limit request: {message}")
            }
            ErrorDetails::MalformedResult { message } => {
                write!(f, "Malformed limit script result: {message}")
            }
            ErrorDetails::ScriptIntegrity { expected, loaded } => {
                write!(
                    f,
                    "Limit script hash mismatch: the store reported `{loaded}` but this \
                     instance computed `{expected}`. Refusing to serve with divergent \
                     script semantics."
                )
            }
            ErrorDetails::StoreExecutionFailure { message } => {
                write!(f, "Counting store script execution failed: {message}")
            }
            ErrorDetails::StoreUnreachable { message } => {
                write!(f, "Counting store unreachable: {message}")
            }
            ErrorDetails::TenantInactive { tenant_id, status } => {
                write!(
                    f,
                    "Tenant `{tenant_id}` is not allowed to send traffic (status: {status})"
                )
            }
            ErrorDetails::TenantNotFound { tenant_id } => {
                write!(f, "Tenant `{tenant_id}` not found")
            }
        }
    }
}
