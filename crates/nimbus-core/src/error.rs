//! Error taxonomy shared by all services.

use nimbus_state::StateError;
use thiserror::Error;

use crate::backend::BackendError;

pub type CoreResult<T> = Result<T, CoreError>;

/// Errors returned by service operations. Every variant carries a
/// user-safe message.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid port format: {0}")]
    InvalidPortFormat(String),

    #[error("too many ports: {count} (max {max})")]
    TooManyPorts { count: usize, max: usize },

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification used for status mapping and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unauthorized,
    Forbidden,
    InvalidInput,
    NotFound,
    Conflict,
    ResourceLimitExceeded,
    InvalidState,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::ResourceLimitExceeded => "resource_limit_exceeded",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Internal => "internal",
        }
    }
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Unauthorized(_) => ErrorKind::Unauthorized,
            CoreError::Forbidden(_) => ErrorKind::Forbidden,
            CoreError::InvalidInput(_)
            | CoreError::InvalidPortFormat(_)
            | CoreError::TooManyPorts { .. } => ErrorKind::InvalidInput,
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::Conflict(_) => ErrorKind::Conflict,
            CoreError::ResourceLimitExceeded(_) => ErrorKind::ResourceLimitExceeded,
            CoreError::InvalidState(_) => ErrorKind::InvalidState,
            CoreError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::InvalidInput => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict | ErrorKind::InvalidState => 409,
            ErrorKind::ResourceLimitExceeded => 429,
            ErrorKind::Internal => 500,
        }
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        CoreError::NotFound(what.to_string())
    }
}

impl From<StateError> for CoreError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound(what) => CoreError::NotFound(what),
            other => CoreError::Internal(other.to_string()),
        }
    }
}

impl From<BackendError> for CoreError {
    fn from(err: BackendError) -> Self {
        CoreError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Internal(format!("serialization: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_state::StoreOp;

    #[test]
    fn port_errors_are_invalid_input() {
        let err = CoreError::TooManyPorts { count: 11, max: 10 };
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(err.http_status(), 400);
        assert_eq!(CoreError::InvalidPortFormat("x".into()).http_status(), 400);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(CoreError::Unauthorized("locked".into()).http_status(), 401);
        assert_eq!(CoreError::Forbidden("no".into()).http_status(), 403);
        assert_eq!(CoreError::not_found("group").http_status(), 404);
        assert_eq!(CoreError::InvalidState("terminated".into()).http_status(), 409);
        assert_eq!(CoreError::ResourceLimitExceeded("quota".into()).http_status(), 429);
        assert_eq!(CoreError::Internal("boom".into()).http_status(), 500);
    }

    #[test]
    fn state_errors_map_to_kinds() {
        let nf: CoreError = StateError::NotFound("tenant".into()).into();
        assert_eq!(nf.kind(), ErrorKind::NotFound);
        let io: CoreError = StateError::storage(StoreOp::Write, "disk full").into();
        assert_eq!(io.kind(), ErrorKind::Internal);
    }
}
