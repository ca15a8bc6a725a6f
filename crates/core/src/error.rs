//! Error model shared by every pipeline component.

use thiserror::Error;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (validation, malformed ids).
/// Infrastructure concerns belong to the boundary that raised them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

/// Failure reported by an external collaborator (renderer, platform, webhook).
///
/// - `Transient`: network blip, rate limit, timeout. Retry with backoff.
/// - `Permanent`: bad input, auth failure. Terminal for the job or action.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExternalError {
    #[error("transient external error: {0}")]
    Transient(String),

    #[error("permanent external error: {0}")]
    Permanent(String),
}

impl ExternalError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// The collaborator's message without the classification prefix.
    pub fn reason(&self) -> &str {
        match self {
            Self::Transient(msg) | Self::Permanent(msg) => msg,
        }
    }

    /// Escalate to permanent (used once a retry ceiling is reached).
    pub fn into_permanent(self) -> Self {
        match self {
            Self::Transient(msg) => Self::Permanent(msg),
            permanent => permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalation_keeps_the_reason() {
        let err = ExternalError::transient("rate limited").into_permanent();
        assert!(!err.is_transient());
        assert_eq!(err.reason(), "rate limited");
        assert_eq!(err.to_string(), "permanent external error: rate limited");
    }
}
