//! Error taxonomy for flows.
//!
//! [`StepError`] is what an intent returns. The engine folds it into
//! [`FlowError`], which is what callers of the service see: `Eof` never
//! leaves the engine (it becomes a finished output) and `NoChange` is reported
//! as [`FlowError::InvalidInputKind`].

use thiserror::Error;

use super::registry::RegistryError;
use super::store::StoreError;

/// Step-specific failures. They are returned to the client verbatim,
/// together with the state the flow is still in.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("invalid verification code")]
    InvalidCode,
    #[error("verification code expired")]
    CodeExpired,
    #[error("too many failed attempts, request a new code")]
    Locked,
    #[error("rate limited")]
    RateLimited,
    #[error("resend cooldown active: {remaining_seconds}s remaining")]
    ResendCooldown { remaining_seconds: u64 },
    #[error("user already exists")]
    UserExists,
    #[error("user not found")]
    UserNotFound,
    #[error("password must be at least {min_length} characters")]
    PasswordPolicy { min_length: usize },
}

impl DomainError {
    /// Stable discriminator exposed as `reason` on the wire.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "InvalidCredentials",
            Self::InvalidCode => "InvalidCode",
            Self::CodeExpired => "CodeExpired",
            Self::Locked => "Locked",
            Self::RateLimited => "RateLimited",
            Self::ResendCooldown { .. } => "ResendCooldown",
            Self::UserExists => "UserExists",
            Self::UserNotFound => "UserNotFound",
            Self::PasswordPolicy { .. } => "PasswordPolicy",
        }
    }
}

/// Errors returned by [`super::Intent`] implementations.
#[derive(Debug, Error)]
pub enum StepError {
    /// The flow already finished; nothing is appended.
    #[error("flow finished")]
    Eof,
    /// The step ignored the input.
    #[error("input did not change the flow")]
    NoChange,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Errors surfaced by the engine and the flow service.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("input kind `{got}` is not accepted, expected one of {expected:?}")]
    InvalidInputKind { got: String, expected: Vec<String> },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("flow state is stale, refresh and retry")]
    Conflict,
    #[error("flow not found")]
    NotFound,
    #[error("flow definition not found: {0}")]
    UnknownFlow(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl FlowError {
    /// Stable discriminator exposed as `reason` on the wire.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidInputKind { .. } => "InvalidInputKind",
            Self::InvalidInput(_) => "InvalidInput",
            Self::Registry(RegistryError::UnknownKind(_)) => "UnknownKind",
            Self::Registry(_) => "InvalidInput",
            Self::Conflict => "Conflict",
            Self::NotFound => "NotFound",
            Self::UnknownFlow(_) => "FlowNotFound",
            Self::Domain(err) => err.reason(),
            Self::Internal(_) => "InternalError",
        }
    }

    /// Whether the client can render this error next to the current state.
    #[must_use]
    pub const fn carries_state(&self) -> bool {
        matches!(
            self,
            Self::InvalidInputKind { .. } | Self::InvalidInput(_) | Self::Domain(_)
        )
    }
}

impl From<StoreError> for FlowError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::NotFound,
            StoreError::Conflict => Self::Conflict,
            other => Self::Internal(anyhow::Error::new(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_flow_errors() {
        assert!(matches!(
            FlowError::from(StoreError::NotFound),
            FlowError::NotFound
        ));
        assert!(matches!(
            FlowError::from(StoreError::Conflict),
            FlowError::Conflict
        ));
        let internal = FlowError::from(StoreError::Database("boom".to_string()));
        assert_eq!(internal.reason(), "InternalError");
    }

    #[test]
    fn reasons_are_stable() {
        assert_eq!(
            FlowError::InvalidInputKind {
                got: "x".to_string(),
                expected: vec![],
            }
            .reason(),
            "InvalidInputKind"
        );
        assert_eq!(
            FlowError::Registry(RegistryError::UnknownKind("verify".to_string())).reason(),
            "UnknownKind"
        );
        assert_eq!(
            FlowError::Domain(DomainError::ResendCooldown {
                remaining_seconds: 3
            })
            .reason(),
            "ResendCooldown"
        );
        assert!(FlowError::Domain(DomainError::InvalidCode).carries_state());
        assert!(!FlowError::Conflict.carries_state());
    }
}
