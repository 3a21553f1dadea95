use std::fmt;

/// Authentication failures surfaced by the session manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthError {
    /// Supplied TOTP code did not match any step in the window.
    InvalidCode,
    /// Too many consecutive failures; retry after the given number of seconds.
    LockedOut { retry_after_secs: u64 },
    /// Missing, unknown, expired, or revoked session token.
    Unauthenticated,
    /// A credential already exists and a forced reset was not requested.
    AlreadyEnrolled,
    /// No credential has been enrolled yet.
    NotEnrolled,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::InvalidCode => write!(f, "invalid TOTP code"),
            AuthError::LockedOut { retry_after_secs } => {
                write!(f, "locked out, retry in {retry_after_secs}s")
            }
            AuthError::Unauthenticated => write!(f, "unauthenticated"),
            AuthError::AlreadyEnrolled => write!(f, "TOTP credential already enrolled"),
            AuthError::NotEnrolled => write!(f, "TOTP credential not enrolled"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Sandbox lifecycle failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LifecycleError {
    /// A sandbox is already provisioning, running, or being destroyed.
    Conflict(String),
    /// The operation is not legal in the sandbox's current state.
    StateConflict {
        operation: &'static str,
        state: String,
    },
    /// A provider call exceeded its timeout on every attempt.
    ProviderTimeout(String),
    /// The provider rejected or failed a call.
    ProviderFailure(String),
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleError::Conflict(msg) => write!(f, "conflict: {msg}"),
            LifecycleError::StateConflict { operation, state } => {
                write!(f, "cannot {operation} while sandbox is {state}")
            }
            LifecycleError::ProviderTimeout(msg) => write!(f, "provider timeout: {msg}"),
            LifecycleError::ProviderFailure(msg) => write!(f, "provider failure: {msg}"),
        }
    }
}

impl std::error::Error for LifecycleError {}

/// Network policy validation and enforcement failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PolicyError {
    /// The policy set failed validation; nothing was applied.
    Malformed(String),
    /// Some rules were installed before a failure. `rolled_back` reports whether
    /// the enforcement layer was restored to its pre-apply state.
    PartialApply { reason: String, rolled_back: bool },
    /// The enforcer did not answer within the policy timeout.
    EnforcementTimeout(String),
    /// The enforcer rejected the first call; nothing was applied.
    Enforcement(String),
}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyError::Malformed(msg) => write!(f, "malformed policy: {msg}"),
            PolicyError::PartialApply {
                reason,
                rolled_back,
            } => {
                if *rolled_back {
                    write!(f, "partial apply rolled back: {reason}")
                } else {
                    write!(f, "partial apply, rollback failed: {reason}")
                }
            }
            PolicyError::EnforcementTimeout(msg) => write!(f, "enforcement timeout: {msg}"),
            PolicyError::Enforcement(msg) => write!(f, "enforcement error: {msg}"),
        }
    }
}

impl std::error::Error for PolicyError {}

/// Errors reported by a `CloudProviderClient`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProviderError {
    Timeout(String),
    NotFound(String),
    Api(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Timeout(msg) => write!(f, "timed out: {msg}"),
            ProviderError::NotFound(msg) => write!(f, "not found: {msg}"),
            ProviderError::Api(msg) => write!(f, "api error: {msg}"),
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<ProviderError> for LifecycleError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Timeout(msg) => LifecycleError::ProviderTimeout(msg),
            other => LifecycleError::ProviderFailure(other.to_string()),
        }
    }
}

/// Errors returned by orchestrator operations.
#[derive(Debug)]
pub enum OrchestratorError {
    Auth(AuthError),
    Lifecycle(LifecycleError),
    Policy(PolicyError),
    /// Invalid input or configuration.
    Validation(String),
    /// HTTP request to a collaborator failed.
    Http(String),
    /// Internal storage/state error.
    Storage(String),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::Auth(err) => write!(f, "auth error: {err}"),
            OrchestratorError::Lifecycle(err) => write!(f, "lifecycle error: {err}"),
            OrchestratorError::Policy(err) => write!(f, "policy error: {err}"),
            OrchestratorError::Validation(msg) => write!(f, "validation error: {msg}"),
            OrchestratorError::Http(msg) => write!(f, "http error: {msg}"),
            OrchestratorError::Storage(msg) => write!(f, "storage error: {msg}"),
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl From<AuthError> for OrchestratorError {
    fn from(err: AuthError) -> Self {
        OrchestratorError::Auth(err)
    }
}

impl From<LifecycleError> for OrchestratorError {
    fn from(err: LifecycleError) -> Self {
        OrchestratorError::Lifecycle(err)
    }
}

impl From<PolicyError> for OrchestratorError {
    fn from(err: PolicyError) -> Self {
        OrchestratorError::Policy(err)
    }
}

impl From<ProviderError> for OrchestratorError {
    fn from(err: ProviderError) -> Self {
        OrchestratorError::Lifecycle(err.into())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_timeout_maps_to_lifecycle_timeout() {
        let err: LifecycleError = ProviderError::Timeout("create".into()).into();
        assert_eq!(err, LifecycleError::ProviderTimeout("create".into()));

        let err: LifecycleError = ProviderError::Api("HTTP 500".into()).into();
        assert!(matches!(err, LifecycleError::ProviderFailure(msg) if msg.contains("HTTP 500")));
    }

    #[test]
    fn display_includes_family() {
        let err = OrchestratorError::from(AuthError::LockedOut {
            retry_after_secs: 30,
        });
        assert_eq!(err.to_string(), "auth error: locked out, retry in 30s");

        let err = OrchestratorError::from(LifecycleError::StateConflict {
            operation: "configure network",
            state: "provisioning".into(),
        });
        assert!(err.to_string().contains("cannot configure network while sandbox is provisioning"));
    }
}
