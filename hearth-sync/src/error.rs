//! Crate-level error returned by supervisor operations.

use thiserror::Error;

use crate::config::ConfigError;
use crate::context::AuthError;
use crate::mutation::MutationError;
use crate::policy::PolicyDenied;
use crate::store::LookupError;

/// Errors surfaced by the supervisor's public operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// Terminal; retrying cannot help.
    #[error(transparent)]
    Denied(#[from] PolicyDenied),
    /// Transient; the next call looks up again.
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Mutation(#[from] MutationError),
    /// Credentials were rejected; reauthenticate and call `reset_session`.
    #[error("session expired")]
    SessionExpired,
}

impl SyncError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Lookup(_) | Self::Auth(AuthError::Unavailable(_)) => true,
            Self::Mutation(e) => matches!(e, MutationError::Unavailable { .. }),
            Self::Denied(_) | Self::Auth(_) | Self::Config(_) | Self::SessionExpired => false,
        }
    }
}
