//! Error types for the session crate.
//!
//! All coordinator, vault-access and configuration failures surface through
//! [`SessionError`]. Key-material failures keep their [`VaultError`] shape so
//! callers can still tell "wrong key for this record" apart from "no key".

use passman_vault::VaultError;

use crate::collaborators::ProviderError;
use crate::state::AccessState;

/// Unified error type for the PassMan session layer.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// An error propagated from the vault crate.
    #[error("vault error: {0}")]
    Vault(#[from] VaultError),

    /// The identity provider rejected the primary credentials.
    #[error("authentication failed: {reason}")]
    AuthFailed {
        /// Why the sign-in was refused.
        reason: String,
    },

    /// The second-factor code did not verify. Retryable.
    #[error("second-factor code rejected")]
    SecondFactorRejected,

    /// The passphrase entered to unlock does not produce this session's key.
    #[error("passphrase does not match the vault key")]
    PassphraseMismatch,

    /// A vault operation was attempted while the session is not unlocked.
    #[error("vault access denied while {state}")]
    AccessDenied {
        /// The state that caused the denial.
        state: AccessState,
    },

    /// The requested operation is not valid from the current state.
    #[error("invalid access transition from {from} to {to}")]
    InvalidTransition { from: AccessState, to: AccessState },

    /// A remote collaborator (identity or second-factor service) failed.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// The remote secret repository failed.
    #[error("secret repository error: {reason}")]
    Repository {
        /// Details from the repository.
        reason: String,
    },

    /// Configuration is missing a usable value or could not be parsed.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What is wrong with the configuration.
        reason: String,
    },
}

impl SessionError {
    /// Whether the failure concerns the key being absent, as opposed to the
    /// operation itself being wrong.
    pub fn is_key_unavailable(&self) -> bool {
        matches!(self, Self::Vault(VaultError::KeyUnavailable))
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, SessionError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
