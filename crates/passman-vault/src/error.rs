//! Vault error types.
//!
//! Every subsystem in this crate surfaces failures through [`VaultError`].
//! The variants follow the failure taxonomy callers act on: a derivation
//! failure blocks unlocking, a decryption failure is local to one record, and
//! the import/recovery family degrades to "no key available" rather than
//! blocking sign-in.

/// Unified error type for the PassMan key vault.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    // -- Crypto errors ------------------------------------------------------
    /// Key derivation rejected its input (empty passphrase or salt).
    #[error("key derivation failed: {reason}")]
    DerivationFailed { reason: String },

    /// Encryption failed (entropy source unavailable, ring internal error).
    #[error("encryption failed: {reason}")]
    EncryptionFailed { reason: String },

    /// Decryption failed: wrong key, tampered ciphertext, or malformed input.
    #[error("decryption failed: {reason}")]
    DecryptionFailed { reason: String },

    // -- Key transport errors -----------------------------------------------
    /// A serialized key could not be turned back into a usable key.
    #[error("key import failed: {reason}")]
    ImportFailed { reason: String },

    /// No vault key is currently held by the session key store.
    #[error("no vault key available")]
    KeyUnavailable,

    // -- Escrow errors ------------------------------------------------------
    /// Biometric enrollment was declined, cancelled, or is unsupported.
    #[error("biometric enrollment failed: {reason}")]
    EnrollmentFailed { reason: String },

    /// No escrow record exists for the requested principal on this device.
    #[error("no biometric escrow enrolled for {principal}")]
    EscrowNotFound { principal: String },

    /// The platform authenticator challenge did not verify.
    #[error("biometric challenge failed: {reason}")]
    ChallengeFailed { reason: String },

    /// The user abandoned the platform authenticator prompt.
    #[error("biometric challenge cancelled")]
    ChallengeCancelled,

    /// The challenge succeeded but the stored key could not be decoded.
    #[error("biometric escrow record is corrupted: {reason}")]
    EscrowCorrupted { reason: String },

    // -- Storage errors -----------------------------------------------------
    /// Database schema setup failed.
    #[error("migration failed: {reason}")]
    MigrationFailed { reason: String },

    /// SQLite error from `rusqlite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A blocking storage task panicked or was cancelled.
    #[error("storage task failed: {0}")]
    TaskJoin(String),

    // -- Generic ------------------------------------------------------------
    /// Catch-all for unexpected internal errors.
    #[error("internal vault error: {0}")]
    Internal(String),
}

impl VaultError {
    /// Whether this error belongs to the biometric recovery family.
    ///
    /// Recovery failures are never fatal to sign-in: the caller treats them
    /// as "no key available" and leaves the vault locked.
    pub fn is_recovery_failure(&self) -> bool {
        matches!(
            self,
            Self::EscrowNotFound { .. }
                | Self::ChallengeFailed { .. }
                | Self::ChallengeCancelled
                | Self::EscrowCorrupted { .. }
                | Self::ImportFailed { .. }
        )
    }
}

impl From<tokio::task::JoinError> for VaultError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

/// Convenience alias used throughout the vault crate.
pub type Result<T> = std::result::Result<T, VaultError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovery_family_is_classified() {
        assert!(VaultError::ChallengeCancelled.is_recovery_failure());
        assert!(
            VaultError::EscrowCorrupted {
                reason: "bad json".into()
            }
            .is_recovery_failure()
        );
        assert!(!VaultError::KeyUnavailable.is_recovery_failure());
        assert!(
            !VaultError::DecryptionFailed {
                reason: "tag".into()
            }
            .is_recovery_failure()
        );
    }

    #[test]
    fn error_display_escrow_not_found() {
        let err = VaultError::EscrowNotFound {
            principal: "uid-1".into(),
        };
        assert_eq!(err.to_string(), "no biometric escrow enrolled for uid-1");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<VaultError>();
    }
}
