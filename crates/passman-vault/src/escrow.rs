//! Biometric key escrow.
//!
//! On an opted-in device the exported vault key is kept in the persistent
//! tier next to a reference to a platform-authenticator credential
//! (WebAuthn/FIDO2 class). Recovering it requires a successful assertion
//! for that credential first; no key material is read until the challenge
//! has verified.
//!
//! Records are stored as JSON under `escrow:record:<principal>`. The
//! `escrow:last_principal` pointer names the most recently enrolled
//! principal so recovery works without a hint on a shared device.
//!
//! The escrow survives idle locks and sign-outs: it is keyed to a separate
//! physical challenge, not to the session.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{VaultKey, random_bytes};
use crate::error::{Result, VaultError};
use crate::export::{ExportedKey, export_key, import_key};
use crate::persistence::{KeyPersistenceBackend, PersistenceTier};
use crate::storage::KeyValueStore;

/// Storage key of the most-recently-enrolled principal pointer.
const LAST_PRINCIPAL_ENTRY: &str = "escrow:last_principal";

/// Length of the random challenge handed to the authenticator.
const CHALLENGE_LEN: usize = 32;

fn record_entry(principal: &str) -> String {
    format!("escrow:record:{principal}")
}

// ---------------------------------------------------------------------------
// Platform authenticator contract
// ---------------------------------------------------------------------------

/// Options for registering a new platform credential.
#[derive(Debug, Clone)]
pub struct RegistrationOptions {
    /// The principal the credential is bound to.
    pub principal_id: String,
    /// Human-readable account name shown by the platform prompt.
    pub user_name: String,
    /// Base64url random challenge.
    pub challenge: String,
}

/// Result of a successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attestation {
    /// Opaque identifier of the new credential.
    pub credential_id: String,
}

/// Options for requesting an assertion.
#[derive(Debug, Clone)]
pub struct AssertionOptions {
    /// Credentials the authenticator may use.
    pub allow_credentials: Vec<String>,
    /// Base64url random challenge.
    pub challenge: String,
    /// Principal the caller expects, if known.
    pub principal_hint: Option<String>,
}

/// Result of a successful assertion.
#[derive(Clone, PartialEq, Eq)]
pub struct Assertion {
    /// The credential that answered the challenge.
    pub credential_id: String,
    /// The principal the credential is bound to.
    pub principal_id: String,
    /// A sign-in token minted by the relying party after verifying the
    /// assertion, exchanged with the identity provider.
    pub sign_in_token: Option<String>,
}

impl fmt::Debug for Assertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Assertion")
            .field("credential_id", &self.credential_id)
            .field("principal_id", &self.principal_id)
            .field("sign_in_token", &self.sign_in_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Failure reported by the platform authenticator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthenticatorError {
    /// The user dismissed the prompt.
    #[error("authenticator prompt cancelled")]
    Cancelled,

    /// No platform authenticator is available.
    #[error("platform authenticator unsupported")]
    Unsupported,

    /// A credential for this principal already exists on the authenticator.
    #[error("credential already registered")]
    AlreadyRegistered,

    /// Any other failure (timeout, lost focus, verification rejected).
    #[error("authenticator failed: {0}")]
    Failed(String),
}

/// A WebAuthn/FIDO2-class platform authenticator.
///
/// Both operations may fail or be cancelled at any time; implementations
/// must report that as an `Err`, never panic.
#[async_trait]
pub trait PlatformAuthenticator: Send + Sync {
    /// Create a new credential bound to a principal.
    async fn register_credential(
        &self,
        options: RegistrationOptions,
    ) -> std::result::Result<Attestation, AuthenticatorError>;

    /// Prove possession of one of the allowed credentials.
    async fn get_assertion(
        &self,
        options: AssertionOptions,
    ) -> std::result::Result<Assertion, AuthenticatorError>;
}

// ---------------------------------------------------------------------------
// Escrow record
// ---------------------------------------------------------------------------

/// The persisted escrow record.
#[derive(Clone, Serialize, Deserialize)]
pub struct EscrowRecord {
    /// Platform credential that gates this record.
    pub credential_id: String,
    /// Exported vault key.
    pub wrapped_key: String,
    /// Principal that enrolled.
    pub owner: String,
    /// Check value of the wrapped key, see [`VaultKey::check_value`].
    pub key_check: String,
    pub enrolled_at: DateTime<Utc>,
}

impl fmt::Debug for EscrowRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EscrowRecord")
            .field("credential_id", &self.credential_id)
            .field("wrapped_key", &"<redacted>")
            .field("owner", &self.owner)
            .field("enrolled_at", &self.enrolled_at)
            .finish()
    }
}

/// An escrow record whose challenge has verified but whose key has not been
/// decoded yet.
#[derive(Debug)]
pub struct VerifiedEscrow {
    assertion: Assertion,
    record: EscrowRecord,
}

impl VerifiedEscrow {
    /// The assertion that unlocked this record.
    pub fn assertion(&self) -> &Assertion {
        &self.assertion
    }

    /// The principal that owns the record.
    pub fn owner(&self) -> &str {
        &self.record.owner
    }
}

// ---------------------------------------------------------------------------
// BiometricEscrow
// ---------------------------------------------------------------------------

/// Persistent, biometric-gated copy of the vault key.
#[derive(Clone)]
pub struct BiometricEscrow {
    store: Arc<dyn KeyValueStore>,
    authenticator: Arc<dyn PlatformAuthenticator>,
}

impl BiometricEscrow {
    /// Create an escrow over the device-scoped `store`.
    pub fn new(store: Arc<dyn KeyValueStore>, authenticator: Arc<dyn PlatformAuthenticator>) -> Self {
        Self {
            store,
            authenticator,
        }
    }

    /// Register a platform credential for `owner` and escrow `key` behind it.
    ///
    /// The credential is registered first; the key is written only once the
    /// platform has accepted. An existing record for `owner` is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::EnrollmentFailed`] if the platform declines,
    /// cancels or does not support registration. Nothing is written in that
    /// case.
    #[tracing::instrument(skip(self, user_name, key))]
    pub async fn enroll(&self, owner: &str, user_name: &str, key: &VaultKey) -> Result<()> {
        let attestation = self.register(owner, user_name).await?;
        self.seal(owner, attestation, key).await
    }

    /// First half of [`enroll`](Self::enroll): run the platform registration
    /// prompt. Touches no key material and writes nothing.
    ///
    /// The prompt can stay open for as long as the user leaves it, so callers
    /// must not hold locks across this call.
    pub async fn register(&self, owner: &str, user_name: &str) -> Result<Attestation> {
        let challenge = URL_SAFE_NO_PAD.encode(random_bytes(CHALLENGE_LEN)?);
        self.authenticator
            .register_credential(RegistrationOptions {
                principal_id: owner.to_string(),
                user_name: user_name.to_string(),
                challenge,
            })
            .await
            .map_err(|e| VaultError::EnrollmentFailed {
                reason: e.to_string(),
            })
    }

    /// Second half of [`enroll`](Self::enroll): write `key` behind the
    /// credential from `attestation`.
    pub async fn seal(&self, owner: &str, attestation: Attestation, key: &VaultKey) -> Result<()> {
        let record = EscrowRecord {
            credential_id: attestation.credential_id,
            wrapped_key: export_key(key)?.as_str().to_string(),
            owner: owner.to_string(),
            key_check: key.check_value(),
            enrolled_at: Utc::now(),
        };

        self.store
            .set(&record_entry(owner), &serde_json::to_string(&record)?)
            .await?;
        self.store.set(LAST_PRINCIPAL_ENTRY, owner).await?;

        tracing::info!(principal = owner, credential = %record.credential_id, "biometric escrow enrolled");
        Ok(())
    }

    /// Whether `owner` has an escrow record on this device.
    pub async fn is_enrolled(&self, owner: &str) -> Result<bool> {
        Ok(self.store.get(&record_entry(owner)).await?.is_some())
    }

    /// Run the platform challenge for the escrow record of `principal_hint`
    /// (or the most recently enrolled principal).
    ///
    /// No key material is decoded here. A declined or cancelled challenge
    /// leaves everything as it was.
    ///
    /// # Errors
    ///
    /// [`VaultError::EscrowNotFound`] if nothing is enrolled,
    /// [`VaultError::ChallengeCancelled`] if the user dismissed the prompt,
    /// [`VaultError::ChallengeFailed`] for any other challenge failure, and
    /// [`VaultError::EscrowCorrupted`] if the record cannot be read at all.
    #[tracing::instrument(skip(self))]
    pub async fn challenge(&self, principal_hint: Option<&str>) -> Result<VerifiedEscrow> {
        let principal = match principal_hint {
            Some(p) => p.to_string(),
            None => self
                .store
                .get(LAST_PRINCIPAL_ENTRY)
                .await?
                .ok_or_else(|| VaultError::EscrowNotFound {
                    principal: "<any>".into(),
                })?,
        };

        let raw = self
            .store
            .get(&record_entry(&principal))
            .await?
            .ok_or_else(|| VaultError::EscrowNotFound {
                principal: principal.clone(),
            })?;

        let record: EscrowRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                self.remove(&principal).await?;
                return Err(VaultError::EscrowCorrupted {
                    reason: format!("unreadable escrow record: {e}"),
                });
            }
        };

        let challenge = URL_SAFE_NO_PAD.encode(random_bytes(CHALLENGE_LEN)?);
        let assertion = self
            .authenticator
            .get_assertion(AssertionOptions {
                allow_credentials: vec![record.credential_id.clone()],
                challenge,
                principal_hint: Some(principal.clone()),
            })
            .await
            .map_err(|e| match e {
                AuthenticatorError::Cancelled => VaultError::ChallengeCancelled,
                other => VaultError::ChallengeFailed {
                    reason: other.to_string(),
                },
            })?;

        if assertion.credential_id != record.credential_id {
            return Err(VaultError::ChallengeFailed {
                reason: "assertion answered with an unexpected credential".into(),
            });
        }
        if assertion.principal_id != record.owner {
            return Err(VaultError::ChallengeFailed {
                reason: "assertion is bound to a different principal".into(),
            });
        }

        tracing::debug!(principal = %principal, "biometric challenge verified");
        Ok(VerifiedEscrow { assertion, record })
    }

    /// Decode the key held by a verified record.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::EscrowCorrupted`] if the wrapped key does not
    /// import or does not match its check value. The record is deleted so
    /// the user is prompted to enroll again.
    pub async fn unseal(&self, verified: VerifiedEscrow) -> Result<VaultKey> {
        let record = verified.record;
        let key = import_key(&ExportedKey::from_stored(record.wrapped_key.clone()))
            .ok()
            .filter(|key| key.check_value() == record.key_check);

        match key {
            Some(key) => Ok(key),
            None => {
                tracing::warn!(principal = %record.owner, "escrowed key failed to decode, removing record");
                self.remove(&record.owner).await?;
                Err(VaultError::EscrowCorrupted {
                    reason: "escrowed key failed to decode".into(),
                })
            }
        }
    }

    /// Challenge, then unseal.
    pub async fn recover(&self, principal_hint: Option<&str>) -> Result<VaultKey> {
        let verified = self.challenge(principal_hint).await?;
        self.unseal(verified).await
    }

    /// Delete the record for `owner` if it no longer wraps `current`.
    ///
    /// Returns `true` if a stale record was removed.
    pub async fn invalidate_if_stale(&self, owner: &str, current: &VaultKey) -> Result<bool> {
        let Some(raw) = self.store.get(&record_entry(owner)).await? else {
            return Ok(false);
        };

        let stale = match serde_json::from_str::<EscrowRecord>(&raw) {
            Ok(record) => record.key_check != current.check_value(),
            Err(_) => true,
        };

        if stale {
            tracing::warn!(principal = owner, "escrowed key no longer matches, invalidating");
            self.remove(owner).await?;
        }
        Ok(stale)
    }

    /// Remove the record for `owner`.
    pub async fn remove(&self, owner: &str) -> Result<()> {
        self.store.remove(&record_entry(owner)).await?;
        if self.store.get(LAST_PRINCIPAL_ENTRY).await?.as_deref() == Some(owner) {
            self.store.remove(LAST_PRINCIPAL_ENTRY).await?;
        }
        tracing::info!(principal = owner, "biometric escrow removed");
        Ok(())
    }
}

#[async_trait]
impl KeyPersistenceBackend for BiometricEscrow {
    fn tier(&self) -> PersistenceTier {
        PersistenceTier::BiometricEscrow
    }

    async fn persist(&self, owner: &str, key: &VaultKey) -> Result<()> {
        self.enroll(owner, owner, key).await
    }

    async fn restore(&self, owner_hint: Option<&str>) -> Result<VaultKey> {
        self.recover(owner_hint).await
    }

    async fn discard(&self, owner_hint: Option<&str>) -> Result<()> {
        let owner = match owner_hint {
            Some(owner) => owner.to_string(),
            None => match self.store.get(LAST_PRINCIPAL_ENTRY).await? {
                Some(owner) => owner,
                None => return Ok(()),
            },
        };
        self.remove(&owner).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
