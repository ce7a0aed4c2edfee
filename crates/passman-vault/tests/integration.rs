//! Integration tests for the passman-vault crate.
//!
//! These exercise derivation, the cipher, key export, and both persistence
//! tiers together, the way a client session strings them along.

use std::sync::Arc;

use async_trait::async_trait;
use passman_vault::crypto::{self, KdfParams};
use passman_vault::{
    Assertion, AssertionOptions, Attestation, AuthenticatorError, BiometricEscrow,
    KeyValueStore, MemoryStore, PlatformAuthenticator, RegistrationOptions, SessionKeyStore,
    SqliteStore, VaultError, VaultKey, export_key, import_key,
};

fn params() -> KdfParams {
    KdfParams::with_iterations(2_000).unwrap()
}

/// An authenticator that always succeeds, binding `cred-<principal>`.
struct AcceptingAuthenticator;

#[async_trait]
impl PlatformAuthenticator for AcceptingAuthenticator {
    async fn register_credential(
        &self,
        options: RegistrationOptions,
    ) -> Result<Attestation, AuthenticatorError> {
        Ok(Attestation {
            credential_id: format!("cred-{}", options.principal_id),
        })
    }

    async fn get_assertion(
        &self,
        options: AssertionOptions,
    ) -> Result<Assertion, AuthenticatorError> {
        let credential_id = options.allow_credentials[0].clone();
        Ok(Assertion {
            principal_id: credential_id.trim_start_matches("cred-").to_string(),
            credential_id,
            sign_in_token: None,
        })
    }
}

/// An authenticator without platform support.
struct MissingAuthenticator;

#[async_trait]
impl PlatformAuthenticator for MissingAuthenticator {
    async fn register_credential(
        &self,
        _options: RegistrationOptions,
    ) -> Result<Attestation, AuthenticatorError> {
        Err(AuthenticatorError::Unsupported)
    }

    async fn get_assertion(
        &self,
        _options: AssertionOptions,
    ) -> Result<Assertion, AuthenticatorError> {
        Err(AuthenticatorError::Unsupported)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Derivation and cipher
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn same_credentials_recover_the_same_key_after_logout() {
    let k1 = crypto::derive_key("Tr0ub4dor&3", "a@x.com", params())
        .await
        .unwrap();
    let stored = crypto::encrypt_field(&k1, "github-password").unwrap();
    drop(k1);

    let k2 = crypto::derive_key("Tr0ub4dor&3", "a@x.com", params())
        .await
        .unwrap();
    assert_eq!(
        crypto::decrypt_field(&k2, &stored.ciphertext, &stored.iv).unwrap(),
        "github-password"
    );
}

#[tokio::test]
async fn key_from_other_passphrase_fails_closed() {
    let owner = crypto::derive_key("Tr0ub4dor&3", "a@x.com", params())
        .await
        .unwrap();
    let attacker = crypto::derive_key("correct horse", "a@x.com", params())
        .await
        .unwrap();

    let stored = crypto::encrypt_field(&owner, "bank-password").unwrap();
    let err = crypto::decrypt_field(&attacker, &stored.ciphertext, &stored.iv).unwrap_err();
    assert!(matches!(err, VaultError::DecryptionFailed { .. }));
}

#[test]
fn exported_key_survives_import() {
    let key = VaultKey::generate().unwrap();
    let stored = crypto::encrypt_field(&key, "value").unwrap();

    let restored = import_key(&export_key(&key).unwrap()).unwrap();
    assert_eq!(
        crypto::decrypt_field(&restored, &stored.ciphertext, &stored.iv).unwrap(),
        "value"
    );
}

// ═══════════════════════════════════════════════════════════════════════
//  Tiers
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn escrow_survives_into_a_fresh_tab_on_the_same_device() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("device.db");
    let auth: Arc<dyn PlatformAuthenticator> = Arc::new(AcceptingAuthenticator);

    // First tab: unlock with the passphrase, enroll.
    let stored = {
        let device: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open(&path).unwrap());
        let keys = SessionKeyStore::new(Arc::new(MemoryStore::new()));
        let key = crypto::derive_key("Tr0ub4dor&3", "a@x.com", params())
            .await
            .unwrap();
        keys.install("uid-1", key).await;

        let key = keys.read().await.unwrap();
        let stored = crypto::encrypt_field(&key, "pre-existing").unwrap();
        BiometricEscrow::new(device, auth.clone())
            .enroll("uid-1", "a@x.com", &key)
            .await
            .unwrap();
        stored
    };

    // Second tab: empty ephemeral tier, same device file.
    let device: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open(&path).unwrap());
    let keys = SessionKeyStore::new(Arc::new(MemoryStore::new()));
    assert!(!keys.restore("uid-1").await);

    let recovered = BiometricEscrow::new(device, auth)
        .recover(None)
        .await
        .unwrap();
    keys.install("uid-1", recovered).await;

    let key = keys.read().await.unwrap();
    assert_eq!(
        crypto::decrypt_field(&key, &stored.ciphertext, &stored.iv).unwrap(),
        "pre-existing"
    );
}

#[tokio::test]
async fn unsupported_platform_fails_enrollment_without_writing() {
    let device = MemoryStore::new();
    let escrow = BiometricEscrow::new(Arc::new(device.clone()), Arc::new(MissingAuthenticator));

    let err = escrow
        .enroll("uid-1", "a@x.com", &VaultKey::generate().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::EnrollmentFailed { .. }));
    assert!(device.is_empty());
}

#[tokio::test]
async fn clearing_the_session_store_leaves_escrow_intact() {
    let device = MemoryStore::new();
    let tab = MemoryStore::new();
    let escrow = BiometricEscrow::new(Arc::new(device.clone()), Arc::new(AcceptingAuthenticator));
    let keys = SessionKeyStore::new(Arc::new(tab.clone()));

    keys.install("uid-1", VaultKey::generate().unwrap()).await;
    escrow
        .enroll("uid-1", "a@x.com", &*keys.read().await.unwrap())
        .await
        .unwrap();

    keys.clear().await.unwrap();
    assert!(tab.is_empty());
    assert!(escrow.is_enrolled("uid-1").await.unwrap());
}
