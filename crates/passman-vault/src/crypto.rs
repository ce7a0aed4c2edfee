//! Key derivation and AES-256-GCM field encryption using the `ring` crate.
//!
//! - **Derivation**: PBKDF2-HMAC-SHA256 over the master passphrase, salted
//!   with the account email. The derivation is deterministic so that signing
//!   in again on any device recovers the same [`VaultKey`] without a
//!   server-held salt.
//! - **Encryption/decryption**: AES-256-GCM with a fresh random 96-bit IV per
//!   call. Decryption authenticates before returning anything and fails
//!   closed with [`VaultError::DecryptionFailed`].
//!
//! # Security Notes
//!
//! - The email salt is low-entropy and predictable. Two accounts with known
//!   emails have known derivation inputs apart from the passphrase. This is
//!   kept for compatibility with vaults already encrypted under it.
//! - IVs are random. With 96 bits the collision probability stays negligible
//!   for well over 2^32 encryptions under one key.
//! - Key bytes live in [`zeroize::Zeroizing`] buffers and are wiped on drop.

use std::fmt;
use std::num::NonZeroU32;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ring::aead::{self, Aad, BoundKey, NONCE_LEN, Nonce, NonceSequence, SealingKey, UnboundKey};
use ring::digest;
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};

/// Length of the AES-256-GCM key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of the AES-256-GCM IV in bytes (96 bits).
pub const IV_LEN: usize = NONCE_LEN;

/// Length of the GCM authentication tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// Default PBKDF2 iteration count, per the OWASP 2023 recommendation for
/// HMAC-SHA256.
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 600_000;

const DEFAULT_ITERATIONS: NonZeroU32 = match NonZeroU32::new(DEFAULT_PBKDF2_ITERATIONS) {
    Some(n) => n,
    None => unreachable!(),
};

/// Domain separator mixed into key check values.
const KEY_CHECK_CONTEXT: &[u8] = b"passman-key-check-v1";

static PBKDF2_ALG: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;

static AEAD_ALG: &aead::Algorithm = &aead::AES_256_GCM;

// ---------------------------------------------------------------------------
// VaultKey
// ---------------------------------------------------------------------------

/// The symmetric key that encrypts every stored secret.
///
/// Deliberately not `Clone`: a single owner (the session key store) holds
/// the live key and lends it out by reference. The bytes are zeroed when the
/// key is dropped.
pub struct VaultKey {
    bytes: Zeroizing<[u8; KEY_LEN]>,
}

impl VaultKey {
    pub(crate) fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            bytes: Zeroizing::new(bytes),
        }
    }

    /// Generate a random key. Used for tests and fresh local vaults.
    pub fn generate() -> Result<Self> {
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        SystemRandom::new()
            .fill(&mut bytes[..])
            .map_err(|_| VaultError::Internal("failed to generate random key".into()))?;
        Ok(Self { bytes })
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    /// A one-way check value identifying this key.
    ///
    /// Two keys share a check value iff they are the same key. Used to detect
    /// an escrowed copy that no longer matches the key the passphrase
    /// derives.
    pub fn check_value(&self) -> String {
        let mut ctx = digest::Context::new(&digest::SHA256);
        ctx.update(KEY_CHECK_CONTEXT);
        ctx.update(&self.bytes[..]);
        STANDARD.encode(ctx.finish().as_ref())
    }
}

impl fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VaultKey(<redacted>)")
    }
}

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

/// Tunable parameters for [`derive_key`].
///
/// Every device that should open the same vault must use the same
/// iteration count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    iterations: NonZeroU32,
}

impl KdfParams {
    /// Parameters with an explicit PBKDF2 iteration count.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::DerivationFailed`] for a zero iteration count.
    pub fn with_iterations(iterations: u32) -> Result<Self> {
        let iterations = NonZeroU32::new(iterations).ok_or_else(|| VaultError::DerivationFailed {
            reason: "iteration count must be non-zero".into(),
        })?;
        Ok(Self { iterations })
    }

    /// The PBKDF2 iteration count.
    pub fn iterations(&self) -> u32 {
        self.iterations.get()
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
        }
    }
}

/// Derive the vault key from `master_secret`, salted with `salt_source`
/// (the account's verified email).
///
/// The PBKDF2 work runs on the blocking pool, so only the caller is
/// suspended while it completes.
///
/// # Errors
///
/// Returns [`VaultError::DerivationFailed`] if either input is empty.
pub async fn derive_key(
    master_secret: &str,
    salt_source: &str,
    params: KdfParams,
) -> Result<VaultKey> {
    validate_derivation_input(master_secret, salt_source)?;

    let secret = Zeroizing::new(master_secret.as_bytes().to_vec());
    let salt = salt_source.as_bytes().to_vec();

    let key = tokio::task::spawn_blocking(move || derive_raw(&secret, &salt, params)).await?;

    tracing::debug!(iterations = params.iterations(), "derived vault key via PBKDF2");
    Ok(key)
}

fn validate_derivation_input(master_secret: &str, salt_source: &str) -> Result<()> {
    if master_secret.is_empty() {
        return Err(VaultError::DerivationFailed {
            reason: "master passphrase is empty".into(),
        });
    }
    if salt_source.trim().is_empty() {
        return Err(VaultError::DerivationFailed {
            reason: "salt source is empty".into(),
        });
    }
    Ok(())
}

fn derive_raw(secret: &[u8], salt: &[u8], params: KdfParams) -> VaultKey {
    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::derive(PBKDF2_ALG, params.iterations, salt, secret, &mut out[..]);
    VaultKey { bytes: out }
}

// ---------------------------------------------------------------------------
// Nonce handling
// ---------------------------------------------------------------------------

/// A nonce sequence that yields exactly one nonce and then errors, so each
/// bound key is used for a single operation.
struct SingleNonce(Option<[u8; IV_LEN]>);

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.0
            .take()
            .map(Nonce::assume_unique_for_key)
            .ok_or(ring::error::Unspecified)
    }
}

// ---------------------------------------------------------------------------
// Encryption
// ---------------------------------------------------------------------------

/// Output of a single [`encrypt`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    /// Ciphertext with the 128-bit GCM tag appended.
    pub ciphertext: Vec<u8>,
    /// The IV generated for this call.
    pub iv: [u8; IV_LEN],
}

/// Encrypt `plaintext` under `key` with a freshly generated IV.
///
/// # Errors
///
/// Returns [`VaultError::EncryptionFailed`] if the system CSPRNG or `ring`
/// reports a failure.
pub fn encrypt(key: &VaultKey, plaintext: &[u8]) -> Result<Sealed> {
    let mut iv = [0u8; IV_LEN];
    SystemRandom::new()
        .fill(&mut iv)
        .map_err(|_| VaultError::EncryptionFailed {
            reason: "failed to generate random iv".into(),
        })?;

    let unbound = UnboundKey::new(AEAD_ALG, key.as_bytes()).map_err(|_| {
        VaultError::EncryptionFailed {
            reason: "failed to create AES-256-GCM key".into(),
        }
    })?;
    let mut sealing_key = SealingKey::new(unbound, SingleNonce(Some(iv)));

    let mut in_out = plaintext.to_vec();
    sealing_key
        .seal_in_place_append_tag(Aad::empty(), &mut in_out)
        .map_err(|_| VaultError::EncryptionFailed {
            reason: "seal_in_place failed".into(),
        })?;

    tracing::trace!(
        plaintext_len = plaintext.len(),
        ciphertext_len = in_out.len(),
        "encrypted field"
    );

    Ok(Sealed {
        ciphertext: in_out,
        iv,
    })
}

/// Decrypt `ciphertext` (tag included) produced under `key` with `iv`.
///
/// # Errors
///
/// Returns [`VaultError::DecryptionFailed`] if the IV has the wrong length,
/// the ciphertext is truncated, the key is wrong, or the data was tampered
/// with. No partial plaintext is ever returned.
pub fn decrypt(key: &VaultKey, ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| VaultError::DecryptionFailed {
        reason: format!("iv must be {IV_LEN} bytes, got {}", iv.len()),
    })?;
    if ciphertext.len() < TAG_LEN {
        return Err(VaultError::DecryptionFailed {
            reason: "ciphertext shorter than authentication tag".into(),
        });
    }

    let unbound = UnboundKey::new(AEAD_ALG, key.as_bytes()).map_err(|_| {
        VaultError::DecryptionFailed {
            reason: "failed to create AES-256-GCM key".into(),
        }
    })?;
    let mut opening_key = aead::OpeningKey::new(unbound, SingleNonce(Some(iv)));

    let mut in_out = ciphertext.to_vec();
    let plaintext = opening_key
        .open_in_place(Aad::empty(), &mut in_out)
        .map_err(|_| VaultError::DecryptionFailed {
            reason: "authentication failed: wrong key or corrupted data".into(),
        })?
        .to_vec();

    tracing::trace!(
        ciphertext_len = ciphertext.len(),
        plaintext_len = plaintext.len(),
        "decrypted field"
    );

    Ok(plaintext)
}

// ---------------------------------------------------------------------------
// Text fields
// ---------------------------------------------------------------------------

/// A text field encrypted for storage: base64 ciphertext and base64 IV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedField {
    pub ciphertext: String,
    pub iv: String,
}

/// Encrypt a UTF-8 field and encode the result for a remote record.
pub fn encrypt_field(key: &VaultKey, plaintext: &str) -> Result<EncryptedField> {
    let sealed = encrypt(key, plaintext.as_bytes())?;
    Ok(EncryptedField {
        ciphertext: STANDARD.encode(&sealed.ciphertext),
        iv: STANDARD.encode(sealed.iv),
    })
}

/// Decode and decrypt a field produced by [`encrypt_field`].
///
/// Malformed base64 and non-UTF-8 plaintext are reported as
/// [`VaultError::DecryptionFailed`] like any other unreadable record.
pub fn decrypt_field(key: &VaultKey, ciphertext: &str, iv: &str) -> Result<String> {
    let ciphertext = STANDARD
        .decode(ciphertext)
        .map_err(|e| VaultError::DecryptionFailed {
            reason: format!("ciphertext is not valid base64: {e}"),
        })?;
    let iv = STANDARD.decode(iv).map_err(|e| VaultError::DecryptionFailed {
        reason: format!("iv is not valid base64: {e}"),
    })?;

    let plaintext = decrypt(key, &ciphertext, &iv)?;
    String::from_utf8(plaintext).map_err(|_| VaultError::DecryptionFailed {
        reason: "plaintext is not valid UTF-8".into(),
    })
}

// ---------------------------------------------------------------------------
// Random bytes
// ---------------------------------------------------------------------------

/// Generate `len` cryptographically secure random bytes.
///
/// # Errors
///
/// Returns [`VaultError::Internal`] if the system CSPRNG fails.
pub fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| VaultError::Internal("failed to generate random bytes".into()))?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_params() -> KdfParams {
        KdfParams::with_iterations(1_000).unwrap()
    }

    fn derive_key_blocking(
        master_secret: &str,
        salt_source: &str,
        params: KdfParams,
    ) -> Result<VaultKey> {
        validate_derivation_input(master_secret, salt_source)?;
        Ok(derive_raw(
            master_secret.as_bytes(),
            salt_source.as_bytes(),
            params,
        ))
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = VaultKey::generate().unwrap();
        let sealed = encrypt(&key, b"hunter2").unwrap();
        let plaintext = decrypt(&key, &sealed.ciphertext, &sealed.iv).unwrap();
        assert_eq!(plaintext, b"hunter2");
    }

    #[test]
    fn every_encryption_uses_a_fresh_iv() {
        let key = VaultKey::generate().unwrap();
        let a = encrypt(&key, b"same").unwrap();
        let b = encrypt(&key, b"same").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let k1 = VaultKey::generate().unwrap();
        let k2 = VaultKey::generate().unwrap();
        let sealed = encrypt(&k1, b"secret").unwrap();

        let err = decrypt(&k2, &sealed.ciphertext, &sealed.iv).unwrap_err();
        assert!(matches!(err, VaultError::DecryptionFailed { .. }));
    }

    #[test]
    fn decrypt_with_tampered_ciphertext_fails() {
        let key = VaultKey::generate().unwrap();
        let mut sealed = encrypt(&key, b"secret").unwrap();
        if let Some(byte) = sealed.ciphertext.first_mut() {
            *byte ^= 0x01;
        }

        assert!(decrypt(&key, &sealed.ciphertext, &sealed.iv).is_err());
    }

    #[test]
    fn malformed_iv_and_truncated_ciphertext_rejected() {
        let key = VaultKey::generate().unwrap();
        let sealed = encrypt(&key, b"secret").unwrap();

        assert!(decrypt(&key, &sealed.ciphertext, &sealed.iv[..8]).is_err());
        assert!(decrypt(&key, &sealed.ciphertext[..4], &sealed.iv).is_err());
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let key = VaultKey::generate().unwrap();
        let sealed = encrypt(&key, b"").unwrap();
        assert_eq!(sealed.ciphertext.len(), TAG_LEN);
        assert!(decrypt(&key, &sealed.ciphertext, &sealed.iv).unwrap().is_empty());
    }

    #[test]
    fn derivation_is_deterministic() {
        let k1 = derive_key_blocking("Tr0ub4dor&3", "a@x.com", fast_params()).unwrap();
        let k2 = derive_key_blocking("Tr0ub4dor&3", "a@x.com", fast_params()).unwrap();

        let sealed = encrypt(&k1, b"github").unwrap();
        assert_eq!(decrypt(&k2, &sealed.ciphertext, &sealed.iv).unwrap(), b"github");
        assert_eq!(k1.check_value(), k2.check_value());
    }

    #[test]
    fn different_salt_yields_different_key() {
        let k1 = derive_key_blocking("passphrase", "a@x.com", fast_params()).unwrap();
        let k2 = derive_key_blocking("passphrase", "b@x.com", fast_params()).unwrap();
        assert_ne!(k1.check_value(), k2.check_value());
    }

    #[test]
    fn empty_inputs_rejected() {
        assert!(matches!(
            derive_key_blocking("", "a@x.com", fast_params()),
            Err(VaultError::DerivationFailed { .. })
        ));
        assert!(matches!(
            derive_key_blocking("pw", "  ", fast_params()),
            Err(VaultError::DerivationFailed { .. })
        ));
        assert!(KdfParams::with_iterations(0).is_err());
    }

    #[test]
    fn default_params_use_owasp_iterations() {
        assert_eq!(KdfParams::default().iterations(), DEFAULT_PBKDF2_ITERATIONS);
    }

    #[tokio::test]
    async fn async_derivation_matches_blocking() {
        let blocking = derive_key_blocking("pw", "a@x.com", fast_params()).unwrap();
        let derived = derive_key("pw", "a@x.com", fast_params()).await.unwrap();
        assert_eq!(blocking.check_value(), derived.check_value());
    }

    #[test]
    fn text_field_roundtrip_and_bad_base64() {
        let key = VaultKey::generate().unwrap();
        let field = encrypt_field(&key, "correct horse").unwrap();
        assert_eq!(decrypt_field(&key, &field.ciphertext, &field.iv).unwrap(), "correct horse");

        let err = decrypt_field(&key, "%%%not-base64", &field.iv).unwrap_err();
        assert!(matches!(err, VaultError::DecryptionFailed { .. }));
    }

    #[test]
    fn debug_output_is_redacted() {
        let key = VaultKey::generate().unwrap();
        assert_eq!(format!("{key:?}"), "VaultKey(<redacted>)");
    }
}
