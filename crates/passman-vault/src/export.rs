//! Storage-safe serialization of a [`VaultKey`].
//!
//! Keys are exported as a JWK-style JSON document:
//!
//! ```text
//! {"kty":"oct","alg":"A256GCM","k":"<base64url, no padding>","ext":true}
//! ```
//!
//! The exported form is exactly as sensitive as the key itself. It is not
//! wrapped again; the storage tier it lands in is the only protection.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::{KEY_LEN, VaultKey};
use crate::error::{Result, VaultError};

const KEY_TYPE: &str = "oct";
const ALGORITHM: &str = "A256GCM";

/// A serialized vault key, ready to be written to a storage tier.
#[derive(Clone, PartialEq, Eq)]
pub struct ExportedKey(Zeroizing<String>);

impl ExportedKey {
    /// Wrap a value read back from storage. Nothing is validated until
    /// [`import_key`] runs.
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    /// The string to persist.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ExportedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExportedKey(<redacted>)")
    }
}

#[derive(Serialize, Deserialize)]
struct JsonWebKey {
    kty: String,
    alg: String,
    k: String,
    #[serde(default)]
    ext: bool,
}

impl Drop for JsonWebKey {
    fn drop(&mut self) {
        self.k.zeroize();
    }
}

/// Serialize `key` into its stable storage form.
///
/// # Errors
///
/// Only fails if JSON serialization itself fails.
pub fn export_key(key: &VaultKey) -> Result<ExportedKey> {
    let jwk = JsonWebKey {
        kty: KEY_TYPE.into(),
        alg: ALGORITHM.into(),
        k: URL_SAFE_NO_PAD.encode(key.as_bytes()),
        ext: true,
    };
    let json = serde_json::to_string(&jwk)?;
    Ok(ExportedKey(Zeroizing::new(json)))
}

/// Rebuild a [`VaultKey`] from its exported form.
///
/// # Errors
///
/// Returns [`VaultError::ImportFailed`] for anything that is not a well-formed
/// 256-bit AES-GCM key: bad JSON, a different key type or algorithm, bad
/// base64, or a wrong length. Callers treat this as "no key available".
pub fn import_key(exported: &ExportedKey) -> Result<VaultKey> {
    let jwk: JsonWebKey =
        serde_json::from_str(exported.as_str()).map_err(|e| VaultError::ImportFailed {
            reason: format!("not a JSON web key: {e}"),
        })?;

    if jwk.kty != KEY_TYPE || jwk.alg != ALGORITHM {
        return Err(VaultError::ImportFailed {
            reason: format!("unsupported key type {}/{}", jwk.kty, jwk.alg),
        });
    }

    let raw = Zeroizing::new(URL_SAFE_NO_PAD.decode(jwk.k.as_bytes()).map_err(|e| {
        VaultError::ImportFailed {
            reason: format!("key material is not base64url: {e}"),
        }
    })?);

    let bytes: [u8; KEY_LEN] = raw.as_slice().try_into().map_err(|_| VaultError::ImportFailed {
        reason: format!("key must be {KEY_LEN} bytes, got {}", raw.len()),
    })?;

    Ok(VaultKey::from_bytes(bytes))
}
