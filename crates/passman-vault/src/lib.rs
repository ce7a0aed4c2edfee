//! Vault key material for PassMan.
//!
//! This crate owns everything that touches the symmetric key protecting a
//! user's stored site credentials: deriving it from the master passphrase,
//! using it for authenticated encryption, serializing it for storage, and
//! keeping it in the two persistence tiers a browser-style client has.
//!
//! # Modules
//!
//! - [`crypto`]: PBKDF2 derivation, AES-256-GCM field encryption, [`VaultKey`].
//! - [`export`]: JWK-style export/import of a key.
//! - [`storage`]: [`KeyValueStore`] tiers (ephemeral memory, persistent SQLite).
//! - [`persistence`]: [`KeyPersistenceBackend`] strategy and the session tier.
//! - [`session_store`]: [`SessionKeyStore`], the single owner of the live key.
//! - [`escrow`]: biometric escrow behind a [`PlatformAuthenticator`].
//! - [`error`]: Unified error types.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use passman_vault::crypto::{self, KdfParams};
//! use passman_vault::{MemoryStore, SessionKeyStore};
//!
//! # async fn example() -> passman_vault::Result<()> {
//! // Derive the key from the master passphrase and the account email.
//! let key = crypto::derive_key("Tr0ub4dor&3", "a@x.com", KdfParams::default()).await?;
//!
//! // Hand it to the session key store for this tab.
//! let keys = SessionKeyStore::new(Arc::new(MemoryStore::new()));
//! keys.install("uid-1", key).await;
//!
//! // Borrow it for one operation.
//! let field = crypto::encrypt_field(&*keys.read().await?, "hunter2")?;
//! let plaintext = crypto::decrypt_field(&*keys.read().await?, &field.ciphertext, &field.iv)?;
//! assert_eq!(plaintext, "hunter2");
//! # Ok(())
//! # }
//! ```

pub mod crypto;
pub mod error;
pub mod escrow;
pub mod export;
pub mod persistence;
pub mod session_store;
pub mod storage;

// Re-export the most commonly used types at the crate root for convenience.
pub use crypto::{EncryptedField, KdfParams, VaultKey};
pub use error::{Result, VaultError};
pub use escrow::{
    Assertion, AssertionOptions, Attestation, AuthenticatorError, BiometricEscrow,
    PlatformAuthenticator, RegistrationOptions,
};
pub use export::{ExportedKey, export_key, import_key};
pub use persistence::{KeyPersistenceBackend, PersistenceTier, SessionTier};
pub use session_store::SessionKeyStore;
pub use storage::{KeyValueStore, MemoryStore, SqliteStore};
