//! Persistence backends for exported key material.
//!
//! A [`KeyPersistenceBackend`] decides where a copy of the vault key lives
//! beyond process memory. There are two implementations:
//!
//! - [`SessionTier`]: the tab-scoped ephemeral store. Written on every unlock
//!   so a reload in the same tab does not ask for the passphrase again.
//! - [`BiometricEscrow`](crate::escrow::BiometricEscrow): the device-scoped
//!   persistent store, gated by a platform authenticator challenge. Written
//!   only after the user explicitly enrolls.
//!
//! Selection is always explicit. Nothing falls back from one tier to the
//! other. [`SessionKeyStore`](crate::session_store::SessionKeyStore)
//! mirrors every installed key through one backend, the session tier unless
//! it was built with [`with_backend`](crate::session_store::SessionKeyStore::with_backend).
//! Biometric sign-in drives the escrow's challenge and unseal steps
//! directly, since the identity provider needs the assertion between them.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::crypto::VaultKey;
use crate::error::{Result, VaultError};
use crate::export::{ExportedKey, export_key, import_key};
use crate::storage::KeyValueStore;

/// Storage key of the session-tier entry.
pub const SESSION_KEY_ENTRY: &str = "vault_key";

/// Which tier a backend writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceTier {
    /// Tab-scoped, survives reload, gone with the tab.
    Session,
    /// Device-scoped, survives restart, gated by a biometric challenge.
    BiometricEscrow,
}

/// Strategy interface over the two key persistence tiers.
#[async_trait]
pub trait KeyPersistenceBackend: Send + Sync {
    /// The tier this backend writes to.
    fn tier(&self) -> PersistenceTier;

    /// Persist `key` on behalf of `owner`, replacing any previous copy.
    async fn persist(&self, owner: &str, key: &VaultKey) -> Result<()>;

    /// Restore the persisted key.
    ///
    /// `owner_hint` narrows the lookup to one principal. A copy that belongs
    /// to somebody else is never returned.
    async fn restore(&self, owner_hint: Option<&str>) -> Result<VaultKey>;

    /// Remove the persisted copy that `restore(owner_hint)` would return,
    /// if any.
    async fn discard(&self, owner_hint: Option<&str>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Session tier
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct SessionEntry {
    owner: String,
    key: String,
}

/// Ephemeral, tab-scoped persistence of the exported key.
#[derive(Clone)]
pub struct SessionTier {
    store: Arc<dyn KeyValueStore>,
}

impl SessionTier {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Remove the entry regardless of who owns it.
    pub async fn clear(&self) -> Result<()> {
        self.store.remove(SESSION_KEY_ENTRY).await
    }
}

#[async_trait]
impl KeyPersistenceBackend for SessionTier {
    fn tier(&self) -> PersistenceTier {
        PersistenceTier::Session
    }

    async fn persist(&self, owner: &str, key: &VaultKey) -> Result<()> {
        let exported = export_key(key)?;
        let entry = SessionEntry {
            owner: owner.to_string(),
            key: exported.as_str().to_string(),
        };
        self.store
            .set(SESSION_KEY_ENTRY, &serde_json::to_string(&entry)?)
            .await?;
        tracing::debug!(principal = owner, "persisted vault key to session tier");
        Ok(())
    }

    async fn restore(&self, owner_hint: Option<&str>) -> Result<VaultKey> {
        let raw = self
            .store
            .get(SESSION_KEY_ENTRY)
            .await?
            .ok_or(VaultError::KeyUnavailable)?;

        let entry: SessionEntry =
            serde_json::from_str(&raw).map_err(|e| VaultError::ImportFailed {
                reason: format!("session entry is not valid JSON: {e}"),
            })?;

        if let Some(owner) = owner_hint {
            if entry.owner != owner {
                return Err(VaultError::ImportFailed {
                    reason: "session key belongs to a different principal".into(),
                });
            }
        }

        import_key(&ExportedKey::from_stored(entry.key))
    }

    /// The tier has a single slot, so it is cleared whoever owns it.
    async fn discard(&self, owner_hint: Option<&str>) -> Result<()> {
        self.clear().await?;
        tracing::debug!(principal = ?owner_hint, "discarded session-tier vault key");
        Ok(())
    }
}
