//! The single owner of the live vault key.
//!
//! [`SessionKeyStore`] holds the active [`VaultKey`] in memory and mirrors an
//! exported copy through a [`KeyPersistenceBackend`], by default the
//! [`SessionTier`], so that a reload in the same tab can restore it. No other
//! component keeps its own copy: consumers borrow the key through
//! [`SessionKeyStore::read`] for the duration of one operation.
//!
//! Key availability is observable through a `watch` channel so that callers
//! can sequence record fetches after the key is in place instead of racing
//! them.

use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard, watch};

use crate::crypto::VaultKey;
use crate::error::{Result, VaultError};
use crate::persistence::{KeyPersistenceBackend, SessionTier};
use crate::storage::KeyValueStore;

struct ActiveKey {
    owner: String,
    key: VaultKey,
}

/// Tab-scoped holder of the active vault key.
pub struct SessionKeyStore {
    active: RwLock<Option<ActiveKey>>,
    backend: Arc<dyn KeyPersistenceBackend>,
    available: watch::Sender<bool>,
}

impl SessionKeyStore {
    /// Create an empty store whose session tier lives in `ephemeral`.
    pub fn new(ephemeral: Arc<dyn KeyValueStore>) -> Self {
        Self::with_backend(Arc::new(SessionTier::new(ephemeral)))
    }

    /// Create an empty store mirroring into `backend`.
    pub fn with_backend(backend: Arc<dyn KeyPersistenceBackend>) -> Self {
        let (available, _) = watch::channel(false);
        Self {
            active: RwLock::new(None),
            backend,
            available,
        }
    }

    /// Install `key` as the active key for `owner`, replacing (and zeroing)
    /// any previous one, and mirror it into the backend.
    ///
    /// A failed mirror write is logged and otherwise ignored: the key is
    /// still valid in memory, only reload survival is lost.
    pub async fn install(&self, owner: &str, key: VaultKey) {
        if let Err(e) = self.backend.persist(owner, &key).await {
            tracing::warn!(principal = owner, tier = ?self.backend.tier(), error = %e, "failed to mirror vault key");
        }
        *self.active.write().await = Some(ActiveKey {
            owner: owner.to_string(),
            key,
        });
        self.available.send_replace(true);
        tracing::debug!(principal = owner, "vault key installed");
    }

    /// Try to restore the key for `owner` after a reload.
    ///
    /// Returns `true` if a key is now available. Missing, corrupt or foreign
    /// entries yield `false`; corrupt and foreign entries are removed so they
    /// are not retried.
    pub async fn restore(&self, owner: &str) -> bool {
        match self.backend.restore(Some(owner)).await {
            Ok(key) => {
                *self.active.write().await = Some(ActiveKey {
                    owner: owner.to_string(),
                    key,
                });
                self.available.send_replace(true);
                tracing::info!(principal = owner, "vault key restored");
                true
            }
            Err(VaultError::KeyUnavailable) => {
                tracing::debug!(principal = owner, "no persisted vault key");
                false
            }
            Err(e @ (VaultError::ImportFailed { .. } | VaultError::EscrowCorrupted { .. })) => {
                tracing::warn!(principal = owner, error = %e, "discarding unusable persisted key");
                if let Err(e) = self.backend.discard(Some(owner)).await {
                    tracing::warn!(error = %e, "failed to remove unusable persisted key");
                }
                false
            }
            Err(e) => {
                tracing::warn!(principal = owner, error = %e, "failed to restore vault key");
                false
            }
        }
    }

    /// Drop the in-memory key and remove its persisted copy.
    pub async fn clear(&self) -> Result<()> {
        // Dropping the old key zeroes it.
        let previous = self.active.write().await.take();
        self.available.send_replace(false);
        let owner = previous.as_ref().map(|active| active.owner.as_str());
        self.backend.discard(owner).await?;
        tracing::debug!("vault key cleared");
        Ok(())
    }

    /// Whether a key is currently held.
    pub fn is_available(&self) -> bool {
        *self.available.borrow()
    }

    /// Subscribe to key availability changes.
    pub fn watch_availability(&self) -> watch::Receiver<bool> {
        self.available.subscribe()
    }

    /// Borrow the active key.
    ///
    /// The returned guard holds a read lock; clearing the key waits until
    /// every outstanding guard is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::KeyUnavailable`] when no key is held.
    pub async fn read(&self) -> Result<RwLockReadGuard<'_, VaultKey>> {
        let guard = self.active.read().await;
        RwLockReadGuard::try_map(guard, |active| active.as_ref().map(|a| &a.key))
            .map_err(|_| VaultError::KeyUnavailable)
    }
}
