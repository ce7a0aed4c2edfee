//! Guarded read/write access to the user's stored credentials.
//!
//! Every operation checks the coordinator's guard first and then borrows the
//! key from the session key store for that one call. Decryption failures are
//! reported per record; they never turn into an empty vault.

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use passman_vault::crypto::{decrypt_field, encrypt_field};
use passman_vault::{VaultError, VaultKey};
use uuid::Uuid;

use crate::collaborators::{ProviderError, SecretRecord, SecretRepository};
use crate::coordinator::AccessCoordinator;
use crate::error::{Result, SessionError};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// One record after decryption was attempted.
pub struct DecryptedRecord {
    pub id: String,
    pub site: String,
    pub username: String,
    /// The plaintext password, or why this record could not be decrypted.
    pub password: std::result::Result<String, VaultError>,
}

impl DecryptedRecord {
    pub fn is_decrypted(&self) -> bool {
        self.password.is_ok()
    }
}

impl fmt::Debug for DecryptedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let password = match &self.password {
            Ok(_) => "<redacted>".to_string(),
            Err(e) => format!("error: {e}"),
        };
        f.debug_struct("DecryptedRecord")
            .field("id", &self.id)
            .field("site", &self.site)
            .field("username", &self.username)
            .field("password", &password)
            .finish()
    }
}

/// Result of listing the vault.
#[derive(Debug)]
pub struct VaultListing {
    pub records: Vec<DecryptedRecord>,
}

impl VaultListing {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records that failed to decrypt.
    pub fn failed(&self) -> usize {
        self.records.iter().filter(|r| !r.is_decrypted()).count()
    }

    /// Whether there were records and none of them decrypted, which most
    /// likely means the key itself is wrong and the user should
    /// re-authenticate.
    pub fn key_rejected(&self) -> bool {
        !self.records.is_empty() && self.failed() == self.records.len()
    }
}

// ---------------------------------------------------------------------------
// VaultAccess
// ---------------------------------------------------------------------------

/// Vault record operations for the signed-in user.
#[derive(Clone)]
pub struct VaultAccess {
    coordinator: AccessCoordinator,
    repository: Arc<dyn SecretRepository>,
}

impl VaultAccess {
    pub fn new(coordinator: AccessCoordinator, repository: Arc<dyn SecretRepository>) -> Self {
        Self {
            coordinator,
            repository,
        }
    }

    /// Fetch and decrypt every record.
    ///
    /// Records are decrypted concurrently; each carries its own outcome.
    pub async fn list(&self) -> Result<VaultListing> {
        self.coordinator.require_unlocked()?;
        let stored = self.repository.list().await.map_err(repository_error)?;

        let records = {
            let key = self.coordinator.keys().read().await?;
            let key: &VaultKey = &key;
            join_all(stored.into_iter().map(|record| async move { decrypt_record(key, record) }))
                .await
        };
        let listing = VaultListing { records };

        if listing.failed() > 0 {
            tracing::warn!(
                total = listing.len(),
                failed = listing.failed(),
                "some vault records could not be decrypted"
            );
        }
        if listing.records.iter().any(DecryptedRecord::is_decrypted) {
            self.coordinator.confirm_key().await;
        }
        Ok(listing)
    }

    pub async fn get(&self, id: &str) -> Result<Option<DecryptedRecord>> {
        self.coordinator.require_unlocked()?;
        let Some(record) = self.repository.get(id).await.map_err(repository_error)? else {
            return Ok(None);
        };

        let record = {
            let key = self.coordinator.keys().read().await?;
            decrypt_record(&key, record)
        };
        if record.is_decrypted() {
            self.coordinator.confirm_key().await;
        }
        Ok(Some(record))
    }

    /// Encrypt and store a new credential. Returns the new record id.
    #[tracing::instrument(skip(self, password))]
    pub async fn add(&self, site: &str, username: &str, password: &str) -> Result<String> {
        let record = self.seal(Uuid::now_v7().to_string(), site, username, password).await?;
        let id = record.id.clone();
        self.repository
            .create(record)
            .await
            .map_err(repository_error)?;

        tracing::debug!(id = %id, "vault record created");
        Ok(id)
    }

    /// Re-encrypt an existing credential under a fresh IV.
    #[tracing::instrument(skip(self, password))]
    pub async fn update(&self, id: &str, site: &str, username: &str, password: &str) -> Result<()> {
        let record = self.seal(id.to_string(), site, username, password).await?;
        self.repository
            .update(record)
            .await
            .map_err(repository_error)?;

        tracing::debug!(id = %id, "vault record updated");
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.coordinator.require_unlocked()?;
        self.repository
            .delete(id)
            .await
            .map_err(repository_error)?;

        tracing::debug!(id = %id, "vault record deleted");
        Ok(())
    }

    async fn seal(&self, id: String, site: &str, username: &str, password: &str) -> Result<SecretRecord> {
        self.coordinator.require_unlocked()?;
        let field = {
            let key = self.coordinator.keys().read().await?;
            encrypt_field(&key, password)?
        };
        Ok(SecretRecord {
            id,
            site: site.to_string(),
            username: username.to_string(),
            ciphertext: field.ciphertext,
            iv: field.iv,
        })
    }
}

fn decrypt_record(key: &VaultKey, record: SecretRecord) -> DecryptedRecord {
    let password = decrypt_field(key, &record.ciphertext, &record.iv);
    if let Err(e) = &password {
        tracing::debug!(id = %record.id, error = %e, "record failed to decrypt");
    }
    DecryptedRecord {
        id: record.id,
        site: record.site,
        username: record.username,
        password,
    }
}

fn repository_error(err: ProviderError) -> SessionError {
    SessionError::Repository {
        reason: err.to_string(),
    }
}
