//! Contracts of the remote and platform services the coordinator drives.
//!
//! None of these are implemented here. Applications plug in their identity
//! provider, second-factor service and secret repository; tests use fakes.
//! Every method returns a typed failure instead of panicking, and the
//! coordinator treats each of them as possibly failing at any time.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

/// Failure reported by a remote collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The request was understood and refused (bad credentials, unknown
    /// account, expired token).
    #[error("rejected: {reason}")]
    Rejected { reason: String },

    /// The service could not be reached or answered with an error.
    #[error("unavailable: {reason}")]
    Unavailable { reason: String },

    /// The addressed record does not exist.
    #[error("not found: {id}")]
    NotFound { id: String },
}

// ---------------------------------------------------------------------------
// Identity provider
// ---------------------------------------------------------------------------

/// An authenticated principal as issued by the identity provider.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable user identifier.
    pub principal_id: String,
    /// Verified email; also the salt source for key derivation.
    pub email: String,
    token: String,
}

impl Identity {
    pub fn new(
        principal_id: impl Into<String>,
        email: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            principal_id: principal_id.into(),
            email: email.into(),
            token: token.into(),
        }
    }

    /// Opaque bearer token handle for calls to remote services.
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("principal_id", &self.principal_id)
            .field("email", &self.email)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Primary credentials.
#[derive(Clone)]
pub enum Credentials {
    /// Account password (distinct from the master passphrase).
    Password { email: String, password: String },
    /// Sign-in token minted after a verified platform assertion.
    Assertion { token: String },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { email, .. } => f
                .debug_struct("Password")
                .field("email", email)
                .field("password", &"<redacted>")
                .finish(),
            Self::Assertion { .. } => f
                .debug_struct("Assertion")
                .field("token", &"<redacted>")
                .finish(),
        }
    }
}

/// Remote identity provider issuing opaque signed session tokens.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Create an account and sign it in.
    async fn register(&self, email: &str, password: &str) -> Result<Identity, ProviderError>;

    /// Check primary credentials.
    async fn authenticate(&self, credentials: Credentials) -> Result<Identity, ProviderError>;

    /// Invalidate the identity's session with the provider.
    async fn sign_out(&self, identity: &Identity) -> Result<(), ProviderError>;

    /// The provider's view of the current identity, updated whenever it
    /// changes (sign-in, sign-out, token revocation).
    fn identity_changes(&self) -> watch::Receiver<Option<Identity>>;
}

// ---------------------------------------------------------------------------
// Second factor
// ---------------------------------------------------------------------------

/// Second-factor state for the current identity and session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwoFactorStatus {
    pub enabled: bool,
    pub verified_this_session: bool,
}

/// Material for enrolling a TOTP authenticator app.
#[derive(Clone, PartialEq, Eq)]
pub struct TotpEnrollment {
    /// Base32 shared secret.
    pub secret: String,
    /// `otpauth://` URL, usually rendered as a QR code.
    pub otpauth_url: String,
}

impl fmt::Debug for TotpEnrollment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TotpEnrollment")
            .field("secret", &"<redacted>")
            .field("otpauth_url", &"<redacted>")
            .finish()
    }
}

/// Remote second-factor (TOTP) service.
#[async_trait]
pub trait SecondFactorService: Send + Sync {
    async fn status(&self, identity: &Identity) -> Result<TwoFactorStatus, ProviderError>;

    /// Check a one-time code. `Ok(false)` means the code was wrong.
    async fn verify_code(&self, identity: &Identity, code: &str) -> Result<bool, ProviderError>;

    /// Generate a new secret for the identity. Not active until [`enable`](Self::enable).
    async fn begin_enrollment(&self, identity: &Identity) -> Result<TotpEnrollment, ProviderError>;

    /// Activate the pending secret. `Ok(false)` means the code was wrong.
    async fn enable(&self, identity: &Identity, code: &str) -> Result<bool, ProviderError>;

    async fn disable(&self, identity: &Identity) -> Result<(), ProviderError>;
}

// ---------------------------------------------------------------------------
// Secret repository
// ---------------------------------------------------------------------------

/// One stored credential. `ciphertext` and `iv` are base64; the core never
/// sees the password in any other form at this boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecord {
    pub id: String,
    pub site: String,
    pub username: String,
    pub ciphertext: String,
    pub iv: String,
}

/// Remote encrypted-blob repository for the signed-in user's records.
#[async_trait]
pub trait SecretRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<SecretRecord>, ProviderError>;

    async fn get(&self, id: &str) -> Result<Option<SecretRecord>, ProviderError>;

    async fn create(&self, record: SecretRecord) -> Result<(), ProviderError>;

    /// Replace an existing record. Unknown ids are [`ProviderError::NotFound`].
    async fn update(&self, record: SecretRecord) -> Result<(), ProviderError>;

    async fn delete(&self, id: &str) -> Result<(), ProviderError>;
}
