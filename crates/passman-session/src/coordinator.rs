//! Access state coordinator.
//!
//! [`AccessCoordinator`] combines the identity provider's view, the session
//! key store and the second-factor status into one [`AccessState`]. It is the
//! single writer of that state: every operation takes the session lock,
//! talks to its collaborators, and publishes the outcome on a `watch`
//! channel (current state) and a `broadcast` channel ([`AccessEvent`]s).
//!
//! Key availability is never inferred from data. Vault reads and writes are
//! allowed iff the state is exactly [`AccessState::Unlocked`].
//!
//! Lock ordering: the session lock is always taken before the key store's
//! lock. Callers outside this module must release any key guard before
//! calling back into the coordinator.

use std::sync::Arc;

use passman_vault::crypto::{self, KdfParams};
use passman_vault::{
    BiometricEscrow, KeyValueStore, PlatformAuthenticator, SessionKeyStore, VaultError, VaultKey,
};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::activity::{ActivityClock, Clock, SystemClock};
use crate::collaborators::{
    Credentials, Identity, IdentityProvider, SecondFactorService, TotpEnrollment, TwoFactorStatus,
};
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::state::{
    AccessEvent, AccessState, LockReason, RouteDecision, SignOutReason, UnlockMethod,
};

/// Ephemeral-tier key naming the principal that verified the second factor
/// in this tab.
pub const SECOND_FACTOR_VERIFIED_ENTRY: &str = "second_factor_verified";

/// Capacity of the [`AccessEvent`] broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Session {
    state: AccessState,
    identity: Option<Identity>,
    second_factor: TwoFactorStatus,
    /// Check value of the key installed for this identity; survives `lock`.
    key_check: Option<String>,
    /// Whether the installed key has decrypted at least one record.
    key_confirmed: bool,
}

impl Session {
    fn new() -> Self {
        Self {
            state: AccessState::Anonymous,
            identity: None,
            second_factor: TwoFactorStatus::default(),
            key_check: None,
            key_confirmed: false,
        }
    }

    fn principal(&self) -> String {
        self.identity
            .as_ref()
            .map(|i| i.principal_id.clone())
            .unwrap_or_default()
    }

    fn require_state(&self, state: AccessState) -> Result<Identity> {
        match &self.identity {
            Some(identity) if self.state == state => Ok(identity.clone()),
            _ => Err(SessionError::AccessDenied { state: self.state }),
        }
    }

    fn expect_state(&self, from: AccessState, to: AccessState) -> Result<Identity> {
        match &self.identity {
            Some(identity) if self.state == from => Ok(identity.clone()),
            _ => Err(SessionError::InvalidTransition {
                from: self.state,
                to,
            }),
        }
    }
}

struct Inner {
    identity_provider: Arc<dyn IdentityProvider>,
    second_factor: Arc<dyn SecondFactorService>,
    keys: SessionKeyStore,
    ephemeral: Arc<dyn KeyValueStore>,
    escrow: Option<BiometricEscrow>,
    activity: ActivityClock,
    kdf: KdfParams,
    session: Mutex<Session>,
    state_tx: watch::Sender<AccessState>,
    events_tx: broadcast::Sender<AccessEvent>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`AccessCoordinator`].
pub struct AccessCoordinatorBuilder {
    identity_provider: Arc<dyn IdentityProvider>,
    second_factor: Arc<dyn SecondFactorService>,
    ephemeral: Arc<dyn KeyValueStore>,
    device: Arc<dyn KeyValueStore>,
    authenticator: Option<Arc<dyn PlatformAuthenticator>>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
}

impl AccessCoordinatorBuilder {
    /// Enable biometric escrow through `authenticator`.
    pub fn authenticator(mut self, authenticator: Arc<dyn PlatformAuthenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// # Errors
    ///
    /// Returns [`SessionError::InvalidConfig`] if the configuration does not
    /// validate.
    pub fn build(self) -> Result<AccessCoordinator> {
        self.config.validate()?;
        let kdf = self.config.kdf_params()?;

        let escrow = self
            .authenticator
            .map(|authenticator| BiometricEscrow::new(Arc::clone(&self.device), authenticator));
        let activity = ActivityClock::new(self.device, self.clock, self.config.idle_timeout());
        let (state_tx, _) = watch::channel(AccessState::Anonymous);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(AccessCoordinator {
            inner: Arc::new(Inner {
                identity_provider: self.identity_provider,
                second_factor: self.second_factor,
                keys: SessionKeyStore::new(Arc::clone(&self.ephemeral)),
                ephemeral: self.ephemeral,
                escrow,
                activity,
                kdf,
                session: Mutex::new(Session::new()),
                state_tx,
                events_tx,
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// AccessCoordinator
// ---------------------------------------------------------------------------

/// Single-writer owner of the session's access state.
///
/// Cheap to clone; every clone drives the same session.
#[derive(Clone)]
pub struct AccessCoordinator {
    inner: Arc<Inner>,
}

impl AccessCoordinator {
    /// Start building a coordinator for one execution context.
    ///
    /// `ephemeral` is this tab's store, `device` the persistent store shared
    /// by every context on the device.
    pub fn builder(
        identity_provider: Arc<dyn IdentityProvider>,
        second_factor: Arc<dyn SecondFactorService>,
        ephemeral: Arc<dyn KeyValueStore>,
        device: Arc<dyn KeyValueStore>,
    ) -> AccessCoordinatorBuilder {
        AccessCoordinatorBuilder {
            identity_provider,
            second_factor,
            ephemeral,
            device,
            authenticator: None,
            clock: Arc::new(SystemClock),
            config: SessionConfig::default(),
        }
    }

    // -- Observation --------------------------------------------------------

    pub fn state(&self) -> AccessState {
        *self.inner.state_tx.borrow()
    }

    /// Route-guard decision for the current state.
    pub fn guard(&self) -> RouteDecision {
        self.state().route_decision()
    }

    /// `Ok` iff the state is exactly [`AccessState::Unlocked`].
    pub fn require_unlocked(&self) -> Result<()> {
        match self.state() {
            AccessState::Unlocked => Ok(()),
            state => Err(SessionError::AccessDenied { state }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<AccessState> {
        self.inner.state_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<AccessEvent> {
        self.inner.events_tx.subscribe()
    }

    pub async fn identity(&self) -> Option<Identity> {
        self.inner.session.lock().await.identity.clone()
    }

    pub async fn second_factor_status(&self) -> TwoFactorStatus {
        self.inner.session.lock().await.second_factor
    }

    /// The session key store. Consumers borrow the key from it for one
    /// operation at a time.
    pub fn keys(&self) -> &SessionKeyStore {
        &self.inner.keys
    }

    pub fn activity(&self) -> &ActivityClock {
        &self.inner.activity
    }

    /// Whether a platform authenticator was configured.
    pub fn biometrics_available(&self) -> bool {
        self.inner.escrow.is_some()
    }

    /// Whether `principal` has a biometric escrow on this device.
    pub async fn has_biometric_escrow(&self, principal: &str) -> Result<bool> {
        match &self.inner.escrow {
            Some(escrow) => Ok(escrow.is_enrolled(principal).await?),
            None => Ok(false),
        }
    }

    // -- Primary sign-in ----------------------------------------------------

    /// Create an account, derive its vault key and unlock.
    ///
    /// New accounts have no second factor, so this goes straight to
    /// `Unlocked`.
    #[instrument(skip(self, password, passphrase))]
    pub async fn register(&self, email: &str, password: &str, passphrase: &str) -> Result<AccessState> {
        let mut session = self.inner.session.lock().await;
        self.transition(&mut session, AccessState::AuthenticatingPrimary)?;

        let identity = match self.inner.identity_provider.register(email, password).await {
            Ok(identity) => identity,
            Err(e) => {
                return self.fail_primary(
                    &mut session,
                    SessionError::AuthFailed {
                        reason: e.to_string(),
                    },
                );
            }
        };
        let key = match self.derive(passphrase, &identity).await {
            Ok(key) => key,
            Err(e) => {
                self.sign_out_provider(&identity).await;
                return self.fail_primary(&mut session, e);
            }
        };

        self.clear_second_factor_flag().await;
        self.install_key(&mut session, &identity, key).await;
        let principal = identity.principal_id.clone();
        session.second_factor = TwoFactorStatus::default();
        session.identity = Some(identity);

        self.transition(&mut session, AccessState::Unlocked)?;
        self.on_unlocked(&principal, UnlockMethod::Passphrase).await;
        tracing::info!(principal = %principal, "account registered");
        Ok(AccessState::Unlocked)
    }

    /// Sign in with account credentials and derive the vault key from the
    /// master passphrase in the same action.
    ///
    /// Ends in `AwaitingSecondFactor` when the account has a second factor
    /// (or its status cannot be fetched), otherwise `Unlocked`.
    #[instrument(skip(self, password, passphrase))]
    pub async fn sign_in(&self, email: &str, password: &str, passphrase: &str) -> Result<AccessState> {
        let mut session = self.inner.session.lock().await;
        self.transition(&mut session, AccessState::AuthenticatingPrimary)?;

        let credentials = Credentials::Password {
            email: email.to_string(),
            password: password.to_string(),
        };
        let identity = match self.inner.identity_provider.authenticate(credentials).await {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!(error = %e, "primary sign-in rejected");
                return self.fail_primary(
                    &mut session,
                    SessionError::AuthFailed {
                        reason: e.to_string(),
                    },
                );
            }
        };
        let key = match self.derive(passphrase, &identity).await {
            Ok(key) => key,
            Err(e) => {
                self.sign_out_provider(&identity).await;
                return self.fail_primary(&mut session, e);
            }
        };

        self.clear_second_factor_flag().await;
        self.install_key(&mut session, &identity, key).await;
        self.settle(&mut session, identity, UnlockMethod::Passphrase)
            .await
    }

    /// Sign in through the biometric escrow, without passphrase or password.
    ///
    /// A failed or cancelled challenge returns to `Anonymous` with nothing
    /// touched. A verified challenge whose stored key does not decode still
    /// signs the identity in, but leaves the vault `Locked`.
    #[instrument(skip(self))]
    pub async fn sign_in_with_biometrics(&self, principal_hint: Option<&str>) -> Result<AccessState> {
        let escrow = self.escrow(principal_hint)?;
        let mut session = self.inner.session.lock().await;
        self.transition(&mut session, AccessState::AuthenticatingPrimary)?;

        let verified = match escrow.challenge(principal_hint).await {
            Ok(verified) => verified,
            Err(e) => {
                tracing::info!(error = %e, "biometric sign-in did not verify");
                return self.fail_primary(&mut session, e.into());
            }
        };

        let Some(token) = verified.assertion().sign_in_token.clone() else {
            return self.fail_primary(
                &mut session,
                SessionError::AuthFailed {
                    reason: "assertion carried no sign-in token".into(),
                },
            );
        };
        let identity = match self
            .inner
            .identity_provider
            .authenticate(Credentials::Assertion { token })
            .await
        {
            Ok(identity) => identity,
            Err(e) => {
                return self.fail_primary(
                    &mut session,
                    SessionError::AuthFailed {
                        reason: e.to_string(),
                    },
                );
            }
        };
        if identity.principal_id != verified.owner() {
            self.sign_out_provider(&identity).await;
            return self.fail_primary(
                &mut session,
                SessionError::AuthFailed {
                    reason: "assertion is bound to a different principal".into(),
                },
            );
        }

        self.clear_second_factor_flag().await;
        match escrow.unseal(verified).await {
            Ok(key) => self.install_key(&mut session, &identity, key).await,
            Err(e) => {
                tracing::warn!(principal = %identity.principal_id, error = %e, "escrowed key unusable, continuing locked");
                self.emit(AccessEvent::KeyRecoveryFailed {
                    reason: e.to_string(),
                });
            }
        }
        self.settle(&mut session, identity, UnlockMethod::Biometric)
            .await
    }

    // -- Second factor ------------------------------------------------------

    /// Submit a one-time code while `AwaitingSecondFactor`.
    ///
    /// A wrong code is [`SessionError::SecondFactorRejected`] and leaves the
    /// state unchanged; the caller decides how many retries to allow.
    #[instrument(skip(self, code))]
    pub async fn verify_second_factor(&self, code: &str) -> Result<AccessState> {
        let mut session = self.inner.session.lock().await;
        let identity = session.expect_state(AccessState::AwaitingSecondFactor, AccessState::Unlocked)?;

        if !self.inner.second_factor.verify_code(&identity, code).await? {
            tracing::warn!(principal = %identity.principal_id, "second-factor code rejected");
            return Err(SessionError::SecondFactorRejected);
        }

        self.set_second_factor_flag(&identity.principal_id).await;
        session.second_factor.verified_this_session = true;

        let next = if self.inner.keys.is_available() {
            AccessState::Unlocked
        } else {
            AccessState::Locked
        };
        self.transition(&mut session, next)?;
        self.after_key_decision(&identity.principal_id, next, UnlockMethod::SecondFactor)
            .await;
        Ok(next)
    }

    /// Give up on the pending second-factor challenge and sign out.
    pub async fn abandon_second_factor(&self) -> Result<()> {
        let mut session = self.inner.session.lock().await;
        if session.state != AccessState::AwaitingSecondFactor {
            return Ok(());
        }
        self.end_session(&mut session, SignOutReason::SecondFactorAbandoned)
            .await
    }

    /// Start TOTP enrollment for the signed-in account.
    pub async fn begin_second_factor_setup(&self) -> Result<TotpEnrollment> {
        let session = self.inner.session.lock().await;
        let identity = session.require_state(AccessState::Unlocked)?;
        Ok(self.inner.second_factor.begin_enrollment(&identity).await?)
    }

    /// Confirm TOTP enrollment with a first code.
    ///
    /// The code doubles as this session's verification.
    pub async fn enable_second_factor(&self, code: &str) -> Result<()> {
        let mut session = self.inner.session.lock().await;
        let identity = session.require_state(AccessState::Unlocked)?;

        if !self.inner.second_factor.enable(&identity, code).await? {
            return Err(SessionError::SecondFactorRejected);
        }
        self.set_second_factor_flag(&identity.principal_id).await;
        session.second_factor = TwoFactorStatus {
            enabled: true,
            verified_this_session: true,
        };
        tracing::info!(principal = %identity.principal_id, "second factor enabled");
        Ok(())
    }

    pub async fn disable_second_factor(&self) -> Result<()> {
        let mut session = self.inner.session.lock().await;
        let identity = session.require_state(AccessState::Unlocked)?;

        self.inner.second_factor.disable(&identity).await?;
        self.clear_second_factor_flag().await;
        session.second_factor = TwoFactorStatus::default();
        tracing::info!(principal = %identity.principal_id, "second factor disabled");
        Ok(())
    }

    // -- Lock / unlock ------------------------------------------------------

    /// Re-derive the key from the passphrase while `Locked`.
    ///
    /// When this session's previous key was confirmed against real records,
    /// a passphrase producing a different key is refused with
    /// [`SessionError::PassphraseMismatch`]. An unconfirmed key (a mistyped
    /// sign-in, a restored key never used) is simply replaced.
    #[instrument(skip(self, passphrase))]
    pub async fn unlock_with_passphrase(&self, passphrase: &str) -> Result<AccessState> {
        let mut session = self.inner.session.lock().await;
        let identity = session.expect_state(AccessState::Locked, AccessState::Unlocked)?;

        let key = self.derive(passphrase, &identity).await?;
        if session.key_confirmed {
            if let Some(expected) = &session.key_check {
                if key.check_value() != *expected {
                    tracing::warn!(principal = %identity.principal_id, "passphrase does not match session key");
                    return Err(SessionError::PassphraseMismatch);
                }
            }
        }

        self.install_key(&mut session, &identity, key).await;
        self.transition(&mut session, AccessState::Unlocked)?;
        self.on_unlocked(&identity.principal_id, UnlockMethod::Passphrase)
            .await;
        Ok(AccessState::Unlocked)
    }

    /// Recover the key from the biometric escrow while `Locked`.
    ///
    /// Any recovery failure leaves the state `Locked`.
    #[instrument(skip(self))]
    pub async fn unlock_with_biometrics(&self) -> Result<AccessState> {
        let mut session = self.inner.session.lock().await;
        let identity = session.expect_state(AccessState::Locked, AccessState::Unlocked)?;
        let escrow = self.escrow(Some(&identity.principal_id))?;

        let key = escrow.recover(Some(&identity.principal_id)).await?;
        self.install_key(&mut session, &identity, key).await;
        self.transition(&mut session, AccessState::Unlocked)?;
        self.on_unlocked(&identity.principal_id, UnlockMethod::Biometric)
            .await;
        Ok(AccessState::Unlocked)
    }

    /// Drop the key but keep the identity.
    pub async fn lock(&self) -> Result<AccessState> {
        let mut session = self.inner.session.lock().await;
        match session.state {
            AccessState::Locked => return Ok(AccessState::Locked),
            AccessState::Unlocked => {}
            from => {
                return Err(SessionError::InvalidTransition {
                    from,
                    to: AccessState::Locked,
                });
            }
        }

        self.discard_key().await;
        self.transition(&mut session, AccessState::Locked)?;
        let principal = session.principal();
        tracing::info!(principal = %principal, "vault locked");
        self.emit(AccessEvent::Locked {
            principal,
            reason: LockReason::UserRequested,
        });
        Ok(AccessState::Locked)
    }

    // -- Sign-out -----------------------------------------------------------

    pub async fn sign_out(&self) -> Result<()> {
        let mut session = self.inner.session.lock().await;
        self.end_session(&mut session, SignOutReason::UserRequested)
            .await
    }

    /// Force the idle sign-out.
    ///
    /// Only acts while `Unlocked`. The key leaves the session tier and the
    /// second-factor verification resets; the biometric escrow is kept.
    /// Returns whether the session was expired.
    pub async fn expire_idle_session(&self) -> Result<bool> {
        let mut session = self.inner.session.lock().await;
        if session.state != AccessState::Unlocked {
            return Ok(false);
        }
        tracing::info!(principal = %session.principal(), "idle timeout reached, signing out");
        self.end_session(&mut session, SignOutReason::IdleTimeout)
            .await?;
        Ok(true)
    }

    /// Compare the shared activity timestamp against the idle threshold and
    /// expire the session if it has been reached.
    pub async fn check_idle(&self) -> Result<bool> {
        if self.state() != AccessState::Unlocked {
            return Ok(false);
        }
        if !self.inner.activity.is_expired().await? {
            return Ok(false);
        }
        self.expire_idle_session().await
    }

    // -- Reload / external identity ----------------------------------------

    /// Reconcile with the identity provider's current identity, restoring
    /// the key from the session tier if this tab still has it.
    #[instrument(skip(self))]
    pub async fn restore_session(&self) -> Result<AccessState> {
        let mut session = self.inner.session.lock().await;
        let rx = self.inner.identity_provider.identity_changes();
        let current = rx.borrow().clone();
        self.apply_identity(&mut session, current).await?;
        Ok(session.state)
    }

    /// Apply an identity reported by the provider.
    ///
    /// `None` while signed in ends the session. A different principal ends
    /// the current session and restores the new one.
    pub async fn handle_identity_change(&self, next: Option<Identity>) -> Result<AccessState> {
        let mut session = self.inner.session.lock().await;
        self.apply_identity(&mut session, next).await?;
        Ok(session.state)
    }

    /// Follow the identity provider's changes on a background task.
    ///
    /// The task holds a clone of the coordinator and runs until the
    /// provider's channel closes or the handle is aborted.
    pub fn spawn_identity_listener(&self) -> JoinHandle<()> {
        let coordinator = self.clone();
        let mut rx = self.inner.identity_provider.identity_changes();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                if let Err(e) = coordinator.restore_session().await {
                    tracing::warn!(error = %e, "failed to apply identity change");
                }
            }
            tracing::debug!("identity provider channel closed");
        })
    }

    // -- Biometric enrollment ----------------------------------------------

    /// Escrow the current key behind a new platform credential.
    ///
    /// Requires `Unlocked`. A declined or unsupported enrollment leaves the
    /// vault usable. The session lock is released while the platform prompt
    /// is open, so a lock, sign-out or idle expiry can still happen; in that
    /// case nothing is written and the enrollment fails.
    #[instrument(skip(self))]
    pub async fn enroll_biometrics(&self) -> Result<()> {
        let identity = {
            let session = self.inner.session.lock().await;
            session.require_state(AccessState::Unlocked)?
        };
        let escrow = self
            .inner
            .escrow
            .as_ref()
            .ok_or_else(|| VaultError::EnrollmentFailed {
                reason: "no platform authenticator configured".into(),
            })?;

        let attestation = escrow
            .register(&identity.principal_id, &identity.email)
            .await?;

        let session = self.inner.session.lock().await;
        let still_unlocked = session
            .require_state(AccessState::Unlocked)
            .is_ok_and(|current| current.principal_id == identity.principal_id);
        if !still_unlocked {
            tracing::warn!(principal = %identity.principal_id, state = %session.state, "session changed during biometric enrollment");
            return Err(VaultError::EnrollmentFailed {
                reason: "the vault was locked before enrollment completed".into(),
            }
            .into());
        }

        let key = self.inner.keys.read().await?;
        escrow.seal(&identity.principal_id, attestation, &key).await?;
        drop(key);
        drop(session);

        self.emit(AccessEvent::BiometricEnrolled {
            principal: identity.principal_id,
        });
        Ok(())
    }

    /// Called once the installed key has decrypted real data. Removes an
    /// escrow record that wraps a different key.
    pub(crate) async fn confirm_key(&self) {
        let mut session = self.inner.session.lock().await;
        if session.key_confirmed || session.state != AccessState::Unlocked {
            return;
        }
        session.key_confirmed = true;

        let (Some(escrow), Some(identity)) = (&self.inner.escrow, &session.identity) else {
            return;
        };
        let Ok(key) = self.inner.keys.read().await else {
            return;
        };
        match escrow.invalidate_if_stale(&identity.principal_id, &key).await {
            Ok(true) => self.emit(AccessEvent::EscrowInvalidated {
                principal: identity.principal_id.clone(),
            }),
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "failed to check escrow staleness"),
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn transition(&self, session: &mut Session, to: AccessState) -> Result<()> {
        let from = session.state;
        if from == to {
            return Ok(());
        }
        if !from.can_transition_to(to) {
            return Err(SessionError::InvalidTransition { from, to });
        }

        session.state = to;
        self.inner.state_tx.send_replace(to);
        tracing::info!(from = %from, to = %to, "access state changed");
        self.emit(AccessEvent::StateChanged {
            from,
            to,
            at: self.inner.activity.now(),
        });
        Ok(())
    }

    fn emit(&self, event: AccessEvent) {
        // No subscribers is fine.
        let _ = self.inner.events_tx.send(event);
    }

    fn fail_primary<T>(&self, session: &mut Session, err: SessionError) -> Result<T> {
        self.transition(session, AccessState::Anonymous)?;
        Err(err)
    }

    fn escrow(&self, principal_hint: Option<&str>) -> Result<&BiometricEscrow> {
        self.inner.escrow.as_ref().ok_or_else(|| {
            SessionError::Vault(VaultError::EscrowNotFound {
                principal: principal_hint.unwrap_or("<any>").to_string(),
            })
        })
    }

    async fn derive(&self, passphrase: &str, identity: &Identity) -> Result<VaultKey> {
        Ok(crypto::derive_key(passphrase, &identity.email, self.inner.kdf).await?)
    }

    async fn install_key(&self, session: &mut Session, identity: &Identity, key: VaultKey) {
        let check = key.check_value();
        // Re-installing the confirmed key keeps it confirmed.
        session.key_confirmed &= session.key_check.as_ref() == Some(&check);
        session.key_check = Some(check);
        self.inner.keys.install(&identity.principal_id, key).await;
    }

    async fn discard_key(&self) {
        if let Err(e) = self.inner.keys.clear().await {
            tracing::warn!(error = %e, "failed to clear session-tier key");
        }
    }

    /// Decide the post-identity state: second factor first, then key.
    async fn settle(
        &self,
        session: &mut Session,
        identity: Identity,
        method: UnlockMethod,
    ) -> Result<AccessState> {
        let status = self.fetch_second_factor_status(&identity).await;
        let principal = identity.principal_id.clone();
        session.second_factor = status;
        session.identity = Some(identity);

        let next = if status.enabled && !status.verified_this_session {
            AccessState::AwaitingSecondFactor
        } else if self.inner.keys.is_available() {
            AccessState::Unlocked
        } else {
            AccessState::Locked
        };
        self.transition(session, next)?;
        self.after_key_decision(&principal, next, method).await;
        Ok(next)
    }

    async fn after_key_decision(&self, principal: &str, state: AccessState, method: UnlockMethod) {
        match state {
            AccessState::Unlocked => self.on_unlocked(principal, method).await,
            AccessState::Locked => self.emit(AccessEvent::Locked {
                principal: principal.to_string(),
                reason: LockReason::KeyUnavailable,
            }),
            _ => {}
        }
    }

    async fn on_unlocked(&self, principal: &str, method: UnlockMethod) {
        // A reload must not reset the idle clock.
        if method.is_interactive() {
            if let Err(e) = self.inner.activity.touch().await {
                tracing::warn!(error = %e, "failed to record unlock activity");
            }
        }
        tracing::info!(principal = %principal, method = ?method, "vault unlocked");
        self.emit(AccessEvent::Unlocked {
            principal: principal.to_string(),
            method,
        });
    }

    async fn apply_identity(&self, session: &mut Session, next: Option<Identity>) -> Result<()> {
        let current = session.identity.as_ref().map(|i| i.principal_id.clone());
        match (current, next) {
            (None, None) => Ok(()),
            (Some(_), None) => {
                self.end_session(session, SignOutReason::IdentityRevoked)
                    .await
            }
            (Some(current), Some(identity)) if current == identity.principal_id => {
                session.identity = Some(identity);
                Ok(())
            }
            (Some(_), Some(identity)) => {
                self.end_session(session, SignOutReason::IdentityChanged)
                    .await?;
                self.restore(session, identity).await
            }
            (None, Some(identity)) => self.restore(session, identity).await,
        }
    }

    async fn restore(&self, session: &mut Session, identity: Identity) -> Result<()> {
        self.transition(session, AccessState::AuthenticatingPrimary)?;

        if self.inner.keys.restore(&identity.principal_id).await {
            session.key_check = self
                .inner
                .keys
                .read()
                .await
                .ok()
                .map(|key| key.check_value());
            session.key_confirmed = false;
        }
        self.settle(session, identity, UnlockMethod::SessionRestore)
            .await?;
        Ok(())
    }

    async fn end_session(&self, session: &mut Session, reason: SignOutReason) -> Result<()> {
        let identity = session.identity.take();
        if let Some(identity) = &identity {
            if reason != SignOutReason::IdentityRevoked && reason != SignOutReason::IdentityChanged {
                self.sign_out_provider(identity).await;
            }
        }

        self.discard_key().await;
        self.clear_second_factor_flag().await;
        session.second_factor = TwoFactorStatus::default();
        session.key_check = None;
        session.key_confirmed = false;

        let was = session.state;
        self.transition(session, AccessState::Anonymous)?;
        if was != AccessState::Anonymous {
            tracing::info!(reason = ?reason, "signed out");
            self.emit(AccessEvent::SignedOut {
                principal: identity.map(|i| i.principal_id),
                reason,
            });
        }
        Ok(())
    }

    async fn sign_out_provider(&self, identity: &Identity) {
        if let Err(e) = self.inner.identity_provider.sign_out(identity).await {
            tracing::warn!(principal = %identity.principal_id, error = %e, "identity provider sign-out failed");
        }
    }

    /// Second-factor status with fail-closed semantics: an unreachable
    /// service counts as enabled. Verification is tracked per tab.
    async fn fetch_second_factor_status(&self, identity: &Identity) -> TwoFactorStatus {
        let verified_this_session = self.second_factor_flag(&identity.principal_id).await;
        match self.inner.second_factor.status(identity).await {
            Ok(status) => TwoFactorStatus {
                enabled: status.enabled,
                verified_this_session,
            },
            Err(e) => {
                tracing::warn!(principal = %identity.principal_id, error = %e, "second-factor status unavailable, requiring verification");
                TwoFactorStatus {
                    enabled: true,
                    verified_this_session,
                }
            }
        }
    }

    async fn second_factor_flag(&self, principal: &str) -> bool {
        match self.inner.ephemeral.get(SECOND_FACTOR_VERIFIED_ENTRY).await {
            Ok(value) => value.as_deref() == Some(principal),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read second-factor flag");
                false
            }
        }
    }

    async fn set_second_factor_flag(&self, principal: &str) {
        if let Err(e) = self
            .inner
            .ephemeral
            .set(SECOND_FACTOR_VERIFIED_ENTRY, principal)
            .await
        {
            tracing::warn!(error = %e, "failed to persist second-factor flag");
        }
    }

    async fn clear_second_factor_flag(&self) {
        if let Err(e) = self.inner.ephemeral.remove(SECOND_FACTOR_VERIFIED_ENTRY).await {
            tracing::warn!(error = %e, "failed to clear second-factor flag");
        }
    }
}
