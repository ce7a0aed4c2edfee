//! In-memory fakes of every collaborator, plus a harness that wires one
//! execution context (tab) to a shared device store.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use passman_session::collaborators::{
    Credentials, Identity, IdentityProvider, ProviderError, SecondFactorService, SecretRecord,
    SecretRepository, TotpEnrollment, TwoFactorStatus,
};
use passman_session::{AccessCoordinator, AccessState, ManualClock, SessionConfig, VaultAccess};
use passman_vault::{
    Assertion, AssertionOptions, Attestation, AuthenticatorError, KeyValueStore, MemoryStore,
    PlatformAuthenticator, RegistrationOptions,
};
use tokio::sync::{Notify, watch};

pub const EMAIL: &str = "a@x.com";
pub const PASSWORD: &str = "account-password";
pub const PASSPHRASE: &str = "Tr0ub4dor&3";
pub const PRINCIPAL: &str = "uid-a";
pub const TOTP_CODE: &str = "123456";

// ═══════════════════════════════════════════════════════════════════════
//  Identity provider
// ═══════════════════════════════════════════════════════════════════════

/// Accounts keyed by email; biometric tokens are `webauthn:<principal>`.
pub struct FakeIdentityProvider {
    accounts: Mutex<HashMap<String, (String, String)>>,
    current: watch::Sender<Option<Identity>>,
    pub sign_outs: Mutex<u32>,
}

impl FakeIdentityProvider {
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        Self {
            accounts: Mutex::new(HashMap::new()),
            current,
            sign_outs: Mutex::new(0),
        }
    }

    pub fn with_account(self, email: &str, password: &str, principal: &str) -> Self {
        self.accounts
            .lock()
            .unwrap()
            .insert(email.into(), (password.into(), principal.into()));
        self
    }

    pub fn identity_for(principal: &str, email: &str) -> Identity {
        Identity::new(principal, email, format!("bearer-{principal}"))
    }

    /// What the provider reports to a context that reloads.
    pub fn set_current(&self, identity: Option<Identity>) {
        self.current.send_replace(identity);
    }

    pub fn current(&self) -> Option<Identity> {
        self.current.borrow().clone()
    }

    fn email_of(&self, principal: &str) -> Option<String> {
        self.accounts
            .lock()
            .unwrap()
            .iter()
            .find(|(_, (_, p))| p == principal)
            .map(|(email, _)| email.clone())
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentityProvider {
    async fn register(&self, email: &str, password: &str) -> Result<Identity, ProviderError> {
        let principal = format!("uid-{}", email.split('@').next().unwrap_or(email));
        {
            let mut accounts = self.accounts.lock().unwrap();
            if accounts.contains_key(email) {
                return Err(ProviderError::Rejected {
                    reason: "email already in use".into(),
                });
            }
            accounts.insert(email.into(), (password.into(), principal.clone()));
        }
        let identity = Self::identity_for(&principal, email);
        self.set_current(Some(identity.clone()));
        Ok(identity)
    }

    async fn authenticate(&self, credentials: Credentials) -> Result<Identity, ProviderError> {
        let identity = match credentials {
            Credentials::Password { email, password } => {
                let accounts = self.accounts.lock().unwrap();
                match accounts.get(&email) {
                    Some((expected, principal)) if *expected == password => {
                        Self::identity_for(principal, &email)
                    }
                    _ => {
                        return Err(ProviderError::Rejected {
                            reason: "invalid email or password".into(),
                        });
                    }
                }
            }
            Credentials::Assertion { token } => {
                let principal = token.strip_prefix("webauthn:").ok_or(ProviderError::Rejected {
                    reason: "malformed token".into(),
                })?;
                let email = self.email_of(principal).ok_or(ProviderError::Rejected {
                    reason: "unknown principal".into(),
                })?;
                Self::identity_for(principal, &email)
            }
        };
        self.set_current(Some(identity.clone()));
        Ok(identity)
    }

    async fn sign_out(&self, _identity: &Identity) -> Result<(), ProviderError> {
        *self.sign_outs.lock().unwrap() += 1;
        self.set_current(None);
        Ok(())
    }

    fn identity_changes(&self) -> watch::Receiver<Option<Identity>> {
        self.current.subscribe()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Second factor
// ═══════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct FakeSecondFactor {
    enabled: Mutex<HashSet<String>>,
    pending: Mutex<HashSet<String>>,
    pub status_unavailable: Mutex<bool>,
}

impl FakeSecondFactor {
    pub fn enabled_for(principal: &str) -> Self {
        let service = Self::default();
        service.enabled.lock().unwrap().insert(principal.into());
        service
    }

    pub fn is_enabled(&self, principal: &str) -> bool {
        self.enabled.lock().unwrap().contains(principal)
    }
}

#[async_trait]
impl SecondFactorService for FakeSecondFactor {
    async fn status(&self, identity: &Identity) -> Result<TwoFactorStatus, ProviderError> {
        if *self.status_unavailable.lock().unwrap() {
            return Err(ProviderError::Unavailable {
                reason: "status endpoint down".into(),
            });
        }
        Ok(TwoFactorStatus {
            enabled: self.is_enabled(&identity.principal_id),
            verified_this_session: false,
        })
    }

    async fn verify_code(&self, _identity: &Identity, code: &str) -> Result<bool, ProviderError> {
        Ok(code == TOTP_CODE)
    }

    async fn begin_enrollment(&self, identity: &Identity) -> Result<TotpEnrollment, ProviderError> {
        self.pending
            .lock()
            .unwrap()
            .insert(identity.principal_id.clone());
        Ok(TotpEnrollment {
            secret: "JBSWY3DPEHPK3PXP".into(),
            otpauth_url: format!(
                "otpauth://totp/PassMan:{}?secret=JBSWY3DPEHPK3PXP",
                identity.email
            ),
        })
    }

    async fn enable(&self, identity: &Identity, code: &str) -> Result<bool, ProviderError> {
        if !self.pending.lock().unwrap().remove(&identity.principal_id) {
            return Err(ProviderError::Rejected {
                reason: "no enrollment in progress".into(),
            });
        }
        if code != TOTP_CODE {
            return Ok(false);
        }
        self.enabled
            .lock()
            .unwrap()
            .insert(identity.principal_id.clone());
        Ok(true)
    }

    async fn disable(&self, identity: &Identity) -> Result<(), ProviderError> {
        self.enabled.lock().unwrap().remove(&identity.principal_id);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Secret repository
// ═══════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct FakeRepository {
    records: Mutex<BTreeMap<String, SecretRecord>>,
}

impl FakeRepository {
    pub fn insert_raw(&self, record: SecretRecord) {
        self.records
            .lock()
            .unwrap()
            .insert(record.id.clone(), record);
    }

    pub fn raw(&self, id: &str) -> Option<SecretRecord> {
        self.records.lock().unwrap().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait]
impl SecretRepository for FakeRepository {
    async fn list(&self) -> Result<Vec<SecretRecord>, ProviderError> {
        Ok(self.records.lock().unwrap().values().cloned().collect())
    }

    async fn get(&self, id: &str) -> Result<Option<SecretRecord>, ProviderError> {
        Ok(self.raw(id))
    }

    async fn create(&self, record: SecretRecord) -> Result<(), ProviderError> {
        self.insert_raw(record);
        Ok(())
    }

    async fn update(&self, record: SecretRecord) -> Result<(), ProviderError> {
        let mut records = self.records.lock().unwrap();
        match records.get_mut(&record.id) {
            Some(existing) => {
                *existing = record;
                Ok(())
            }
            None => Err(ProviderError::NotFound { id: record.id }),
        }
    }

    async fn delete(&self, id: &str) -> Result<(), ProviderError> {
        self.records.lock().unwrap().remove(id);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Platform authenticator
// ═══════════════════════════════════════════════════════════════════════

/// Registers `cred-<principal>`; assertions carry `webauthn:<principal>`.
#[derive(Default)]
pub struct FakeAuthenticator {
    next_failure: Mutex<Option<AuthenticatorError>>,
    registration_gate: Mutex<Option<Arc<Notify>>>,
    /// Notified each time a registration prompt opens.
    pub registration_started: Notify,
}

impl FakeAuthenticator {
    pub fn fail_next(&self, err: AuthenticatorError) {
        *self.next_failure.lock().unwrap() = Some(err);
    }

    /// Keep the next registration prompt open until the returned handle is
    /// notified, as a user who has not yet touched the sensor would.
    pub fn hold_registration(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.registration_gate.lock().unwrap() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl PlatformAuthenticator for FakeAuthenticator {
    async fn register_credential(
        &self,
        options: RegistrationOptions,
    ) -> Result<Attestation, AuthenticatorError> {
        if let Some(err) = self.next_failure.lock().unwrap().take() {
            return Err(err);
        }
        let gate = self.registration_gate.lock().unwrap().take();
        self.registration_started.notify_one();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(Attestation {
            credential_id: format!("cred-{}", options.principal_id),
        })
    }

    async fn get_assertion(
        &self,
        options: AssertionOptions,
    ) -> Result<Assertion, AuthenticatorError> {
        if let Some(err) = self.next_failure.lock().unwrap().take() {
            return Err(err);
        }
        let credential_id = options.allow_credentials[0].clone();
        let principal_id = credential_id.trim_start_matches("cred-").to_string();
        Ok(Assertion {
            sign_in_token: Some(format!("webauthn:{principal_id}")),
            credential_id,
            principal_id,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Harness
// ═══════════════════════════════════════════════════════════════════════

pub fn test_config() -> SessionConfig {
    SessionConfig {
        kdf_iterations: 1_000,
        idle_timeout_secs: 300,
        activity_coalesce_ms: 1_000,
        idle_poll_ms: 5_000,
        activity_channel_capacity: 16,
    }
}

/// Collaborators shared by every context on one simulated device.
pub struct Device {
    pub identity: Arc<FakeIdentityProvider>,
    pub second_factor: Arc<FakeSecondFactor>,
    pub repository: Arc<FakeRepository>,
    pub authenticator: Arc<FakeAuthenticator>,
    pub store: Arc<dyn KeyValueStore>,
    pub clock: Arc<ManualClock>,
    pub config: SessionConfig,
}

impl Device {
    pub fn new() -> Self {
        Self::with(FakeSecondFactor::default(), Arc::new(MemoryStore::new()))
    }

    pub fn with(second_factor: FakeSecondFactor, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            identity: Arc::new(
                FakeIdentityProvider::new().with_account(EMAIL, PASSWORD, PRINCIPAL),
            ),
            second_factor: Arc::new(second_factor),
            repository: Arc::new(FakeRepository::default()),
            authenticator: Arc::new(FakeAuthenticator::default()),
            store,
            clock: Arc::new(ManualClock::default()),
            config: test_config(),
        }
    }

    /// Open a context with its own ephemeral store (a new tab).
    pub fn open_tab(&self) -> Tab {
        self.open_tab_with(MemoryStore::new())
    }

    /// Open a context over an existing ephemeral store (a reload of that tab).
    pub fn open_tab_with(&self, ephemeral: MemoryStore) -> Tab {
        let coordinator = AccessCoordinator::builder(
            self.identity.clone(),
            self.second_factor.clone(),
            Arc::new(ephemeral.clone()),
            self.store.clone(),
        )
        .authenticator(self.authenticator.clone())
        .clock(self.clock.clone())
        .config(self.config.clone())
        .build()
        .unwrap();
        let vault = VaultAccess::new(coordinator.clone(), self.repository.clone());
        Tab {
            coordinator,
            vault,
            ephemeral,
        }
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }
}

pub struct Tab {
    pub coordinator: AccessCoordinator,
    pub vault: VaultAccess,
    pub ephemeral: MemoryStore,
}

impl Tab {
    pub async fn sign_in(&self) -> AccessState {
        self.coordinator
            .sign_in(EMAIL, PASSWORD, PASSPHRASE)
            .await
            .unwrap()
    }

    pub fn reload(&self, device: &Device) -> Tab {
        device.open_tab_with(self.ephemeral.clone())
    }
}

/// Wait until the coordinator reaches `state`, failing after a second.
pub async fn wait_for_state(coordinator: &AccessCoordinator, state: AccessState) {
    let mut rx = coordinator.subscribe();
    tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| *s == state))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed");
}
