//! Session layer for PassMan.
//!
//! Decides whether the vault is usable right now. The [`AccessCoordinator`]
//! folds the identity provider, the vault key and the second factor into one
//! [`AccessState`]; [`VaultAccess`] gates record operations on it; the
//! [`InactivityMonitor`] signs idle sessions out.
//!
//! # Modules
//!
//! - [`coordinator`]: the access state machine and its operations.
//! - [`state`]: states, route decisions, events.
//! - [`vault_access`]: guarded list/get/add/update/delete of records.
//! - [`monitor`]: the inactivity monitor task.
//! - [`activity`]: clocks and the shared activity timestamp.
//! - [`collaborators`]: identity, second-factor and repository contracts.
//! - [`config`]: TOML configuration.
//! - [`error`]: unified error type.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use passman_session::{AccessCoordinator, InactivityMonitor, SessionConfig, VaultAccess};
//! use passman_session::collaborators::{IdentityProvider, SecondFactorService, SecretRepository};
//! use passman_vault::{MemoryStore, SqliteStore};
//!
//! # async fn example(
//! #     identity: Arc<dyn IdentityProvider>,
//! #     totp: Arc<dyn SecondFactorService>,
//! #     repository: Arc<dyn SecretRepository>,
//! # ) -> passman_session::Result<()> {
//! let config = SessionConfig::load("passman.toml")?;
//! let device = Arc::new(SqliteStore::open("device.db")?);
//!
//! let coordinator = AccessCoordinator::builder(identity, totp, Arc::new(MemoryStore::new()), device)
//!     .config(config.clone())
//!     .build()?;
//! let monitor = InactivityMonitor::spawn(coordinator.clone(), &config)?;
//!
//! coordinator.sign_in("a@x.com", "account-password", "Tr0ub4dor&3").await?;
//! let vault = VaultAccess::new(coordinator.clone(), repository);
//! vault.add("github.com", "alice", "hunter2").await?;
//!
//! monitor.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod activity;
pub mod collaborators;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod monitor;
pub mod state;
pub mod vault_access;

pub use activity::{ActivityClock, Clock, ManualClock, SystemClock};
pub use collaborators::{Identity, TwoFactorStatus};
pub use config::SessionConfig;
pub use coordinator::{AccessCoordinator, AccessCoordinatorBuilder};
pub use error::{Result, SessionError};
pub use monitor::{ActivitySender, ActivitySignal, InactivityMonitor};
pub use state::{AccessEvent, AccessState, RouteDecision, UnlockMethod};
pub use vault_access::{DecryptedRecord, VaultAccess, VaultListing};
