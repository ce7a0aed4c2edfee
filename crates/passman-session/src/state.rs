//! Access states, route decisions and coordinator events.
//!
//! The state machine has five states. The only edges are:
//!
//! | from                    | to                                                   |
//! |-------------------------|------------------------------------------------------|
//! | `Anonymous`             | `AuthenticatingPrimary`                              |
//! | `AuthenticatingPrimary` | `AwaitingSecondFactor`, `Unlocked`, `Locked`, `Anonymous` |
//! | `AwaitingSecondFactor`  | `Unlocked`, `Locked`, `Anonymous`                    |
//! | `Unlocked`              | `Locked`, `Anonymous`                                |
//! | `Locked`                | `Unlocked`, `Anonymous`                              |

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// AccessState
// ---------------------------------------------------------------------------

/// Whether the vault is usable right now, and if not, why.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessState {
    /// No identity.
    Anonymous,
    /// Primary credentials are being checked.
    AuthenticatingPrimary,
    /// Identity accepted, second factor still outstanding.
    AwaitingSecondFactor,
    /// Identity valid and vault key held.
    Unlocked,
    /// Identity valid, vault key absent.
    Locked,
}

impl AccessState {
    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(self, next: AccessState) -> bool {
        use AccessState::*;
        matches!(
            (self, next),
            (Anonymous, AuthenticatingPrimary)
                | (AuthenticatingPrimary, AwaitingSecondFactor)
                | (AuthenticatingPrimary, Unlocked)
                | (AuthenticatingPrimary, Locked)
                | (AuthenticatingPrimary, Anonymous)
                | (AwaitingSecondFactor, Unlocked)
                | (AwaitingSecondFactor, Locked)
                | (AwaitingSecondFactor, Anonymous)
                | (Unlocked, Locked)
                | (Unlocked, Anonymous)
                | (Locked, Unlocked)
                | (Locked, Anonymous)
        )
    }

    /// Whether an identity is established in this state.
    pub fn has_identity(self) -> bool {
        matches!(
            self,
            Self::AwaitingSecondFactor | Self::Unlocked | Self::Locked
        )
    }

    /// The decision a route guard makes in this state.
    pub fn route_decision(self) -> RouteDecision {
        match self {
            Self::Anonymous => RouteDecision::SignIn,
            Self::AuthenticatingPrimary => RouteDecision::Pending,
            Self::AwaitingSecondFactor => RouteDecision::SecondFactor,
            Self::Unlocked => RouteDecision::Permit,
            Self::Locked => RouteDecision::VaultLocked,
        }
    }
}

impl fmt::Display for AccessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Anonymous => "anonymous",
            Self::AuthenticatingPrimary => "authenticating",
            Self::AwaitingSecondFactor => "awaiting second factor",
            Self::Unlocked => "unlocked",
            Self::Locked => "locked",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// RouteDecision
// ---------------------------------------------------------------------------

/// What a route guard should do with a request for a vault view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteDecision {
    /// Render the vault.
    Permit,
    /// Send the user to primary sign-in.
    SignIn,
    /// Send the user to second-factor verification.
    SecondFactor,
    /// Show the "vault locked, re-authenticate" prompt. Never an empty vault.
    VaultLocked,
    /// A sign-in is in flight; show a progress indicator.
    Pending,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// How the vault key was obtained for an unlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlockMethod {
    Passphrase,
    Biometric,
    SecondFactor,
    SessionRestore,
}

impl UnlockMethod {
    /// Whether the unlock came from a user interaction (as opposed to a
    /// silent reload).
    pub fn is_interactive(self) -> bool {
        !matches!(self, Self::SessionRestore)
    }
}

/// Why the key was dropped while the identity stayed valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockReason {
    UserRequested,
    KeyUnavailable,
}

/// Why the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignOutReason {
    UserRequested,
    IdleTimeout,
    IdentityRevoked,
    IdentityChanged,
    SecondFactorAbandoned,
}

/// Notification published by the coordinator on every observable change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AccessEvent {
    StateChanged {
        from: AccessState,
        to: AccessState,
        at: DateTime<Utc>,
    },
    Unlocked {
        principal: String,
        method: UnlockMethod,
    },
    Locked {
        principal: String,
        reason: LockReason,
    },
    SignedOut {
        principal: Option<String>,
        reason: SignOutReason,
    },
    /// A persisted key could not be used; the session continues without it.
    KeyRecoveryFailed { reason: String },
    BiometricEnrolled { principal: String },
    EscrowInvalidated { principal: String },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
