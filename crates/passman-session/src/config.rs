//! Session configuration.
//!
//! Loaded from a TOML file. Every field has a default, so an absent file or
//! an empty table yields a working configuration:
//!
//! ```toml
//! kdf_iterations = 600000
//! idle_timeout_secs = 300
//! activity_coalesce_ms = 1000
//! idle_poll_ms = 5000
//! activity_channel_capacity = 64
//! ```

use std::path::Path;
use std::time::Duration;

use passman_vault::KdfParams;
use passman_vault::crypto::DEFAULT_PBKDF2_ITERATIONS;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Tunables for the access coordinator and inactivity monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// PBKDF2-HMAC-SHA256 iteration count.
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,

    /// Idle time after which the session is signed out.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Minimum spacing between two activity timestamp writes.
    #[serde(default = "default_activity_coalesce_ms")]
    pub activity_coalesce_ms: u64,

    /// How often the idle check runs while unlocked.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,

    /// Buffered activity signals per monitor before new ones are dropped.
    #[serde(default = "default_activity_channel_capacity")]
    pub activity_channel_capacity: usize,
}

fn default_kdf_iterations() -> u32 {
    DEFAULT_PBKDF2_ITERATIONS
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_activity_coalesce_ms() -> u64 {
    1_000
}

fn default_idle_poll_ms() -> u64 {
    5_000
}

fn default_activity_channel_capacity() -> usize {
    64
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            kdf_iterations: default_kdf_iterations(),
            idle_timeout_secs: default_idle_timeout_secs(),
            activity_coalesce_ms: default_activity_coalesce_ms(),
            idle_poll_ms: default_idle_poll_ms(),
            activity_channel_capacity: default_activity_channel_capacity(),
        }
    }
}

impl SessionConfig {
    /// Load from `path`, falling back to defaults if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidConfig`] if the file cannot be read,
    /// is not valid TOML, or holds a zero value.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!(path = %path.display(), "session config not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| SessionError::InvalidConfig {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        let config = Self::from_toml_str(&content)?;

        tracing::info!(path = %path.display(), "session config loaded");
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| SessionError::InvalidConfig {
            reason: format!("failed to parse TOML config: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject zero values; each of them would disable a safety mechanism.
    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("kdf_iterations", u64::from(self.kdf_iterations)),
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("activity_coalesce_ms", self.activity_coalesce_ms),
            ("idle_poll_ms", self.idle_poll_ms),
            ("activity_channel_capacity", self.activity_channel_capacity as u64),
        ]
        .into_iter()
        .find(|(_, value)| *value == 0);

        match zero {
            Some((field, _)) => Err(SessionError::InvalidConfig {
                reason: format!("{field} must be greater than zero"),
            }),
            None => Ok(()),
        }
    }

    /// Derivation parameters for the vault key.
    pub fn kdf_params(&self) -> Result<KdfParams> {
        KdfParams::with_iterations(self.kdf_iterations).map_err(|e| SessionError::InvalidConfig {
            reason: e.to_string(),
        })
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn activity_coalesce(&self) -> Duration {
        Duration::from_millis(self.activity_coalesce_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_five_minute_auto_logout() {
        let config = SessionConfig::default();
        assert_eq!(config.idle_timeout(), Duration::from_secs(300));
        assert_eq!(config.kdf_iterations, 600_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = SessionConfig::from_toml_str("idle_timeout_secs = 60\n").unwrap();
        assert_eq!(config.idle_timeout_secs, 60);
        assert_eq!(config.idle_poll_ms, 5_000);
        assert_eq!(config.activity_channel_capacity, 64);
    }

    #[test]
    fn zero_values_are_rejected() {
        let err = SessionConfig::from_toml_str("idle_poll_ms = 0").unwrap_err();
        assert!(matches!(err, SessionError::InvalidConfig { .. }));
        assert!(err.to_string().contains("idle_poll_ms"));
    }

    #[test]
    fn malformed_toml_is_rejected() {
        assert!(matches!(
            SessionConfig::from_toml_str("idle_timeout_secs = \"soon\""),
            Err(SessionError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.toml");
        std::fs::write(&path, "kdf_iterations = 1000\nactivity_coalesce_ms = 250\n").unwrap();

        let config = SessionConfig::load(&path).unwrap();
        assert_eq!(config.kdf_params().unwrap().iterations(), 1_000);
        assert_eq!(config.activity_coalesce(), Duration::from_millis(250));
    }
}
