//! Call configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CallError;

/// A relay/traversal server descriptor supplied by the credential service.
///
/// Passed unmodified to every peer connection at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Recovery deadlines for a peer session that has not reached Connected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub ice_restart_after_ms: u64,
    pub renegotiate_after_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            ice_restart_after_ms: 15_000,
            renegotiate_after_ms: 25_000,
        }
    }
}

impl WatchdogConfig {
    pub fn ice_restart_after(&self) -> Duration {
        Duration::from_millis(self.ice_restart_after_ms)
    }

    pub fn renegotiate_after(&self) -> Duration {
        Duration::from_millis(self.renegotiate_after_ms)
    }
}

/// Voice activity detection used to auto-start calls from an idle room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    pub enabled: bool,
    /// RMS level (0.0..=1.0 for normalized samples) a frame must reach.
    pub rms_threshold: f32,
    /// Consecutive loud frames required before speech counts as sustained.
    pub required_frames: u32,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rms_threshold: 0.04,
            required_frames: 6,
        }
    }
}

/// Backoff for idempotent relay operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    pub fn none() -> Self {
        Self {
            attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }
}

/// Configuration for the call core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub ice_servers: Vec<IceServer>,
    /// Maximum remote peers the initiator negotiates with.
    pub max_peers: usize,
    /// Maximum room size the data model accepts.
    pub max_participants: usize,
    pub join_poll_attempts: u32,
    pub join_poll_interval_ms: u64,
    /// A join of the same call that produced no live session may be retried
    /// after this long.
    pub rejoin_backoff_ms: u64,
    pub watchdog: WatchdogConfig,
    pub speech: SpeechConfig,
    pub relay_retry: RetryPolicy,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            max_peers: 1,
            max_participants: 8,
            join_poll_attempts: 6,
            join_poll_interval_ms: 250,
            rejoin_backoff_ms: 3_000,
            watchdog: WatchdogConfig::default(),
            speech: SpeechConfig::default(),
            relay_retry: RetryPolicy::default(),
        }
    }
}

impl CallConfig {
    pub fn from_json(json: &str) -> Result<Self, CallError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CallError> {
        if self.max_peers == 0 {
            return Err(CallError::Config("max_peers must be at least 1".into()));
        }
        if self.max_peers >= self.max_participants {
            return Err(CallError::Config(format!(
                "max_peers ({}) must be below max_participants ({})",
                self.max_peers, self.max_participants
            )));
        }
        if self.join_poll_attempts == 0 {
            return Err(CallError::Config(
                "join_poll_attempts must be at least 1".into(),
            ));
        }
        if self.watchdog.renegotiate_after_ms <= self.watchdog.ice_restart_after_ms {
            return Err(CallError::Config(
                "renegotiate deadline must come after the ICE restart deadline".into(),
            ));
        }
        if self.speech.required_frames == 0 {
            return Err(CallError::Config(
                "speech.required_frames must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn join_poll_interval(&self) -> Duration {
        Duration::from_millis(self.join_poll_interval_ms)
    }

    pub fn rejoin_backoff(&self) -> Duration {
        Duration::from_millis(self.rejoin_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timings_and_fan_out() {
        let config = CallConfig::default();
        assert_eq!(config.max_peers, 1);
        assert_eq!(config.join_poll_attempts, 6);
        assert_eq!(config.join_poll_interval(), Duration::from_millis(250));
        assert_eq!(config.watchdog.ice_restart_after(), Duration::from_secs(15));
        assert_eq!(config.watchdog.renegotiate_after(), Duration::from_secs(25));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_fills_missing_fields() {
        let config = CallConfig::from_json(
            r#"{
                "ice_servers": [{"urls": ["turn:turn.example.org:3478"], "username": "u", "credential": "p"}],
                "watchdog": {"ice_restart_after_ms": 1000}
            }"#,
        )
        .unwrap();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].username.as_deref(), Some("u"));
        assert_eq!(config.watchdog.ice_restart_after_ms, 1000);
        assert_eq!(config.watchdog.renegotiate_after_ms, 25_000);
        assert_eq!(config.max_participants, 8);
    }

    #[test]
    fn test_validate_rejects_inverted_watchdog() {
        let mut config = CallConfig::default();
        config.watchdog.renegotiate_after_ms = 10_000;
        assert!(matches!(config.validate(), Err(CallError::Config(_))));
    }

    #[test]
    fn test_retry_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(10), Duration::from_millis(2_000));
    }
}
