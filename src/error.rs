//! Error types for call signaling.
//!
//! Claim races and "no offer yet" are not errors here: they surface as
//! [`crate::StartOutcome::Joined`] and [`crate::JoinOutcome::Waiting`].

use thiserror::Error;

use crate::peer::state::InvalidTransition;

/// Failures talking to the signaling relay.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("relay unavailable: {0}")]
    Unavailable(String),

    #[error("relay rejected write to {path}: {reason}")]
    Rejected { path: String, reason: String },
}

/// Failures acquiring local capture devices.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("permission denied for {0}")]
    PermissionDenied(&'static str),

    #[error("no {0} device available")]
    DeviceNotFound(&'static str),

    #[error("capture failed: {0}")]
    Capture(String),
}

/// Failures reported by a peer connection implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RtcError {
    #[error("connection is closed")]
    Closed,

    #[error("no remote description")]
    NoRemoteDescription,

    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("media error: {0}")]
    Media(MediaError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("peer connection error: {0}")]
    Rtc(#[from] RtcError),

    #[error("transport degraded for peer {peer}: {reason}")]
    TransportDegraded { peer: String, reason: String },

    #[error("invalid document at {path}: {reason}")]
    InvalidDocument { path: String, reason: String },

    #[error("invalid peer session transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("not in a call")]
    NotInCall,

    #[error("no outgoing video line for peer {0}")]
    NoOutgoingVideo(String),

    #[error("not in room")]
    NotInRoom,

    #[error("no other participants to call")]
    NoPeers,

    #[error("config error: {0}")]
    Config(String),
}

impl CallError {
    pub(crate) fn invalid_document(path: impl ToString, reason: impl Into<String>) -> Self {
        Self::InvalidDocument {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this failure should be shown to the user as status text.
    ///
    /// Everything else is recovered or retried locally.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied(_) | Self::Relay(_) | Self::TransportDegraded { .. }
        )
    }
}

impl From<MediaError> for CallError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::PermissionDenied(device) => Self::PermissionDenied(device.to_string()),
            other => Self::Media(other),
        }
    }
}

impl From<serde_json::Error> for CallError {
    fn from(e: serde_json::Error) -> Self {
        Self::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_maps_to_user_visible_error() {
        let err: CallError = MediaError::PermissionDenied("camera").into();
        assert!(matches!(err, CallError::PermissionDenied(ref d) if d == "camera"));
        assert!(err.is_user_visible());
    }

    #[test]
    fn test_device_errors_are_not_permission_errors() {
        let err: CallError = MediaError::DeviceNotFound("microphone").into();
        assert!(matches!(err, CallError::Media(_)));
        assert!(!err.is_user_visible());
    }

    #[test]
    fn test_relay_errors_are_user_visible() {
        let err: CallError = RelayError::Unavailable("offline".into()).into();
        assert!(err.is_user_visible());
        assert_eq!(err.to_string(), "relay unavailable: offline");
    }
}
