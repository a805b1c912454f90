//! Peer connection seam.
//!
//! The call core drives a negotiated media session through these traits. A
//! browser, a native WebRTC stack, or [`crate::loopback`] sits behind them.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::IceServer;
use crate::error::RtcError;
use crate::media::MediaTrack;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Audio => "audio",
            Self::Video => "video",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// An ICE candidate, in the shape browsers serialize it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// The candidate line, e.g. `candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host`.
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }

    pub fn with_username_fragment(mut self, ufrag: impl Into<String>) -> Self {
        self.username_fragment = Some(ufrag.into());
        self
    }

    /// Stable serialized form used to deduplicate redelivered candidates.
    pub fn dedup_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.candidate.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransceiverDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl TransceiverDirection {
    pub fn from_flags(send: bool, recv: bool) -> Self {
        match (send, recv) {
            (true, true) => Self::SendRecv,
            (true, false) => Self::SendOnly,
            (false, true) => Self::RecvOnly,
            (false, false) => Self::Inactive,
        }
    }

    pub fn sends(self) -> bool {
        matches!(self, Self::SendRecv | Self::SendOnly)
    }

    pub fn receives(self) -> bool {
        matches!(self, Self::SendRecv | Self::RecvOnly)
    }

    /// Direction an answerer should take for a line the remote offered as
    /// `self`. The answer may only send where the offerer receives and only
    /// receive where the offerer sends.
    pub fn answer_to(self, can_send: bool) -> Self {
        Self::from_flags(can_send && self.receives(), self.sends())
    }

    pub fn as_sdp_attr(self) -> &'static str {
        match self {
            Self::SendRecv => "sendrecv",
            Self::SendOnly => "sendonly",
            Self::RecvOnly => "recvonly",
            Self::Inactive => "inactive",
        }
    }

    pub fn from_sdp_attr(attr: &str) -> Option<Self> {
        match attr {
            "sendrecv" => Some(Self::SendRecv),
            "sendonly" => Some(Self::SendOnly),
            "recvonly" => Some(Self::RecvOnly),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

/// Aggregate connection state, as reported by the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

/// Events a peer connection pushes to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A locally gathered candidate to be sent to the remote peer.
    LocalCandidate(IceCandidate),
    ConnectionStateChanged(ConnectionState),
    RemoteTrack { kind: MediaKind, track_id: String },
}

/// One media line of a connection, with its outgoing track slot.
#[async_trait]
pub trait Transceiver: Send + Sync {
    fn kind(&self) -> MediaKind;

    fn mid(&self) -> Option<String>;

    fn direction(&self) -> TransceiverDirection;

    fn set_direction(&self, direction: TransceiverDirection);

    /// Track currently attached to the sender, if any.
    fn sender_track(&self) -> Option<Arc<dyn MediaTrack>>;

    /// Swap the outgoing track in place. Never triggers renegotiation.
    async fn replace_track(&self, track: Option<Arc<dyn MediaTrack>>) -> Result<(), RtcError>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Append a media line. Lines are never reordered once added.
    fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
    ) -> Arc<dyn Transceiver>;

    /// Media lines in negotiated order.
    fn transceivers(&self) -> Vec<Arc<dyn Transceiver>>;

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, RtcError>;

    async fn create_answer(&self) -> Result<SessionDescription, RtcError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), RtcError>;

    /// Apply the remote description. For an offer this materializes any media
    /// lines the connection does not have yet, in offer order.
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), RtcError>;

    fn remote_description(&self) -> Option<SessionDescription>;

    /// Fails with [`RtcError::NoRemoteDescription`] before a remote description
    /// is applied.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError>;

    /// Mark the next offer as an ICE restart.
    fn restart_ice(&self);

    fn connection_state(&self) -> ConnectionState;

    /// Take the event stream. Only the first call returns `Some`.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, ice_servers: &[IceServer]) -> Result<Arc<dyn PeerConnection>, RtcError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_answer_direction_to_recvonly_offer_never_receives() {
        let offered = TransceiverDirection::RecvOnly;
        assert_eq!(offered.answer_to(false), TransceiverDirection::Inactive);
        assert_eq!(offered.answer_to(true), TransceiverDirection::SendOnly);
    }

    #[test]
    fn test_answer_direction_to_sendrecv_offer() {
        let offered = TransceiverDirection::SendRecv;
        assert_eq!(offered.answer_to(true), TransceiverDirection::SendRecv);
        assert_eq!(offered.answer_to(false), TransceiverDirection::RecvOnly);
    }

    #[test]
    fn test_candidate_serializes_like_browsers() {
        let c = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 9 typ host")
            .with_sdp_mid("0")
            .with_sdp_m_line_index(0);
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
        let back: IceCandidate = serde_json::from_value(json).unwrap();
        assert_eq!(back.dedup_key(), c.dedup_key());
    }
}
