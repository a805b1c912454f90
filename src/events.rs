use tokio::sync::broadcast;

use crate::peer::PeerRole;
use crate::room::CallRoom;
use crate::rtc::MediaKind;
use crate::signaling::CallInvite;
use crate::types::{CallId, RoomId, Uid};

const CHANNEL_CAPACITY: usize = 100;

/// Why a local call session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// `end_call` was called locally.
    Hangup,
    /// The room went back to Idle under us.
    RemoteEnded,
    /// Every peer session failed.
    Failed,
    LeftRoom,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    RoomChanged {
        room_id: RoomId,
        room: CallRoom,
    },
    /// Someone else started a call in the room we are in.
    IncomingCall {
        room_id: RoomId,
        call_id: CallId,
        started_by: Option<Uid>,
    },
    /// Post this into the chat stream.
    InviteReady(CallInvite),
    CallStarted {
        call_id: CallId,
        role: PeerRole,
    },
    /// Joining is blocked on the offer; it resumes when the offer arrives.
    JoinPending {
        call_id: CallId,
    },
    PeerConnected {
        call_id: CallId,
        peer: Uid,
    },
    PeerDisconnected {
        call_id: CallId,
        peer: Uid,
    },
    PeerFailed {
        call_id: CallId,
        peer: Uid,
        reason: String,
    },
    RemoteTrack {
        call_id: CallId,
        peer: Uid,
        kind: MediaKind,
    },
    ScreenShareStarted {
        call_id: CallId,
    },
    ScreenShareStopped {
        call_id: CallId,
    },
    SpeechDetected {
        room_id: RoomId,
    },
    CallEnded {
        call_id: CallId,
        reason: EndReason,
    },
    /// User-visible status text.
    Status(String),
}

/// Fan-out of [`CallEvent`]s to any number of subscribers. Slow subscribers
/// lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CallEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            tx: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: CallEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
