//! Peer-to-peer call signaling for chat rooms.
//!
//! Participants of a room coordinate calls through a shared document relay
//! ([`relay::SignalingRelay`]). The room document is claimed atomically, so
//! only one call runs per room. Offers, answers and ICE candidates are
//! exchanged through the same relay. The media stack sits behind the
//! [`rtc`] and [`media`] traits.

pub mod config;
pub mod controller;
pub mod env;
pub mod error;
pub mod events;
pub mod initiator;
pub mod joiner;
pub mod loopback;
pub mod media;
pub mod peer;
pub mod presence;
pub mod relay;
pub mod room;
pub mod rtc;
pub mod sdp;
pub mod session;
pub mod signaling;
pub mod types;
pub mod vad;

pub use config::CallConfig;
pub use controller::{CallAttempt, CallController, CallSnapshot};
pub use env::CallEnv;
pub use error::CallError;
pub use events::{CallEvent, EndReason, EventBus};
pub use initiator::{CallInitiator, StartOutcome};
pub use joiner::{CallJoiner, JoinOutcome};
pub use presence::{PresenceState, PresenceTracker};
pub use room::{CallRoom, RoomStateStore, RoomStatus};
pub use types::{CallId, RoomId, Uid};
