//! Signaling relay abstraction.
//!
//! The relay is a shared, subscribable document store. It carries the room
//! document, per-recipient offer/answer slots, the append-only candidate log and
//! per-participant presence. It gives no ordering guarantee across documents.
//!
//! # Layout
//!
//! ```text
//! callRooms/{roomId}
//! calls/{callId}/offers/{peerUid}
//! calls/{callId}/answers/{peerUid}
//! calls/{callId}/candidates/{autoId}
//! presence/{roomId}/members/{peerUid}
//! ```
//!
//! Subscriptions are modelled as a stream of [`DocChange`] plus a cancellation
//! handle, so the call logic never sees transport-specific callbacks.

pub mod memory;
pub mod retry;

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::RelayError;
use crate::types::{CallId, RoomId, Uid};

pub use memory::MemoryRelay;
pub use retry::with_retry;

/// A collection of documents that can be listed, appended to and watched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Offers(CallId),
    Answers(CallId),
    Candidates(CallId),
    Presence(RoomId),
}

impl Collection {
    /// Path of the document `id` inside this collection.
    pub fn doc(&self, id: impl Into<String>) -> DocPath {
        let id = id.into();
        match self {
            Self::Offers(call_id) => DocPath::Offer {
                call_id: call_id.clone(),
                peer: id,
            },
            Self::Answers(call_id) => DocPath::Answer {
                call_id: call_id.clone(),
                peer: id,
            },
            Self::Candidates(call_id) => DocPath::Candidate {
                call_id: call_id.clone(),
                id,
            },
            Self::Presence(room_id) => DocPath::Presence {
                room_id: room_id.clone(),
                uid: id,
            },
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offers(call_id) => write!(f, "calls/{call_id}/offers"),
            Self::Answers(call_id) => write!(f, "calls/{call_id}/answers"),
            Self::Candidates(call_id) => write!(f, "calls/{call_id}/candidates"),
            Self::Presence(room_id) => write!(f, "presence/{room_id}/members"),
        }
    }
}

/// Address of a single relay document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DocPath {
    Room(RoomId),
    Offer { call_id: CallId, peer: Uid },
    Answer { call_id: CallId, peer: Uid },
    Candidate { call_id: CallId, id: String },
    Presence { room_id: RoomId, uid: Uid },
}

impl DocPath {
    pub fn room(room_id: impl Into<String>) -> Self {
        Self::Room(room_id.into())
    }

    pub fn offer(call_id: &CallId, peer: impl Into<String>) -> Self {
        Self::Offer {
            call_id: call_id.clone(),
            peer: peer.into(),
        }
    }

    pub fn answer(call_id: &CallId, peer: impl Into<String>) -> Self {
        Self::Answer {
            call_id: call_id.clone(),
            peer: peer.into(),
        }
    }

    pub fn presence(room_id: impl Into<String>, uid: impl Into<String>) -> Self {
        Self::Presence {
            room_id: room_id.into(),
            uid: uid.into(),
        }
    }

    /// The collection this document belongs to, if any.
    pub fn collection(&self) -> Option<Collection> {
        match self {
            Self::Room(_) => None,
            Self::Offer { call_id, .. } => Some(Collection::Offers(call_id.clone())),
            Self::Answer { call_id, .. } => Some(Collection::Answers(call_id.clone())),
            Self::Candidate { call_id, .. } => Some(Collection::Candidates(call_id.clone())),
            Self::Presence { room_id, .. } => Some(Collection::Presence(room_id.clone())),
        }
    }

    /// Last path segment.
    pub fn id(&self) -> &str {
        match self {
            Self::Room(room_id) => room_id,
            Self::Offer { peer, .. } | Self::Answer { peer, .. } => peer,
            Self::Candidate { id, .. } => id,
            Self::Presence { uid, .. } => uid,
        }
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Room(room_id) => write!(f, "callRooms/{room_id}"),
            other => match other.collection() {
                Some(collection) => write!(f, "{collection}/{}", other.id()),
                None => Ok(()),
            },
        }
    }
}

/// A change pushed to a subscriber. `value` is `None` when the document was
/// deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct DocChange {
    pub path: DocPath,
    pub value: Option<Value>,
}

/// Decision returned by a transaction body.
#[derive(Debug, Clone, PartialEq)]
pub enum TxWrite {
    Put(Value),
    Abort,
}

/// Result of [`SignalingRelay::transact`].
#[derive(Debug, Clone, PartialEq)]
pub struct TxOutcome {
    pub committed: bool,
    /// Document value after the transaction: the written value on commit,
    /// the observed value on abort.
    pub value: Option<Value>,
}

type CancelFn = Box<dyn FnOnce() + Send>;

/// A live subscription. Dropping it cancels it; cancelling twice is a no-op.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<DocChange>,
    cancel: Option<CancelFn>,
}

impl Subscription {
    pub fn new(
        rx: mpsc::UnboundedReceiver<DocChange>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            rx,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Next change, or `None` once the subscription is cancelled or the relay
    /// went away.
    pub async fn recv(&mut self) -> Option<DocChange> {
        if self.cancel.is_none() {
            return None;
        }
        self.rx.recv().await
    }

    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
            self.rx.close();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_none()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// The shared document store used to exchange negotiation messages.
///
/// Subscriptions deliver the current state first (the existing document, or
/// every existing member of a collection in key order) and then each change.
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    async fn get(&self, path: &DocPath) -> Result<Option<Value>, RelayError>;

    async fn set(&self, path: &DocPath, value: Value) -> Result<(), RelayError>;

    /// Append to a collection under a relay-generated id. Ids sort in append
    /// order.
    async fn add(&self, collection: &Collection, value: Value) -> Result<DocPath, RelayError>;

    async fn delete(&self, path: &DocPath) -> Result<(), RelayError>;

    async fn list(&self, collection: &Collection) -> Result<Vec<(DocPath, Value)>, RelayError>;

    /// Atomic read-modify-write of one document.
    ///
    /// `body` sees the current value and decides what to write. No other
    /// write to `path` can interleave between the read and the write.
    async fn transact(
        &self,
        path: &DocPath,
        body: &mut (dyn for<'v> FnMut(Option<&'v Value>) -> TxWrite + Send),
    ) -> Result<TxOutcome, RelayError>;

    async fn subscribe_doc(&self, path: &DocPath) -> Result<Subscription, RelayError>;

    async fn subscribe_collection(
        &self,
        collection: &Collection,
    ) -> Result<Subscription, RelayError>;
}
