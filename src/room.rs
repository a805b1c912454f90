//! Room-level call state and its atomic claim/release operations.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RetryPolicy;
use crate::error::CallError;
use crate::relay::{DocPath, SignalingRelay, Subscription, TxWrite, with_retry};
use crate::types::{CallId, Uid};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    #[default]
    Idle,
    Connecting,
    Active,
}

/// The shared `callRooms/{roomId}` document.
///
/// `active_call_id` is set if and only if `status` is not [`RoomStatus::Idle`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRoom {
    pub status: RoomStatus,
    #[serde(default)]
    pub active_call_id: Option<CallId>,
    #[serde(default)]
    pub started_by: Option<Uid>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_active_at: Option<DateTime<Utc>>,
}

impl CallRoom {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        self.status == RoomStatus::Idle
    }

    /// Whether the room currently carries `call_id`.
    pub fn is_running(&self, call_id: &CallId) -> bool {
        !self.is_idle() && self.active_call_id.as_ref() == Some(call_id)
    }

    pub fn validate(&self) -> Result<(), String> {
        match (self.status, &self.active_call_id) {
            (RoomStatus::Idle, Some(id)) => Err(format!("idle room carries call {id}")),
            (RoomStatus::Connecting | RoomStatus::Active, None) => {
                Err(format!("{:?} room has no active call", self.status))
            }
            _ => Ok(()),
        }
    }

    pub fn from_value(value: &Value) -> Result<Self, String> {
        let room: Self = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
        room.validate()?;
        Ok(room)
    }

    fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    fn released(&self) -> Self {
        Self {
            status: RoomStatus::Idle,
            active_call_id: None,
            started_by: None,
            started_at: None,
            last_active_at: Some(Utc::now()),
        }
    }
}

/// Result of [`RoomStateStore::claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// Someone else holds the room. Carries the winner's room document.
    Taken(CallRoom),
}

/// The room-level state machine (Idle, Connecting, Active) kept in the relay.
///
/// Every mutation goes through a relay transaction so concurrent clients can
/// never both move the room out of Idle.
#[derive(Clone)]
pub struct RoomStateStore {
    relay: Arc<dyn SignalingRelay>,
    local_uid: Uid,
    retry: RetryPolicy,
}

impl RoomStateStore {
    pub fn new(relay: Arc<dyn SignalingRelay>, local_uid: impl Into<Uid>, retry: RetryPolicy) -> Self {
        Self {
            relay,
            local_uid: local_uid.into(),
            retry,
        }
    }

    /// Create the room document as Idle if it does not exist yet.
    pub async fn ensure_room(&self, room_id: &str) -> Result<CallRoom, CallError> {
        let path = DocPath::room(room_id);
        let outcome = with_retry("ensure room", &self.retry, || {
            let path = path.clone();
            async move {
                self.relay
                    .transact(&path, &mut |current: Option<&Value>| match current {
                        Some(_) => TxWrite::Abort,
                        None => TxWrite::Put(CallRoom::idle().to_value()),
                    })
                    .await
            }
        })
        .await?;
        if outcome.committed {
            debug!("Created call room {room_id}");
        }
        parse_room(&path, outcome.value.as_ref())
    }

    pub async fn current(&self, room_id: &str) -> Result<CallRoom, CallError> {
        let path = DocPath::room(room_id);
        let value = with_retry("read room", &self.retry, || self.relay.get(&path)).await?;
        parse_room(&path, value.as_ref())
    }

    /// Atomic compare-and-set from Idle to Connecting for `call_id`.
    ///
    /// A missing room document counts as Idle.
    pub async fn claim(&self, room_id: &str, call_id: &CallId) -> Result<ClaimOutcome, CallError> {
        let path = DocPath::room(room_id);
        let mut corrupt = None;
        let outcome = self
            .relay
            .transact(&path, &mut |current: Option<&Value>| {
                let room = match current.map(CallRoom::from_value) {
                    None => CallRoom::idle(),
                    Some(Ok(room)) => room,
                    Some(Err(reason)) => {
                        corrupt = Some(reason);
                        return TxWrite::Abort;
                    }
                };
                if !room.is_idle() || room.active_call_id.is_some() {
                    return TxWrite::Abort;
                }
                let now = Utc::now();
                TxWrite::Put(
                    CallRoom {
                        status: RoomStatus::Connecting,
                        active_call_id: Some(call_id.clone()),
                        started_by: Some(self.local_uid.clone()),
                        started_at: Some(now),
                        last_active_at: Some(now),
                    }
                    .to_value(),
                )
            })
            .await?;

        if let Some(reason) = corrupt {
            return Err(CallError::invalid_document(&path, reason));
        }
        if outcome.committed {
            info!("Claimed room {room_id} for call {call_id}");
            return Ok(ClaimOutcome::Claimed);
        }
        let winner = parse_room(&path, outcome.value.as_ref())?;
        info!(
            "Room {room_id} already claimed (call {:?}, status {:?})",
            winner.active_call_id, winner.status
        );
        Ok(ClaimOutcome::Taken(winner))
    }

    /// [`claim`](Self::claim) reduced to whether it succeeded.
    pub async fn claim_room(&self, room_id: &str, call_id: &CallId) -> Result<bool, CallError> {
        Ok(matches!(self.claim(room_id, call_id).await?, ClaimOutcome::Claimed))
    }

    /// Move a Connecting room to Active. Returns whether the room is Active
    /// with `call_id` afterwards; repeating the call is harmless.
    pub async fn promote_to_active(&self, room_id: &str, call_id: &CallId) -> Result<bool, CallError> {
        let path = DocPath::room(room_id);
        let outcome = with_retry("promote room", &self.retry, || {
            let path = path.clone();
            async move {
                self.relay
                    .transact(&path, &mut |current: Option<&Value>| {
                        match current.map(CallRoom::from_value) {
                            Some(Ok(room))
                                if room.status == RoomStatus::Connecting
                                    && room.active_call_id.as_ref() == Some(call_id) =>
                            {
                                TxWrite::Put(
                                    CallRoom {
                                        status: RoomStatus::Active,
                                        last_active_at: Some(Utc::now()),
                                        ..room
                                    }
                                    .to_value(),
                                )
                            }
                            _ => TxWrite::Abort,
                        }
                    })
                    .await
            }
        })
        .await?;
        let room = parse_room(&path, outcome.value.as_ref())?;
        let active = room.status == RoomStatus::Active && room.is_running(call_id);
        if outcome.committed {
            info!("Room {room_id} is active with call {call_id}");
        } else if !active {
            debug!("Not promoting room {room_id}: call {call_id} no longer current");
        }
        Ok(active)
    }

    /// Reset the room to Idle regardless of which call holds it.
    pub async fn release_room(&self, room_id: &str) -> Result<(), CallError> {
        let path = DocPath::room(room_id);
        with_retry("release room", &self.retry, || {
            let path = path.clone();
            async move {
                self.relay
                    .transact(&path, &mut |current: Option<&Value>| {
                        match current.map(CallRoom::from_value) {
                            Some(Ok(room)) if room.is_idle() => TxWrite::Abort,
                            Some(Ok(room)) => TxWrite::Put(room.released().to_value()),
                            // Unreadable rooms are reset too.
                            Some(Err(_)) => TxWrite::Put(CallRoom::idle().released().to_value()),
                            None => TxWrite::Abort,
                        }
                    })
                    .await
            }
        })
        .await?;
        info!("Released room {room_id}");
        Ok(())
    }

    /// Reset the room to Idle only while it still carries `call_id`.
    ///
    /// Returns whether this call released it. A late teardown of an old call
    /// never clobbers a newer one.
    pub async fn release_room_if_current(
        &self,
        room_id: &str,
        call_id: &CallId,
    ) -> Result<bool, CallError> {
        let path = DocPath::room(room_id);
        let outcome = with_retry("release room", &self.retry, || {
            let path = path.clone();
            async move {
                self.relay
                    .transact(&path, &mut |current: Option<&Value>| {
                        match current.map(CallRoom::from_value) {
                            Some(Ok(room)) if room.is_running(call_id) => {
                                TxWrite::Put(room.released().to_value())
                            }
                            _ => TxWrite::Abort,
                        }
                    })
                    .await
            }
        })
        .await?;
        if outcome.committed {
            info!("Released room {room_id} (call {call_id} ended)");
        } else {
            debug!("Room {room_id} no longer carries call {call_id}; leaving it untouched");
        }
        Ok(outcome.committed)
    }

    /// Live view of the room document.
    pub async fn watch(&self, room_id: &str) -> Result<RoomWatch, CallError> {
        let path = DocPath::room(room_id);
        let subscription = self.relay.subscribe_doc(&path).await?;
        Ok(RoomWatch { path, subscription })
    }
}

fn parse_room(path: &DocPath, value: Option<&Value>) -> Result<CallRoom, CallError> {
    match value {
        None => Ok(CallRoom::idle()),
        Some(value) => CallRoom::from_value(value).map_err(|reason| CallError::invalid_document(path, reason)),
    }
}

/// Stream of room document changes. Deleted or unreadable documents read as
/// Idle.
#[derive(Debug)]
pub struct RoomWatch {
    path: DocPath,
    subscription: Subscription,
}

impl RoomWatch {
    pub async fn next(&mut self) -> Option<CallRoom> {
        let change = self.subscription.recv().await?;
        match parse_room(&self.path, change.value.as_ref()) {
            Ok(room) => Some(room),
            Err(e) => {
                warn!("Ignoring unreadable room document: {e}");
                Some(CallRoom::idle())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::MemoryRelay;
    use serde_json::json;

    fn store(relay: &MemoryRelay, uid: &str) -> RoomStateStore {
        RoomStateStore::new(Arc::new(relay.clone()), uid, RetryPolicy::none())
    }

    #[tokio::test]
    async fn test_ensure_room_is_idempotent() {
        let relay = MemoryRelay::new();
        let alice = store(&relay, "alice");
        assert!(alice.ensure_room("room1").await.unwrap().is_idle());
        assert!(alice.ensure_room("room1").await.unwrap().is_idle());
        assert_eq!(relay.write_count(&DocPath::room("room1")), 1);
    }

    #[tokio::test]
    async fn test_second_claim_observes_winner() {
        let relay = MemoryRelay::new();
        let alice = store(&relay, "alice");
        let bob = store(&relay, "bob");
        alice.ensure_room("room1").await.unwrap();

        assert!(alice.claim_room("room1", &CallId::new("call1")).await.unwrap());
        match bob.claim("room1", &CallId::new("call1-b")).await.unwrap() {
            ClaimOutcome::Taken(room) => {
                assert_eq!(room.active_call_id, Some(CallId::new("call1")));
                assert_eq!(room.started_by.as_deref(), Some("alice"));
                assert_eq!(room.status, RoomStatus::Connecting);
            }
            ClaimOutcome::Claimed => panic!("second claim must lose"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let relay = MemoryRelay::new();
        let mut handles = Vec::new();
        for n in 0..8 {
            let store = store(&relay, &format!("user{n}"));
            handles.push(tokio::spawn(async move {
                store.claim_room("room1", &CallId::new(format!("call{n}"))).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_promote_is_idempotent_and_scoped_to_call() {
        let relay = MemoryRelay::new();
        let alice = store(&relay, "alice");
        let call = CallId::new("call1");
        alice.claim_room("room1", &call).await.unwrap();

        assert!(!alice.promote_to_active("room1", &CallId::new("other")).await.unwrap());
        assert!(alice.promote_to_active("room1", &call).await.unwrap());
        assert!(alice.promote_to_active("room1", &call).await.unwrap());
        assert_eq!(alice.current("room1").await.unwrap().status, RoomStatus::Active);
    }

    #[tokio::test]
    async fn test_conditional_release_leaves_newer_call() {
        let relay = MemoryRelay::new();
        let alice = store(&relay, "alice");
        alice.claim_room("room1", &CallId::new("call2")).await.unwrap();

        assert!(!alice.release_room_if_current("room1", &CallId::new("call1")).await.unwrap());
        assert!(!alice.current("room1").await.unwrap().is_idle());

        assert!(alice.release_room_if_current("room1", &CallId::new("call2")).await.unwrap());
        let room = alice.current("room1").await.unwrap();
        assert!(room.is_idle());
        assert!(room.validate().is_ok());
    }

    #[tokio::test]
    async fn test_release_resets_and_allows_new_claim() {
        let relay = MemoryRelay::new();
        let alice = store(&relay, "alice");
        alice.claim_room("room1", &CallId::new("call1")).await.unwrap();
        alice.release_room("room1").await.unwrap();
        alice.release_room("room1").await.unwrap();
        assert!(alice.claim_room("room1", &CallId::new("call2")).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_room_is_rejected() {
        let relay = MemoryRelay::new();
        relay
            .set(&DocPath::room("room1"), json!({"status": "idle", "activeCallId": "X"}))
            .await
            .unwrap();
        let alice = store(&relay, "alice");
        assert!(matches!(
            alice.claim("room1", &CallId::new("c")).await,
            Err(CallError::InvalidDocument { .. })
        ));
        alice.release_room("room1").await.unwrap();
        assert!(alice.claim_room("room1", &CallId::new("c")).await.unwrap());
    }

    #[tokio::test]
    async fn test_watch_reports_transitions() {
        let relay = MemoryRelay::new();
        let alice = store(&relay, "alice");
        alice.ensure_room("room1").await.unwrap();
        let mut watch = alice.watch("room1").await.unwrap();
        assert!(watch.next().await.unwrap().is_idle());

        alice.claim_room("room1", &CallId::new("call1")).await.unwrap();
        let room = watch.next().await.unwrap();
        assert!(room.is_running(&CallId::new("call1")));
    }
}
