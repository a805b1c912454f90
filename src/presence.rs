//! Per-participant call presence.
//!
//! Each participant writes only its own `presence/{roomId}/members/{uid}` record;
//! everyone reads all of them. Records stored under someone else's slot are
//! ignored on read.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RetryPolicy;
use crate::error::CallError;
use crate::relay::{Collection, DocPath, SignalingRelay, Subscription, with_retry};
use crate::types::{RoomId, Uid};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    #[default]
    Idle,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub uid: Uid,
    pub state: PresenceState,
    #[serde(default)]
    pub has_video: bool,
    pub updated_at: DateTime<Utc>,
}

impl PresenceRecord {
    /// Parse a record and check it belongs to the slot it was read from.
    fn from_slot(path: &DocPath, value: &Value) -> Result<Self, CallError> {
        let record: Self = serde_json::from_value(value.clone())
            .map_err(|e| CallError::invalid_document(path, e.to_string()))?;
        if record.uid != path.id() {
            return Err(CallError::invalid_document(
                path,
                format!("record for {} written to another participant's slot", record.uid),
            ));
        }
        Ok(record)
    }
}

#[derive(Clone)]
pub struct PresenceTracker {
    relay: Arc<dyn SignalingRelay>,
    local_uid: Uid,
    retry: RetryPolicy,
}

impl PresenceTracker {
    pub fn new(relay: Arc<dyn SignalingRelay>, local_uid: impl Into<Uid>, retry: RetryPolicy) -> Self {
        Self {
            relay,
            local_uid: local_uid.into(),
            retry,
        }
    }

    pub fn local_uid(&self) -> &str {
        &self.local_uid
    }

    /// Write the local participant's record. Last write wins.
    pub async fn publish(
        &self,
        room_id: &str,
        state: PresenceState,
        has_video: bool,
    ) -> Result<PresenceRecord, CallError> {
        let record = PresenceRecord {
            uid: self.local_uid.clone(),
            state,
            has_video,
            updated_at: Utc::now(),
        };
        let path = DocPath::presence(room_id, &self.local_uid);
        let value = serde_json::to_value(&record)?;
        with_retry("publish presence", &self.retry, || self.relay.set(&path, value.clone())).await?;
        debug!("Presence for {} in {room_id}: {state:?} (video: {has_video})", self.local_uid);
        Ok(record)
    }

    /// Every readable record in the room.
    pub async fn list(&self, room_id: &str) -> Result<Vec<PresenceRecord>, CallError> {
        let collection = Collection::Presence(room_id.to_string());
        let docs = with_retry("list presence", &self.retry, || self.relay.list(&collection)).await?;
        Ok(docs
            .iter()
            .filter_map(|(path, value)| match PresenceRecord::from_slot(path, value) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Skipping presence record: {e}");
                    None
                }
            })
            .collect())
    }

    pub async fn watch(&self, room_id: &str) -> Result<PresenceWatch, CallError> {
        let subscription = self
            .relay
            .subscribe_collection(&Collection::Presence(room_id.to_string()))
            .await?;
        Ok(PresenceWatch {
            room_id: room_id.to_string(),
            subscription,
        })
    }
}

/// A presence change. `record` is `None` when the participant's record was
/// removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub uid: Uid,
    pub record: Option<PresenceRecord>,
}

#[derive(Debug)]
pub struct PresenceWatch {
    room_id: RoomId,
    subscription: Subscription,
}

impl PresenceWatch {
    pub async fn next(&mut self) -> Option<PresenceUpdate> {
        loop {
            let change = self.subscription.recv().await?;
            let uid = change.path.id().to_string();
            let Some(value) = change.value else {
                return Some(PresenceUpdate { uid, record: None });
            };
            match PresenceRecord::from_slot(&change.path, &value) {
                Ok(record) => return Some(PresenceUpdate { uid, record: Some(record) }),
                Err(e) => warn!("Skipping presence update in {}: {e}", self.room_id),
            }
        }
    }
}
