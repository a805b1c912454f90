#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use roomcall::loopback::{LoopbackDevices, LoopbackFactory, LoopbackNetwork, LoopbackPeerConnection};
use roomcall::relay::{DocPath, MemoryRelay, SignalingRelay};
use roomcall::rtc::{MediaKind, PeerConnection, PeerConnectionFactory, TransceiverDirection};
use roomcall::signaling::{SessionDoc, SignalingMessage};
use roomcall::{CallConfig, CallController, CallEnv, CallEvent, CallId};
use tokio::sync::broadcast;

pub const ROOM: &str = "room-1";

/// One relay and one network shared by every participant of a test.
pub struct World {
    pub relay: Arc<MemoryRelay>,
    pub network: LoopbackNetwork,
}

pub struct Participant {
    pub uid: String,
    pub controller: CallController,
    pub devices: Arc<LoopbackDevices>,
    pub factory: LoopbackFactory,
    pub events: broadcast::Receiver<CallEvent>,
}

impl World {
    pub fn new() -> Self {
        Self {
            relay: Arc::new(MemoryRelay::new()),
            network: LoopbackNetwork::new(),
        }
    }

    pub fn env(&self, uid: &str, config: CallConfig) -> (CallEnv, LoopbackFactory, Arc<LoopbackDevices>) {
        let devices = LoopbackDevices::new();
        let factory = LoopbackFactory::new(self.network.clone());
        let env = CallEnv::new(
            uid,
            config,
            self.relay.clone(),
            Arc::new(factory.clone()),
            devices.clone(),
        );
        (env, factory, devices)
    }

    pub fn participant(&self, uid: &str) -> Participant {
        self.participant_with(uid, CallConfig::default())
    }

    pub fn participant_with(&self, uid: &str, config: CallConfig) -> Participant {
        let (env, factory, devices) = self.env(uid, config);
        let controller = CallController::new(env).expect("valid config");
        let events = controller.subscribe_events();
        Participant {
            uid: uid.to_string(),
            controller,
            devices,
            factory,
            events,
        }
    }

    /// Write a syntactically complete offer from `from` to `to`, as an
    /// initiator without a camera would.
    pub async fn publish_offer(&self, call_id: &CallId, from: &str, to: &str) {
        let factory = LoopbackFactory::new(LoopbackNetwork::new());
        let pc = factory.create(&[]).await.expect("connection");
        pc.add_transceiver(MediaKind::Audio, TransceiverDirection::SendRecv);
        pc.add_transceiver(MediaKind::Video, TransceiverDirection::RecvOnly);
        let offer = pc.create_offer(false).await.expect("offer");
        let doc = SessionDoc::new(call_id, from, to, &offer);
        self.relay
            .set(
                &DocPath::offer(call_id, to),
                SignalingMessage::Offer(doc).to_document(),
            )
            .await
            .expect("write offer");
    }

    pub async fn read_session(&self, path: &DocPath) -> SessionDoc {
        let value = self
            .relay
            .get(path)
            .await
            .expect("relay read")
            .expect("document present");
        match SignalingMessage::from_document(path, &value).expect("valid document") {
            SignalingMessage::Offer(doc) | SignalingMessage::Answer(doc) => doc,
            other => panic!("expected a session document, got {other:?}"),
        }
    }
}

impl Participant {
    pub async fn enter(&self, members: &[&str]) {
        self.controller
            .enter_room(ROOM, members.iter().map(|m| m.to_string()).collect())
            .await
            .expect("enter room");
    }

    /// Next event matching `pred`, skipping everything else.
    pub async fn wait_for(&mut self, pred: impl Fn(&CallEvent) -> bool) -> CallEvent {
        let events = &mut self.events;
        tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(e) => panic!("event bus closed: {e}"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    pub async fn wait_connected(&mut self) {
        self.wait_for(|e| matches!(e, CallEvent::PeerConnected { .. }))
            .await;
    }

    /// The most recent connection this participant created.
    pub fn connection(&self) -> Arc<LoopbackPeerConnection> {
        self.factory.last_connection().expect("a connection was created")
    }
}

/// Poll `cond` until it holds, letting background tasks run in between.
pub async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held: {what}");
}
