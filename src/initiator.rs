//! Starting a call: claim the room, then offer to every remote participant.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::env::CallEnv;
use crate::error::CallError;
use crate::joiner::{CallJoiner, JoinOutcome};
use crate::media::MediaConstraints;
use crate::peer::{PeerRole, PeerSupervisor, SupervisorEvent};
use crate::room::{ClaimOutcome, RoomStateStore};
use crate::rtc::{MediaKind, TransceiverDirection};
use crate::session::SessionToken;
use crate::types::{CallId, Uid};

#[derive(Debug)]
pub enum StartOutcome {
    /// We hold the room and have offered to `sessions`.
    Started {
        call_id: CallId,
        sessions: Vec<Arc<PeerSupervisor>>,
    },
    /// Another participant claimed the room first; we joined their call
    /// instead.
    Joined { call_id: CallId, outcome: JoinOutcome },
    Superseded,
}

pub struct CallInitiator {
    env: CallEnv,
    rooms: RoomStateStore,
    joiner: Arc<CallJoiner>,
}

impl CallInitiator {
    pub fn new(env: CallEnv, rooms: RoomStateStore, joiner: Arc<CallJoiner>) -> Self {
        Self { env, rooms, joiner }
    }

    /// Remote participants to offer to, in a stable order, capped at the
    /// configured fan-out.
    pub fn select_peers(&self, participants: &[Uid]) -> Vec<Uid> {
        let mut peers: Vec<Uid> = participants
            .iter()
            .filter(|uid| **uid != self.env.local_uid)
            .cloned()
            .collect();
        peers.sort();
        peers.dedup();
        if peers.len() > self.env.config.max_peers {
            debug!(
                "Limiting call to {} of {} participants",
                self.env.config.max_peers,
                peers.len()
            );
            peers.truncate(self.env.config.max_peers);
        }
        peers
    }

    pub async fn start_call(
        &self,
        room_id: &str,
        participants: &[Uid],
        wants_video: bool,
        token: SessionToken,
        events: mpsc::UnboundedSender<SupervisorEvent>,
    ) -> Result<StartOutcome, CallError> {
        let peers = self.select_peers(participants);
        if peers.is_empty() {
            return Err(CallError::NoPeers);
        }

        let call_id = CallId::generate();
        match self.rooms.claim(room_id, &call_id).await? {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::Taken(room) => {
                let Some(active) = room.active_call_id else {
                    return Err(CallError::invalid_document(
                        format!("callRooms/{room_id}"),
                        "claimed room without a call",
                    ));
                };
                info!("Room {room_id} already has call {active}; joining it");
                let outcome = self
                    .joiner
                    .join_call(room_id, &active, wants_video, token, events)
                    .await?;
                return Ok(StartOutcome::Joined {
                    call_id: active,
                    outcome,
                });
            }
        }
        if token.is_stale() {
            self.abandon(room_id, &call_id, Vec::new()).await;
            return Ok(StartOutcome::Superseded);
        }

        let mut sessions = Vec::with_capacity(peers.len());
        let result = self
            .offer_to_peers(&call_id, &peers, wants_video, &token, &events, &mut sessions)
            .await;
        match result {
            Ok(()) if token.is_current() => {
                info!(
                    "Started call {call_id} in room {room_id} with {} peer(s)",
                    sessions.len()
                );
                Ok(StartOutcome::Started { call_id, sessions })
            }
            Ok(()) => {
                self.abandon(room_id, &call_id, sessions).await;
                Ok(StartOutcome::Superseded)
            }
            Err(e) => {
                warn!("Starting call {call_id} failed: {e}");
                self.abandon(room_id, &call_id, sessions).await;
                Err(e)
            }
        }
    }

    async fn offer_to_peers(
        &self,
        call_id: &CallId,
        peers: &[Uid],
        wants_video: bool,
        token: &SessionToken,
        events: &mpsc::UnboundedSender<SupervisorEvent>,
        sessions: &mut Vec<Arc<PeerSupervisor>>,
    ) -> Result<(), CallError> {
        for peer in peers {
            let stream = self
                .env
                .devices
                .get_user_media(MediaConstraints::for_call(wants_video))
                .await?;
            if token.is_stale() {
                stream.stop_all();
                return Ok(());
            }
            let connection = match self.env.rtc.create(&self.env.config.ice_servers).await {
                Ok(connection) => connection,
                Err(e) => {
                    stream.stop_all();
                    return Err(e.into());
                }
            };

            // Fixed line order: one audio line, then one video line. The video
            // line only receives when there is no camera.
            let audio = connection.add_transceiver(MediaKind::Audio, TransceiverDirection::SendRecv);
            let video_direction = if stream.has_video() {
                TransceiverDirection::SendRecv
            } else {
                TransceiverDirection::RecvOnly
            };
            let video = connection.add_transceiver(MediaKind::Video, video_direction);

            let ctx = self.env.peer_context(call_id, peer, PeerRole::Initiator, token.clone(), events.clone());
            let supervisor = PeerSupervisor::new(ctx, connection, stream.clone());
            sessions.push(supervisor.clone());

            audio.replace_track(stream.audio.clone()).await?;
            if stream.has_video() {
                video.replace_track(stream.video.clone()).await?;
            }

            supervisor.start();
            supervisor.listen_for_answer().await?;
            supervisor.listen_for_candidates().await?;
            supervisor.publish_offer(false).await?;
            if token.is_stale() {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Tear down everything a failed or superseded start created.
    async fn abandon(&self, room_id: &str, call_id: &CallId, sessions: Vec<Arc<PeerSupervisor>>) {
        for session in sessions {
            session.close().await;
        }
        if let Err(e) = self.rooms.release_room_if_current(room_id, call_id).await {
            warn!("Releasing room {room_id} after failed start: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CallConfig;
    use crate::loopback::{LoopbackDevices, LoopbackFactory, LoopbackNetwork};
    use crate::relay::MemoryRelay;
    use crate::session::SessionCounter;

    struct Fixture {
        initiator: CallInitiator,
        rooms: RoomStateStore,
        devices: Arc<LoopbackDevices>,
        factory: LoopbackFactory,
    }

    fn fixture(config: CallConfig) -> Fixture {
        let relay = Arc::new(MemoryRelay::new());
        let devices = LoopbackDevices::new();
        let factory = LoopbackFactory::new(LoopbackNetwork::new());
        let env = CallEnv::new(
            "alice",
            config,
            relay.clone(),
            Arc::new(factory.clone()),
            devices.clone(),
        );
        let rooms = RoomStateStore::new(relay, "alice", env.config.relay_retry.clone());
        let joiner = Arc::new(CallJoiner::new(env.clone(), rooms.clone()));
        Fixture {
            initiator: CallInitiator::new(env, rooms.clone(), joiner),
            rooms,
            devices,
            factory,
        }
    }

    fn uids(names: &[&str]) -> Vec<Uid> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_select_peers_excludes_self_and_caps_fan_out() {
        let config = CallConfig {
            max_peers: 2,
            ..CallConfig::default()
        };
        let f = fixture(config);
        let peers = f
            .initiator
            .select_peers(&uids(&["dave", "alice", "bob", "carol", "bob"]));
        assert_eq!(peers, uids(&["bob", "carol"]));

        assert!(f.initiator.select_peers(&uids(&["alice"])).is_empty());
    }

    #[tokio::test]
    async fn test_alone_in_room_is_an_error_and_claims_nothing() {
        let f = fixture(CallConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = f
            .initiator
            .start_call("r1", &uids(&["alice"]), false, SessionCounter::new().advance(), tx)
            .await;
        assert!(matches!(result, Err(CallError::NoPeers)));
        assert!(f.rooms.current("r1").await.unwrap().is_idle());
    }

    #[tokio::test]
    async fn test_denied_camera_releases_the_claim() {
        let f = fixture(CallConfig::default());
        f.devices.set_deny_camera(true);
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = f
            .initiator
            .start_call("r1", &uids(&["alice", "bob"]), true, SessionCounter::new().advance(), tx)
            .await;
        assert!(matches!(result, Err(CallError::PermissionDenied(ref d)) if d == "camera"));
        assert!(f.rooms.current("r1").await.unwrap().is_idle());
        assert!(f.factory.connections().is_empty());
        assert_eq!(f.devices.live_tracks(), 0);
    }

    #[tokio::test]
    async fn test_stale_token_abandons_the_start() {
        let f = fixture(CallConfig::default());
        let sessions = SessionCounter::new();
        let token = sessions.advance();
        sessions.advance();
        let (tx, _rx) = mpsc::unbounded_channel();
        let outcome = f
            .initiator
            .start_call("r1", &uids(&["alice", "bob"]), false, token, tx)
            .await
            .unwrap();
        assert!(matches!(outcome, StartOutcome::Superseded));
        assert!(f.rooms.current("r1").await.unwrap().is_idle());
    }
}
