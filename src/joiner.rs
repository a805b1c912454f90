//! Joining a call someone else started.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::env::CallEnv;
use crate::error::CallError;
use crate::media::{MediaConstraints, MediaTrack};
use crate::peer::{PeerRole, PeerSupervisor, SupervisorEvent};
use crate::relay::{DocPath, with_retry};
use crate::room::RoomStateStore;
use crate::rtc::{MediaKind, PeerConnection};
use crate::sdp;
use crate::session::SessionToken;
use crate::signaling::{SessionDoc, SignalingMessage};
use crate::types::CallId;

#[derive(Debug)]
pub enum JoinOutcome {
    Joined(Arc<PeerSupervisor>),
    /// This call is already joined, or was just attempted without result.
    AlreadyJoined,
    /// No offer for us yet. The next relay notification resolves it.
    Waiting,
    /// The room no longer carries this call.
    NotRunning,
    /// A newer session replaced this one while joining.
    Superseded,
}

struct JoinRecord {
    call_id: CallId,
    at: Instant,
    sessions: Vec<Weak<PeerSupervisor>>,
}

impl JoinRecord {
    fn live_sessions(&self) -> usize {
        self.sessions
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|s| !s.is_closed())
            .count()
    }
}

/// Discovers the offer addressed to the local participant and answers it.
pub struct CallJoiner {
    env: CallEnv,
    rooms: RoomStateStore,
    last_join: Mutex<Option<JoinRecord>>,
}

impl CallJoiner {
    pub fn new(env: CallEnv, rooms: RoomStateStore) -> Self {
        Self {
            env,
            rooms,
            last_join: Mutex::new(None),
        }
    }

    /// Whether `call_id` should not be joined again right now.
    fn recently_joined(&self, call_id: &CallId) -> bool {
        let last = self.last_join.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(record) = last.as_ref().filter(|r| &r.call_id == call_id) else {
            return false;
        };
        if record.live_sessions() > 0 {
            return true;
        }
        record.at.elapsed() <= self.env.config.rejoin_backoff()
    }

    fn record_join(&self, call_id: &CallId, sessions: Vec<Weak<PeerSupervisor>>) {
        *self.last_join.lock().unwrap_or_else(PoisonError::into_inner) = Some(JoinRecord {
            call_id: call_id.clone(),
            at: Instant::now(),
            sessions,
        });
    }

    async fn is_running(&self, room_id: &str, call_id: &CallId) -> Result<bool, CallError> {
        let room = self.rooms.current(room_id).await?;
        if !room.is_running(call_id) {
            info!(
                "Call {call_id} is not running in room {room_id} ({:?}); not joining",
                room.status
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Poll for an offer addressed to us, absorbing publish latency.
    async fn find_offer(
        &self,
        call_id: &CallId,
        token: &SessionToken,
    ) -> Result<Option<SessionDoc>, CallError> {
        let config = &self.env.config;
        let path = DocPath::offer(call_id, &self.env.local_uid);
        for attempt in 1..=config.join_poll_attempts {
            let value = with_retry("read offer", &config.relay_retry, || {
                self.env.relay.get(&path)
            })
            .await?;
            if token.is_stale() {
                return Ok(None);
            }
            match value.map(|v| SignalingMessage::from_document(&path, &v)) {
                Some(Ok(SignalingMessage::Offer(doc))) => {
                    debug!("Found offer for call {call_id} on attempt {attempt}");
                    return Ok(Some(doc));
                }
                Some(Ok(other)) => warn!("Unexpected {other:?} in offer slot"),
                Some(Err(e)) => warn!("{e}"),
                None => {}
            }
            if attempt < config.join_poll_attempts {
                tokio::time::sleep(config.join_poll_interval()).await;
            }
        }
        Ok(None)
    }

    /// Answer the offer for call `call_id` in `room_id`.
    pub async fn join_call(
        &self,
        room_id: &str,
        call_id: &CallId,
        wants_video: bool,
        token: SessionToken,
        events: mpsc::UnboundedSender<SupervisorEvent>,
    ) -> Result<JoinOutcome, CallError> {
        if !self.is_running(room_id, call_id).await? {
            return Ok(JoinOutcome::NotRunning);
        }
        if self.recently_joined(call_id) {
            debug!("Call {call_id} already joined; not rejoining");
            return Ok(JoinOutcome::AlreadyJoined);
        }

        let Some(offer) = self.find_offer(call_id, &token).await? else {
            if token.is_stale() {
                return Ok(JoinOutcome::Superseded);
            }
            info!("No offer for call {call_id} yet; waiting");
            return Ok(JoinOutcome::Waiting);
        };
        // Offers outlive their call, so the room is checked again.
        if !self.is_running(room_id, call_id).await? {
            return Ok(JoinOutcome::NotRunning);
        }
        self.record_join(call_id, Vec::new());

        let stream = self
            .env
            .devices
            .get_user_media(MediaConstraints::for_call(wants_video))
            .await?;
        if token.is_stale() {
            stream.stop_all();
            return Ok(JoinOutcome::Superseded);
        }
        let connection = match self.env.rtc.create(&self.env.config.ice_servers).await {
            Ok(connection) => connection,
            Err(e) => {
                stream.stop_all();
                return Err(e.into());
            }
        };

        let ctx = self.env.peer_context(call_id, &offer.from_uid, PeerRole::Joiner, token.clone(), events);
        let supervisor = PeerSupervisor::new(ctx, connection, stream);
        // Teardown runs on every exit below unless the session is handed out.
        let guard = scopeguard::guard(supervisor.clone(), |supervisor| {
            tokio::spawn(async move { supervisor.close().await });
        });

        supervisor.start();
        supervisor.listen_for_candidates().await?;
        supervisor.accept_offer(offer).await?;
        if token.is_stale() {
            return Ok(JoinOutcome::Superseded);
        }
        supervisor.listen_for_offer_changes().await?;
        self.rooms.promote_to_active(room_id, call_id).await?;
        if token.is_stale() {
            return Ok(JoinOutcome::Superseded);
        }

        let supervisor = scopeguard::ScopeGuard::into_inner(guard);
        self.record_join(call_id, vec![Arc::downgrade(&supervisor)]);
        info!(
            "Joined call {call_id} with {} in room {room_id}",
            supervisor.peer_uid()
        );
        Ok(JoinOutcome::Joined(supervisor))
    }
}

/// Line the connection's existing transceivers up with the offer's media
/// lines: set each answer direction and attach or detach the outgoing track.
///
/// Never adds or reorders lines.
pub(crate) async fn align_transceivers(
    connection: &dyn PeerConnection,
    offer_sdp: &str,
    audio: Option<Arc<dyn MediaTrack>>,
    video: Option<Arc<dyn MediaTrack>>,
) -> Result<(), CallError> {
    let transceivers = connection.transceivers();
    let mut used = vec![false; transceivers.len()];

    for section in sdp::media_sections(offer_sdp) {
        let Some(kind) = section.kind else { continue };
        let by_mid = section.mid.as_deref().and_then(|mid| {
            (0..transceivers.len()).find(|&i| {
                !used[i]
                    && transceivers[i].kind() == kind
                    && transceivers[i].mid().as_deref() == Some(mid)
            })
        });
        let index = by_mid
            .or_else(|| (0..transceivers.len()).find(|&i| !used[i] && transceivers[i].kind() == kind));
        let Some(index) = index else {
            warn!("No {kind} transceiver for offered line {:?}", section.mid);
            continue;
        };
        used[index] = true;

        let track = match kind {
            MediaKind::Audio => audio.clone(),
            MediaKind::Video => video.clone(),
        };
        let transceiver = &transceivers[index];
        // Send only where the offerer sends too: an audio-only call stays
        // audio-only in both directions.
        let direction = section
            .direction
            .answer_to(track.is_some() && section.direction.sends());
        transceiver.set_direction(direction);
        transceiver
            .replace_track(if direction.sends() { track } else { None })
            .await?;
        debug!(
            "Aligned {kind} line {:?}: offered {:?}, answering {direction:?}",
            section.mid, section.direction
        );
    }
    Ok(())
}
