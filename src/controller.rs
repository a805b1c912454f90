//! The per-participant call orchestrator.
//!
//! A [`CallController`] belongs to one local participant. It follows the room
//! it is in, starts or joins calls, owns the resulting [`PeerSupervisor`]s and
//! turns everything that happens into [`CallEvent`]s.
//!
//! All mutable call state lives in one place, the current call session.
//! Every operation that replaces it advances the session counter first, so
//! work started for an older session finds its token stale and backs out.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::future::{BoxFuture, join_all};
use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::env::CallEnv;
use crate::error::CallError;
use crate::events::{CallEvent, EndReason, EventBus};
use crate::initiator::{CallInitiator, StartOutcome};
use crate::joiner::{CallJoiner, JoinOutcome};
use crate::media::{DisplayCapture, MediaTrack};
use crate::peer::{
    PeerRole, PeerSnapshot, PeerSupervisor, SupervisorEvent, SupervisorEventKind, TaskHandle,
};
use crate::presence::{PresenceState, PresenceTracker};
use crate::relay::DocPath;
use crate::room::{CallRoom, RoomStateStore, RoomStatus, RoomWatch};
use crate::session::{SessionCounter, SessionToken};
use crate::signaling::{CallInvite, SignalingMessage};
use crate::types::{CallId, RoomId, Uid};
use crate::vad::{MonitorHandle, SpeechActivityMonitor};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Result of [`CallController::start_call`] and [`CallController::join_call`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallAttempt {
    /// We claimed the room and offered to the other participants.
    Started(CallId),
    Joined(CallId),
    AlreadyInCall(CallId),
    /// The offer for us is not there yet. Joining resumes when it arrives.
    Waiting(CallId),
    /// The call has already ended.
    NotRunning(CallId),
    /// A newer operation replaced this one.
    Superseded,
}

/// Point-in-time view of the local call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSnapshot {
    pub room_id: RoomId,
    pub call_id: CallId,
    pub role: PeerRole,
    pub wants_video: bool,
    pub sharing_screen: bool,
    pub peers: Vec<PeerSnapshot>,
}

struct ScreenShare {
    track: Arc<dyn MediaTrack>,
    _watcher: TaskHandle,
}

/// Everything that belongs to the local call. Replaced as a whole.
struct CallSession {
    room_id: RoomId,
    call_id: CallId,
    role: PeerRole,
    wants_video: bool,
    peers: BTreeMap<Uid, Arc<PeerSupervisor>>,
    screen: Option<ScreenShare>,
}

impl CallSession {
    fn has_video(&self) -> bool {
        self.peers.values().any(|p| p.stream().has_video())
    }

    fn any_connected(&self) -> bool {
        self.peers.values().any(|p| p.is_connected())
    }

    async fn teardown(self) {
        if let Some(screen) = self.screen {
            screen.track.stop();
        }
        join_all(self.peers.values().map(|p| p.close())).await;
    }
}

struct SpeechListener {
    monitor: MonitorHandle,
    _trigger: TaskHandle,
}

struct RoomEntry {
    room_id: RoomId,
    participants: Vec<Uid>,
    status: watch::Sender<RoomStatus>,
    /// Incoming call already announced, so redelivered room documents stay quiet.
    announced: Option<CallId>,
    _watcher: TaskHandle,
    speech: Option<SpeechListener>,
    pending_join: Option<TaskHandle>,
}

struct Inner {
    env: CallEnv,
    rooms: RoomStateStore,
    presence: PresenceTracker,
    joiner: Arc<CallJoiner>,
    initiator: CallInitiator,
    speech: SpeechActivityMonitor,
    sessions: SessionCounter,
    events: EventBus,
    supervisor_tx: mpsc::UnboundedSender<SupervisorEvent>,
    room: tokio::sync::Mutex<Option<RoomEntry>>,
    call: tokio::sync::Mutex<Option<CallSession>>,
    background: Mutex<Vec<TaskHandle>>,
}

/// Room and call orchestration for one local participant.
///
/// Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct CallController {
    inner: Arc<Inner>,
}

impl CallController {
    pub fn new(env: CallEnv) -> Result<Self, CallError> {
        env.config.validate()?;
        let retry = env.config.relay_retry.clone();
        let rooms = RoomStateStore::new(env.relay.clone(), env.local_uid.clone(), retry.clone());
        let presence = PresenceTracker::new(env.relay.clone(), env.local_uid.clone(), retry);
        let joiner = Arc::new(CallJoiner::new(env.clone(), rooms.clone()));
        let initiator = CallInitiator::new(env.clone(), rooms.clone(), joiner.clone());
        let speech = SpeechActivityMonitor::new(env.devices.clone(), env.config.speech.clone());
        let (supervisor_tx, supervisor_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            env,
            rooms,
            presence,
            joiner,
            initiator,
            speech,
            sessions: SessionCounter::new(),
            events: EventBus::new(),
            supervisor_tx,
            room: tokio::sync::Mutex::new(None),
            call: tokio::sync::Mutex::new(None),
            background: Mutex::new(Vec::new()),
        });
        let pump = TaskHandle::spawn(pump_supervisor_events(
            Arc::downgrade(&inner),
            supervisor_rx,
        ));
        lock(&inner.background).push(pump);
        Ok(Self { inner })
    }

    pub fn local_uid(&self) -> &str {
        &self.inner.env.local_uid
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    pub fn rooms(&self) -> &RoomStateStore {
        &self.inner.rooms
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.inner.presence
    }

    /// Follow `room_id`. Leaves the previous room first.
    pub async fn enter_room(
        &self,
        room_id: &str,
        participants: Vec<Uid>,
    ) -> Result<CallRoom, CallError> {
        self.leave_room().await;
        self.inner.enter_room(room_id, participants).await
    }

    /// Stop following the current room, ending any call in it.
    pub async fn leave_room(&self) {
        self.inner.leave_room().await;
    }

    pub async fn start_call(&self, wants_video: bool) -> Result<CallAttempt, CallError> {
        self.inner.start(wants_video).await
    }

    pub async fn join_call(
        &self,
        call_id: &CallId,
        wants_video: bool,
    ) -> Result<CallAttempt, CallError> {
        self.inner.join(call_id.clone(), wants_video).await
    }

    pub async fn end_call(&self) -> Result<(), CallError> {
        if self.inner.finish_call(EndReason::Hangup, None).await {
            Ok(())
        } else {
            Err(CallError::NotInCall)
        }
    }

    pub async fn set_audio_muted(&self, muted: bool) -> Result<(), CallError> {
        let call = self.inner.call.lock().await;
        let session = call.as_ref().ok_or(CallError::NotInCall)?;
        for peer in session.peers.values() {
            peer.set_audio_enabled(!muted);
        }
        debug!("Microphone {}", if muted { "muted" } else { "unmuted" });
        Ok(())
    }

    /// Toggle the camera. Fails with [`CallError::NoOutgoingVideo`] for a call
    /// started without one.
    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), CallError> {
        let call = self.inner.call.lock().await;
        let session = call.as_ref().ok_or(CallError::NotInCall)?;
        for peer in session.peers.values() {
            peer.set_video_enabled(enabled)?;
        }
        Ok(())
    }

    /// Replace the camera with a display capture on every peer. Needs no
    /// renegotiation. Reverts on its own when the capture ends.
    pub async fn start_screen_share(&self) -> Result<(), CallError> {
        self.inner.start_screen_share().await
    }

    pub async fn stop_screen_share(&self) -> Result<(), CallError> {
        self.inner.stop_screen_share(None).await.map(|_| ())
    }

    pub async fn status(&self) -> PresenceState {
        match self.inner.call.lock().await.as_ref() {
            None => PresenceState::Idle,
            Some(session) if session.any_connected() => PresenceState::Connected,
            Some(_) => PresenceState::Connecting,
        }
    }

    /// Last known status of the room we are in.
    pub async fn room_status(&self) -> Option<RoomStatus> {
        self.inner
            .room
            .lock()
            .await
            .as_ref()
            .map(|entry| *entry.status.borrow())
    }

    pub async fn session_snapshot(&self) -> Option<CallSnapshot> {
        let call = self.inner.call.lock().await;
        let session = call.as_ref()?;
        let peers = join_all(session.peers.values().map(|p| p.snapshot())).await;
        Some(CallSnapshot {
            room_id: session.room_id.clone(),
            call_id: session.call_id.clone(),
            role: session.role,
            wants_video: session.wants_video,
            sharing_screen: session.screen.is_some(),
            peers,
        })
    }
}

impl Inner {
    async fn publish_presence(&self, room_id: &str, state: PresenceState, has_video: bool) {
        if let Err(e) = self.presence.publish(room_id, state, has_video).await {
            warn!("Publishing presence {state:?} in {room_id} failed: {e}");
        }
    }

    fn report(&self, error: &CallError) {
        if error.is_user_visible() {
            self.events.emit(CallEvent::Status(error.to_string()));
        }
    }

    async fn current_call_id(&self) -> Option<CallId> {
        self.call.lock().await.as_ref().map(|s| s.call_id.clone())
    }

    async fn room_target(&self) -> Result<(RoomId, Vec<Uid>), CallError> {
        self.room
            .lock()
            .await
            .as_ref()
            .map(|entry| (entry.room_id.clone(), entry.participants.clone()))
            .ok_or(CallError::NotInRoom)
    }

    // Room

    async fn enter_room(
        self: &Arc<Self>,
        room_id: &str,
        participants: Vec<Uid>,
    ) -> Result<CallRoom, CallError> {
        self.sessions.advance();
        let room = self.rooms.ensure_room(room_id).await?;
        let room_watch = self.rooms.watch(room_id).await?;
        {
            // The watcher's first delivery waits for the entry to be in place.
            let mut guard = self.room.lock().await;
            let watcher = TaskHandle::spawn(watch_room(
                Arc::downgrade(self),
                room_id.to_string(),
                room_watch,
            ));
            *guard = Some(RoomEntry {
                room_id: room_id.to_string(),
                participants,
                status: watch::Sender::new(room.status),
                announced: None,
                _watcher: watcher,
                speech: None,
                pending_join: None,
            });
        }
        self.publish_presence(room_id, PresenceState::Idle, false).await;
        self.ensure_speech_monitor().await;
        info!("Entered room {room_id} ({:?})", room.status);
        Ok(room)
    }

    async fn leave_room(&self) {
        self.finish_call(EndReason::LeftRoom, None).await;
        let Some(entry) = self.room.lock().await.take() else {
            return;
        };
        self.sessions.advance();
        if let Some(speech) = entry.speech {
            speech.monitor.stop().await;
        }
        self.publish_presence(&entry.room_id, PresenceState::Idle, false).await;
        info!("Left room {}", entry.room_id);
    }

    /// Deliveries can arrive late or twice, so the stored document decides.
    async fn on_room_change(self: &Arc<Self>, room_id: &str, delivered: CallRoom) {
        let local_call = self.current_call_id().await;
        let room = match self.rooms.current(room_id).await {
            Ok(room) => room,
            Err(e) if delivered.is_idle() => {
                warn!("Could not confirm room {room_id} went idle: {e}");
                return;
            }
            Err(e) => {
                warn!("Re-reading room {room_id} failed: {e}");
                delivered.clone()
            }
        };
        if room != delivered {
            debug!("Room {room_id} moved past {:?} before it was handled", delivered.status);
        }
        let mut incoming = None;
        {
            let mut guard = self.room.lock().await;
            let Some(entry) = guard.as_mut().filter(|e| e.room_id == room_id) else {
                return;
            };
            entry.status.send_replace(room.status);
            if room.is_idle() {
                entry.announced = None;
                entry.pending_join = None;
            } else if let Some(active) = &room.active_call_id
                && local_call.is_none()
                && room.started_by.as_deref() != Some(self.env.local_uid.as_str())
                && entry.announced.as_ref() != Some(active)
            {
                entry.announced = Some(active.clone());
                incoming = Some(active.clone());
            }
        }
        debug!("Room {room_id} is {:?} ({:?})", room.status, room.active_call_id);
        self.events.emit(CallEvent::RoomChanged {
            room_id: room_id.to_string(),
            room: room.clone(),
        });

        if let Some(call_id) = incoming {
            info!("Incoming call {call_id} in room {room_id}");
            self.events.emit(CallEvent::IncomingCall {
                room_id: room_id.to_string(),
                call_id,
                started_by: room.started_by.clone(),
            });
        }
        if let Some(call_id) = local_call
            && !room.is_running(&call_id)
        {
            info!("Room {room_id} no longer runs call {call_id}; ended remotely");
            self.finish_call(EndReason::RemoteEnded, Some(&call_id)).await;
        }
        if room.is_idle() {
            self.ensure_speech_monitor().await;
        }
    }

    // Speech

    async fn ensure_speech_monitor(self: &Arc<Self>) {
        if !self.env.config.speech.enabled || self.call.lock().await.is_some() {
            return;
        }
        let mut guard = self.room.lock().await;
        let Some(entry) = guard.as_mut() else { return };
        if entry.speech.as_ref().is_some_and(|s| !s.monitor.is_finished())
            || *entry.status.borrow() != RoomStatus::Idle
        {
            return;
        }

        let (tx, rx) = oneshot::channel();
        let monitor = self.speech.spawn(entry.status.subscribe(), tx);
        let weak = Arc::downgrade(self);
        let room_id = entry.room_id.clone();
        let trigger = TaskHandle::spawn(async move {
            if rx.await.is_err() {
                return;
            }
            let Some(inner) = weak.upgrade() else { return };
            inner.events.emit(CallEvent::SpeechDetected { room_id });
            // Detached: starting the call replaces this listener.
            tokio::spawn(async move {
                if let Err(e) = inner.start_detached(false).await {
                    warn!("Hands-free call start failed: {e}");
                }
            });
        });
        entry.speech = Some(SpeechListener {
            monitor,
            _trigger: trigger,
        });
        debug!("Speech monitor armed for room {}", entry.room_id);
    }

    /// Stop the speech monitor and wait until it has released the microphone.
    async fn stop_speech_monitor(&self) {
        let speech = match self.room.lock().await.as_mut() {
            Some(entry) => entry.speech.take(),
            None => None,
        };
        if let Some(speech) = speech {
            speech.monitor.stop().await;
        }
    }

    // Starting and joining

    // Boxed entry points for tasks spawned from within start and join.

    fn start_detached(
        self: Arc<Self>,
        wants_video: bool,
    ) -> BoxFuture<'static, Result<CallAttempt, CallError>> {
        Box::pin(async move { self.start(wants_video).await })
    }

    fn join_detached(
        self: Arc<Self>,
        call_id: CallId,
        wants_video: bool,
    ) -> BoxFuture<'static, Result<CallAttempt, CallError>> {
        Box::pin(async move { self.join(call_id, wants_video).await })
    }

    async fn start(self: &Arc<Self>, wants_video: bool) -> Result<CallAttempt, CallError> {
        let (room_id, participants) = self.room_target().await?;
        if let Some(call_id) = self.current_call_id().await {
            return Ok(CallAttempt::AlreadyInCall(call_id));
        }
        self.stop_speech_monitor().await;
        let token = self.sessions.advance();
        self.publish_presence(&room_id, PresenceState::Connecting, wants_video)
            .await;

        let result = self
            .initiator
            .start_call(
                &room_id,
                &participants,
                wants_video,
                token.clone(),
                self.supervisor_tx.clone(),
            )
            .await;
        match result {
            Ok(StartOutcome::Started { call_id, sessions }) => {
                let installed = self
                    .install_call(&room_id, &call_id, PeerRole::Initiator, wants_video, &token, sessions)
                    .await;
                if !installed {
                    return Ok(CallAttempt::Superseded);
                }
                self.events
                    .emit(CallEvent::InviteReady(CallInvite::new(call_id.clone(), wants_video)));
                Ok(CallAttempt::Started(call_id))
            }
            Ok(StartOutcome::Joined { call_id, outcome }) => {
                self.on_join_outcome(&room_id, call_id, wants_video, &token, outcome)
                    .await
            }
            Ok(StartOutcome::Superseded) => Ok(CallAttempt::Superseded),
            Err(e) => {
                self.on_attempt_failed(&room_id, &e).await;
                Err(e)
            }
        }
    }

    async fn join(self: &Arc<Self>, call_id: CallId, wants_video: bool) -> Result<CallAttempt, CallError> {
        let (room_id, _) = self.room_target().await?;
        match self.current_call_id().await {
            Some(current) if current == call_id => return Ok(CallAttempt::AlreadyInCall(call_id)),
            Some(current) => {
                info!("Leaving call {current} to join {call_id}");
                self.finish_call(EndReason::Hangup, Some(&current)).await;
            }
            None => {}
        }
        self.stop_speech_monitor().await;
        let token = self.sessions.advance();
        self.publish_presence(&room_id, PresenceState::Connecting, wants_video)
            .await;

        let result = self
            .joiner
            .join_call(&room_id, &call_id, wants_video, token.clone(), self.supervisor_tx.clone())
            .await;
        match result {
            Ok(outcome) => {
                self.on_join_outcome(&room_id, call_id, wants_video, &token, outcome)
                    .await
            }
            Err(e) => {
                self.on_attempt_failed(&room_id, &e).await;
                Err(e)
            }
        }
    }

    async fn on_join_outcome(
        self: &Arc<Self>,
        room_id: &str,
        call_id: CallId,
        wants_video: bool,
        token: &SessionToken,
        outcome: JoinOutcome,
    ) -> Result<CallAttempt, CallError> {
        match outcome {
            JoinOutcome::Joined(supervisor) => {
                let installed = self
                    .install_call(room_id, &call_id, PeerRole::Joiner, wants_video, token, vec![supervisor])
                    .await;
                Ok(if installed {
                    CallAttempt::Joined(call_id)
                } else {
                    CallAttempt::Superseded
                })
            }
            JoinOutcome::AlreadyJoined => Ok(CallAttempt::AlreadyInCall(call_id)),
            JoinOutcome::Waiting => {
                // Not in a call until the deferred join installs one.
                self.publish_presence(room_id, PresenceState::Idle, false).await;
                self.ensure_speech_monitor().await;
                self.wait_for_offer(room_id, &call_id, wants_video).await?;
                self.events.emit(CallEvent::JoinPending {
                    call_id: call_id.clone(),
                });
                Ok(CallAttempt::Waiting(call_id))
            }
            JoinOutcome::NotRunning => {
                if token.is_current() {
                    self.publish_presence(room_id, PresenceState::Idle, false).await;
                    self.ensure_speech_monitor().await;
                }
                Ok(CallAttempt::NotRunning(call_id))
            }
            JoinOutcome::Superseded => Ok(CallAttempt::Superseded),
        }
    }

    /// Retry the join as soon as an offer for us shows up.
    async fn wait_for_offer(
        self: &Arc<Self>,
        room_id: &str,
        call_id: &CallId,
        wants_video: bool,
    ) -> Result<(), CallError> {
        let path = DocPath::offer(call_id, &self.env.local_uid);
        let mut subscription = self.env.relay.subscribe_doc(&path).await?;
        let weak = Arc::downgrade(self);
        let expected = call_id.clone();
        let task = TaskHandle::spawn(async move {
            while let Some(change) = subscription.recv().await {
                let Some(value) = change.value else { continue };
                match SignalingMessage::from_document(&change.path, &value) {
                    Ok(SignalingMessage::Offer(doc)) if doc.call_id == expected => {
                        let Some(inner) = weak.upgrade() else { return };
                        debug!("Offer for call {expected} arrived; joining");
                        // Detached: a successful join drops this task.
                        tokio::spawn(async move {
                            if let Err(e) = inner.join_detached(expected, wants_video).await {
                                warn!("Deferred join failed: {e}");
                            }
                        });
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => warn!("{e}"),
                }
            }
        });

        let mut guard = self.room.lock().await;
        match guard.as_mut().filter(|e| e.room_id == room_id) {
            Some(entry) => entry.pending_join = Some(task),
            None => debug!("Left room {room_id} before the offer for {call_id} arrived"),
        }
        Ok(())
    }

    async fn on_attempt_failed(self: &Arc<Self>, room_id: &str, error: &CallError) {
        warn!("Call attempt in {room_id} failed: {error}");
        self.report(error);
        if self.call.lock().await.is_none() {
            self.publish_presence(room_id, PresenceState::Idle, false).await;
        }
        self.ensure_speech_monitor().await;
    }

    /// Make `peers` the current call. Returns false, tearing them down, when
    /// `token` went stale or another call got installed first.
    async fn install_call(
        self: &Arc<Self>,
        room_id: &str,
        call_id: &CallId,
        role: PeerRole,
        wants_video: bool,
        token: &SessionToken,
        peers: Vec<Arc<PeerSupervisor>>,
    ) -> bool {
        let mut call = self.call.lock().await;
        if token.is_stale() || call.is_some() {
            drop(call);
            debug!("Call {call_id} superseded before it was installed");
            join_all(peers.iter().map(|p| p.close())).await;
            if role == PeerRole::Initiator
                && let Err(e) = self.rooms.release_room_if_current(room_id, call_id).await
            {
                warn!("Releasing room {room_id} for superseded call failed: {e}");
            }
            return false;
        }

        // Connected events that raced ahead of the install were dropped.
        let connected: Vec<Uid> = peers
            .iter()
            .filter(|p| p.is_connected())
            .map(|p| p.peer_uid().to_string())
            .collect();
        *call = Some(CallSession {
            room_id: room_id.to_string(),
            call_id: call_id.clone(),
            role,
            wants_video,
            peers: peers
                .into_iter()
                .map(|p| (p.peer_uid().to_string(), p))
                .collect(),
            screen: None,
        });
        drop(call);

        if let Some(entry) = self.room.lock().await.as_mut() {
            entry.pending_join = None;
        }
        info!("In call {call_id} as {role:?}");
        self.events.emit(CallEvent::CallStarted {
            call_id: call_id.clone(),
            role,
        });
        for peer in connected {
            self.on_supervisor_event(SupervisorEvent {
                call_id: call_id.clone(),
                peer,
                kind: SupervisorEventKind::Connected,
            })
            .await;
        }
        true
    }

    // Ending

    /// End the local call, if any (and if it is `only`, when given).
    /// Returns whether a call was ended.
    async fn finish_call(&self, reason: EndReason, only: Option<&CallId>) -> bool {
        let session = {
            let mut call = self.call.lock().await;
            match call.as_ref() {
                Some(s) if only.is_none_or(|id| *id == s.call_id) => call.take(),
                _ => None,
            }
        };
        let Some(session) = session else { return false };
        self.sessions.advance();

        let room_id = session.room_id.clone();
        let call_id = session.call_id.clone();
        session.teardown().await;
        if let Err(e) = self.rooms.release_room_if_current(&room_id, &call_id).await {
            warn!("Releasing room {room_id} after call {call_id} failed: {e}");
            self.report(&e);
        }
        self.publish_presence(&room_id, PresenceState::Idle, false).await;
        info!("Call {call_id} ended ({reason:?})");
        self.events.emit(CallEvent::CallEnded { call_id, reason });
        true
    }

    // Peer events

    async fn on_supervisor_event(&self, event: SupervisorEvent) {
        let SupervisorEvent {
            call_id,
            peer,
            kind,
        } = event;
        let mut call = self.call.lock().await;
        let Some(session) = call.as_mut().filter(|s| s.call_id == call_id) else {
            debug!("Dropping {kind:?} from {peer} for inactive call {call_id}");
            return;
        };
        let room_id = session.room_id.clone();

        match kind {
            SupervisorEventKind::Connected => {
                let has_video = session.has_video();
                drop(call);
                if let Err(e) = self.rooms.promote_to_active(&room_id, &call_id).await {
                    warn!("Marking call {call_id} active failed: {e}");
                }
                self.publish_presence(&room_id, PresenceState::Connected, has_video)
                    .await;
                self.events
                    .emit(CallEvent::PeerConnected { call_id, peer });
            }
            SupervisorEventKind::Disconnected => {
                let still_connected = session.any_connected();
                let has_video = session.has_video();
                drop(call);
                if !still_connected {
                    self.publish_presence(&room_id, PresenceState::Connecting, has_video)
                        .await;
                }
                self.events
                    .emit(CallEvent::PeerDisconnected { call_id, peer });
            }
            SupervisorEventKind::Failed { reason } => {
                let removed = session.peers.remove(&peer);
                let remaining = session.peers.len();
                drop(call);
                if let Some(supervisor) = removed {
                    supervisor.close().await;
                }
                let error = CallError::TransportDegraded {
                    peer: peer.clone(),
                    reason: reason.clone(),
                };
                warn!("{error}");
                self.report(&error);
                self.events.emit(CallEvent::PeerFailed {
                    call_id: call_id.clone(),
                    peer,
                    reason,
                });
                if remaining == 0 {
                    self.finish_call(EndReason::Failed, Some(&call_id)).await;
                }
            }
            SupervisorEventKind::RemoteTrack(kind) => {
                drop(call);
                self.events
                    .emit(CallEvent::RemoteTrack { call_id, peer, kind });
            }
        }
    }

    // Screen share

    async fn start_screen_share(self: &Arc<Self>) -> Result<(), CallError> {
        let mut call = self.call.lock().await;
        let session = call.as_mut().ok_or(CallError::NotInCall)?;
        if session.screen.is_some() {
            return Ok(());
        }
        let DisplayCapture { track, ended } = self.env.devices.get_display_media().await?;

        let mut shared: Vec<&Arc<PeerSupervisor>> = Vec::new();
        for peer in session.peers.values() {
            if let Err(e) = peer.start_screen_share(track.clone()).await {
                for peer in shared {
                    if let Err(e) = peer.stop_screen_share().await {
                        warn!("Reverting screen share for {} failed: {e}", peer.peer_uid());
                    }
                }
                track.stop();
                return Err(e);
            }
            shared.push(peer);
        }

        let weak = Arc::downgrade(self);
        let call_id = session.call_id.clone();
        let watcher = TaskHandle::spawn({
            let call_id = call_id.clone();
            async move {
                if ended.await.is_err() {
                    return;
                }
                let Some(inner) = weak.upgrade() else { return };
                info!("Display capture ended; switching back to the camera");
                // Detached: stopping the share drops this watcher.
                tokio::spawn(async move {
                    if let Err(e) = inner.stop_screen_share(Some(&call_id)).await {
                        warn!("Reverting screen share failed: {e}");
                    }
                });
            }
        });
        session.screen = Some(ScreenShare {
            track,
            _watcher: watcher,
        });
        drop(call);
        self.events.emit(CallEvent::ScreenShareStarted { call_id });
        Ok(())
    }

    /// Returns whether a share was running.
    async fn stop_screen_share(&self, only: Option<&CallId>) -> Result<bool, CallError> {
        let mut call = self.call.lock().await;
        let session = call.as_mut().ok_or(CallError::NotInCall)?;
        if only.is_some_and(|id| *id != session.call_id) {
            return Ok(false);
        }
        let Some(screen) = session.screen.take() else {
            return Ok(false);
        };
        for peer in session.peers.values() {
            if let Err(e) = peer.stop_screen_share().await {
                warn!("Restoring camera for {} failed: {e}", peer.peer_uid());
            }
        }
        screen.track.stop();
        let call_id = session.call_id.clone();
        drop(call);
        self.events.emit(CallEvent::ScreenShareStopped { call_id });
        Ok(true)
    }
}

async fn pump_supervisor_events(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<SupervisorEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        inner.on_supervisor_event(event).await;
    }
}

async fn watch_room(inner: Weak<Inner>, room_id: RoomId, mut watch: RoomWatch) {
    while let Some(room) = watch.next().await {
        let Some(inner) = inner.upgrade() else { break };
        inner.on_room_change(&room_id, room).await;
    }
    debug!("Room watch for {room_id} ended");
}
