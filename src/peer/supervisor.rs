use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::{debug, info, warn};
use tokio::sync::mpsc;

use super::TaskHandle;
use super::candidates::{Admission, CandidateQueue};
use super::state::{PeerSessionState, PeerTransition};
use crate::config::{RetryPolicy, WatchdogConfig};
use crate::error::CallError;
use crate::joiner::align_transceivers;
use crate::media::{LocalStream, MediaTrack};
use crate::relay::{Collection, DocChange, DocPath, SignalingRelay, Subscription, with_retry};
use crate::rtc::{
    ConnectionState, IceCandidate, MediaKind, PeerConnection, PeerEvent, SessionDescription,
    Transceiver,
};
use crate::sdp;
use crate::session::SessionToken;
use crate::signaling::{CandidateDoc, CandidateOrigin, SessionDoc, SignalingMessage};
use crate::types::{CallId, Uid};

/// Which side of the offer/answer exchange this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Initiator,
    Joiner,
}

impl PeerRole {
    /// Origin tag for candidates this side publishes.
    fn local_origin(self) -> CandidateOrigin {
        match self {
            Self::Initiator => CandidateOrigin::Offer,
            Self::Joiner => CandidateOrigin::Answer,
        }
    }

    fn remote_origin(self) -> CandidateOrigin {
        match self {
            Self::Initiator => CandidateOrigin::Answer,
            Self::Joiner => CandidateOrigin::Offer,
        }
    }
}

/// Notification from a supervisor to the call that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorEvent {
    pub call_id: CallId,
    pub peer: Uid,
    pub kind: SupervisorEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEventKind {
    Connected,
    Disconnected,
    /// Recovery is exhausted; the owner should tear the peer down.
    Failed { reason: String },
    RemoteTrack(MediaKind),
}

/// Everything a supervisor needs besides its connection and tracks.
#[derive(Clone)]
pub struct PeerContext {
    pub call_id: CallId,
    pub local_uid: Uid,
    pub peer_uid: Uid,
    pub role: PeerRole,
    pub relay: Arc<dyn SignalingRelay>,
    pub retry: RetryPolicy,
    pub watchdog: WatchdogConfig,
    pub token: SessionToken,
    pub events: mpsc::UnboundedSender<SupervisorEvent>,
}

/// Point-in-time view of a peer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub peer_uid: Uid,
    pub role: PeerRole,
    pub state: PeerSessionState,
    pub connection: ConnectionState,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub sharing_screen: bool,
}

struct Negotiation {
    state: PeerSessionState,
    local_candidates: CandidateQueue,
    remote_candidates: CandidateQueue,
    /// Last remote sdp applied, used to skip redelivered documents.
    last_remote_sdp: Option<String>,
    awaiting_answer: bool,
    /// [`sdp::origin`] of the offer we last published.
    pending_offer: Option<String>,
}

#[derive(Default)]
struct Watchdogs {
    restart: Option<TaskHandle>,
    renegotiate: Option<TaskHandle>,
}

impl Watchdogs {
    fn is_armed(&self) -> bool {
        [&self.restart, &self.renegotiate]
            .into_iter()
            .flatten()
            .any(|h| !h.is_finished())
    }
}

/// Owns the media session with one remote participant.
pub struct PeerSupervisor {
    ctx: PeerContext,
    connection: Arc<dyn PeerConnection>,
    stream: LocalStream,
    screen: Mutex<Option<Arc<dyn MediaTrack>>>,
    negotiation: tokio::sync::Mutex<Negotiation>,
    tasks: Mutex<Vec<TaskHandle>>,
    watchdogs: Mutex<Watchdogs>,
    renegotiated: AtomicBool,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PeerSupervisor {
    pub fn new(
        ctx: PeerContext,
        connection: Arc<dyn PeerConnection>,
        stream: LocalStream,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            connection,
            stream,
            screen: Mutex::new(None),
            negotiation: tokio::sync::Mutex::new(Negotiation {
                state: PeerSessionState::New,
                local_candidates: CandidateQueue::new(),
                remote_candidates: CandidateQueue::deduplicating(),
                last_remote_sdp: None,
                awaiting_answer: false,
                pending_offer: None,
            }),
            tasks: Mutex::new(Vec::new()),
            watchdogs: Mutex::new(Watchdogs::default()),
            renegotiated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn peer_uid(&self) -> &str {
        &self.ctx.peer_uid
    }

    pub fn role(&self) -> PeerRole {
        self.ctx.role
    }

    pub fn connection(&self) -> &Arc<dyn PeerConnection> {
        &self.connection
    }

    pub fn stream(&self) -> &LocalStream {
        &self.stream
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Open and still belonging to the current session.
    pub fn is_live(&self) -> bool {
        !self.is_closed() && self.ctx.token.is_current()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.connection_state().is_connected()
    }

    /// Start consuming connection events and arm the watchdogs.
    pub fn start(self: &Arc<Self>) {
        match self.connection.take_events() {
            Some(mut events) => {
                let weak = Arc::downgrade(self);
                self.push_task(TaskHandle::spawn(async move {
                    while let Some(event) = events.recv().await {
                        let Some(sup) = weak.upgrade() else { break };
                        sup.handle_peer_event(event).await;
                    }
                }));
            }
            None => warn!("Connection events for {} already taken", self.ctx.peer_uid),
        }
        self.arm_watchdogs();
    }

    async fn handle_peer_event(self: &Arc<Self>, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let mut neg = self.negotiation.lock().await;
                if let Admission::Ready(candidate) = neg.local_candidates.push(candidate) {
                    self.publish_candidate(candidate).await;
                }
            }
            PeerEvent::ConnectionStateChanged(state) => self.on_connection_state(state).await,
            PeerEvent::RemoteTrack { kind, track_id } => {
                debug!("Remote {kind} track {track_id} from {}", self.ctx.peer_uid);
                self.emit(SupervisorEventKind::RemoteTrack(kind));
            }
        }
    }

    async fn on_connection_state(self: &Arc<Self>, state: ConnectionState) {
        if self.is_closed() {
            return;
        }
        let peer = self.ctx.peer_uid.clone();
        let mut neg = self.negotiation.lock().await;
        match state {
            ConnectionState::New | ConnectionState::Closed => {}
            ConnectionState::Connecting => advance(&mut neg.state, PeerTransition::IceChecking),
            ConnectionState::Connected => {
                self.cancel_watchdogs();
                advance(&mut neg.state, PeerTransition::Connected);
                info!("Peer {peer} connected in call {}", self.ctx.call_id);
                self.emit(SupervisorEventKind::Connected);
            }
            ConnectionState::Disconnected => {
                advance(&mut neg.state, PeerTransition::Disconnected);
                warn!("Peer {peer} disconnected; waiting for recovery");
                self.arm_watchdogs();
                self.emit(SupervisorEventKind::Disconnected);
            }
            ConnectionState::Failed => {
                advance(&mut neg.state, PeerTransition::Failed);
                if self.renegotiated.load(Ordering::SeqCst) {
                    warn!("Peer {peer} failed after renegotiation; giving up");
                    self.emit(SupervisorEventKind::Failed {
                        reason: "connection failed after renegotiation".into(),
                    });
                } else {
                    warn!("Peer {peer} failed; recovery pending");
                    self.arm_watchdogs();
                }
            }
        }
    }

    fn emit(&self, kind: SupervisorEventKind) {
        // The owner may already be gone during shutdown.
        let _ = self.ctx.events.send(SupervisorEvent {
            call_id: self.ctx.call_id.clone(),
            peer: self.ctx.peer_uid.clone(),
            kind,
        });
    }

    fn push_task(&self, task: TaskHandle) {
        if self.is_closed() {
            return;
        }
        lock(&self.tasks).push(task);
    }

    /// Run `handler` for every change on `subscription` until the supervisor
    /// closes.
    fn spawn_listener<F, Fut>(self: &Arc<Self>, mut subscription: Subscription, handler: F)
    where
        F: Fn(Arc<Self>, DocChange) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.push_task(TaskHandle::spawn(async move {
            while let Some(change) = subscription.recv().await {
                let Some(sup) = weak.upgrade() else { break };
                handler(sup, change).await;
            }
        }));
    }

    // Watchdogs

    /// Arm both recovery deadlines unless a previous pair is still pending.
    fn arm_watchdogs(self: &Arc<Self>) {
        if !self.is_live() {
            return;
        }
        let mut dogs = lock(&self.watchdogs);
        if dogs.is_armed() {
            return;
        }
        self.renegotiated.store(false, Ordering::SeqCst);

        let restart_after = self.ctx.watchdog.ice_restart_after();
        let weak = Arc::downgrade(self);
        dogs.restart = Some(TaskHandle::spawn(async move {
            tokio::time::sleep(restart_after).await;
            if let Some(sup) = weak.upgrade() {
                sup.on_restart_deadline().await;
            }
        }));

        let renegotiate_after = self.ctx.watchdog.renegotiate_after();
        let weak = Arc::downgrade(self);
        dogs.renegotiate = Some(TaskHandle::spawn(async move {
            tokio::time::sleep(renegotiate_after).await;
            if let Some(sup) = weak.upgrade() {
                sup.on_renegotiate_deadline().await;
            }
        }));
        debug!(
            "Watchdogs armed for {} ({restart_after:?} / {renegotiate_after:?})",
            self.ctx.peer_uid
        );
    }

    fn cancel_watchdogs(&self) {
        let mut dogs = lock(&self.watchdogs);
        let restart = dogs.restart.take();
        let renegotiate = dogs.renegotiate.take();
        if restart.is_some() || renegotiate.is_some() {
            debug!("Watchdogs cancelled for {}", self.ctx.peer_uid);
        }
    }

    pub fn watchdogs_armed(&self) -> bool {
        lock(&self.watchdogs).is_armed()
    }

    async fn on_restart_deadline(&self) {
        if !self.is_live() || self.is_connected() {
            return;
        }
        warn!(
            "Peer {} not connected after {:?}; requesting ICE restart",
            self.ctx.peer_uid,
            self.ctx.watchdog.ice_restart_after()
        );
        self.connection.restart_ice();
        {
            let mut neg = self.negotiation.lock().await;
            advance(&mut neg.state, PeerTransition::IceRestart);
        }
        if self.ctx.role == PeerRole::Initiator
            && let Err(e) = self.publish_offer(true).await
        {
            warn!("ICE restart offer to {} failed: {e}", self.ctx.peer_uid);
        }
    }

    async fn on_renegotiate_deadline(&self) {
        if !self.is_live() || self.is_connected() {
            return;
        }
        warn!(
            "Peer {} still not connected after {:?}; renegotiating",
            self.ctx.peer_uid,
            self.ctx.watchdog.renegotiate_after()
        );
        self.renegotiated.store(true, Ordering::SeqCst);
        let result = match self.ctx.role {
            PeerRole::Initiator => self.publish_offer(false).await,
            PeerRole::Joiner => self.reanswer().await,
        };
        if let Err(e) = result {
            warn!("Renegotiation with {} failed: {e}", self.ctx.peer_uid);
        }
    }

    // Offer side

    /// Create an offer, apply it locally and publish it to the peer's slot.
    pub async fn publish_offer(&self, ice_restart: bool) -> Result<(), CallError> {
        let mut neg = self.negotiation.lock().await;
        if !self.is_live() {
            return Ok(());
        }
        let offer = self.connection.create_offer(ice_restart).await?;
        self.connection.set_local_description(offer.clone()).await?;
        if !self.is_live() {
            return Ok(());
        }
        let doc = SessionDoc::new(
            &self.ctx.call_id,
            &self.ctx.local_uid,
            &self.ctx.peer_uid,
            &offer,
        );
        let value = SignalingMessage::Offer(doc).to_document();
        let path = DocPath::offer(&self.ctx.call_id, &self.ctx.peer_uid);
        with_retry("publish offer", &self.ctx.retry, || {
            self.ctx.relay.set(&path, value.clone())
        })
        .await?;
        neg.state.apply_transition(PeerTransition::OfferSent)?;
        neg.awaiting_answer = true;
        neg.pending_offer = sdp::origin(&offer.sdp);
        info!(
            "Published {}offer to {}",
            if ice_restart { "ICE restart " } else { "" },
            self.ctx.peer_uid
        );
        Ok(())
    }

    /// Apply answers written to the peer's answer slot.
    pub async fn listen_for_answer(self: &Arc<Self>) -> Result<(), CallError> {
        let path = DocPath::answer(&self.ctx.call_id, &self.ctx.peer_uid);
        let subscription = self.ctx.relay.subscribe_doc(&path).await?;
        self.spawn_listener(subscription, |sup, change| async move {
            let Some(value) = change.value else { return };
            match SignalingMessage::from_document(&change.path, &value) {
                Ok(SignalingMessage::Answer(doc)) if doc.to_uid == sup.ctx.local_uid => {
                    if let Err(e) = sup.on_answer(doc).await {
                        warn!("Applying answer from {} failed: {e}", sup.ctx.peer_uid);
                    }
                }
                Ok(other) => debug!("Ignoring {other:?} in answer slot"),
                Err(e) => warn!("{e}"),
            }
        });
        Ok(())
    }

    async fn on_answer(&self, doc: SessionDoc) -> Result<(), CallError> {
        let mut neg = self.negotiation.lock().await;
        if !self.is_live() || neg.last_remote_sdp.as_deref() == Some(doc.sdp.as_str()) {
            return Ok(());
        }
        if !neg.awaiting_answer {
            debug!("Unsolicited answer from {}; ignoring", self.ctx.peer_uid);
            return Ok(());
        }
        if let (Some(reply), Some(pending)) = (&doc.in_reply_to, &neg.pending_offer)
            && reply != pending
        {
            debug!(
                "Answer from {} is for offer {reply}, not {pending}; ignoring",
                self.ctx.peer_uid
            );
            return Ok(());
        }
        self.connection
            .set_remote_description(doc.description())
            .await?;
        neg.last_remote_sdp = Some(doc.sdp);
        neg.awaiting_answer = false;
        if neg.state == PeerSessionState::AwaitingAnswer {
            neg.state.apply_transition(PeerTransition::AnswerApplied)?;
        }
        debug!("Answer from {} applied", self.ctx.peer_uid);
        self.flush_candidates(&mut neg).await;
        Ok(())
    }

    // Answer side

    /// Answer `offer`, or re-answer it after a renegotiation.
    pub async fn accept_offer(&self, offer: SessionDoc) -> Result<(), CallError> {
        let mut neg = self.negotiation.lock().await;
        if neg.last_remote_sdp.as_deref() == Some(offer.sdp.as_str()) {
            debug!("Offer from {} already answered", self.ctx.peer_uid);
            return Ok(());
        }
        if neg.state == PeerSessionState::New {
            neg.state.apply_transition(PeerTransition::AwaitOffer)?;
        }
        self.answer_locked(&mut neg, offer.description()).await
    }

    /// Produce a fresh answer to the offer currently in our slot.
    async fn reanswer(&self) -> Result<(), CallError> {
        let path = DocPath::offer(&self.ctx.call_id, &self.ctx.local_uid);
        let value = with_retry("read offer", &self.ctx.retry, || self.ctx.relay.get(&path)).await?;
        let offer = match value.map(|v| SignalingMessage::from_document(&path, &v)) {
            Some(Ok(SignalingMessage::Offer(doc))) => doc.description(),
            Some(Err(e)) => return Err(e),
            _ => match self.connection.remote_description() {
                Some(desc) => desc,
                None => return Ok(()),
            },
        };
        let mut neg = self.negotiation.lock().await;
        self.answer_locked(&mut neg, offer).await
    }

    async fn answer_locked(
        &self,
        neg: &mut Negotiation,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        if !self.is_live() {
            return Ok(());
        }
        self.connection.set_remote_description(offer.clone()).await?;
        let video = lock(&self.screen).clone().or_else(|| self.stream.video.clone());
        align_transceivers(
            self.connection.as_ref(),
            &offer.sdp,
            self.stream.audio.clone(),
            video,
        )
        .await?;

        let answer = self.connection.create_answer().await?;
        self.connection.set_local_description(answer.clone()).await?;
        if !self.is_live() {
            return Ok(());
        }
        let doc = SessionDoc::new(
            &self.ctx.call_id,
            &self.ctx.local_uid,
            &self.ctx.peer_uid,
            &answer,
        )
        .replying_to(&offer.sdp);
        let value = SignalingMessage::Answer(doc).to_document();
        let path = DocPath::answer(&self.ctx.call_id, &self.ctx.local_uid);
        with_retry("publish answer", &self.ctx.retry, || {
            self.ctx.relay.set(&path, value.clone())
        })
        .await?;
        neg.state.apply_transition(PeerTransition::AnswerSent)?;
        neg.last_remote_sdp = Some(offer.sdp);
        info!("Published answer to {}", self.ctx.peer_uid);
        self.flush_candidates(neg).await;
        Ok(())
    }

    /// Re-answer whenever the offer in our slot changes.
    pub async fn listen_for_offer_changes(self: &Arc<Self>) -> Result<(), CallError> {
        let path = DocPath::offer(&self.ctx.call_id, &self.ctx.local_uid);
        let subscription = self.ctx.relay.subscribe_doc(&path).await?;
        self.spawn_listener(subscription, |sup, change| async move {
            let Some(value) = change.value else { return };
            match SignalingMessage::from_document(&change.path, &value) {
                Ok(SignalingMessage::Offer(doc)) if doc.from_uid == sup.ctx.peer_uid => {
                    if let Err(e) = sup.accept_offer(doc).await {
                        warn!("Re-answering {} failed: {e}", sup.ctx.peer_uid);
                    }
                }
                Ok(other) => debug!("Ignoring {other:?} in offer slot"),
                Err(e) => warn!("{e}"),
            }
        });
        Ok(())
    }

    // Candidates

    /// Apply candidates the peer publishes for us.
    pub async fn listen_for_candidates(self: &Arc<Self>) -> Result<(), CallError> {
        let collection = Collection::Candidates(self.ctx.call_id.clone());
        let subscription = self.ctx.relay.subscribe_collection(&collection).await?;
        let expected = self.ctx.role.remote_origin();
        self.spawn_listener(subscription, move |sup, change| async move {
            let Some(value) = change.value else { return };
            match SignalingMessage::from_document(&change.path, &value) {
                Ok(SignalingMessage::Candidate(doc))
                    if doc.origin == expected
                        && doc.from_uid == sup.ctx.peer_uid
                        && doc.to_uid == sup.ctx.local_uid =>
                {
                    sup.on_remote_candidate(doc.candidate).await;
                }
                Ok(_) => {}
                Err(e) => warn!("{e}"),
            }
        });
        Ok(())
    }

    async fn on_remote_candidate(&self, candidate: IceCandidate) {
        let mut neg = self.negotiation.lock().await;
        match neg.remote_candidates.push(candidate) {
            Admission::Ready(candidate) => self.apply_remote_candidate(candidate).await,
            Admission::Buffered => debug!(
                "Buffered candidate from {} until remote description is set",
                self.ctx.peer_uid
            ),
            Admission::Duplicate => debug!("Dropped duplicate candidate from {}", self.ctx.peer_uid),
        }
    }

    async fn apply_remote_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.connection.add_ice_candidate(candidate).await {
            warn!("Candidate from {} rejected: {e}", self.ctx.peer_uid);
        }
    }

    async fn publish_candidate(&self, candidate: IceCandidate) {
        if !self.is_live() {
            return;
        }
        let doc = CandidateDoc {
            origin: self.ctx.role.local_origin(),
            from_uid: self.ctx.local_uid.clone(),
            to_uid: self.ctx.peer_uid.clone(),
            candidate,
            call_id: self.ctx.call_id.clone(),
        };
        let value = SignalingMessage::Candidate(doc).to_document();
        let collection = Collection::Candidates(self.ctx.call_id.clone());
        if let Err(e) = with_retry("publish candidate", &self.ctx.retry, || {
            self.ctx.relay.add(&collection, value.clone())
        })
        .await
        {
            warn!("Publishing candidate to {} failed: {e}", self.ctx.peer_uid);
        }
    }

    /// Release both queues once the remote description is in place. Runs under
    /// the negotiation lock so later candidates queue up behind the flush.
    async fn flush_candidates(&self, neg: &mut Negotiation) {
        let remote = neg.remote_candidates.flush();
        let local = neg.local_candidates.flush();
        if !remote.is_empty() || !local.is_empty() {
            debug!(
                "Flushing {} remote / {} local candidates for {}",
                remote.len(),
                local.len(),
                self.ctx.peer_uid
            );
        }
        for candidate in remote {
            self.apply_remote_candidate(candidate).await;
        }
        for candidate in local {
            self.publish_candidate(candidate).await;
        }
    }

    // Tracks

    fn video_transceiver(&self) -> Option<Arc<dyn Transceiver>> {
        self.connection
            .transceivers()
            .into_iter()
            .find(|t| t.kind() == MediaKind::Video)
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        if let Some(track) = &self.stream.audio {
            track.set_enabled(enabled);
        }
    }

    pub fn set_video_enabled(&self, enabled: bool) -> Result<(), CallError> {
        match &self.stream.video {
            Some(track) => {
                track.set_enabled(enabled);
                Ok(())
            }
            None => Err(CallError::NoOutgoingVideo(self.ctx.peer_uid.clone())),
        }
    }

    /// Send `track` on the video line in place of the camera.
    pub async fn start_screen_share(&self, track: Arc<dyn MediaTrack>) -> Result<(), CallError> {
        let transceiver = self
            .video_transceiver()
            .filter(|t| t.direction().sends())
            .ok_or_else(|| CallError::NoOutgoingVideo(self.ctx.peer_uid.clone()))?;
        transceiver.replace_track(Some(track.clone())).await?;
        *lock(&self.screen) = Some(track);
        info!("Sharing screen with {}", self.ctx.peer_uid);
        Ok(())
    }

    /// Put the camera track back on the video line.
    pub async fn stop_screen_share(&self) -> Result<(), CallError> {
        if lock(&self.screen).take().is_none() {
            return Ok(());
        }
        if let Some(transceiver) = self.video_transceiver() {
            transceiver.replace_track(self.stream.video.clone()).await?;
        }
        info!("Stopped sharing screen with {}", self.ctx.peer_uid);
        Ok(())
    }

    pub fn is_sharing_screen(&self) -> bool {
        lock(&self.screen).is_some()
    }

    pub async fn snapshot(&self) -> PeerSnapshot {
        let state = self.negotiation.lock().await.state;
        PeerSnapshot {
            peer_uid: self.ctx.peer_uid.clone(),
            role: self.ctx.role,
            state,
            connection: self.connection.connection_state(),
            audio_enabled: self.stream.audio.as_ref().is_some_and(|t| t.is_enabled()),
            video_enabled: self.stream.video.as_ref().is_some_and(|t| t.is_enabled()),
            sharing_screen: self.is_sharing_screen(),
        }
    }

    /// Tear the session down. Safe to call any number of times.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_watchdogs();
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            task.cancel().await;
        }
        self.connection.close().await;
        self.stream.stop_all();
        lock(&self.screen).take();

        let mut neg = self.negotiation.lock().await;
        advance(&mut neg.state, PeerTransition::Close);
        info!(
            "Peer session with {} closed (call {})",
            self.ctx.peer_uid, self.ctx.call_id
        );
    }
}

impl std::fmt::Debug for PeerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSupervisor")
            .field("call_id", &self.ctx.call_id)
            .field("peer_uid", &self.ctx.peer_uid)
            .field("role", &self.ctx.role)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Apply an event-driven transition, tolerating out-of-order events.
fn advance(state: &mut PeerSessionState, transition: PeerTransition) {
    if let Err(e) = state.apply_transition(transition) {
        debug!("{e}");
    }
}

impl Drop for PeerSupervisor {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            warn!(
                "Peer session with {} dropped without teardown",
                self.ctx.peer_uid
            );
            self.stream.stop_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CallConfig;
    use crate::env::CallEnv;
    use crate::loopback::{LoopbackDevices, LoopbackFactory, LoopbackNetwork};
    use crate::media::{MediaConstraints, MediaDevices};
    use crate::relay::MemoryRelay;
    use crate::rtc::{PeerConnectionFactory, TransceiverDirection};
    use crate::session::SessionCounter;
    use std::time::Duration;

    struct Side {
        sup: Arc<PeerSupervisor>,
        events: mpsc::UnboundedReceiver<SupervisorEvent>,
        devices: Arc<LoopbackDevices>,
    }

    async fn side(
        relay: &Arc<MemoryRelay>,
        network: &LoopbackNetwork,
        local: &str,
        peer: &str,
        role: PeerRole,
    ) -> Side {
        let devices = LoopbackDevices::new();
        let factory = LoopbackFactory::new(network.clone());
        let env = CallEnv::new(
            local,
            CallConfig::default(),
            relay.clone(),
            Arc::new(factory.clone()),
            devices.clone(),
        );
        let (tx, events) = mpsc::unbounded_channel();
        let ctx = env.peer_context(
            &CallId::new("C1"),
            peer,
            role,
            SessionCounter::new().advance(),
            tx,
        );
        let stream = devices
            .get_user_media(MediaConstraints::for_call(false))
            .await
            .unwrap();
        let connection = factory.create(&[]).await.unwrap();
        if role == PeerRole::Initiator {
            let audio = connection.add_transceiver(MediaKind::Audio, TransceiverDirection::SendRecv);
            connection.add_transceiver(MediaKind::Video, TransceiverDirection::RecvOnly);
            audio.replace_track(stream.audio.clone()).await.unwrap();
        }
        Side {
            sup: PeerSupervisor::new(ctx, connection, stream),
            events,
            devices,
        }
    }

    async fn wait_connected(side: &mut Side) {
        while let Some(event) = side.events.recv().await {
            if event.kind == SupervisorEventKind::Connected {
                return;
            }
        }
        panic!("event channel closed before connecting");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connecting_disarms_both_watchdogs() {
        let relay = Arc::new(MemoryRelay::new());
        let network = LoopbackNetwork::new();
        let mut alice = side(&relay, &network, "alice", "bob", PeerRole::Initiator).await;
        let mut bob = side(&relay, &network, "bob", "alice", PeerRole::Joiner).await;

        alice.sup.start();
        alice.sup.listen_for_answer().await.unwrap();
        alice.sup.listen_for_candidates().await.unwrap();
        alice.sup.publish_offer(false).await.unwrap();
        assert!(alice.sup.watchdogs_armed());

        let path = DocPath::offer(&CallId::new("C1"), "bob");
        let value = relay.get(&path).await.unwrap().unwrap();
        let SignalingMessage::Offer(offer) = SignalingMessage::from_document(&path, &value).unwrap()
        else {
            panic!("offer slot holds something else");
        };
        bob.sup.start();
        bob.sup.listen_for_candidates().await.unwrap();
        bob.sup.accept_offer(offer).await.unwrap();

        wait_connected(&mut alice).await;
        wait_connected(&mut bob).await;
        assert!(!alice.sup.watchdogs_armed());
        assert!(!bob.sup.watchdogs_armed());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(alice.sup.snapshot().await.state, PeerSessionState::Connected);
        assert_eq!(relay.write_count(&path), 1);

        alice.sup.close().await;
        bob.sup.close().await;
    }

    async fn read_session(relay: &MemoryRelay, path: &DocPath) -> SessionDoc {
        let value = relay.get(path).await.unwrap().unwrap();
        match SignalingMessage::from_document(path, &value).unwrap() {
            SignalingMessage::Offer(doc) | SignalingMessage::Answer(doc) => doc,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_to_a_replaced_offer_is_ignored() {
        let relay = Arc::new(MemoryRelay::new());
        let network = LoopbackNetwork::new();
        let alice = side(&relay, &network, "alice", "bob", PeerRole::Initiator).await;
        let bob = side(&relay, &network, "bob", "alice", PeerRole::Joiner).await;
        let offer_path = DocPath::offer(&CallId::new("C1"), "bob");
        let answer_path = DocPath::answer(&CallId::new("C1"), "bob");

        alice.sup.start();
        alice.sup.listen_for_answer().await.unwrap();
        alice.sup.publish_offer(false).await.unwrap();
        let first = read_session(&relay, &offer_path).await;
        alice.sup.publish_offer(true).await.unwrap();
        let second = read_session(&relay, &offer_path).await;
        assert_ne!(sdp::origin(&first.sdp), sdp::origin(&second.sdp));

        bob.sup.start();
        bob.sup.accept_offer(first.clone()).await.unwrap();
        let stale = read_session(&relay, &answer_path).await;
        assert_eq!(stale.in_reply_to, sdp::origin(&first.sdp));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(alice.sup.connection().remote_description().is_none());
        assert_eq!(alice.sup.snapshot().await.state, PeerSessionState::AwaitingAnswer);

        bob.sup.accept_offer(second.clone()).await.unwrap();
        let current = read_session(&relay, &answer_path).await;
        assert_eq!(current.in_reply_to, sdp::origin(&second.sdp));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            alice.sup.connection().remote_description().map(|d| d.sdp),
            Some(current.sdp)
        );

        alice.sup.close().await;
        bob.sup.close().await;
    }

    #[tokio::test]
    async fn test_close_twice_releases_everything_once() {
        let relay = Arc::new(MemoryRelay::new());
        let network = LoopbackNetwork::new();
        let alice = side(&relay, &network, "alice", "bob", PeerRole::Initiator).await;
        alice.sup.start();
        alice.sup.listen_for_answer().await.unwrap();
        alice.sup.listen_for_candidates().await.unwrap();
        assert!(relay.subscriber_count() > 0);

        alice.sup.close().await;
        alice.sup.close().await;
        assert!(alice.sup.is_closed());
        assert!(!alice.sup.watchdogs_armed());
        assert_eq!(alice.sup.connection().connection_state(), ConnectionState::Closed);
        assert_eq!(alice.devices.live_tracks(), 0);
        assert_eq!(relay.subscriber_count(), 0);
        assert_eq!(alice.sup.snapshot().await.state, PeerSessionState::Closed);
    }

    #[tokio::test]
    async fn test_track_toggles_without_camera() {
        let relay = Arc::new(MemoryRelay::new());
        let network = LoopbackNetwork::new();
        let alice = side(&relay, &network, "alice", "bob", PeerRole::Initiator).await;

        alice.sup.set_audio_enabled(false);
        assert!(!alice.sup.snapshot().await.audio_enabled);
        assert!(matches!(
            alice.sup.set_video_enabled(true),
            Err(CallError::NoOutgoingVideo(ref peer)) if peer == "bob"
        ));
        let screen = crate::media::LocalTrack::new("screen-1", MediaKind::Video);
        assert!(matches!(
            alice.sup.start_screen_share(screen).await,
            Err(CallError::NoOutgoingVideo(_))
        ));
        alice.sup.close().await;
    }
}
