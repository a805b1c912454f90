//! In-process stand-ins for the peer connection stack and capture devices.
//!
//! Used by the demo binary and the tests. A [`LoopbackPeerConnection`] writes
//! plausible SDP, gathers two host candidates per ICE generation and reports
//! Connected once both descriptions are applied and a candidate for the
//! remote ICE generation has been added, unless the [`LoopbackNetwork`] is
//! blocked.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use log::{debug, trace};
use tokio::sync::{mpsc, oneshot};

use crate::config::IceServer;
use crate::error::{MediaError, RtcError};
use crate::media::{
    DisplayCapture, LocalStream, LocalTrack, MediaConstraints, MediaDevices, MediaTrack,
    MicrophoneCapture,
};
use crate::rtc::{
    ConnectionState, IceCandidate, MediaKind, PeerConnection, PeerConnectionFactory, PeerEvent,
    SdpType, SessionDescription, Transceiver, TransceiverDirection,
};
use crate::sdp;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn random_ufrag() -> String {
    hex::encode(rand::random::<[u8; 4]>())
}

/// Shared "network" all loopback connections live on.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    blocked: AtomicBool,
    connections: Mutex<Vec<Weak<LoopbackPeerConnection>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// While blocked, no connection can reach Connected.
    pub fn set_blocked(&self, blocked: bool) {
        self.inner.blocked.store(blocked, Ordering::SeqCst);
        if !blocked {
            let connections: Vec<_> = lock(&self.inner.connections)
                .iter()
                .filter_map(Weak::upgrade)
                .collect();
            for connection in connections {
                connection.try_connect();
            }
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.inner.blocked.load(Ordering::SeqCst)
    }

    fn register(&self, connection: &Arc<LoopbackPeerConnection>) {
        let mut connections = lock(&self.inner.connections);
        connections.retain(|c| c.strong_count() > 0);
        connections.push(Arc::downgrade(connection));
    }
}

#[derive(Debug)]
pub struct LoopbackTransceiver {
    kind: MediaKind,
    mid: String,
    direction: Mutex<TransceiverDirection>,
    track: Mutex<Option<Arc<dyn MediaTrack>>>,
    replacements: AtomicUsize,
}

impl LoopbackTransceiver {
    fn new(kind: MediaKind, mid: String, direction: TransceiverDirection) -> Arc<Self> {
        Arc::new(Self {
            kind,
            mid,
            direction: Mutex::new(direction),
            track: Mutex::new(None),
            replacements: AtomicUsize::new(0),
        })
    }

    /// Number of `replace_track` calls.
    pub fn replacements(&self) -> usize {
        self.replacements.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transceiver for LoopbackTransceiver {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn mid(&self) -> Option<String> {
        Some(self.mid.clone())
    }

    fn direction(&self) -> TransceiverDirection {
        *lock(&self.direction)
    }

    fn set_direction(&self, direction: TransceiverDirection) {
        *lock(&self.direction) = direction;
    }

    fn sender_track(&self) -> Option<Arc<dyn MediaTrack>> {
        lock(&self.track).clone()
    }

    async fn replace_track(&self, track: Option<Arc<dyn MediaTrack>>) -> Result<(), RtcError> {
        if let Some(track) = &track
            && track.kind() != self.kind
        {
            return Err(RtcError::Other(format!(
                "cannot send {} track on {} line",
                track.kind(),
                self.kind
            )));
        }
        *lock(&self.track) = track;
        self.replacements.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct PcState {
    transceivers: Vec<Arc<LoopbackTransceiver>>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    local_ufrag: String,
    gathered_ufrag: Option<String>,
    restart_pending: bool,
    answered_remote_ufrag: Option<String>,
    applied: Vec<IceCandidate>,
    connection: ConnectionState,
    tracks_announced: bool,
    version: u64,
    candidate_seq: u32,
}

pub struct LoopbackPeerConnection {
    id: u64,
    network: LoopbackNetwork,
    ice_servers: Vec<IceServer>,
    state: Mutex<PcState>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    offers_created: AtomicUsize,
    ice_restarts: AtomicUsize,
    closed: AtomicBool,
}

impl LoopbackPeerConnection {
    fn new(id: u64, network: LoopbackNetwork, ice_servers: Vec<IceServer>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            id,
            network: network.clone(),
            ice_servers,
            state: Mutex::new(PcState {
                transceivers: Vec::new(),
                local: None,
                remote: None,
                local_ufrag: random_ufrag(),
                gathered_ufrag: None,
                restart_pending: false,
                answered_remote_ufrag: None,
                applied: Vec::new(),
                connection: ConnectionState::New,
                tracks_announced: false,
                version: 0,
                candidate_seq: 0,
            }),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            offers_created: AtomicUsize::new(0),
            ice_restarts: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        network.register(&connection);
        connection
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    /// Offers created so far, including ICE restarts.
    pub fn offers_created(&self) -> usize {
        self.offers_created.load(Ordering::SeqCst)
    }

    /// Number of `restart_ice` requests.
    pub fn ice_restarts(&self) -> usize {
        self.ice_restarts.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Remote candidates applied, in order.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.state).applied.clone()
    }

    pub fn loopback_transceivers(&self) -> Vec<Arc<LoopbackTransceiver>> {
        lock(&self.state).transceivers.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.state).local.clone()
    }

    /// Drop a connected session back to Disconnected.
    pub fn simulate_disconnect(&self) {
        self.set_connection(ConnectionState::Disconnected);
    }

    pub fn simulate_failure(&self) {
        self.set_connection(ConnectionState::Failed);
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events_tx.send(event);
    }

    fn set_connection(&self, next: ConnectionState) {
        let mut state = lock(&self.state);
        if self.is_closed() || state.connection == next {
            return;
        }
        trace!("loopback pc {} {:?} -> {next:?}", self.id, state.connection);
        state.connection = next;
        drop(state);
        self.emit(PeerEvent::ConnectionStateChanged(next));
    }

    fn try_connect(&self) {
        let mut state = lock(&self.state);
        if self.is_closed() || state.local.is_none() {
            return;
        }
        let Some(remote) = &state.remote else { return };
        let remote_ufrag = sdp::ice_ufrag(&remote.sdp);
        let reachable = !self.network.is_blocked()
            && state
                .applied
                .iter()
                .any(|c| c.username_fragment.is_some() && c.username_fragment == remote_ufrag);

        let next = if reachable {
            ConnectionState::Connected
        } else if state.connection == ConnectionState::New {
            ConnectionState::Connecting
        } else {
            return;
        };
        if state.connection == next {
            return;
        }
        state.connection = next;
        let mut events = vec![PeerEvent::ConnectionStateChanged(next)];
        if next == ConnectionState::Connected && !state.tracks_announced {
            state.tracks_announced = true;
            for t in &state.transceivers {
                if t.direction().receives() {
                    events.push(PeerEvent::RemoteTrack {
                        kind: t.kind,
                        track_id: format!("remote-{}-{}", self.id, t.mid),
                    });
                }
            }
        }
        drop(state);
        for event in events {
            self.emit(event);
        }
    }

    fn render(&self, state: &mut PcState, sdp_type: SdpType) -> SessionDescription {
        state.version += 1;
        let mut sdp = format!(
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.id, state.version
        );
        let mids: Vec<&str> = state.transceivers.iter().map(|t| t.mid.as_str()).collect();
        sdp.push_str(&format!("a=group:BUNDLE {}\r\n", mids.join(" ")));

        // Answers follow the offer's line order.
        let order: Vec<Arc<LoopbackTransceiver>> = match (sdp_type, &state.remote) {
            (SdpType::Answer, Some(offer)) => sdp::media_sections(&offer.sdp)
                .iter()
                .filter_map(|s| {
                    state
                        .transceivers
                        .iter()
                        .find(|t| Some(&t.mid) == s.mid.as_ref())
                        .cloned()
                })
                .collect(),
            _ => state.transceivers.clone(),
        };
        for (index, t) in order.iter().enumerate() {
            let payload = match t.kind {
                MediaKind::Audio => 111,
                MediaKind::Video => 96,
            };
            sdp.push_str(&format!(
                "m={} 9 UDP/TLS/RTP/SAVPF {payload}\r\nc=IN IP4 0.0.0.0\r\na=mid:{}\r\na=ice-ufrag:{}\r\na={}\r\n",
                t.kind,
                t.mid,
                state.local_ufrag,
                t.direction().as_sdp_attr()
            ));
            trace!("loopback pc {} line {index}: {} {}", self.id, t.kind, t.mid);
        }
        match sdp_type {
            SdpType::Offer => SessionDescription::offer(sdp),
            SdpType::Answer => SessionDescription::answer(sdp),
        }
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeerConnection {
    fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
    ) -> Arc<dyn Transceiver> {
        let mut state = lock(&self.state);
        let mid = state.transceivers.len().to_string();
        let transceiver = LoopbackTransceiver::new(kind, mid, direction);
        state.transceivers.push(transceiver.clone());
        transceiver
    }

    fn transceivers(&self) -> Vec<Arc<dyn Transceiver>> {
        lock(&self.state)
            .transceivers
            .iter()
            .map(|t| t.clone() as Arc<dyn Transceiver>)
            .collect()
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, RtcError> {
        if self.is_closed() {
            return Err(RtcError::Closed);
        }
        let mut state = lock(&self.state);
        if ice_restart || state.restart_pending {
            state.restart_pending = false;
            state.local_ufrag = random_ufrag();
        }
        self.offers_created.fetch_add(1, Ordering::SeqCst);
        Ok(self.render(&mut state, SdpType::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        if self.is_closed() {
            return Err(RtcError::Closed);
        }
        let mut state = lock(&self.state);
        let Some(offer) = state.remote.as_ref().filter(|d| d.sdp_type == SdpType::Offer) else {
            return Err(RtcError::NoRemoteDescription);
        };
        // A new remote ICE generation gets a new local one.
        let remote_ufrag = sdp::ice_ufrag(&offer.sdp);
        if state.restart_pending
            || (state.answered_remote_ufrag.is_some() && state.answered_remote_ufrag != remote_ufrag)
        {
            state.restart_pending = false;
            state.local_ufrag = random_ufrag();
        }
        state.answered_remote_ufrag = remote_ufrag;
        Ok(self.render(&mut state, SdpType::Answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), RtcError> {
        if self.is_closed() {
            return Err(RtcError::Closed);
        }
        let ufrag = sdp::ice_ufrag(&desc.sdp)
            .ok_or_else(|| RtcError::InvalidDescription("missing ice-ufrag".into()))?;
        let mut state = lock(&self.state);
        state.local = Some(desc);
        let mut gathered = Vec::new();
        if state.gathered_ufrag.as_deref() != Some(ufrag.as_str()) {
            for port in [50000, 50001] {
                state.candidate_seq += 1;
                gathered.push(
                    IceCandidate::new(format!(
                        "candidate:{} 1 udp 2130706431 127.0.0.1 {port} typ host",
                        state.candidate_seq
                    ))
                    .with_sdp_mid("0")
                    .with_sdp_m_line_index(0)
                    .with_username_fragment(ufrag.clone()),
                );
            }
            state.gathered_ufrag = Some(ufrag);
        }
        drop(state);
        for candidate in gathered {
            self.emit(PeerEvent::LocalCandidate(candidate));
        }
        self.try_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), RtcError> {
        if self.is_closed() {
            return Err(RtcError::Closed);
        }
        let sections = sdp::media_sections(&desc.sdp);
        if sections.is_empty() {
            return Err(RtcError::InvalidDescription("no media sections".into()));
        }
        let mut state = lock(&self.state);
        if desc.sdp_type == SdpType::Offer {
            for section in &sections {
                let (Some(kind), Some(mid)) = (section.kind, section.mid.clone()) else {
                    continue;
                };
                if !state.transceivers.iter().any(|t| t.mid == mid) {
                    debug!("loopback pc {} adds {kind} line {mid} from offer", self.id);
                    state.transceivers.push(LoopbackTransceiver::new(
                        kind,
                        mid,
                        TransceiverDirection::RecvOnly,
                    ));
                }
            }
        }
        state.remote = Some(desc);
        drop(state);
        self.try_connect();
        Ok(())
    }

    fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.state).remote.clone()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        if self.is_closed() {
            return Err(RtcError::Closed);
        }
        if candidate.candidate.trim().is_empty() {
            return Err(RtcError::InvalidCandidate("empty candidate".into()));
        }
        {
            let mut state = lock(&self.state);
            if state.remote.is_none() {
                return Err(RtcError::NoRemoteDescription);
            }
            state.applied.push(candidate);
        }
        self.try_connect();
        Ok(())
    }

    fn restart_ice(&self) {
        self.ice_restarts.fetch_add(1, Ordering::SeqCst);
        lock(&self.state).restart_pending = true;
    }

    fn connection_state(&self) -> ConnectionState {
        lock(&self.state).connection
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        lock(&self.events_rx).take()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.state).connection = ConnectionState::Closed;
        debug!("loopback pc {} closed", self.id);
    }
}

/// Creates [`LoopbackPeerConnection`]s and remembers them for inspection.
#[derive(Clone, Default)]
pub struct LoopbackFactory {
    network: LoopbackNetwork,
    created: Arc<Mutex<Vec<Arc<LoopbackPeerConnection>>>>,
    next_id: Arc<AtomicU64>,
}

impl LoopbackFactory {
    pub fn new(network: LoopbackNetwork) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }

    pub fn connections(&self) -> Vec<Arc<LoopbackPeerConnection>> {
        lock(&self.created).clone()
    }

    pub fn last_connection(&self) -> Option<Arc<LoopbackPeerConnection>> {
        lock(&self.created).last().cloned()
    }
}

#[async_trait]
impl PeerConnectionFactory for LoopbackFactory {
    async fn create(&self, ice_servers: &[IceServer]) -> Result<Arc<dyn PeerConnection>, RtcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let connection = LoopbackPeerConnection::new(id, self.network.clone(), ice_servers.to_vec());
        lock(&self.created).push(connection.clone());
        Ok(connection)
    }
}

/// Capture devices backed by [`LocalTrack`]s.
#[derive(Default)]
pub struct LoopbackDevices {
    deny_microphone: AtomicBool,
    deny_camera: AtomicBool,
    deny_display: AtomicBool,
    next_track: AtomicU64,
    tracks: Mutex<Vec<Arc<LocalTrack>>>,
    microphone: Mutex<Option<mpsc::Sender<Vec<f32>>>>,
    display_ended: Mutex<Vec<oneshot::Sender<()>>>,
}

impl LoopbackDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_deny_microphone(&self, deny: bool) {
        self.deny_microphone.store(deny, Ordering::SeqCst);
    }

    pub fn set_deny_camera(&self, deny: bool) {
        self.deny_camera.store(deny, Ordering::SeqCst);
    }

    pub fn set_deny_display(&self, deny: bool) {
        self.deny_display.store(deny, Ordering::SeqCst);
    }

    /// Push one frame to the open microphone capture, if any.
    pub fn feed_microphone(&self, frame: Vec<f32>) -> bool {
        match lock(&self.microphone).as_ref() {
            Some(tx) => tx.try_send(frame).is_ok(),
            None => false,
        }
    }

    /// Simulate the user ending every active display capture.
    pub fn end_display_capture(&self) {
        for tx in lock(&self.display_ended).drain(..) {
            let _ = tx.send(());
        }
    }

    /// Every track handed out so far.
    pub fn tracks(&self) -> Vec<Arc<LocalTrack>> {
        lock(&self.tracks).clone()
    }

    /// Tracks handed out and not yet stopped.
    pub fn live_tracks(&self) -> usize {
        lock(&self.tracks).iter().filter(|t| !t.is_stopped()).count()
    }

    fn track(&self, label: &str, kind: MediaKind) -> Arc<LocalTrack> {
        let n = self.next_track.fetch_add(1, Ordering::Relaxed) + 1;
        let track = LocalTrack::new(format!("{label}-{n}"), kind);
        lock(&self.tracks).push(track.clone());
        track
    }
}

#[async_trait]
impl MediaDevices for LoopbackDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<LocalStream, MediaError> {
        if constraints.audio && self.deny_microphone.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("microphone"));
        }
        if constraints.video && self.deny_camera.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("camera"));
        }
        let audio = constraints
            .audio
            .then(|| self.track("mic", MediaKind::Audio) as Arc<dyn MediaTrack>);
        let video = constraints
            .video
            .then(|| self.track("cam", MediaKind::Video) as Arc<dyn MediaTrack>);
        Ok(LocalStream { audio, video })
    }

    async fn get_display_media(&self) -> Result<DisplayCapture, MediaError> {
        if self.deny_display.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("screen"));
        }
        let (tx, ended) = oneshot::channel();
        lock(&self.display_ended).push(tx);
        Ok(DisplayCapture {
            track: self.track("screen", MediaKind::Video),
            ended,
        })
    }

    async fn open_microphone(&self) -> Result<MicrophoneCapture, MediaError> {
        if self.deny_microphone.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("microphone"));
        }
        let (tx, frames) = mpsc::channel(64);
        *lock(&self.microphone) = Some(tx);
        Ok(MicrophoneCapture {
            track: self.track("vad-mic", MediaKind::Audio),
            frames,
        })
    }
}
