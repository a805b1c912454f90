use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::CallConfig;
use crate::media::MediaDevices;
use crate::peer::{PeerContext, PeerRole, SupervisorEvent};
use crate::relay::SignalingRelay;
use crate::rtc::PeerConnectionFactory;
use crate::session::SessionToken;
use crate::types::{CallId, Uid};

/// Collaborators shared by the initiator, the joiner and the controller of one
/// local participant.
#[derive(Clone)]
pub struct CallEnv {
    pub local_uid: Uid,
    pub config: Arc<CallConfig>,
    pub relay: Arc<dyn SignalingRelay>,
    pub rtc: Arc<dyn PeerConnectionFactory>,
    pub devices: Arc<dyn MediaDevices>,
}

impl CallEnv {
    pub fn new(
        local_uid: impl Into<Uid>,
        config: CallConfig,
        relay: Arc<dyn SignalingRelay>,
        rtc: Arc<dyn PeerConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
    ) -> Self {
        Self {
            local_uid: local_uid.into(),
            config: Arc::new(config),
            relay,
            rtc,
            devices,
        }
    }

    pub(crate) fn peer_context(
        &self,
        call_id: &CallId,
        peer_uid: &str,
        role: PeerRole,
        token: SessionToken,
        events: mpsc::UnboundedSender<SupervisorEvent>,
    ) -> PeerContext {
        PeerContext {
            call_id: call_id.clone(),
            local_uid: self.local_uid.clone(),
            peer_uid: peer_uid.to_string(),
            role,
            relay: self.relay.clone(),
            retry: self.config.relay_retry.clone(),
            watchdog: self.config.watchdog.clone(),
            token,
            events,
        }
    }
}
