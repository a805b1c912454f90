//! Per-peer media sessions.
//!
//! # Architecture
//!
//! - [`PeerSupervisor`]: owns one negotiated connection to one remote
//!   participant, its local tracks, candidate queues and watchdog timers
//! - [`CandidateQueue`]: ordered, flush-once buffering of ICE candidates
//! - [`PeerSessionState`]: the negotiation state machine
//! - [`TaskHandle`]: a spawned task that is aborted when its handle drops
//!
//! Sessions are never reused. A replacement for the same peer is only built
//! after [`PeerSupervisor::close`] has returned for the previous one.

pub mod candidates;
pub mod state;
mod supervisor;

use std::future::Future;

use tokio::task::JoinHandle;

pub use candidates::{Admission, CandidateQueue};
pub use state::{InvalidTransition, PeerSessionState, PeerTransition};
pub use supervisor::{
    PeerContext, PeerRole, PeerSnapshot, PeerSupervisor, SupervisorEvent, SupervisorEventKind,
};

/// A spawned task tied to its owner. Dropping the handle aborts the task.
#[derive(Debug)]
pub struct TaskHandle(Option<JoinHandle<()>>);

impl TaskHandle {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self(Some(tokio::spawn(future)))
    }

    pub fn is_finished(&self) -> bool {
        self.0.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Abort the task and wait until it has been dropped.
    ///
    /// Must not be called from inside the task itself.
    pub async fn cancel(mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if let Some(handle) = &self.0 {
            handle.abort();
        }
    }
}
