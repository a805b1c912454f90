use std::collections::{HashSet, VecDeque};

use crate::rtc::IceCandidate;

/// What [`CandidateQueue::push`] did with a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The queue has already been flushed; handle the candidate now.
    Ready(IceCandidate),
    Buffered,
    /// Already seen; drop it.
    Duplicate,
}

/// Holds candidates until the remote description is applied, then releases
/// them exactly once in arrival order.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
    seen: Option<HashSet<String>>,
    flushed: bool,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// A queue that drops candidates whose serialized form was already seen.
    pub fn deduplicating() -> Self {
        Self {
            seen: Some(HashSet::new()),
            ..Self::default()
        }
    }

    pub fn push(&mut self, candidate: IceCandidate) -> Admission {
        if let Some(seen) = &mut self.seen
            && !seen.insert(candidate.dedup_key())
        {
            return Admission::Duplicate;
        }
        if self.flushed {
            Admission::Ready(candidate)
        } else {
            self.pending.push_back(candidate);
            Admission::Buffered
        }
    }

    /// Drain the buffer. Only the first call returns anything; later
    /// candidates come back from [`push`](Self::push) as ready.
    pub fn flush(&mut self) -> Vec<IceCandidate> {
        if self.flushed {
            return Vec::new();
        }
        self.flushed = true;
        self.pending.drain(..).collect()
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
