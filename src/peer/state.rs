//! Per-peer negotiation state machine.

use std::fmt;

/// Lifecycle of one peer session.
///
/// ```text
/// New -> AwaitingAnswer | AwaitingOffer -> AnswerExchanged -> Connecting -> Connected
/// Connected -> Disconnected -> Restarting -> Connected
/// any -> Failed -> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PeerSessionState {
    #[default]
    New,
    /// Offer published, waiting for the remote answer.
    AwaitingAnswer,
    /// Joining, waiting for an offer addressed to us.
    AwaitingOffer,
    AnswerExchanged,
    Connecting,
    Connected,
    Disconnected,
    /// ICE restart requested after a stalled or dropped connection.
    Restarting,
    Failed,
    Closed,
}

impl PeerSessionState {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }

    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }

    /// States from which a fresh offer or answer may be exchanged.
    fn can_renegotiate(self) -> bool {
        matches!(
            self,
            Self::AwaitingAnswer
                | Self::AnswerExchanged
                | Self::Connecting
                | Self::Connected
                | Self::Disconnected
                | Self::Restarting
                | Self::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerTransition {
    OfferSent,
    AwaitOffer,
    AnswerApplied,
    AnswerSent,
    IceChecking,
    Connected,
    Disconnected,
    IceRestart,
    Failed,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

impl PeerSessionState {
    pub fn apply_transition(&mut self, transition: PeerTransition) -> Result<(), InvalidTransition> {
        use PeerSessionState as S;
        use PeerTransition as T;

        let new_state = match (*self, transition) {
            (S::Closed, _) => {
                return Err(self.invalid(transition));
            }
            (_, T::Close) => S::Closed,
            (_, T::Failed) => S::Failed,

            (S::New, T::OfferSent) => S::AwaitingAnswer,
            (current, T::OfferSent) if current.can_renegotiate() => S::AwaitingAnswer,
            (S::New, T::AwaitOffer) => S::AwaitingOffer,

            (S::AwaitingAnswer, T::AnswerApplied) => S::AnswerExchanged,
            (S::AwaitingOffer, T::AnswerSent) => S::AnswerExchanged,
            (current, T::AnswerSent) if current.can_renegotiate() => S::AnswerExchanged,

            (S::AnswerExchanged | S::Disconnected | S::Restarting, T::IceChecking) => S::Connecting,
            // An ICE restart offer can be in flight while the old path recovers.
            (
                S::AwaitingAnswer
                | S::AnswerExchanged
                | S::Connecting
                | S::Disconnected
                | S::Restarting,
                T::Connected,
            ) => S::Connected,
            (S::Connected | S::Connecting, T::Disconnected) => S::Disconnected,
            (
                S::AwaitingAnswer | S::AnswerExchanged | S::Connecting | S::Disconnected,
                T::IceRestart,
            ) => S::Restarting,

            _ => return Err(self.invalid(transition)),
        };
        *self = new_state;
        Ok(())
    }

    fn invalid(&self, transition: PeerTransition) -> InvalidTransition {
        InvalidTransition {
            current_state: format!("{self:?}"),
            attempted: format!("{transition:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// New → AwaitingAnswer → AnswerExchanged → Connecting → Connected
    #[test]
    fn test_initiator_flow() {
        let mut state = PeerSessionState::New;
        state.apply_transition(PeerTransition::OfferSent).unwrap();
        assert_eq!(state, PeerSessionState::AwaitingAnswer);
        state.apply_transition(PeerTransition::AnswerApplied).unwrap();
        state.apply_transition(PeerTransition::IceChecking).unwrap();
        state.apply_transition(PeerTransition::Connected).unwrap();
        assert!(state.is_connected());
    }

    #[test]
    fn test_joiner_flow_with_reanswer() {
        let mut state = PeerSessionState::New;
        state.apply_transition(PeerTransition::AwaitOffer).unwrap();
        state.apply_transition(PeerTransition::AnswerSent).unwrap();
        state.apply_transition(PeerTransition::Connected).unwrap();
        state.apply_transition(PeerTransition::AnswerSent).unwrap();
        assert_eq!(state, PeerSessionState::AnswerExchanged);
    }

    #[test]
    fn test_disconnect_restart_reconnect() {
        let mut state = PeerSessionState::Connected;
        state.apply_transition(PeerTransition::Disconnected).unwrap();
        state.apply_transition(PeerTransition::IceRestart).unwrap();
        assert_eq!(state, PeerSessionState::Restarting);
        state.apply_transition(PeerTransition::Connected).unwrap();
        assert!(state.is_connected());
    }

    #[test]
    fn test_closed_is_terminal() {
        let mut state = PeerSessionState::Failed;
        state.apply_transition(PeerTransition::Close).unwrap();
        assert!(state.is_closed());
        let err = state.apply_transition(PeerTransition::Close).unwrap_err();
        assert_eq!(err.current_state, "Closed");
        assert!(state.apply_transition(PeerTransition::OfferSent).is_err());
    }

    #[test]
    fn test_answer_requires_offer() {
        let mut state = PeerSessionState::New;
        assert!(state.apply_transition(PeerTransition::AnswerApplied).is_err());
        assert_eq!(state, PeerSessionState::New);
    }
}
