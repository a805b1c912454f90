//! Negotiation messages exchanged through the relay.
//!
//! Every document read from the relay is turned into a [`SignalingMessage`]
//! by [`SignalingMessage::from_document`], which rejects anything that does
//! not match the slot it was read from.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CallError;
use crate::relay::DocPath;
use crate::rtc::{IceCandidate, SdpType, SessionDescription};
use crate::sdp;
use crate::types::{CallId, Uid};

/// Offer or answer, stored in the recipient-keyed slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDoc {
    pub from_uid: Uid,
    pub to_uid: Uid,
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub call_id: CallId,
    /// On answers, the [`sdp::origin`] of the offer being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
}

impl SessionDoc {
    pub fn new(call_id: &CallId, from_uid: &str, to_uid: &str, desc: &SessionDescription) -> Self {
        Self {
            from_uid: from_uid.to_string(),
            to_uid: to_uid.to_string(),
            sdp: desc.sdp.clone(),
            sdp_type: desc.sdp_type,
            call_id: call_id.clone(),
            in_reply_to: None,
        }
    }

    /// Mark this answer as the reply to the offer `offer_sdp`.
    pub fn replying_to(mut self, offer_sdp: &str) -> Self {
        self.in_reply_to = sdp::origin(offer_sdp);
        self
    }

    pub fn description(&self) -> SessionDescription {
        SessionDescription {
            sdp_type: self.sdp_type,
            sdp: self.sdp.clone(),
        }
    }
}

/// Which side of the negotiation produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateOrigin {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateDoc {
    pub origin: CandidateOrigin,
    pub from_uid: Uid,
    pub to_uid: Uid,
    pub candidate: IceCandidate,
    pub call_id: CallId,
}

/// A validated signaling document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    Offer(SessionDoc),
    Answer(SessionDoc),
    Candidate(CandidateDoc),
}

impl SignalingMessage {
    /// Parse and validate a relay document against the slot it came from.
    pub fn from_document(path: &DocPath, value: &Value) -> Result<Self, CallError> {
        match path {
            DocPath::Offer { call_id, peer } => {
                let doc = parse_session(path, value, SdpType::Offer, call_id)?;
                if &doc.to_uid != peer {
                    return Err(CallError::invalid_document(
                        path,
                        format!("offer addressed to {} stored in slot {peer}", doc.to_uid),
                    ));
                }
                Ok(Self::Offer(doc))
            }
            DocPath::Answer { call_id, peer } => {
                let doc = parse_session(path, value, SdpType::Answer, call_id)?;
                if &doc.from_uid != peer {
                    return Err(CallError::invalid_document(
                        path,
                        format!("answer from {} stored in slot {peer}", doc.from_uid),
                    ));
                }
                Ok(Self::Answer(doc))
            }
            DocPath::Candidate { call_id, .. } => {
                let doc: CandidateDoc = serde_json::from_value(value.clone())
                    .map_err(|e| CallError::invalid_document(path, e.to_string()))?;
                if &doc.call_id != call_id {
                    return Err(CallError::invalid_document(path, "call id mismatch"));
                }
                if doc.candidate.candidate.trim().is_empty() {
                    return Err(CallError::invalid_document(path, "empty candidate"));
                }
                if doc.from_uid == doc.to_uid {
                    return Err(CallError::invalid_document(path, "candidate sent to self"));
                }
                Ok(Self::Candidate(doc))
            }
            DocPath::Room(_) | DocPath::Presence { .. } => Err(CallError::invalid_document(
                path,
                "not a signaling slot",
            )),
        }
    }

    pub fn to_document(&self) -> Value {
        let value = match self {
            Self::Offer(doc) | Self::Answer(doc) => serde_json::to_value(doc),
            Self::Candidate(doc) => serde_json::to_value(doc),
        };
        // Plain structs of strings and enums always serialize.
        value.unwrap_or(Value::Null)
    }
}

fn parse_session(
    path: &DocPath,
    value: &Value,
    expected: SdpType,
    call_id: &CallId,
) -> Result<SessionDoc, CallError> {
    let doc: SessionDoc = serde_json::from_value(value.clone())
        .map_err(|e| CallError::invalid_document(path, e.to_string()))?;
    if doc.sdp_type != expected {
        return Err(CallError::invalid_document(
            path,
            format!("expected {expected:?}, found {:?}", doc.sdp_type),
        ));
    }
    if &doc.call_id != call_id {
        return Err(CallError::invalid_document(path, "call id mismatch"));
    }
    if doc.sdp.trim().is_empty() {
        return Err(CallError::invalid_document(path, "empty sdp"));
    }
    if doc.from_uid == doc.to_uid {
        return Err(CallError::invalid_document(path, "description sent to self"));
    }
    Ok(doc)
}

/// Marker posted into the chat stream so the message layer can render a join
/// affordance. The rendering format belongs to that layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInvite {
    pub kind: String,
    pub call_id: CallId,
    pub video: bool,
}

impl CallInvite {
    pub const KIND: &'static str = "call_invite";

    pub fn new(call_id: CallId, video: bool) -> Self {
        Self {
            kind: Self::KIND.to_string(),
            call_id,
            video,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call() -> CallId {
        CallId::new("C1")
    }

    #[test]
    fn test_offer_document_is_validated_against_slot() {
        let doc = SessionDoc::new(&call(), "alice", "bob", &SessionDescription::offer("v=0"));
        let msg = SignalingMessage::Offer(doc.clone());
        let value = msg.to_document();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["fromUid"], "alice");

        let parsed =
            SignalingMessage::from_document(&DocPath::offer(&call(), "bob"), &value).unwrap();
        assert_eq!(parsed, msg);

        let err = SignalingMessage::from_document(&DocPath::offer(&call(), "carol"), &value);
        assert!(matches!(err, Err(CallError::InvalidDocument { .. })));
    }

    #[test]
    fn test_answer_names_the_offer_it_answers() {
        let offer = "v=0\r\no=- 42 3 IN IP4 127.0.0.1\r\n";
        let doc = SessionDoc::new(&call(), "bob", "alice", &SessionDescription::answer("v=0"))
            .replying_to(offer);
        let value = SignalingMessage::Answer(doc).to_document();
        assert_eq!(value["inReplyTo"], "42 3");

        let parsed =
            SignalingMessage::from_document(&DocPath::answer(&call(), "bob"), &value).unwrap();
        let SignalingMessage::Answer(parsed) = parsed else {
            panic!("expected an answer");
        };
        assert_eq!(parsed.in_reply_to.as_deref(), Some("42 3"));

        // Offers carry no reply marker at all.
        let offer_doc = SessionDoc::new(&call(), "alice", "bob", &SessionDescription::offer("v=0"));
        let value = SignalingMessage::Offer(offer_doc).to_document();
        assert!(value.get("inReplyTo").is_none());
    }

    #[test]
    fn test_answer_in_offer_slot_is_rejected() {
        let doc = SessionDoc::new(&call(), "bob", "alice", &SessionDescription::answer("v=0"));
        let value = SignalingMessage::Answer(doc).to_document();
        assert!(SignalingMessage::from_document(&DocPath::offer(&call(), "alice"), &value).is_err());
        assert!(SignalingMessage::from_document(&DocPath::answer(&call(), "bob"), &value).is_ok());
    }

    #[test]
    fn test_malformed_documents_are_rejected_early() {
        let path = DocPath::offer(&call(), "bob");
        for value in [
            json!({}),
            json!({"fromUid": "a", "toUid": "bob", "sdp": "", "type": "offer", "callId": "C1"}),
            json!({"fromUid": "a", "toUid": "bob", "sdp": "v=0", "type": "offer", "callId": "C9"}),
            json!({"fromUid": "bob", "toUid": "bob", "sdp": "v=0", "type": "offer", "callId": "C1"}),
            json!("garbage"),
        ] {
            assert!(SignalingMessage::from_document(&path, &value).is_err(), "{value}");
        }
    }

    #[test]
    fn test_candidate_document_round_trip() {
        let doc = CandidateDoc {
            origin: CandidateOrigin::Answer,
            from_uid: "bob".into(),
            to_uid: "alice".into(),
            candidate: IceCandidate::new("candidate:1 1 udp 1 10.0.0.2 9 typ host"),
            call_id: call(),
        };
        let value = SignalingMessage::Candidate(doc.clone()).to_document();
        assert_eq!(value["origin"], "answer");
        let path = crate::relay::Collection::Candidates(call()).doc("000000000001");
        assert_eq!(
            SignalingMessage::from_document(&path, &value).unwrap(),
            SignalingMessage::Candidate(doc)
        );
    }

    #[test]
    fn test_invite_marker_shape() {
        let invite = CallInvite::new(call(), true);
        let value = serde_json::to_value(&invite).unwrap();
        assert_eq!(value, json!({"kind": "call_invite", "callId": "C1", "video": true}));
    }
}
