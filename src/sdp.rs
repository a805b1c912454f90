//! Just enough SDP reading to line transceivers up with an offer.

use crate::rtc::{MediaKind, TransceiverDirection};

/// One `m=` section of a session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSection {
    /// `None` for media types other than audio and video (e.g. `application`).
    pub kind: Option<MediaKind>,
    pub mid: Option<String>,
    /// Falls back to the session-level direction, then to `sendrecv`.
    pub direction: TransceiverDirection,
    pub ice_ufrag: Option<String>,
}

/// Media sections in the order they appear.
pub fn media_sections(sdp: &str) -> Vec<MediaSection> {
    let mut sections = Vec::new();
    let mut session_direction = None;
    let mut session_ufrag = None;
    let mut current: Option<MediaSection> = None;

    for line in sdp.lines().map(str::trim) {
        if let Some(media) = line.strip_prefix("m=") {
            if let Some(section) = current.take() {
                sections.push(section);
            }
            let kind = match media.split_whitespace().next() {
                Some("audio") => Some(MediaKind::Audio),
                Some("video") => Some(MediaKind::Video),
                _ => None,
            };
            current = Some(MediaSection {
                kind,
                mid: None,
                direction: session_direction.unwrap_or(TransceiverDirection::SendRecv),
                ice_ufrag: None,
            });
            continue;
        }

        let Some(attr) = line.strip_prefix("a=") else {
            continue;
        };
        let (name, value) = match attr.split_once(':') {
            Some((name, value)) => (name, Some(value)),
            None => (attr, None),
        };

        match &mut current {
            Some(section) => {
                if let Some(direction) = TransceiverDirection::from_sdp_attr(name) {
                    section.direction = direction;
                } else if name == "mid" {
                    section.mid = value.map(str::to_string);
                } else if name == "ice-ufrag" {
                    section.ice_ufrag = value.map(str::to_string);
                }
            }
            None => {
                if let Some(direction) = TransceiverDirection::from_sdp_attr(name) {
                    session_direction = Some(direction);
                } else if name == "ice-ufrag" {
                    session_ufrag = value.map(str::to_string);
                }
            }
        }
    }
    if let Some(section) = current.take() {
        sections.push(section);
    }

    if session_ufrag.is_some() {
        for section in &mut sections {
            if section.ice_ufrag.is_none() {
                section.ice_ufrag.clone_from(&session_ufrag);
            }
        }
    }
    sections
}

/// The ICE username fragment of the first media section, or the session one.
pub fn ice_ufrag(sdp: &str) -> Option<String> {
    media_sections(sdp)
        .into_iter()
        .find_map(|section| section.ice_ufrag)
        .or_else(|| {
            sdp.lines()
                .map(str::trim)
                .find_map(|line| line.strip_prefix("a=ice-ufrag:").map(str::to_string))
        })
}

/// Session id and version from the `o=` line. Every new offer bumps one of
/// them, so the pair names a single offer.
pub fn origin(sdp: &str) -> Option<String> {
    let line = sdp
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("o="))?;
    let mut fields = line.split_whitespace().skip(1);
    let session_id = fields.next()?;
    let version = fields.next()?;
    Some(format!("{session_id} {version}"))
}

/// Media kinds in line order, ignoring non audio/video sections.
pub fn line_order(sdp: &str) -> Vec<MediaKind> {
    media_sections(sdp)
        .into_iter()
        .filter_map(|section| section.kind)
        .collect()
}
