mod common;

use common::{ROOM, World, eventually};
use roomcall::error::CallError;
use roomcall::media::MediaTrack;
use roomcall::presence::PresenceState;
use roomcall::relay::{Collection, DocPath, SignalingRelay};
use roomcall::rtc::{MediaKind, PeerConnection, Transceiver, TransceiverDirection};
use roomcall::sdp;
use roomcall::signaling::CallInvite;
use roomcall::{CallAttempt, CallEvent, EndReason, RoomStatus};

#[tokio::test(start_paused = true)]
async fn test_audio_call_connects_and_ends_for_both() {
    let world = World::new();
    let mut alice = world.participant("alice");
    let mut bob = world.participant("bob");
    alice.enter(&["alice", "bob"]).await;
    bob.enter(&["alice", "bob"]).await;

    let CallAttempt::Started(call_id) = alice.controller.start_call(false).await.unwrap() else {
        panic!("alice should have claimed the idle room");
    };
    let invite = alice
        .wait_for(|e| matches!(e, CallEvent::InviteReady(_)))
        .await;
    assert_eq!(
        invite,
        CallEvent::InviteReady(CallInvite::new(call_id.clone(), false))
    );

    let incoming = bob
        .wait_for(|e| matches!(e, CallEvent::IncomingCall { .. }))
        .await;
    let CallEvent::IncomingCall {
        call_id: incoming_id,
        started_by,
        ..
    } = incoming
    else {
        unreachable!()
    };
    assert_eq!(incoming_id, call_id);
    assert_eq!(started_by.as_deref(), Some("alice"));

    assert_eq!(
        bob.controller.join_call(&call_id, false).await.unwrap(),
        CallAttempt::Joined(call_id.clone())
    );
    alice.wait_connected().await;
    bob.wait_connected().await;

    let room = alice.controller.rooms().current(ROOM).await.unwrap();
    assert_eq!(room.status, RoomStatus::Active);
    assert_eq!(room.active_call_id.as_ref(), Some(&call_id));
    assert_eq!(alice.controller.status().await, PresenceState::Connected);
    let presence = alice.controller.presence().list(ROOM).await.unwrap();
    assert_eq!(presence.len(), 2);
    assert!(presence.iter().all(|r| r.state == PresenceState::Connected));

    alice.controller.end_call().await.unwrap();
    let ended = bob
        .wait_for(|e| matches!(e, CallEvent::CallEnded { .. }))
        .await;
    assert_eq!(
        ended,
        CallEvent::CallEnded {
            call_id: call_id.clone(),
            reason: EndReason::RemoteEnded,
        }
    );

    assert!(alice.controller.rooms().current(ROOM).await.unwrap().is_idle());
    assert_eq!(bob.controller.status().await, PresenceState::Idle);
    assert!(alice.connection().is_closed());
    assert!(bob.connection().is_closed());
    assert_eq!(alice.devices.live_tracks(), 0);
    assert_eq!(bob.devices.live_tracks(), 0);
    let presence = bob.controller.presence().list(ROOM).await.unwrap();
    assert!(presence.iter().all(|r| r.state == PresenceState::Idle));
}

#[tokio::test(start_paused = true)]
async fn test_simultaneous_start_yields_one_call() {
    let world = World::new();
    let mut alice = world.participant("alice");
    let mut bob = world.participant("bob");
    alice.enter(&["alice", "bob"]).await;
    bob.enter(&["alice", "bob"]).await;

    let (a, b) = tokio::join!(
        alice.controller.start_call(false),
        bob.controller.start_call(false)
    );
    let call_id = match (a.unwrap(), b.unwrap()) {
        (CallAttempt::Started(started), CallAttempt::Joined(joined))
        | (CallAttempt::Joined(joined), CallAttempt::Started(started)) => {
            assert_eq!(started, joined);
            started
        }
        other => panic!("expected one start and one join, got {other:?}"),
    };

    let room = alice.controller.rooms().current(ROOM).await.unwrap();
    assert_eq!(room.active_call_id.as_ref(), Some(&call_id));
    alice.wait_connected().await;
    bob.wait_connected().await;

    let offers = world
        .relay
        .list(&Collection::Offers(call_id.clone()))
        .await
        .unwrap();
    assert_eq!(offers.len(), 1, "only the winner offers");
}

#[tokio::test(start_paused = true)]
async fn test_audio_only_call_keeps_video_unsent_on_both_sides() {
    let world = World::new();
    let mut alice = world.participant("alice");
    let mut bob = world.participant("bob");
    alice.enter(&["alice", "bob"]).await;
    bob.enter(&["alice", "bob"]).await;

    let CallAttempt::Started(call_id) = alice.controller.start_call(false).await.unwrap() else {
        panic!("expected a fresh call");
    };
    // Bob has a camera, but the call is audio-only.
    bob.controller.join_call(&call_id, true).await.unwrap();
    bob.wait_connected().await;

    let offer = world.read_session(&DocPath::offer(&call_id, "bob")).await;
    assert_eq!(sdp::line_order(&offer.sdp), vec![MediaKind::Audio, MediaKind::Video]);
    let offered = sdp::media_sections(&offer.sdp);
    assert_eq!(offered[0].direction, TransceiverDirection::SendRecv);
    assert_eq!(offered[1].direction, TransceiverDirection::RecvOnly);

    let answer = world.read_session(&DocPath::answer(&call_id, "bob")).await;
    let answered = sdp::media_sections(&answer.sdp);
    assert_eq!(sdp::line_order(&answer.sdp), vec![MediaKind::Audio, MediaKind::Video]);
    assert!(!answered[1].direction.sends());

    let video = bob
        .connection()
        .transceivers()
        .into_iter()
        .find(|t| t.kind() == MediaKind::Video)
        .unwrap();
    assert!(!video.direction().sends());
    assert!(video.sender_track().is_none());
    assert!(matches!(
        bob.controller.start_screen_share().await,
        Err(CallError::NoOutgoingVideo(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_screen_share_swaps_track_without_renegotiating() {
    let world = World::new();
    let mut alice = world.participant("alice");
    let mut bob = world.participant("bob");
    alice.enter(&["alice", "bob"]).await;
    bob.enter(&["alice", "bob"]).await;

    let CallAttempt::Started(call_id) = alice.controller.start_call(true).await.unwrap() else {
        panic!("expected a fresh call");
    };
    bob.controller.join_call(&call_id, true).await.unwrap();
    alice.wait_connected().await;

    let offer_path = DocPath::offer(&call_id, "bob");
    assert_eq!(world.relay.write_count(&offer_path), 1);
    let pc = alice.connection();
    let video = pc
        .loopback_transceivers()
        .into_iter()
        .find(|t| t.kind() == MediaKind::Video)
        .unwrap();
    assert!(video.sender_track().unwrap().id().starts_with("cam-"));

    alice.controller.start_screen_share().await.unwrap();
    assert!(video.sender_track().unwrap().id().starts_with("screen-"));
    let snapshot = alice.controller.session_snapshot().await.unwrap();
    assert!(snapshot.sharing_screen);
    assert!(snapshot.peers[0].sharing_screen);

    // The user stops sharing from the system UI.
    alice.devices.end_display_capture();
    alice
        .wait_for(|e| matches!(e, CallEvent::ScreenShareStopped { .. }))
        .await;
    assert!(video.sender_track().unwrap().id().starts_with("cam-"));
    assert!(!alice.controller.session_snapshot().await.unwrap().sharing_screen);

    assert_eq!(world.relay.write_count(&offer_path), 1);
    assert_eq!(pc.offers_created(), 1);
    let screen = alice
        .devices
        .tracks()
        .into_iter()
        .find(|t| t.id().starts_with("screen-"))
        .unwrap();
    assert!(screen.is_stopped());
}

#[tokio::test(start_paused = true)]
async fn test_denied_microphone_leaves_nothing_behind() {
    let world = World::new();
    let mut alice = world.participant("alice");
    let bob = world.participant("bob");
    alice.enter(&["alice", "bob"]).await;
    bob.enter(&["alice", "bob"]).await;
    alice.devices.set_deny_microphone(true);

    let err = alice.controller.start_call(false).await.unwrap_err();
    assert!(matches!(err, CallError::PermissionDenied(ref d) if d == "microphone"));
    let status = alice
        .wait_for(|e| matches!(e, CallEvent::Status(_)))
        .await;
    assert_eq!(status, CallEvent::Status("permission denied: microphone".into()));

    assert!(alice.controller.rooms().current(ROOM).await.unwrap().is_idle());
    assert!(alice.factory.connections().is_empty());
    assert_eq!(alice.devices.live_tracks(), 0);
    assert_eq!(alice.controller.status().await, PresenceState::Idle);
    assert!(alice.controller.session_snapshot().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_mute_and_camera_toggle_touch_tracks_only() {
    let world = World::new();
    let mut alice = world.participant("alice");
    let bob = world.participant("bob");
    alice.enter(&["alice", "bob"]).await;
    bob.enter(&["alice", "bob"]).await;

    let CallAttempt::Started(call_id) = alice.controller.start_call(true).await.unwrap() else {
        panic!("expected a fresh call");
    };
    bob.controller.join_call(&call_id, false).await.unwrap();
    alice.wait_connected().await;

    alice.controller.set_audio_muted(true).await.unwrap();
    alice.controller.set_video_enabled(false).await.unwrap();
    let peer = &alice.controller.session_snapshot().await.unwrap().peers[0];
    assert!(!peer.audio_enabled);
    assert!(!peer.video_enabled);
    assert_eq!(alice.devices.live_tracks(), 2);
    assert_eq!(world.relay.write_count(&DocPath::offer(&call_id, "bob")), 1);

    // Bob joined without a camera.
    assert!(matches!(
        bob.controller.set_video_enabled(true).await,
        Err(CallError::NoOutgoingVideo(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_leaving_the_room_ends_the_call() {
    let world = World::new();
    let mut alice = world.participant("alice");
    let mut bob = world.participant("bob");
    alice.enter(&["alice", "bob"]).await;
    bob.enter(&["alice", "bob"]).await;

    let CallAttempt::Started(call_id) = alice.controller.start_call(false).await.unwrap() else {
        panic!("expected a fresh call");
    };
    bob.controller.join_call(&call_id, false).await.unwrap();
    bob.wait_connected().await;

    bob.controller.leave_room().await;
    let ended = bob
        .wait_for(|e| matches!(e, CallEvent::CallEnded { .. }))
        .await;
    assert_eq!(
        ended,
        CallEvent::CallEnded {
            call_id: call_id.clone(),
            reason: EndReason::LeftRoom,
        }
    );
    let ended = alice
        .wait_for(|e| matches!(e, CallEvent::CallEnded { .. }))
        .await;
    assert_eq!(
        ended,
        CallEvent::CallEnded {
            call_id,
            reason: EndReason::RemoteEnded,
        }
    );
    assert!(bob.controller.room_status().await.is_none());
    assert!(alice.controller.rooms().current(ROOM).await.unwrap().is_idle());
    assert_eq!(alice.controller.status().await, PresenceState::Idle);
    eventually("alice closed her connection", || alice.connection().is_closed()).await;
}

#[tokio::test(start_paused = true)]
async fn test_ended_call_cannot_be_joined() {
    let world = World::new();
    let mut alice = world.participant("alice");
    let bob = world.participant("bob");
    alice.enter(&["alice", "bob"]).await;
    bob.enter(&["alice", "bob"]).await;

    let CallAttempt::Started(call_id) = alice.controller.start_call(false).await.unwrap() else {
        panic!("expected a fresh call");
    };
    alice.controller.end_call().await.unwrap();
    alice
        .wait_for(|e| matches!(e, CallEvent::CallEnded { .. }))
        .await;
    assert!(alice.controller.rooms().current(ROOM).await.unwrap().is_idle());

    // The offer to bob is still stored, but the room moved on.
    assert_eq!(
        bob.controller.join_call(&call_id, false).await.unwrap(),
        CallAttempt::NotRunning(call_id.clone())
    );
    assert!(bob.factory.connections().is_empty());
    assert_eq!(bob.devices.live_tracks(), 0);
    assert_eq!(bob.controller.status().await, PresenceState::Idle);
    assert!(bob.controller.session_snapshot().await.is_none());
    let presence = bob.controller.presence().list(ROOM).await.unwrap();
    let own = presence.iter().find(|r| r.uid == "bob").unwrap();
    assert_eq!(own.state, PresenceState::Idle);
}
