//! Signaling handshake scenarios against the mock flock.

mod support;

use kite_client::{FlockSession, SessionConfig, SessionError, SessionEvent};
use kite_proto::Credential;
use kite_transport::mock::{self, MOCK_ANSWER};
use support::{ready_session, wait_until, Harness, PERSONA_BLOB};

#[tokio::test]
async fn discovery_handshake_collects_personas() {
    let (connector, mut ctl) = mock::pair();
    let (session, mut events) =
        FlockSession::connect(SessionConfig::new("wss://flock.test"), connector)
            .await
            .unwrap();

    // No appliance configured: the session asks for one first.
    match events.recv().await {
        Some(SessionEvent::NeedsAppliance) => {}
        other => panic!("expected NeedsAppliance, got {other:?}"),
    }

    let sig = ctl.signaling().await;
    session.set_appliance("garage").await.unwrap();
    assert_eq!(sig.sent_lines(), vec!["garage".to_owned()]);

    sig.push_line("105");
    sig.push_blob(PERSONA_BLOB);
    sig.push_line("403");

    match events.recv().await {
        Some(SessionEvent::NeedsPersonas(personas)) => {
            assert_eq!(personas.len(), 1);
            assert_eq!(personas[0].id, "abc");
            assert_eq!(personas[0].display_name, "Alice");
            assert_eq!(personas[0].photo, None);
        }
        other => panic!("expected NeedsPersonas, got {other:?}"),
    }
}

#[tokio::test]
async fn preconfigured_appliance_reaches_ready() {
    let harness = ready_session().await;
    let lines = harness.sig.sent_lines();
    assert_eq!(
        lines[..4],
        ["garage", "abc", "pwd:secret", MOCK_ANSWER],
        "appliance, persona, credential, then the answer"
    );
    assert_eq!(harness.peer.remote_offer().as_deref(), Some("v=0 offer"));
}

#[tokio::test]
async fn unknown_appliance_reprompts_and_recovers() {
    let (connector, mut ctl) = mock::pair();
    let (session, mut events) =
        FlockSession::connect(SessionConfig::new("wss://flock.test"), connector)
            .await
            .unwrap();
    match events.recv().await {
        Some(SessionEvent::NeedsAppliance) => {}
        other => panic!("expected NeedsAppliance, got {other:?}"),
    }

    let sig = ctl.signaling().await;
    session.set_appliance("ghost").await.unwrap();
    sig.push_line("404");

    match events.recv().await {
        Some(SessionEvent::Error(SessionError::ApplianceNotFound)) => {}
        other => panic!("expected ApplianceNotFound, got {other:?}"),
    }
    match events.recv().await {
        Some(SessionEvent::NeedsAppliance) => {}
        other => panic!("expected NeedsAppliance reprompt, got {other:?}"),
    }

    // The session is still alive: naming a known appliance proceeds.
    session.set_appliance("garage").await.unwrap();
    sig.push_line("105");
    sig.push_blob(PERSONA_BLOB);
    sig.push_line("403");
    match events.recv().await {
        Some(SessionEvent::NeedsPersonas(personas)) => assert_eq!(personas[0].id, "abc"),
        other => panic!("expected NeedsPersonas, got {other:?}"),
    }
    assert_eq!(sig.sent_lines(), vec!["ghost".to_owned(), "garage".to_owned()]);
}

#[tokio::test]
async fn buffered_candidates_flush_in_order_after_answer() {
    let (connector, mut ctl) = mock::pair();
    let config = SessionConfig::new("wss://flock.test").with_appliance("garage");
    let (session, mut events) = FlockSession::connect(config, connector).await.unwrap();

    let sig = ctl.signaling().await;
    sig.push_line("105");
    sig.push_blob(PERSONA_BLOB);
    sig.push_line("403");
    match events.recv().await {
        Some(SessionEvent::NeedsPersonas(_)) => {}
        other => panic!("expected NeedsPersonas, got {other:?}"),
    }
    session
        .login("abc", Credential::token("tok-123"))
        .await
        .unwrap();
    sig.push_line("200");
    sig.push_line("151");

    // Candidates discovered before the answer is on the wire get buffered.
    let peer = ctl.peer().await;
    peer.emit_candidate(Some("cand:1"));
    peer.emit_candidate(Some("cand:2"));
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    assert!(
        !sig.sent_lines().iter().any(|l| l.starts_with("cand:")),
        "no candidate may precede the answer"
    );

    sig.push_blob(&b"v=0 offer"[..]);
    wait_until(|| sig.sent_lines().iter().any(|l| l == MOCK_ANSWER)).await;

    // Candidates after the answer go straight out.
    peer.emit_candidate(Some("cand:3"));
    wait_until(|| sig.sent_lines().iter().any(|l| l == "cand:3")).await;

    // Gathering complete: empty line, then the fully drained exchange closes
    // the signaling line (the remote finished with the standalone 151).
    peer.emit_candidate(None);
    wait_until(|| sig.is_closed()).await;

    let lines = sig.sent_lines();
    assert_eq!(
        lines[3..],
        [MOCK_ANSWER, "cand:1", "cand:2", "cand:3", ""],
        "answer first, buffered candidates in discovery order, then the rest"
    );
}

#[tokio::test]
async fn signaling_hangup_during_login_is_authentication_failure() {
    let (connector, mut ctl) = mock::pair();
    let config = SessionConfig::new("wss://flock.test").with_appliance("garage");
    let (session, mut events) = FlockSession::connect(config, connector).await.unwrap();

    let sig = ctl.signaling().await;
    sig.push_line("105");
    sig.push_blob(PERSONA_BLOB);
    sig.push_line("403");
    match events.recv().await {
        Some(SessionEvent::NeedsPersonas(_)) => {}
        other => panic!("expected NeedsPersonas, got {other:?}"),
    }
    session
        .login("abc", Credential::password("wrong"))
        .await
        .unwrap();

    // The appliance rejects by hanging up before the control channel opens.
    sig.close();
    match events.recv().await {
        Some(SessionEvent::Error(SessionError::AuthenticationFailed)) => {}
        other => panic!("expected AuthenticationFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn unexpected_line_fails_the_session_exactly_once() {
    let (connector, mut ctl) = mock::pair();
    let config = SessionConfig::new("wss://flock.test").with_appliance("garage");
    let (_session, mut events) = FlockSession::connect(config, connector).await.unwrap();

    let sig = ctl.signaling().await;
    sig.push_line("105");
    // 200 is not valid while collecting personas.
    sig.push_line("200");
    sig.push_line("200");

    match events.recv().await {
        Some(SessionEvent::Error(SessionError::UnexpectedLine { code: 200, .. })) => {}
        other => panic!("expected UnexpectedLine, got {other:?}"),
    }
    wait_until(|| sig.is_closed()).await;

    // Exactly one error: the driver is gone, nothing further arrives.
    assert!(events.recv().await.is_none());
}

#[tokio::test]
async fn closing_the_session_cascades_to_owned_resources() {
    let mut harness = ready_session().await;
    harness.session.close().await.unwrap();

    assert!(harness.sig.is_closed());
    assert!(harness.control.is_closed());
    assert!(harness.peer.is_closed());

    // Operations after close fail instead of hanging.
    let err = harness.session.request_apps(&["files"]).await.unwrap_err();
    assert!(matches!(err, SessionError::Closed));
}

#[tokio::test]
async fn apps_are_rejected_before_the_control_channel_opens() {
    let (connector, mut ctl) = mock::pair();
    let config = SessionConfig::new("wss://flock.test").with_appliance("garage");
    let (session, _events) = FlockSession::connect(config, connector).await.unwrap();
    let _sig = ctl.signaling().await;

    let err = session.request_apps(&["files"]).await.unwrap_err();
    assert!(matches!(err, SessionError::NotReady));

    let err = session
        .open_socket("files", 80, kite_proto::TransportKind::Stream)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NotReady));
}

#[tokio::test]
async fn harness_session_is_reusable() {
    // Sanity-check the shared harness invariants the other files rely on.
    let harness: Harness = ready_session().await;
    assert_eq!(harness.control.label(), "kite-control");
    assert!(
        !harness.sig.is_closed(),
        "signaling stays open until both sides finish candidates"
    );
}
