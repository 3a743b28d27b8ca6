//! Shared harness for session integration tests: brings a session up against
//! the in-memory mock transport and exposes the mock handles for poking.

#![allow(dead_code)]

use bytes::Bytes;
use kite_client::{FlockSession, SessionConfig, SessionEvent, SocketEvent, TunnelSocket};
use kite_proto::{ConnectResponse, ControlRequest, Credential, OpenAppResponse, TransportKind, WireCursor};
use kite_transport::mock::{
    self, MockChannelHandle, MockConnectorHandle, MockPeerHandle, MockSignalingHandle,
};
use tokio::sync::mpsc;

pub const PERSONA_BLOB: &[u8] = b"KITE PERSONASBEGIN:VCARD\nX-KITEID:abc\nFN:Alice\nEND:VCARD";

pub struct Harness {
    pub session: FlockSession,
    pub events: mpsc::Receiver<SessionEvent>,
    pub sig: MockSignalingHandle,
    pub peer: MockPeerHandle,
    pub control: MockChannelHandle,
    pub ctl: MockConnectorHandle,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Run a session all the way to `Ready` against the mock flock.
pub async fn ready_session() -> Harness {
    init_tracing();
    let (connector, mut ctl) = mock::pair();
    let config = SessionConfig::new("wss://flock.test").with_appliance("garage");
    let (session, mut events) = FlockSession::connect(config, connector).await.unwrap();

    let sig = ctl.signaling().await;
    sig.push_line("105");
    sig.push_blob(PERSONA_BLOB);
    sig.push_line("403");

    match events.recv().await {
        Some(SessionEvent::NeedsPersonas(personas)) => {
            assert_eq!(personas.len(), 1);
            assert_eq!(personas[0].id, "abc");
        }
        other => panic!("expected NeedsPersonas, got {other:?}"),
    }

    session
        .login("abc", Credential::password("secret"))
        .await
        .unwrap();
    sig.push_line("200");
    sig.push_line("151");
    sig.push_blob(&b"v=0 offer"[..]);

    let mut peer = ctl.peer().await;
    let control = peer.channel().await;
    control.open();

    match events.recv().await {
        Some(SessionEvent::Ready) => {}
        other => panic!("expected Ready, got {other:?}"),
    }

    Harness {
        session,
        events,
        sig,
        peer,
        control,
        ctl,
    }
}

/// Open a socket to an application the session has not registered yet,
/// answering the OpenApp exchange with the given descriptor.
pub async fn open_socket(
    harness: &mut Harness,
    app: &str,
    port: u16,
    kind: TransportKind,
    descriptor: u32,
) -> (TunnelSocket, MockChannelHandle) {
    let Harness {
        session,
        peer,
        control,
        ..
    } = harness;
    let base = control.sent_count();
    let (socket, channel) = tokio::join!(session.open_socket(app, port, kind), async {
        wait_until(|| control.sent_count() > base).await;
        let request = decode_request(&control.sent()[base]);
        assert_eq!(
            request,
            ControlRequest::OpenApp {
                name: app.to_owned()
            }
        );
        control.inject(OpenAppResponse(Ok(descriptor)).encode());
        peer.channel().await
    });
    (socket.unwrap(), channel)
}

/// Complete a socket's connect handshake with a success response.
pub async fn connect_socket(socket: &mut TunnelSocket, channel: &MockChannelHandle) {
    channel.open();
    wait_until(|| channel.sent_count() == 1).await;
    channel.inject(ConnectResponse(Ok(())).encode());
    match socket.next_event().await {
        Some(SocketEvent::Open) => {}
        other => panic!("expected Open, got {other:?}"),
    }
}

pub fn decode_request(bytes: &Bytes) -> ControlRequest {
    let mut cursor = WireCursor::new(bytes.clone());
    ControlRequest::decode(&mut cursor).unwrap()
}

/// Spin the scheduler until the condition holds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached in time");
}
