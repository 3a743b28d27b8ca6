//! In-memory peer transport for tests
//!
//! Implements the full capability surface over channels and shared state, so
//! session and socket logic can be exercised without a real peer stack. Every
//! mock object comes with a test-side handle that injects inbound traffic and
//! observes outbound traffic.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{
    ChannelEvent, ChannelInit, ChannelReliability, DataChannel, PeerConnector, PeerEvent,
    PeerTransport, SignalingChannel, SignalingItem, TransportError, TransportResult,
};

/// SDP answer produced by [`MockPeer::create_answer`].
pub const MOCK_ANSWER: &str = "v=0 mock-answer";

/// Build a connected connector/handle pair. The connector side goes to the
/// code under test; the handle side stays with the test and yields one
/// [`MockSignalingHandle`] per opened signaling line and one
/// [`MockPeerHandle`] per created peer.
pub fn pair() -> (MockConnector, MockConnectorHandle) {
    let (signaling_tx, signaling_rx) = mpsc::unbounded_channel();
    let (peer_tx, peer_rx) = mpsc::unbounded_channel();
    (
        MockConnector {
            signaling_tx,
            peer_tx,
        },
        MockConnectorHandle {
            signaling_rx,
            peer_rx,
        },
    )
}

pub struct MockConnector {
    signaling_tx: mpsc::UnboundedSender<MockSignalingHandle>,
    peer_tx: mpsc::UnboundedSender<MockPeerHandle>,
}

pub struct MockConnectorHandle {
    signaling_rx: mpsc::UnboundedReceiver<MockSignalingHandle>,
    peer_rx: mpsc::UnboundedReceiver<MockPeerHandle>,
}

impl MockConnectorHandle {
    /// Wait for the next signaling line opened through the connector.
    pub async fn signaling(&mut self) -> MockSignalingHandle {
        self.signaling_rx
            .recv()
            .await
            .expect("connector dropped before opening a signaling line")
    }

    /// Wait for the next peer created through the connector.
    pub async fn peer(&mut self) -> MockPeerHandle {
        self.peer_rx
            .recv()
            .await
            .expect("connector dropped before creating a peer")
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    type Signaling = MockSignaling;
    type Peer = MockPeer;

    async fn open_signaling(&self, endpoint: &str) -> TransportResult<Self::Signaling> {
        let (signaling, handle) = signaling_pair(endpoint);
        self.signaling_tx
            .send(handle)
            .map_err(|_| TransportError::ConnectionFailed("mock connector handle dropped".into()))?;
        Ok(signaling)
    }

    async fn create_peer(&self) -> TransportResult<Self::Peer> {
        let (peer, handle) = peer_pair();
        self.peer_tx
            .send(handle)
            .map_err(|_| TransportError::ConnectionFailed("mock connector handle dropped".into()))?;
        Ok(peer)
    }
}

struct SignalingShared {
    endpoint: String,
    sent: Mutex<Vec<String>>,
    closed: AtomicBool,
}

fn signaling_pair(endpoint: &str) -> (MockSignaling, MockSignalingHandle) {
    let shared = Arc::new(SignalingShared {
        endpoint: endpoint.to_owned(),
        sent: Mutex::new(Vec::new()),
        closed: AtomicBool::new(false),
    });
    let (item_tx, item_rx) = mpsc::unbounded_channel();
    (
        MockSignaling {
            shared: shared.clone(),
            items: item_rx,
        },
        MockSignalingHandle {
            shared,
            items: Mutex::new(Some(item_tx)),
        },
    )
}

/// Signaling line given to the code under test.
pub struct MockSignaling {
    shared: Arc<SignalingShared>,
    items: mpsc::UnboundedReceiver<SignalingItem>,
}

#[async_trait]
impl SignalingChannel for MockSignaling {
    async fn send_line(&mut self, line: &str) -> TransportResult<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        self.shared.sent.lock().unwrap().push(line.to_owned());
        Ok(())
    }

    async fn next(&mut self) -> TransportResult<Option<SignalingItem>> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(self.items.recv().await)
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.shared.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Test-side handle for a [`MockSignaling`] line.
pub struct MockSignalingHandle {
    shared: Arc<SignalingShared>,
    items: Mutex<Option<mpsc::UnboundedSender<SignalingItem>>>,
}

impl MockSignalingHandle {
    pub fn endpoint(&self) -> String {
        self.shared.endpoint.clone()
    }

    /// Deliver one inbound text line.
    pub fn push_line(&self, line: &str) {
        if let Some(tx) = &*self.items.lock().unwrap() {
            let _ = tx.send(SignalingItem::Line(line.to_owned()));
        }
    }

    /// Deliver one inbound payload frame.
    pub fn push_blob(&self, payload: impl Into<Bytes>) {
        if let Some(tx) = &*self.items.lock().unwrap() {
            let _ = tx.send(SignalingItem::Blob(payload.into()));
        }
    }

    /// Close the line from the remote side: `next` yields `None` once the
    /// queued items drain.
    pub fn close(&self) {
        self.items.lock().unwrap().take();
    }

    /// Lines transmitted by the code under test, in send order.
    pub fn sent_lines(&self) -> Vec<String> {
        self.shared.sent.lock().unwrap().clone()
    }

    /// Whether the code under test closed the line.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

struct PeerShared {
    remote_offer: Mutex<Option<String>>,
    remote_candidates: Mutex<Vec<String>>,
    closed: AtomicBool,
}

fn peer_pair() -> (MockPeer, MockPeerHandle) {
    let shared = Arc::new(PeerShared {
        remote_offer: Mutex::new(None),
        remote_candidates: Mutex::new(Vec::new()),
        closed: AtomicBool::new(false),
    });
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (channel_tx, channel_rx) = mpsc::unbounded_channel();
    (
        MockPeer {
            shared: shared.clone(),
            events: event_rx,
            channels: channel_tx,
        },
        MockPeerHandle {
            shared,
            events: event_tx,
            channels: channel_rx,
        },
    )
}

/// Peer transport given to the code under test.
pub struct MockPeer {
    shared: Arc<PeerShared>,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    channels: mpsc::UnboundedSender<MockChannelHandle>,
}

#[async_trait]
impl PeerTransport for MockPeer {
    type Channel = MockChannel;

    async fn set_remote_offer(&mut self, sdp: &str) -> TransportResult<()> {
        *self.shared.remote_offer.lock().unwrap() = Some(sdp.to_owned());
        Ok(())
    }

    async fn create_answer(&mut self) -> TransportResult<String> {
        if self.shared.remote_offer.lock().unwrap().is_none() {
            return Err(TransportError::Negotiation("no remote offer set".into()));
        }
        Ok(MOCK_ANSWER.to_owned())
    }

    async fn add_remote_candidate(&mut self, candidate: &str) -> TransportResult<()> {
        self.shared
            .remote_candidates
            .lock()
            .unwrap()
            .push(candidate.to_owned());
        Ok(())
    }

    async fn open_channel(&mut self, init: ChannelInit) -> TransportResult<Self::Channel> {
        let (channel, handle) = channel_pair(init);
        self.channels
            .send(handle)
            .map_err(|_| TransportError::ConnectionFailed("mock peer handle dropped".into()))?;
        Ok(channel)
    }

    async fn next_event(&mut self) -> TransportResult<Option<PeerEvent>> {
        Ok(self.events.recv().await)
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.shared.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Test-side handle for a [`MockPeer`].
pub struct MockPeerHandle {
    shared: Arc<PeerShared>,
    events: mpsc::UnboundedSender<PeerEvent>,
    channels: mpsc::UnboundedReceiver<MockChannelHandle>,
}

impl MockPeerHandle {
    /// Wait for the next data channel opened on this peer.
    pub async fn channel(&mut self) -> MockChannelHandle {
        self.channels
            .recv()
            .await
            .expect("peer dropped before opening a channel")
    }

    /// Emit a locally discovered candidate event; `None` marks gathering
    /// complete.
    pub fn emit_candidate(&self, candidate: Option<&str>) {
        let _ = self
            .events
            .send(PeerEvent::LocalCandidate(candidate.map(str::to_owned)));
    }

    pub fn remote_offer(&self) -> Option<String> {
        self.shared.remote_offer.lock().unwrap().clone()
    }

    pub fn remote_candidates(&self) -> Vec<String> {
        self.shared.remote_candidates.lock().unwrap().clone()
    }

    /// Whether the code under test closed the peer.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

struct ChannelShared {
    label: String,
    reliability: ChannelReliability,
    sent: Mutex<Vec<Bytes>>,
    buffered: AtomicUsize,
    open: AtomicBool,
    closed: AtomicBool,
}

fn channel_pair(init: ChannelInit) -> (MockChannel, MockChannelHandle) {
    let shared = Arc::new(ChannelShared {
        label: init.label,
        reliability: init.reliability,
        sent: Mutex::new(Vec::new()),
        buffered: AtomicUsize::new(0),
        open: AtomicBool::new(false),
        closed: AtomicBool::new(false),
    });
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    (
        MockChannel {
            shared: shared.clone(),
            events: event_rx,
        },
        MockChannelHandle {
            shared,
            events: event_tx,
        },
    )
}

/// Data channel given to the code under test.
pub struct MockChannel {
    shared: Arc<ChannelShared>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
}

#[async_trait]
impl DataChannel for MockChannel {
    async fn send(&self, data: Bytes) -> TransportResult<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        self.shared.sent.lock().unwrap().push(data);
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        self.shared.buffered.load(Ordering::SeqCst)
    }

    async fn next_event(&mut self) -> TransportResult<Option<ChannelEvent>> {
        Ok(self.events.recv().await)
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.shared.open.store(false, Ordering::SeqCst);
        self.shared.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn label(&self) -> &str {
        &self.shared.label
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst) && !self.shared.closed.load(Ordering::SeqCst)
    }
}

/// Test-side handle for a [`MockChannel`].
pub struct MockChannelHandle {
    shared: Arc<ChannelShared>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl MockChannelHandle {
    /// Finish opening the channel and deliver [`ChannelEvent::Open`].
    pub fn open(&self) {
        self.shared.open.store(true, Ordering::SeqCst);
        let _ = self.events.send(ChannelEvent::Open);
    }

    /// Deliver one inbound transport message.
    pub fn inject(&self, data: impl Into<Bytes>) {
        let _ = self.events.send(ChannelEvent::Message(data.into()));
    }

    /// Set the outstanding buffered byte count reported by
    /// [`DataChannel::buffered_amount`].
    pub fn set_buffered(&self, amount: usize) {
        self.shared.buffered.store(amount, Ordering::SeqCst);
    }

    /// Deliver [`ChannelEvent::BufferedLow`].
    pub fn signal_buffered_low(&self) {
        let _ = self.events.send(ChannelEvent::BufferedLow);
    }

    /// Close the channel from the remote side.
    pub fn close(&self) {
        self.shared.open.store(false, Ordering::SeqCst);
        self.shared.closed.store(true, Ordering::SeqCst);
        let _ = self.events.send(ChannelEvent::Closed);
    }

    /// Fail the channel with a transport-level error event.
    pub fn fail(&self, reason: &str) {
        let _ = self.events.send(ChannelEvent::Error(reason.to_owned()));
    }

    /// Messages transmitted by the code under test, in send order.
    pub fn sent(&self) -> Vec<Bytes> {
        self.shared.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.shared.sent.lock().unwrap().len()
    }

    /// Whether the channel has been closed (by either side).
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn label(&self) -> String {
        self.shared.label.clone()
    }

    pub fn reliability(&self) -> ChannelReliability {
        self.shared.reliability
    }
}
