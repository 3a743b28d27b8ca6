//! Peer-transport abstraction layer
//!
//! The tunnel engine negotiates and uses a peer transport (offer/answer and
//! candidate exchange, plus reliable and unreliable data channels) without
//! coupling to any specific implementation. This crate defines that narrow
//! capability surface; a browser host backs it with its WebRTC stack, tests
//! back it with the in-memory [`mock`] implementation.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              kite-client                     │
//! │   (session, app registry, tunnel sockets)    │
//! └─────────────────────────────────────────────┘
//!                      │ uses traits
//!                      ↓
//! ┌─────────────────────────────────────────────┐
//! │        kite-transport (this crate)           │
//! │  - PeerConnector      - SignalingChannel     │
//! │  - PeerTransport      - DataChannel          │
//! └─────────────────────────────────────────────┘
//!                      │ implemented by
//!                      ↓
//!        host peer stack, in-memory mock
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub mod mock;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("negotiation error: {0}")]
    Negotiation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// One item delivered by the signaling line: a text line or an opaque
/// payload frame. The session interprets payload frames by its current
/// state; the transport only preserves the text/binary distinction and the
/// send order.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingItem {
    Line(String),
    Blob(Bytes),
}

/// Reliability mode requested for a data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelReliability {
    /// In-order, lossless delivery.
    ReliableOrdered,
    /// No ordering, no automatic retransmits.
    UnreliableUnordered,
}

/// Parameters for opening a data channel.
#[derive(Debug, Clone)]
pub struct ChannelInit {
    pub label: String,
    pub reliability: ChannelReliability,
}

impl ChannelInit {
    pub fn reliable(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            reliability: ChannelReliability::ReliableOrdered,
        }
    }

    pub fn unreliable(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            reliability: ChannelReliability::UnreliableUnordered,
        }
    }
}

/// Events surfaced by a data channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The channel finished opening and may carry traffic.
    Open,
    /// One transport message.
    Message(Bytes),
    /// The outstanding buffered byte count dropped below the low threshold.
    BufferedLow,
    /// The channel closed.
    Closed,
    /// The channel failed.
    Error(String),
}

/// Events surfaced by the peer transport itself.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A locally discovered ICE candidate; `None` marks gathering complete.
    LocalCandidate(Option<String>),
}

/// The signaling line to the flock.
///
/// `next` must be cancellation safe: dropping the returned future loses no
/// items. Items arrive in strict send order.
#[async_trait]
pub trait SignalingChannel: Send {
    /// Transmit one text line (the transport appends framing as needed).
    async fn send_line(&mut self, line: &str) -> TransportResult<()>;

    /// Receive the next item. `None` means the line closed.
    async fn next(&mut self) -> TransportResult<Option<SignalingItem>>;

    /// Close the line.
    async fn close(&mut self) -> TransportResult<()>;
}

/// The negotiated peer transport.
///
/// `next_event` must be cancellation safe.
#[async_trait]
pub trait PeerTransport: Send {
    type Channel: DataChannel + 'static;

    /// Apply the remote SDP offer.
    async fn set_remote_offer(&mut self, sdp: &str) -> TransportResult<()>;

    /// Produce the local SDP answer; candidate gathering starts here.
    async fn create_answer(&mut self) -> TransportResult<String>;

    /// Apply one remote ICE candidate.
    async fn add_remote_candidate(&mut self, candidate: &str) -> TransportResult<()>;

    /// Open a data channel with the requested reliability.
    async fn open_channel(&mut self, init: ChannelInit) -> TransportResult<Self::Channel>;

    /// Receive the next transport event. `None` means the peer closed.
    async fn next_event(&mut self) -> TransportResult<Option<PeerEvent>>;

    /// Tear the peer down, closing every channel it produced.
    async fn close(&mut self) -> TransportResult<()>;
}

/// Factory for signaling lines and peer transports.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    type Signaling: SignalingChannel + 'static;
    type Peer: PeerTransport + 'static;

    /// Open the signaling line to the given flock endpoint.
    async fn open_signaling(&self, endpoint: &str) -> TransportResult<Self::Signaling>;

    /// Create the peer-transport capability for this session.
    async fn create_peer(&self) -> TransportResult<Self::Peer>;
}

/// One data channel of the peer transport.
///
/// `next_event` must be cancellation safe.
#[async_trait]
pub trait DataChannel: Send {
    /// Queue one message for transmission.
    async fn send(&self, data: Bytes) -> TransportResult<()>;

    /// Bytes accepted by [`DataChannel::send`] but not yet handed to the
    /// network.
    fn buffered_amount(&self) -> usize;

    /// Receive the next channel event. `None` means no more events will
    /// arrive.
    async fn next_event(&mut self) -> TransportResult<Option<ChannelEvent>>;

    /// Close the channel.
    async fn close(&mut self) -> TransportResult<()>;

    fn label(&self) -> &str;

    fn is_open(&self) -> bool;
}
