//! Virtual tunnel sockets
//!
//! A [`TunnelSocket`] maps one application endpoint onto one transport
//! channel. Stream endpoints ride a reliable-ordered channel; datagram
//! endpoints an unreliable-unordered channel with the connect request
//! retried on a doubling interval. Outbound payloads are framed with a
//! 5-byte header and split into MTU-sized transport messages.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::stream::{BoxStream, Stream, StreamExt};
use kite_proto::{
    AppDescriptor, ConnectResponse, ControlRequest, TransportKind, WireCursor, FRAME_HEADER_SIZE,
    FRAME_TAG_DATA,
};
use kite_transport::{ChannelEvent, DataChannel, TransportResult};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::SocketError;

/// Events surfaced to the socket consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// The connect handshake succeeded; the socket may carry traffic.
    Open,
    /// One received payload, frame header stripped.
    Data(Bytes),
    /// The socket closed.
    Closed,
    /// The socket failed.
    Error(SocketError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketState {
    Connecting,
    Connected,
    Closed,
    Disconnected,
    Error,
}

/// Everything the socket driver needs from the session.
pub(crate) struct SocketParams {
    pub app: String,
    pub port: u16,
    pub kind: TransportKind,
    pub descriptor: AppDescriptor,
    pub connect_retry_base: Duration,
    pub connect_retry_sends: u8,
    pub max_frame_size: usize,
    pub low_buffer_watermark: usize,
    pub burst_yield_bytes: usize,
}

type Progress = Box<dyn FnMut(usize) + Send>;

enum SocketCommand {
    Send {
        payload: Bytes,
        progress: Option<Progress>,
        resp: oneshot::Sender<Result<(), SocketError>>,
    },
    SendStream {
        source: BoxStream<'static, Bytes>,
        progress: Option<Progress>,
        resp: oneshot::Sender<Result<(), SocketError>>,
    },
    Close {
        resp: oneshot::Sender<()>,
    },
}

/// Handle to a virtual socket multiplexed over the peer transport.
pub struct TunnelSocket {
    app: String,
    port: u16,
    kind: TransportKind,
    cmd_tx: mpsc::Sender<SocketCommand>,
    events: mpsc::Receiver<SocketEvent>,
}

impl std::fmt::Debug for TunnelSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSocket")
            .field("app", &self.app)
            .field("port", &self.port)
            .field("kind", &self.kind)
            .finish()
    }
}

impl TunnelSocket {
    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Receive the next socket event. `None` means the socket task ended.
    pub async fn next_event(&mut self) -> Option<SocketEvent> {
        self.events.recv().await
    }

    /// Send one payload, chunked to the transport MTU. Valid only while
    /// connected.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<(), SocketError> {
        let payload = payload.into();
        self.exec(|resp| SocketCommand::Send {
            payload,
            progress: None,
            resp,
        })
        .await
    }

    /// Send a UTF-8 text payload.
    pub async fn send_text(&self, text: &str) -> Result<(), SocketError> {
        self.send(Bytes::copy_from_slice(text.as_bytes())).await
    }

    /// Send one payload, reporting cumulative payload bytes after each chunk.
    pub async fn send_with_progress(
        &self,
        payload: impl Into<Bytes>,
        progress: impl FnMut(usize) + Send + 'static,
    ) -> Result<(), SocketError> {
        let payload = payload.into();
        self.exec(|resp| SocketCommand::Send {
            payload,
            progress: Some(Box::new(progress)),
            resp,
        })
        .await
    }

    /// Send a byte stream lazily, pacing on the channel's buffered amount.
    /// Resolves once the source signals end-of-data.
    pub async fn send_stream<S>(&self, source: S) -> Result<(), SocketError>
    where
        S: Stream<Item = Bytes> + Send + 'static,
    {
        self.exec(|resp| SocketCommand::SendStream {
            source: source.boxed(),
            progress: None,
            resp,
        })
        .await
    }

    /// [`TunnelSocket::send_stream`] with a cumulative progress callback.
    pub async fn send_stream_with_progress<S>(
        &self,
        source: S,
        progress: impl FnMut(usize) + Send + 'static,
    ) -> Result<(), SocketError>
    where
        S: Stream<Item = Bytes> + Send + 'static,
    {
        self.exec(|resp| SocketCommand::SendStream {
            source: source.boxed(),
            progress: Some(Box::new(progress)),
            resp,
        })
        .await
    }

    /// Close the socket and its channel. Any operation afterwards fails
    /// with [`SocketError::Closed`].
    pub async fn close(&self) -> Result<(), SocketError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(SocketCommand::Close { resp: tx })
            .await
            .map_err(|_| SocketError::Closed)?;
        rx.await.map_err(|_| SocketError::Closed)
    }

    async fn exec(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), SocketError>>) -> SocketCommand,
    ) -> Result<(), SocketError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| SocketError::Closed)?;
        rx.await.map_err(|_| SocketError::Closed)?
    }
}

/// Take ownership of a freshly opened channel and drive it as a socket.
pub(crate) fn spawn<Ch: DataChannel + 'static>(channel: Ch, params: SocketParams) -> TunnelSocket {
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (event_tx, event_rx) = mpsc::channel(64);
    let handle = TunnelSocket {
        app: params.app.clone(),
        port: params.port,
        kind: params.kind,
        cmd_tx,
        events: event_rx,
    };
    let label = channel.label().to_owned();
    let driver = SocketDriver {
        channel,
        params,
        label,
        state: SocketState::Connecting,
        request_sent: false,
        retry: None,
        channel_dead: false,
        finished: false,
        events: event_tx,
        cmd_rx,
    };
    tokio::spawn(driver.run());
    handle
}

#[derive(Debug, Clone, Copy)]
struct Retry {
    deadline: Instant,
    interval: Duration,
    sends: u8,
}

struct SocketDriver<Ch> {
    channel: Ch,
    params: SocketParams,
    label: String,
    state: SocketState,
    request_sent: bool,
    retry: Option<Retry>,
    channel_dead: bool,
    finished: bool,
    events: mpsc::Sender<SocketEvent>,
    cmd_rx: mpsc::Receiver<SocketCommand>,
}

impl<Ch: DataChannel + 'static> SocketDriver<Ch> {
    async fn run(mut self) {
        debug!("[{}] socket task started", self.label);
        while !self.finished {
            let retry_deadline = self.retry.map(|r| r.deadline);
            tokio::select! {
                ev = next_channel_event(&mut self.channel, self.channel_dead) => {
                    self.on_channel_event(ev).await;
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    None => {
                        // Handle dropped: cascade the close to the channel.
                        self.retry = None;
                        self.shutdown_channel().await;
                        self.finished = true;
                    }
                },
                _ = sleep_opt(retry_deadline) => self.on_retry_lapsed().await,
            }
        }
        debug!("[{}] socket task ended", self.label);
    }

    async fn on_channel_event(&mut self, event: TransportResult<Option<ChannelEvent>>) {
        match event {
            Ok(Some(ChannelEvent::Open)) => self.on_open().await,
            Ok(Some(ChannelEvent::Message(data))) => self.on_message(data).await,
            Ok(Some(ChannelEvent::BufferedLow)) => {}
            Ok(Some(ChannelEvent::Closed)) | Ok(None) => self.on_channel_closed().await,
            Ok(Some(ChannelEvent::Error(reason))) => {
                self.on_channel_error(SocketError::Transport(reason)).await;
            }
            Err(err) => self.on_channel_error(err.into()).await,
        }
    }

    async fn on_open(&mut self) {
        if self.request_sent {
            return;
        }
        self.request_sent = true;
        if let Err(err) = self.channel.send(self.connect_request()).await {
            self.on_channel_error(err.into()).await;
            return;
        }
        debug!("[{}] sent connect request", self.label);
        if self.params.kind == TransportKind::Datagram {
            let interval = self.params.connect_retry_base;
            self.retry = Some(Retry {
                deadline: Instant::now() + interval,
                interval,
                sends: 1,
            });
        }
    }

    async fn on_retry_lapsed(&mut self) {
        let Some(retry) = self.retry else { return };
        if retry.sends >= self.params.connect_retry_sends {
            self.retry = None;
            warn!(
                "[{}] no connect response after {} sends",
                self.label, retry.sends
            );
            self.state = SocketState::Disconnected;
            self.emit(SocketEvent::Error(SocketError::ConnectTimeout)).await;
            self.shutdown_channel().await;
            return;
        }
        match self.channel.send(self.connect_request()).await {
            Ok(()) => {
                let interval = retry.interval * 2;
                self.retry = Some(Retry {
                    deadline: Instant::now() + interval,
                    interval,
                    sends: retry.sends + 1,
                });
                trace!(
                    "[{}] connect resend {}, next interval {:?}",
                    self.label,
                    retry.sends + 1,
                    interval
                );
            }
            Err(err) => {
                self.retry = None;
                self.on_channel_error(err.into()).await;
            }
        }
    }

    async fn on_message(&mut self, data: Bytes) {
        match self.state {
            SocketState::Connecting => {
                // First response cancels the pending retry timer.
                self.retry = None;
                let mut cursor = WireCursor::new(data);
                match ConnectResponse::decode(&mut cursor) {
                    Ok(ConnectResponse(Ok(()))) => {
                        self.state = SocketState::Connected;
                        info!("[{}] socket connected", self.label);
                        self.emit(SocketEvent::Open).await;
                    }
                    Ok(ConnectResponse(Err(errno))) => {
                        self.state = SocketState::Error;
                        self.emit(SocketEvent::Error(SocketError::Remote { errno }))
                            .await;
                        self.shutdown_channel().await;
                    }
                    Err(err) => {
                        self.state = SocketState::Error;
                        self.emit(SocketEvent::Error(SocketError::Protocol(err.to_string())))
                            .await;
                        self.shutdown_channel().await;
                    }
                }
            }
            SocketState::Connected => {
                self.deliver(data).await;
            }
            state => {
                debug!(
                    "[{}] dropping {} bytes received in state {:?}",
                    self.label,
                    data.len(),
                    state
                );
            }
        }
    }

    /// Strip the frame header and hand the payload to the consumer. Returns
    /// false when the frame is malformed (the socket is failed in place).
    async fn deliver(&mut self, data: Bytes) -> bool {
        if data.len() >= FRAME_HEADER_SIZE && data[0] == FRAME_TAG_DATA {
            self.emit(SocketEvent::Data(data.slice(FRAME_HEADER_SIZE..)))
                .await;
            true
        } else {
            self.state = SocketState::Error;
            self.emit(SocketEvent::Error(SocketError::Protocol(
                "malformed data frame".into(),
            )))
            .await;
            self.shutdown_channel().await;
            false
        }
    }

    async fn on_channel_closed(&mut self) {
        self.retry = None;
        self.channel_dead = true;
        if self.state != SocketState::Closed {
            self.state = SocketState::Closed;
            self.emit(SocketEvent::Closed).await;
        }
    }

    async fn on_channel_error(&mut self, err: SocketError) {
        self.retry = None;
        self.state = SocketState::Error;
        self.emit(SocketEvent::Error(err)).await;
        self.shutdown_channel().await;
    }

    async fn on_command(&mut self, cmd: SocketCommand) {
        match cmd {
            SocketCommand::Send {
                payload,
                progress,
                resp,
            } => {
                if self.state != SocketState::Connected {
                    self.emit(SocketEvent::Error(SocketError::InvalidState)).await;
                    let _ = resp.send(Err(SocketError::InvalidState));
                    return;
                }
                let _ = resp.send(self.blast(payload, progress).await);
            }
            SocketCommand::SendStream {
                source,
                progress,
                resp,
            } => {
                if self.state != SocketState::Connected {
                    self.emit(SocketEvent::Error(SocketError::InvalidState)).await;
                    let _ = resp.send(Err(SocketError::InvalidState));
                    return;
                }
                let _ = resp.send(self.pump_stream(source, progress).await);
            }
            SocketCommand::Close { resp } => {
                self.retry = None;
                self.shutdown_channel().await;
                if self.state != SocketState::Closed {
                    self.state = SocketState::Closed;
                    self.emit(SocketEvent::Closed).await;
                }
                let _ = resp.send(());
                self.finished = true;
            }
        }
    }

    /// Chunk one payload into framed transport messages.
    async fn blast(
        &mut self,
        payload: Bytes,
        mut progress: Option<Progress>,
    ) -> Result<(), SocketError> {
        let max_payload = self.params.max_frame_size - FRAME_HEADER_SIZE;
        let mut offset = 0;
        while offset < payload.len() {
            let end = (offset + max_payload).min(payload.len());
            if let Err(err) = self.channel.send(encode_frame(&payload[offset..end])).await {
                let err: SocketError = err.into();
                self.on_channel_error(err.clone()).await;
                return Err(err);
            }
            offset = end;
            if let Some(report) = progress.as_mut() {
                report(offset);
            }
        }
        Ok(())
    }

    /// Pull the source lazily, pausing on buffered backpressure and yielding
    /// between long synchronous bursts.
    async fn pump_stream(
        &mut self,
        mut source: BoxStream<'static, Bytes>,
        mut progress: Option<Progress>,
    ) -> Result<(), SocketError> {
        let max_payload = self.params.max_frame_size - FRAME_HEADER_SIZE;
        let mut total = 0usize;
        let mut burst = 0usize;
        while let Some(chunk) = source.next().await {
            let mut offset = 0;
            while offset < chunk.len() {
                let end = (offset + max_payload).min(chunk.len());
                if let Err(err) = self.channel.send(encode_frame(&chunk[offset..end])).await {
                    let err: SocketError = err.into();
                    self.on_channel_error(err.clone()).await;
                    return Err(err);
                }
                total += end - offset;
                burst += end - offset;
                offset = end;
                if let Some(report) = progress.as_mut() {
                    report(total);
                }
                if self.channel.buffered_amount() > self.params.low_buffer_watermark {
                    self.await_buffered_low().await?;
                    burst = 0;
                } else if burst > self.params.burst_yield_bytes {
                    tokio::task::yield_now().await;
                    burst = 0;
                }
            }
        }
        Ok(())
    }

    /// Park until the channel drains, still servicing inbound events.
    async fn await_buffered_low(&mut self) -> Result<(), SocketError> {
        loop {
            match self.channel.next_event().await {
                Ok(Some(ChannelEvent::BufferedLow)) => return Ok(()),
                Ok(Some(ChannelEvent::Open)) => {}
                Ok(Some(ChannelEvent::Message(data))) => {
                    if !self.deliver(data).await {
                        return Err(SocketError::Protocol("malformed data frame".into()));
                    }
                }
                Ok(Some(ChannelEvent::Closed)) | Ok(None) => {
                    self.on_channel_closed().await;
                    return Err(SocketError::Closed);
                }
                Ok(Some(ChannelEvent::Error(reason))) => {
                    let err = SocketError::Transport(reason);
                    self.on_channel_error(err.clone()).await;
                    return Err(err);
                }
                Err(err) => {
                    let err: SocketError = err.into();
                    self.on_channel_error(err.clone()).await;
                    return Err(err);
                }
            }
        }
    }

    fn connect_request(&self) -> Bytes {
        let retries = match self.params.kind {
            TransportKind::Datagram => self.params.connect_retry_sends,
            _ => 0,
        };
        ControlRequest::ConnectSocket {
            retries,
            kind: self.params.kind,
            port: self.params.port,
            descriptor: self.params.descriptor,
        }
        .encode()
    }

    async fn shutdown_channel(&mut self) {
        if !self.channel_dead {
            self.channel_dead = true;
            let _ = self.channel.close().await;
        }
    }

    async fn emit(&mut self, event: SocketEvent) {
        if self.events.send(event).await.is_err() {
            trace!("[{}] event receiver dropped", self.label);
        }
    }
}

async fn next_channel_event<Ch: DataChannel>(
    channel: &mut Ch,
    dead: bool,
) -> TransportResult<Option<ChannelEvent>> {
    if dead {
        std::future::pending().await
    } else {
        channel.next_event().await
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn encode_frame(chunk: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + chunk.len());
    frame.put_u8(FRAME_TAG_DATA);
    frame.put_bytes(0, FRAME_HEADER_SIZE - 1);
    frame.put_slice(chunk);
    frame.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_header_layout() {
        let frame = encode_frame(b"hello");
        assert_eq!(&frame[..FRAME_HEADER_SIZE], &[FRAME_TAG_DATA, 0, 0, 0, 0]);
        assert_eq!(&frame[FRAME_HEADER_SIZE..], b"hello");
    }

    #[test]
    fn empty_chunk_is_header_only() {
        let frame = encode_frame(b"");
        assert_eq!(frame.len(), FRAME_HEADER_SIZE);
    }
}
