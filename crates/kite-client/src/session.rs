//! Flock session
//!
//! [`FlockSession`] drives discovery, authentication and peer-transport
//! negotiation against a flock signaling endpoint, then hands out tunnel
//! sockets to named applications on the appliance.
//!
//! The protocol logic lives in [`Machine`], a pure transition function over
//! `(state, input)` pairs; a background driver task interprets its effects
//! against the signaling line, the peer transport and the control channel.
//! The caller talks to the driver through command/event channels.

use bytes::Bytes;
use kite_proto::persona::parse_personas;
use kite_proto::signaling::{self, Credential, LineCode};
use kite_proto::{ControlRequest, OpenAppResponse, Persona, TransportKind, WireCursor};
use kite_transport::{
    ChannelEvent, ChannelInit, ChannelReliability, DataChannel, PeerConnector, PeerEvent,
    PeerTransport, SignalingChannel, SignalingItem, TransportResult,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::apps::{Action, AppRequests, BatchGoal};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::socket::{self, SocketParams, TunnelSocket};

/// Label of the channel carrying OpenApp traffic.
const CONTROL_CHANNEL_LABEL: &str = "kite-control";

/// Session lifecycle states. Transitions are monotonic except for the
/// universal transition to `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No appliance chosen yet.
    Connecting,
    /// Appliance chosen, awaiting the persona challenge.
    Connected,
    /// Accumulating persona records from payload frames.
    CollectingPersonas,
    /// Persona list delivered; waiting for the caller to log in.
    ReadyToLogin,
    /// Transport negotiation may begin.
    StartIce,
    /// Remote offer announced; more candidates expected.
    OfferReceived,
    /// The control channel is open; the session is usable.
    Complete,
    /// Terminal failure.
    Error,
}

/// Events delivered to the session owner.
#[derive(Debug)]
pub enum SessionEvent {
    /// The flock needs an appliance name; answer with
    /// [`FlockSession::set_appliance`].
    NeedsAppliance,
    /// The appliance's personas; answer with [`FlockSession::login`].
    NeedsPersonas(Vec<Persona>),
    /// Login succeeded and the control channel is open.
    Ready,
    /// The session failed. Recoverable variants
    /// ([`SessionError::ApplianceNotFound`]) leave the session alive;
    /// everything else is terminal.
    Error(SessionError),
}

/// What arrived on the wire (or from the control channel), as the machine
/// sees it.
enum Input {
    Line(LineCode),
    Blob(Bytes),
    ControlOpen,
}

/// What the driver must do after a transition.
enum Effect {
    /// 404: clear the appliance and re-prompt the caller.
    ApplianceUnknown,
    /// 403 ended the persona list.
    NeedsPersonas(Vec<Persona>),
    /// 150/151 in StartIce: create the peer and the control channel.
    BeginNegotiation,
    /// Apply the remote SDP offer, answer it, flush buffered candidates.
    RemoteOffer(String),
    /// Apply one remote ICE candidate.
    RemoteCandidate(String),
    /// The remote side finished candidate exchange.
    RemoteComplete,
    /// The control channel opened; the session is complete.
    Ready,
    /// The input was outside the transition table (or malformed).
    Fail(SessionError),
}

/// Which kind of payload frame the next blob carries, decided by the
/// preceding line code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExpectBlob {
    Nothing,
    Offer,
    Candidate,
}

/// Pure protocol state machine. All wire inputs funnel through
/// [`Machine::step`]; the driver interprets the returned effects.
struct Machine {
    state: SessionState,
    expect: ExpectBlob,
    personas: Vec<Persona>,
}

impl Machine {
    fn new(appliance_known: bool) -> Self {
        Self {
            state: if appliance_known {
                SessionState::Connected
            } else {
                SessionState::Connecting
            },
            expect: ExpectBlob::Nothing,
            personas: Vec::new(),
        }
    }

    #[cfg(test)]
    fn at(state: SessionState) -> Self {
        Self {
            state,
            expect: ExpectBlob::Nothing,
            personas: Vec::new(),
        }
    }

    fn state(&self) -> SessionState {
        self.state
    }

    /// The caller supplied an appliance name during discovery.
    fn choose_appliance(&mut self) {
        if self.state == SessionState::Connecting {
            self.state = SessionState::Connected;
        }
    }

    fn step(&mut self, input: Input) -> Vec<Effect> {
        match input {
            Input::Line(code) => self.on_line(code),
            Input::Blob(payload) => self.on_blob(payload),
            Input::ControlOpen => match self.state {
                SessionState::Complete | SessionState::Error => Vec::new(),
                _ => {
                    self.state = SessionState::Complete;
                    vec![Effect::Ready]
                }
            },
        }
    }

    fn on_line(&mut self, code: LineCode) -> Vec<Effect> {
        use LineCode as L;
        use SessionState as S;
        match (self.state, code) {
            (S::Error, _) => Vec::new(),
            (S::Connecting, L::ApplianceUnknown) => vec![Effect::ApplianceUnknown],
            (S::Connected, L::ApplianceUnknown) => {
                // The pre-chosen appliance is unknown: fall back to discovery.
                self.state = S::Connecting;
                vec![Effect::ApplianceUnknown]
            }
            (S::Connected, L::PersonasBegin) => {
                self.state = S::CollectingPersonas;
                self.personas.clear();
                Vec::new()
            }
            (S::CollectingPersonas, L::ChallengeRequired) => {
                self.state = S::ReadyToLogin;
                vec![Effect::NeedsPersonas(self.personas.clone())]
            }
            (S::ReadyToLogin, L::Proceed) => {
                self.state = S::StartIce;
                Vec::new()
            }
            (S::StartIce, L::OfferFollows) => {
                self.state = S::OfferReceived;
                self.expect = ExpectBlob::Offer;
                vec![Effect::BeginNegotiation]
            }
            (S::StartIce, L::CandidatesDone) => {
                // Standalone 151: the offer still follows, but the remote
                // side has nothing further to exchange.
                self.expect = ExpectBlob::Offer;
                vec![Effect::BeginNegotiation, Effect::RemoteComplete]
            }
            (S::OfferReceived | S::Complete, L::OfferFollows) => {
                self.expect = ExpectBlob::Candidate;
                Vec::new()
            }
            (S::OfferReceived | S::Complete, L::CandidatesDone) => vec![Effect::RemoteComplete],
            (state, code) => self.fail(SessionError::UnexpectedLine {
                state,
                code: code.code(),
            }),
        }
    }

    fn on_blob(&mut self, payload: Bytes) -> Vec<Effect> {
        use SessionState as S;
        match self.state {
            S::Error => Vec::new(),
            S::CollectingPersonas => match parse_personas(&payload) {
                Ok(records) => {
                    self.personas.extend(records);
                    Vec::new()
                }
                Err(err) => self.fail(err.into()),
            },
            S::StartIce | S::OfferReceived | S::Complete => match self.expect {
                ExpectBlob::Offer => {
                    self.expect = ExpectBlob::Nothing;
                    self.text_blob(payload, Effect::RemoteOffer)
                }
                ExpectBlob::Candidate => {
                    self.expect = ExpectBlob::Nothing;
                    self.text_blob(payload, Effect::RemoteCandidate)
                }
                ExpectBlob::Nothing => {
                    self.fail(SessionError::ProtocolViolation(
                        "unannounced payload frame".into(),
                    ))
                }
            },
            _ => self.fail(SessionError::ProtocolViolation(
                "payload frame outside a payload-bearing state".into(),
            )),
        }
    }

    fn text_blob(&mut self, payload: Bytes, make: impl FnOnce(String) -> Effect) -> Vec<Effect> {
        match std::str::from_utf8(&payload) {
            Ok(text) => vec![make(text.to_owned())],
            Err(err) => self.fail(SessionError::ProtocolViolation(err.to_string())),
        }
    }

    fn fail(&mut self, err: SessionError) -> Vec<Effect> {
        self.state = SessionState::Error;
        vec![Effect::Fail(err)]
    }
}

enum Command {
    SetAppliance {
        name: String,
        resp: oneshot::Sender<Result<(), SessionError>>,
    },
    Login {
        persona_id: String,
        credential: Credential,
        resp: oneshot::Sender<Result<(), SessionError>>,
    },
    RequestApps {
        names: Vec<String>,
        resp: oneshot::Sender<Result<(), SessionError>>,
    },
    OpenSocket {
        app: String,
        port: u16,
        kind: TransportKind,
        resp: oneshot::Sender<Result<TunnelSocket, SessionError>>,
    },
    Close {
        resp: oneshot::Sender<()>,
    },
}

/// Handle to a running flock session.
pub struct FlockSession {
    cmd_tx: mpsc::Sender<Command>,
}

impl FlockSession {
    /// Open the signaling line and start the session driver. Events arrive
    /// on the returned receiver; the first one is
    /// [`SessionEvent::NeedsAppliance`] unless the config named an
    /// appliance.
    pub async fn connect<C>(
        config: SessionConfig,
        connector: C,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>), SessionError>
    where
        C: PeerConnector + 'static,
    {
        let id = format!("flock-{}", Uuid::new_v4());
        let mut signaling = connector.open_signaling(&config.endpoint).await?;
        info!("[{}] signaling line open to {}", id, config.endpoint);

        if let Some(name) = &config.appliance {
            signaling.send_line(name).await?;
            debug!("[{}] requested appliance {:?}", id, name);
        }

        let machine = Machine::new(config.appliance.is_some());
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::channel(64);
        let apps = AppRequests::new(config.app_open_timeout);
        let driver = Driver {
            config,
            connector,
            signaling: Some(signaling),
            peer: None,
            peer_events_done: false,
            control: None,
            machine,
            apps,
            pending_candidates: Vec::new(),
            answer_sent: false,
            local_complete: false,
            local_done_pending: false,
            remote_complete: false,
            control_ready: false,
            login_pending: false,
            events: event_tx,
            cmd_rx,
            id,
        };
        tokio::spawn(driver.run());
        Ok((Self { cmd_tx }, event_rx))
    }

    /// Name the appliance during discovery (after a
    /// [`SessionEvent::NeedsAppliance`] prompt).
    pub async fn set_appliance(&self, name: &str) -> Result<(), SessionError> {
        self.exec(|resp| Command::SetAppliance {
            name: name.to_owned(),
            resp,
        })
        .await
    }

    /// Submit credentials for one of the offered personas. Success is
    /// signaled by [`SessionEvent::Ready`]; a session error before that is
    /// an authentication failure.
    pub async fn login(&self, persona_id: &str, credential: Credential) -> Result<(), SessionError> {
        self.exec(|resp| Command::Login {
            persona_id: persona_id.to_owned(),
            credential,
            resp,
        })
        .await
    }

    /// Open the named applications, one request at a time. Names already
    /// registered cost no wire traffic; any denial or timeout fails the
    /// whole batch.
    pub async fn request_apps(&self, names: &[&str]) -> Result<(), SessionError> {
        self.exec(|resp| Command::RequestApps {
            names: names.iter().map(|s| s.to_string()).collect(),
            resp,
        })
        .await
    }

    /// Open a virtual socket to an application endpoint, registering the
    /// application first if needed.
    pub async fn open_socket(
        &self,
        app: &str,
        port: u16,
        kind: TransportKind,
    ) -> Result<TunnelSocket, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::OpenSocket {
                app: app.to_owned(),
                port,
                kind,
                resp: tx,
            })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Tear the session down, closing the signaling line, control channel
    /// and peer, and failing pending application requests.
    pub async fn close(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Close { resp: tx })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    async fn exec(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), SessionError>>) -> Command,
    ) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }
}

enum Flow {
    Continue,
    Shutdown,
}

type PeerChannel<C> = <<C as PeerConnector>::Peer as PeerTransport>::Channel;

struct Driver<C: PeerConnector> {
    config: SessionConfig,
    connector: C,
    signaling: Option<C::Signaling>,
    peer: Option<C::Peer>,
    peer_events_done: bool,
    control: Option<PeerChannel<C>>,
    machine: Machine,
    apps: AppRequests,
    /// Local candidates discovered before the answer went out, in
    /// discovery order.
    pending_candidates: Vec<String>,
    answer_sent: bool,
    local_complete: bool,
    /// Gathering finished before the answer was transmitted.
    local_done_pending: bool,
    remote_complete: bool,
    control_ready: bool,
    login_pending: bool,
    events: mpsc::Sender<SessionEvent>,
    cmd_rx: mpsc::Receiver<Command>,
    id: String,
}

impl<C: PeerConnector + 'static> Driver<C> {
    async fn run(mut self) {
        if self.config.appliance.is_none() {
            self.emit(SessionEvent::NeedsAppliance).await;
        }
        loop {
            let app_deadline = self.apps.deadline();
            let step = tokio::select! {
                item = next_signaling(&mut self.signaling) => self.on_signaling(item).await,
                ev = next_peer(&mut self.peer, self.peer_events_done) => self.on_peer(ev).await,
                ev = next_control(&mut self.control) => self.on_control(ev).await,
                cmd = self.cmd_rx.recv() => self.on_command(cmd).await,
                _ = sleep_opt(app_deadline) => self.on_app_timeout().await,
            };
            match step {
                Ok(Flow::Continue) => {}
                Ok(Flow::Shutdown) => break,
                Err(err) => {
                    self.fatal(err).await;
                    break;
                }
            }
        }
        debug!("[{}] session driver ended", self.id);
    }

    async fn on_signaling(
        &mut self,
        item: TransportResult<Option<SignalingItem>>,
    ) -> Result<Flow, SessionError> {
        match item {
            Ok(Some(SignalingItem::Line(line))) => {
                let code = signaling::parse_line(&line)?;
                debug!("[{}] <- line {}", self.id, code.code());
                let effects = self.machine.step(Input::Line(code));
                self.apply(effects).await
            }
            Ok(Some(SignalingItem::Blob(payload))) => {
                debug!("[{}] <- payload frame ({} bytes)", self.id, payload.len());
                let effects = self.machine.step(Input::Blob(payload));
                self.apply(effects).await
            }
            Ok(None) => {
                // Remote hung up. Expected once candidate exchange finished
                // or the session completed; fatal any earlier.
                self.signaling = None;
                if self.machine.state() == SessionState::Complete
                    || (self.local_complete && self.remote_complete)
                {
                    Ok(Flow::Continue)
                } else {
                    Err(kite_transport::TransportError::ChannelClosed.into())
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn on_peer(
        &mut self,
        event: TransportResult<Option<PeerEvent>>,
    ) -> Result<Flow, SessionError> {
        match event {
            Ok(Some(PeerEvent::LocalCandidate(Some(candidate)))) => {
                if self.answer_sent {
                    self.send_line(&candidate).await?;
                } else {
                    // A single text channel cannot interleave the answer and
                    // candidates out of order; hold them until the answer is
                    // on the wire.
                    self.pending_candidates.push(candidate);
                }
                Ok(Flow::Continue)
            }
            Ok(Some(PeerEvent::LocalCandidate(None))) => {
                if self.answer_sent {
                    self.finish_local_candidates().await?;
                } else {
                    self.local_done_pending = true;
                }
                Ok(Flow::Continue)
            }
            Ok(None) => {
                warn!("[{}] peer event stream ended", self.id);
                self.peer_events_done = true;
                Ok(Flow::Continue)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn on_control(
        &mut self,
        event: TransportResult<Option<ChannelEvent>>,
    ) -> Result<Flow, SessionError> {
        match event {
            Ok(Some(ChannelEvent::Open)) => {
                info!("[{}] control channel open", self.id);
                let effects = self.machine.step(Input::ControlOpen);
                self.apply(effects).await
            }
            Ok(Some(ChannelEvent::Message(data))) => {
                if !self.apps.has_inflight() {
                    warn!(
                        "[{}] unexpected control message ({} bytes)",
                        self.id,
                        data.len()
                    );
                    return Ok(Flow::Continue);
                }
                let mut cursor = WireCursor::new(data);
                let response = OpenAppResponse::decode(&mut cursor)?;
                let actions = self.apps.on_response(response.0);
                self.run_app_actions(actions).await?;
                Ok(Flow::Continue)
            }
            Ok(Some(ChannelEvent::BufferedLow)) => Ok(Flow::Continue),
            Ok(Some(ChannelEvent::Closed)) | Ok(None) => {
                Err(kite_transport::TransportError::ChannelClosed.into())
            }
            Ok(Some(ChannelEvent::Error(reason))) => {
                Err(kite_transport::TransportError::ConnectionFailed(reason).into())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn on_command(&mut self, cmd: Option<Command>) -> Result<Flow, SessionError> {
        let Some(cmd) = cmd else {
            // Handle dropped: tear everything down quietly.
            self.shutdown(None).await;
            return Ok(Flow::Shutdown);
        };
        match cmd {
            Command::SetAppliance { name, resp } => {
                if self.machine.state() != SessionState::Connecting {
                    let _ = resp.send(Err(SessionError::NotReady));
                    return Ok(Flow::Continue);
                }
                self.send_line(&name).await?;
                debug!("[{}] requested appliance {:?}", self.id, name);
                self.machine.choose_appliance();
                self.config.appliance = Some(name);
                let _ = resp.send(Ok(()));
                Ok(Flow::Continue)
            }
            Command::Login {
                persona_id,
                credential,
                resp,
            } => {
                if self.machine.state() != SessionState::ReadyToLogin {
                    let _ = resp.send(Err(SessionError::NotReady));
                    return Ok(Flow::Continue);
                }
                self.send_line(&persona_id).await?;
                self.send_line(&credential.to_string()).await?;
                debug!("[{}] submitted credentials for persona {:?}", self.id, persona_id);
                self.login_pending = true;
                let _ = resp.send(Ok(()));
                Ok(Flow::Continue)
            }
            Command::RequestApps { names, resp } => {
                if !self.control_ready {
                    let _ = resp.send(Err(SessionError::NotReady));
                    return Ok(Flow::Continue);
                }
                let actions = self.apps.submit(names, BatchGoal::Apps(resp));
                self.run_app_actions(actions).await?;
                Ok(Flow::Continue)
            }
            Command::OpenSocket {
                app,
                port,
                kind,
                resp,
            } => {
                if !self.control_ready {
                    let _ = resp.send(Err(SessionError::NotReady));
                    return Ok(Flow::Continue);
                }
                if self.apps.descriptor(&app).is_some() {
                    self.open_socket_channel(app, port, kind, resp).await?;
                } else {
                    let actions = self.apps.submit(
                        vec![app.clone()],
                        BatchGoal::Socket {
                            app,
                            port,
                            kind,
                            resp,
                        },
                    );
                    self.run_app_actions(actions).await?;
                }
                Ok(Flow::Continue)
            }
            Command::Close { resp } => {
                info!("[{}] closing session", self.id);
                self.shutdown(Some(resp)).await;
                Ok(Flow::Shutdown)
            }
        }
    }

    async fn on_app_timeout(&mut self) -> Result<Flow, SessionError> {
        warn!("[{}] application open timed out", self.id);
        let actions = self.apps.on_timeout();
        self.run_app_actions(actions).await?;
        Ok(Flow::Continue)
    }

    async fn apply(&mut self, effects: Vec<Effect>) -> Result<Flow, SessionError> {
        for effect in effects {
            match effect {
                Effect::ApplianceUnknown => {
                    self.config.appliance = None;
                    self.emit(SessionEvent::Error(SessionError::ApplianceNotFound))
                        .await;
                    self.emit(SessionEvent::NeedsAppliance).await;
                }
                Effect::NeedsPersonas(personas) => {
                    info!("[{}] {} persona(s) offered", self.id, personas.len());
                    self.emit(SessionEvent::NeedsPersonas(personas)).await;
                }
                Effect::BeginNegotiation => {
                    let mut peer = self.connector.create_peer().await?;
                    let control = peer
                        .open_channel(ChannelInit::reliable(CONTROL_CHANNEL_LABEL))
                        .await?;
                    debug!("[{}] peer created, control channel requested", self.id);
                    self.peer = Some(peer);
                    self.control = Some(control);
                }
                Effect::RemoteOffer(sdp) => {
                    let peer = self.peer.as_mut().ok_or(SessionError::NotReady)?;
                    peer.set_remote_offer(&sdp).await?;
                    let answer = peer.create_answer().await?;
                    self.send_line(&answer).await?;
                    self.answer_sent = true;
                    debug!("[{}] answer sent, flushing buffered candidates", self.id);
                    for candidate in std::mem::take(&mut self.pending_candidates) {
                        self.send_line(&candidate).await?;
                    }
                    if self.local_done_pending {
                        self.finish_local_candidates().await?;
                    }
                }
                Effect::RemoteCandidate(candidate) => {
                    let peer = self.peer.as_mut().ok_or(SessionError::NotReady)?;
                    peer.add_remote_candidate(&candidate).await?;
                }
                Effect::RemoteComplete => {
                    self.remote_complete = true;
                    self.maybe_close_signaling().await;
                }
                Effect::Ready => {
                    info!("[{}] session complete", self.id);
                    self.control_ready = true;
                    self.login_pending = false;
                    self.emit(SessionEvent::Ready).await;
                }
                Effect::Fail(err) => return Err(err),
            }
        }
        Ok(Flow::Continue)
    }

    async fn run_app_actions(&mut self, actions: Vec<Action>) -> Result<(), SessionError> {
        for action in actions {
            match action {
                Action::Send(name) => {
                    let control = self.control.as_ref().ok_or(SessionError::NotReady)?;
                    debug!("[{}] -> OpenApp {:?}", self.id, name);
                    control
                        .send(ControlRequest::OpenApp { name }.encode())
                        .await?;
                }
                Action::Resolve(goal, result) => match (goal, result) {
                    (BatchGoal::Apps(tx), result) => {
                        let _ = tx.send(result);
                    }
                    (
                        BatchGoal::Socket {
                            app,
                            port,
                            kind,
                            resp,
                        },
                        Ok(()),
                    ) => {
                        self.open_socket_channel(app, port, kind, resp).await?;
                    }
                    (BatchGoal::Socket { resp, .. }, Err(err)) => {
                        let _ = resp.send(Err(err));
                    }
                },
            }
        }
        Ok(())
    }

    async fn open_socket_channel(
        &mut self,
        app: String,
        port: u16,
        kind: TransportKind,
        resp: oneshot::Sender<Result<TunnelSocket, SessionError>>,
    ) -> Result<(), SessionError> {
        let Some(descriptor) = self.apps.descriptor(&app) else {
            let _ = resp.send(Err(SessionError::NotReady));
            return Ok(());
        };
        let Some(peer) = self.peer.as_mut() else {
            let _ = resp.send(Err(SessionError::NotReady));
            return Ok(());
        };
        let reliability = match kind {
            TransportKind::Datagram => ChannelReliability::UnreliableUnordered,
            TransportKind::Stream | TransportKind::SeqPacket => {
                ChannelReliability::ReliableOrdered
            }
        };
        let init = ChannelInit {
            label: format!("{app}:{port}"),
            reliability,
        };
        match peer.open_channel(init).await {
            Ok(channel) => {
                debug!("[{}] opened socket channel {}:{}", self.id, app, port);
                let socket = socket::spawn(
                    channel,
                    SocketParams {
                        app,
                        port,
                        kind,
                        descriptor,
                        connect_retry_base: self.config.connect_retry_base,
                        connect_retry_sends: self.config.connect_retry_sends,
                        max_frame_size: self.config.max_frame_size,
                        low_buffer_watermark: self.config.low_buffer_watermark,
                        burst_yield_bytes: self.config.burst_yield_bytes,
                    },
                );
                let _ = resp.send(Ok(socket));
            }
            Err(err) => {
                // A failed channel open is scoped to this socket, not the
                // session.
                warn!("[{}] socket channel open failed: {}", self.id, err);
                let _ = resp.send(Err(err.into()));
            }
        }
        Ok(())
    }

    async fn send_line(&mut self, line: &str) -> Result<(), SessionError> {
        let signaling = self.signaling.as_mut().ok_or(SessionError::Closed)?;
        signaling.send_line(line).await?;
        Ok(())
    }

    /// Transmit the end-of-candidates marker and close the line if the
    /// remote side is done too.
    async fn finish_local_candidates(&mut self) -> Result<(), SessionError> {
        self.send_line("").await?;
        self.local_complete = true;
        debug!("[{}] local candidate gathering complete", self.id);
        self.maybe_close_signaling().await;
        Ok(())
    }

    /// The signaling line is only needed until both sides finish candidate
    /// exchange.
    async fn maybe_close_signaling(&mut self) {
        if self.local_complete && self.remote_complete {
            if let Some(mut signaling) = self.signaling.take() {
                let _ = signaling.close().await;
                debug!("[{}] signaling line closed", self.id);
            }
        }
    }

    async fn fatal(&mut self, err: SessionError) {
        // Any failure between the login lines and the control-channel open
        // means the appliance rejected the login.
        let err = if self.login_pending && !self.control_ready {
            SessionError::AuthenticationFailed
        } else {
            err
        };
        error!("[{}] session failed: {}", self.id, err);
        for goal in self.apps.abort_all() {
            fail_goal(goal, SessionError::Closed);
        }
        self.emit(SessionEvent::Error(err)).await;
        self.close_resources().await;
    }

    async fn shutdown(&mut self, resp: Option<oneshot::Sender<()>>) {
        for goal in self.apps.abort_all() {
            fail_goal(goal, SessionError::Closed);
        }
        self.close_resources().await;
        if let Some(resp) = resp {
            let _ = resp.send(());
        }
    }

    async fn close_resources(&mut self) {
        if let Some(mut control) = self.control.take() {
            let _ = control.close().await;
        }
        if let Some(mut peer) = self.peer.take() {
            let _ = peer.close().await;
        }
        if let Some(mut signaling) = self.signaling.take() {
            let _ = signaling.close().await;
        }
    }

    async fn emit(&mut self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            debug!("[{}] event receiver dropped", self.id);
        }
    }
}

fn fail_goal(goal: BatchGoal, err: SessionError) {
    match goal {
        BatchGoal::Apps(tx) => {
            let _ = tx.send(Err(err));
        }
        BatchGoal::Socket { resp, .. } => {
            let _ = resp.send(Err(err));
        }
    }
}

async fn next_signaling<S: SignalingChannel>(
    signaling: &mut Option<S>,
) -> TransportResult<Option<SignalingItem>> {
    match signaling.as_mut() {
        Some(signaling) => signaling.next().await,
        None => std::future::pending().await,
    }
}

async fn next_peer<P: PeerTransport>(
    peer: &mut Option<P>,
    done: bool,
) -> TransportResult<Option<PeerEvent>> {
    match peer.as_mut() {
        Some(peer) if !done => peer.next_event().await,
        _ => std::future::pending().await,
    }
}

async fn next_control<Ch: DataChannel>(
    control: &mut Option<Ch>,
) -> TransportResult<Option<ChannelEvent>> {
    match control.as_mut() {
        Some(control) => control.next_event().await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
