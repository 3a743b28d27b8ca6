//! Kite tunnel client engine
//!
//! Establishes an authenticated session with a remote appliance through a
//! flock signaling server, negotiates a peer transport, and multiplexes
//! virtual sockets to named applications over it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   signaling lines    ┌───────┐
//! │ FlockSession │◄────────────────────►│ flock │
//! └──────┬───────┘                      └───────┘
//!        │ negotiated peer transport
//!        ▼
//! ┌──────────────┐  control channel: OpenApp
//! │ AppRegistry  │◄────────────────────────────► appliance
//! └──────┬───────┘
//!        │ descriptors
//!        ▼
//! ┌──────────────┐  one data channel per socket
//! │ TunnelSocket │◄────────────────────────────► application
//! └──────────────┘
//! ```
//!
//! The peer transport itself (SDP/candidate exchange, data channels) is a
//! capability of the host, injected through the `kite-transport` traits.
//!
//! # Example
//!
//! ```no_run
//! use kite_client::{FlockSession, SessionConfig, SessionEvent};
//! use kite_proto::{Credential, TransportKind};
//!
//! # async fn run<C: kite_transport::PeerConnector + 'static>(connector: C) -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::new("wss://flock.example.com/signal").with_appliance("garage");
//! let (session, mut events) = FlockSession::connect(config, connector).await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SessionEvent::NeedsPersonas(personas) => {
//!             session.login(&personas[0].id, Credential::password("secret")).await?;
//!         }
//!         SessionEvent::Ready => break,
//!         SessionEvent::Error(err) => return Err(err.into()),
//!         SessionEvent::NeedsAppliance => session.set_appliance("garage").await?,
//!     }
//! }
//!
//! let socket = session.open_socket("files", 80, TransportKind::Stream).await?;
//! socket.send_text("GET /index.html").await?;
//! # Ok(())
//! # }
//! ```

mod apps;
mod config;
mod error;
mod session;
mod socket;

pub use config::SessionConfig;
pub use error::{DenyReason, SessionError, SocketError};
pub use session::{FlockSession, SessionEvent, SessionState};
pub use socket::{SocketEvent, TunnelSocket};

// Protocol types callers interact with directly.
pub use kite_proto::{Credential, CredentialScheme, Persona, TransportKind};
