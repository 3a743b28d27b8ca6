//! Kite Tunnel Protocol Definitions
//!
//! This crate defines the wire codec, application-control messages, signaling
//! line vocabulary and persona records for the kite tunnel engine.

pub mod control;
pub mod persona;
pub mod signaling;
pub mod wire;

pub use control::{
    AppDescriptor, ConnectResponse, ControlRequest, OpenAppResponse, TransportKind,
};
pub use persona::{parse_personas, Persona};
pub use signaling::{Credential, CredentialScheme, LineCode};
pub use wire::{ByteOrder, WireBuffer, WireCursor, WireError};

/// Maximum tunnel frame size in bytes, header included
pub const MAX_FRAME_SIZE: usize = 32 * 1024;

/// Data frame header size: tag (1) + reserved (4)
pub const FRAME_HEADER_SIZE: usize = 5;

/// Tag byte carried by data frames
pub const FRAME_TAG_DATA: u8 = 0x01;

/// Magic prefix of persona payload frames
pub const PERSONAS_MAGIC: &str = "KITE PERSONAS";
