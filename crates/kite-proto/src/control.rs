//! Application-control messages
//!
//! Request/response traffic carried on the control channel and on freshly
//! opened socket channels. Layouts are bit-exact:
//!
//! ```text
//! OpenApp            u8 tag=1 | u32 BE len | UTF-8 app name
//! ConnectSocket      u8 tag=2 | u8 retries | u8 kind | u16 BE port | u32 BE descriptor
//! OpenAppResp        u8 flags | u32 BE errno (error) / u32 BE descriptor (ok)
//! ConnectSocketResp  u8 flags | u32 BE errno (error) / empty (ok)
//! ```
//!
//! The flags byte sets bit 7 on every response and bit 6 on errors.

use bytes::Bytes;

use crate::wire::{ByteOrder, WireBuffer, WireCursor, WireError};

/// Response flag bits
pub mod flags {
    /// Bit 7: message is a response.
    pub const RESPONSE: u8 = 0b1000_0000;
    /// Bit 6: response carries an errno instead of a result.
    pub const ERROR: u8 = 0b0100_0000;
}

/// Request tag bytes
pub const TAG_OPEN_APP: u8 = 1;
pub const TAG_CONNECT_SOCKET: u8 = 2;

/// Opaque numeric handle the appliance assigns to a named application.
/// Never reassigned once granted for the life of the session.
pub type AppDescriptor = u32;

/// Socket transport kind carried in ConnectSocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransportKind {
    Stream = 1,
    Datagram = 2,
    SeqPacket = 5,
}

impl TryFrom<u8> for TransportKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            1 => Ok(TransportKind::Stream),
            2 => Ok(TransportKind::Datagram),
            5 => Ok(TransportKind::SeqPacket),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

/// Control-channel request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    /// Ask the appliance to open the named application.
    OpenApp { name: String },
    /// Ask the appliance to connect this channel to an application socket.
    ConnectSocket {
        retries: u8,
        kind: TransportKind,
        port: u16,
        descriptor: AppDescriptor,
    },
}

impl ControlRequest {
    pub fn encode(&self) -> Bytes {
        let mut w = WireBuffer::new();
        match self {
            ControlRequest::OpenApp { name } => {
                w.put_u8(TAG_OPEN_APP).put_str(name);
            }
            ControlRequest::ConnectSocket {
                retries,
                kind,
                port,
                descriptor,
            } => {
                w.put_u8(TAG_CONNECT_SOCKET)
                    .put_u8(*retries)
                    .put_u8(*kind as u8)
                    .put_u16(*port, ByteOrder::Big)
                    .put_u32(*descriptor, ByteOrder::Big);
            }
        }
        w.finish()
    }

    pub fn decode(r: &mut WireCursor) -> Result<Self, WireError> {
        match r.get_u8()? {
            TAG_OPEN_APP => Ok(ControlRequest::OpenApp { name: r.get_str()? }),
            TAG_CONNECT_SOCKET => Ok(ControlRequest::ConnectSocket {
                retries: r.get_u8()?,
                kind: TransportKind::try_from(r.get_u8()?)?,
                port: r.get_u16(ByteOrder::Big)?,
                descriptor: r.get_u32(ByteOrder::Big)?,
            }),
            other => Err(WireError::UnknownTag(other)),
        }
    }
}

/// Read the response flags byte, yielding `Some(errno)` for errors.
fn decode_flags(r: &mut WireCursor) -> Result<Option<u32>, WireError> {
    let f = r.get_u8()?;
    if f & flags::RESPONSE == 0 {
        return Err(WireError::NotAResponse(f));
    }
    if f & flags::ERROR != 0 {
        Ok(Some(r.get_u32(ByteOrder::Big)?))
    } else {
        Ok(None)
    }
}

/// Response to [`ControlRequest::OpenApp`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenAppResponse(pub Result<AppDescriptor, u32>);

impl OpenAppResponse {
    pub fn encode(&self) -> Bytes {
        let mut w = WireBuffer::new();
        match self.0 {
            Ok(descriptor) => {
                w.put_u8(flags::RESPONSE).put_u32(descriptor, ByteOrder::Big);
            }
            Err(errno) => {
                w.put_u8(flags::RESPONSE | flags::ERROR)
                    .put_u32(errno, ByteOrder::Big);
            }
        }
        w.finish()
    }

    pub fn decode(r: &mut WireCursor) -> Result<Self, WireError> {
        Ok(match decode_flags(r)? {
            Some(errno) => OpenAppResponse(Err(errno)),
            None => OpenAppResponse(Ok(r.get_u32(ByteOrder::Big)?)),
        })
    }
}

/// Response to [`ControlRequest::ConnectSocket`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse(pub Result<(), u32>);

impl ConnectResponse {
    pub fn encode(&self) -> Bytes {
        let mut w = WireBuffer::new();
        match self.0 {
            Ok(()) => {
                w.put_u8(flags::RESPONSE);
            }
            Err(errno) => {
                w.put_u8(flags::RESPONSE | flags::ERROR)
                    .put_u32(errno, ByteOrder::Big);
            }
        }
        w.finish()
    }

    pub fn decode(r: &mut WireCursor) -> Result<Self, WireError> {
        Ok(match decode_flags(r)? {
            Some(errno) => ConnectResponse(Err(errno)),
            None => ConnectResponse(Ok(())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_app_golden_bytes() {
        let req = ControlRequest::OpenApp {
            name: "files".into(),
        };
        let bytes = req.encode();
        assert_eq!(&bytes[..], b"\x01\x00\x00\x00\x05files");
    }

    #[test]
    fn connect_socket_golden_bytes() {
        let req = ControlRequest::ConnectSocket {
            retries: 7,
            kind: TransportKind::Datagram,
            port: 0x1F90, // 8080
            descriptor: 0x0000_002A,
        };
        let bytes = req.encode();
        assert_eq!(&bytes[..], &[2, 7, 2, 0x1F, 0x90, 0, 0, 0, 0x2A]);
    }

    #[test]
    fn request_round_trip() {
        for req in [
            ControlRequest::OpenApp { name: "".into() },
            ControlRequest::OpenApp {
                name: "a-long-application-identifier".into(),
            },
            ControlRequest::ConnectSocket {
                retries: 0,
                kind: TransportKind::Stream,
                port: 443,
                descriptor: u32::MAX,
            },
            ControlRequest::ConnectSocket {
                retries: 7,
                kind: TransportKind::SeqPacket,
                port: 0,
                descriptor: 0,
            },
        ] {
            let mut r = WireCursor::new(req.encode());
            assert_eq!(ControlRequest::decode(&mut r).unwrap(), req);
            assert_eq!(r.remaining(), 0);
        }
    }

    #[test]
    fn unknown_tag_rejected() {
        let mut r = WireCursor::new(Bytes::from_static(&[9, 0, 0, 0, 0]));
        assert!(matches!(
            ControlRequest::decode(&mut r),
            Err(WireError::UnknownTag(9))
        ));
    }

    #[test]
    fn unknown_transport_kind_rejected() {
        let mut r = WireCursor::new(Bytes::from_static(&[2, 0, 3, 0, 80, 0, 0, 0, 1]));
        assert!(matches!(
            ControlRequest::decode(&mut r),
            Err(WireError::UnknownKind(3))
        ));
    }

    #[test]
    fn open_app_response_ok() {
        let resp = OpenAppResponse(Ok(7));
        let bytes = resp.encode();
        assert_eq!(&bytes[..], &[0x80, 0, 0, 0, 7]);
        let mut r = WireCursor::new(bytes);
        assert_eq!(OpenAppResponse::decode(&mut r).unwrap(), resp);
    }

    #[test]
    fn open_app_response_error() {
        let resp = OpenAppResponse(Err(13)); // EACCES
        let bytes = resp.encode();
        assert_eq!(&bytes[..], &[0xC0, 0, 0, 0, 13]);
        let mut r = WireCursor::new(bytes);
        assert_eq!(OpenAppResponse::decode(&mut r).unwrap(), resp);
    }

    #[test]
    fn connect_response_ok_is_one_byte() {
        let resp = ConnectResponse(Ok(()));
        let bytes = resp.encode();
        assert_eq!(&bytes[..], &[0x80]);
        let mut r = WireCursor::new(bytes);
        assert_eq!(ConnectResponse::decode(&mut r).unwrap(), resp);
    }

    #[test]
    fn connect_response_error_round_trip() {
        let resp = ConnectResponse(Err(111)); // ECONNREFUSED
        let mut r = WireCursor::new(resp.encode());
        assert_eq!(ConnectResponse::decode(&mut r).unwrap(), resp);
    }

    #[test]
    fn response_marker_bit_is_required() {
        let mut r = WireCursor::new(Bytes::from_static(&[0x40, 0, 0, 0, 1]));
        assert!(matches!(
            OpenAppResponse::decode(&mut r),
            Err(WireError::NotAResponse(0x40))
        ));
    }

    #[test]
    fn truncated_response_fails_bounds() {
        let mut r = WireCursor::new(Bytes::from_static(&[0xC0, 0, 0]));
        assert!(matches!(
            ConnectResponse::decode(&mut r),
            Err(WireError::Bounds { .. })
        ));
    }
}
