//! HCI packet framing.
//!
//! Over a User Channel every read and write carries exactly one packet,
//! prefixed with a one-byte type discriminator. Commands and events carry a
//! one-byte parameter length; ACL data packets carry a twelve-bit connection
//! handle packed with the boundary and broadcast flags, followed by a
//! sixteen-bit payload length.

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

use crate::cmd::Opcode;
use crate::coding::{BufExt, BufMutExt, UnexpectedEnd};
use crate::event::{Event, EventDecodeError};
use crate::ConnHandle;

pub(crate) const PACKET_TYPE_COMMAND: u8 = 0x01;
pub(crate) const PACKET_TYPE_ACL_DATA: u8 = 0x02;
pub(crate) const PACKET_TYPE_EVENT: u8 = 0x04;

/// Packet boundary flag of an ACL data packet.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BoundaryFlag {
    /// First fragment of a non-automatically-flushable PDU (host to controller).
    FirstNonAutoFlushable,
    /// Continuation fragment of a PDU.
    Continuing,
    /// First fragment of an automatically flushable PDU; on receive, the start
    /// of a new L2CAP PDU.
    FirstAutoFlushable,
    /// A complete, unfragmented PDU (deprecated on LE).
    Complete,
}

impl BoundaryFlag {
    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => Self::FirstNonAutoFlushable,
            0b01 => Self::Continuing,
            0b10 => Self::FirstAutoFlushable,
            _ => Self::Complete,
        }
    }

    fn to_bits(self) -> u16 {
        match self {
            Self::FirstNonAutoFlushable => 0b00,
            Self::Continuing => 0b01,
            Self::FirstAutoFlushable => 0b10,
            Self::Complete => 0b11,
        }
    }
}

/// Broadcast flag of an ACL data packet. Always point-to-point on LE.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BroadcastFlag {
    /// Point-to-point traffic.
    PointToPoint,
    /// BR/EDR background broadcast.
    Broadcast,
    /// Reserved value 0b10.
    Reserved2,
    /// Reserved value 0b11.
    Reserved3,
}

impl BroadcastFlag {
    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => Self::PointToPoint,
            0b01 => Self::Broadcast,
            0b10 => Self::Reserved2,
            _ => Self::Reserved3,
        }
    }

    fn to_bits(self) -> u16 {
        match self {
            Self::PointToPoint => 0b00,
            Self::Broadcast => 0b01,
            Self::Reserved2 => 0b10,
            Self::Reserved3 => 0b11,
        }
    }
}

/// One HCI ACL data packet: a fragment of an L2CAP PDU on one link.
#[derive(Debug, Clone)]
pub struct AclPacket {
    /// The link this fragment belongs to.
    pub handle: ConnHandle,
    /// Whether this fragment starts or continues an L2CAP PDU.
    pub boundary: BoundaryFlag,
    /// Broadcast flag; `PointToPoint` for everything this host produces.
    pub broadcast: BroadcastFlag,
    /// Fragment payload.
    pub data: Bytes,
}

impl AclPacket {
    /// Encode the packet, including the packet type discriminator.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5 + self.data.len());
        buf.write(PACKET_TYPE_ACL_DATA);
        let header =
            (self.handle.0 & 0x0fff) | (self.boundary.to_bits() << 12) | (self.broadcast.to_bits() << 14);
        buf.write(header);
        buf.write(self.data.len() as u16);
        buf.put_slice(&self.data);
        buf
    }

    fn decode(mut buf: Bytes) -> Result<Self, PacketDecodeError> {
        let header: u16 = buf.get()?;
        let length: u16 = buf.get()?;
        if buf.len() != usize::from(length) {
            return Err(PacketDecodeError::LengthMismatch);
        }
        Ok(Self {
            handle: ConnHandle(header & 0x0fff),
            boundary: BoundaryFlag::from_bits(header >> 12),
            broadcast: BroadcastFlag::from_bits(header >> 14),
            data: buf,
        })
    }
}

/// Any packet that can appear on the HCI transport.
#[derive(Debug, Clone)]
pub enum Packet {
    /// Host-to-controller command. Decoded only by tests and diagnostics; a
    /// controller never sends one.
    Command {
        /// Command opcode (OGF/OCF packed, treated as opaque).
        opcode: Opcode,
        /// Raw command parameters.
        params: Bytes,
    },
    /// An ACL data fragment.
    Acl(AclPacket),
    /// A controller event.
    Event(Event),
}

/// Reasons a transport-level packet can fail to decode.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketDecodeError {
    /// The buffer ended before the declared structure did.
    #[error("unexpected end of packet")]
    UnexpectedEnd,
    /// The type discriminator byte is not command, ACL data or event.
    #[error("unknown packet type {0:#04x}")]
    UnknownType(u8),
    /// A declared length field disagrees with the packet tail.
    #[error("declared length does not match packet tail")]
    LengthMismatch,
    /// The event body failed to decode.
    #[error(transparent)]
    Event(#[from] EventDecodeError),
}

impl From<UnexpectedEnd> for PacketDecodeError {
    fn from(_: UnexpectedEnd) -> Self {
        Self::UnexpectedEnd
    }
}

impl Packet {
    /// Decode one whole packet as read from the transport.
    pub fn decode(mut buf: Bytes) -> Result<Self, PacketDecodeError> {
        let ty: u8 = buf.get()?;
        match ty {
            PACKET_TYPE_COMMAND => {
                let opcode = Opcode(buf.get()?);
                let param_len: u8 = buf.get()?;
                if buf.len() != usize::from(param_len) {
                    return Err(PacketDecodeError::LengthMismatch);
                }
                Ok(Self::Command { opcode, params: buf })
            }
            PACKET_TYPE_ACL_DATA => Ok(Self::Acl(AclPacket::decode(buf)?)),
            PACKET_TYPE_EVENT => Ok(Self::Event(Event::decode(buf)?)),
            other => Err(PacketDecodeError::UnknownType(other)),
        }
    }

    /// Encode one whole packet, including the type discriminator.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Command { opcode, params } => {
                debug_assert!(params.len() <= usize::from(u8::MAX));
                let mut buf = Vec::with_capacity(4 + params.len());
                buf.write(PACKET_TYPE_COMMAND);
                buf.write(opcode.0);
                buf.write(params.len() as u8);
                buf.put_slice(params);
                buf
            }
            Self::Acl(acl) => acl.encode(),
            Self::Event(event) => {
                let mut buf = Vec::new();
                buf.write(PACKET_TYPE_EVENT);
                event.encode(&mut buf);
                buf
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use hex_literal::hex;

    #[test]
    fn acl_round_trip() {
        let packet = AclPacket {
            handle: ConnHandle(0x0eff),
            boundary: BoundaryFlag::FirstAutoFlushable,
            broadcast: BroadcastFlag::PointToPoint,
            data: Bytes::from_static(b"\x05\x00\x05\x00hello"),
        };
        let encoded = packet.encode();
        assert_eq!(&encoded[..5], hex!("02 ff 2e 09 00"));
        let decoded = match Packet::decode(Bytes::from(encoded.clone())).unwrap() {
            Packet::Acl(acl) => acl,
            other => panic!("incorrect packet {other:?}"),
        };
        assert_eq!(decoded.handle, packet.handle);
        assert_eq!(decoded.boundary, packet.boundary);
        assert_eq!(decoded.broadcast, packet.broadcast);
        assert_eq!(decoded.data, packet.data);
        assert_eq!(Packet::Acl(decoded).encode(), encoded);
    }

    #[test]
    fn acl_continuation_flag() {
        let packet = AclPacket {
            handle: ConnHandle(0x0003),
            boundary: BoundaryFlag::Continuing,
            broadcast: BroadcastFlag::PointToPoint,
            data: Bytes::from_static(b"ab"),
        };
        let encoded = packet.encode();
        assert_eq!(encoded, hex!("02 03 10 02 00 61 62"));
    }

    #[test]
    fn acl_length_mismatch() {
        // Declares 3 payload bytes, carries 2.
        let raw = Bytes::from_static(&hex!("02 03 20 03 00 61 62"));
        assert_matches!(
            Packet::decode(raw),
            Err(PacketDecodeError::LengthMismatch)
        );
    }

    #[test]
    fn unknown_packet_type() {
        let raw = Bytes::from_static(&hex!("03 00 00"));
        assert_matches!(Packet::decode(raw), Err(PacketDecodeError::UnknownType(0x03)));
    }

    #[test]
    fn command_round_trip() {
        let packet = Packet::Command {
            opcode: Opcode::RESET,
            params: Bytes::new(),
        };
        let encoded = packet.encode();
        assert_eq!(encoded, hex!("01 03 0c 00"));
        assert_matches!(
            Packet::decode(Bytes::from(encoded)).unwrap(),
            Packet::Command { opcode: Opcode::RESET, ref params } if params.is_empty()
        );
    }

    #[test]
    fn truncated_packet() {
        assert_matches!(
            Packet::decode(Bytes::from_static(&hex!("02 03"))),
            Err(PacketDecodeError::UnexpectedEnd)
        );
        assert_matches!(
            Packet::decode(Bytes::new()),
            Err(PacketDecodeError::UnexpectedEnd)
        );
    }
}
