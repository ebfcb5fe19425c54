//! Wire protocol layer for the `bluefin` Bluetooth LE host.
//!
//! This crate contains the byte-exact encoders and decoders for the pieces of
//! HCI and L2CAP that a peripheral-role host speaks over an HCI User Channel:
//! HCI command/event/ACL packets, the L2CAP basic frame, the LE-U signalling
//! PDUs used by credit-based channels, and advertising data structures. It is
//! deliberately free of I/O and tasks; the `bluefin` crate drives it.
//!
//! All multi-byte fields are little-endian, per the Bluetooth Core
//! Specification. Every decoder validates the declared lengths against the
//! actual buffer and reports unknown event codes and unknown signalling
//! opcodes as distinct error variants so the caller can decide whether they
//! are ignorable.

#![warn(missing_docs)]

use std::fmt;

use bytes::{Buf, BufMut};

pub mod advertise;
pub mod att;
pub mod cmd;
pub mod coding;
pub mod event;
pub mod frame;
pub mod packet;

use coding::{Codec, UnexpectedEnd};

/// Identifies one ACL logical link between the host and a peer.
///
/// Only the low 12 bits are meaningful on the wire; the upper bits of the ACL
/// data packet header carry the boundary and broadcast flags.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnHandle(pub u16);

impl fmt::Display for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#05x}", self.0)
    }
}

/// A 48-bit Bluetooth device address, stored in wire order (LSB first).
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash)]
pub struct BdAddr(pub [u8; 6]);

impl Codec for BdAddr {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        if buf.remaining() < 6 {
            return Err(UnexpectedEnd);
        }
        let mut octets = [0; 6];
        buf.copy_to_slice(&mut octets);
        Ok(Self(octets))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.0);
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Customary display order is MSB first, the reverse of the wire.
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[5], o[4], o[3], o[2], o[1], o[0]
        )
    }
}

/// Role of the local device on a link, from LE Connection Complete.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Role {
    /// The local device initiated the connection.
    Central,
    /// The local device was the advertiser.
    Peripheral,
}

impl TryFrom<u8> for Role {
    type Error = coding::InvalidValue;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Central),
            0x01 => Ok(Self::Peripheral),
            _ => Err(coding::InvalidValue),
        }
    }
}

impl From<Role> for u8 {
    fn from(role: Role) -> Self {
        match role {
            Role::Central => 0x00,
            Role::Peripheral => 0x01,
        }
    }
}

/// Address kind of a peer device.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AddrKind {
    /// Public device address.
    Public,
    /// Random device address.
    Random,
}

impl TryFrom<u8> for AddrKind {
    type Error = coding::InvalidValue;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Public),
            0x01 => Ok(Self::Random),
            _ => Err(coding::InvalidValue),
        }
    }
}

impl From<AddrKind> for u8 {
    fn from(kind: AddrKind) -> Self {
        match kind {
            AddrKind::Public => 0x00,
            AddrKind::Random => 0x01,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bd_addr_display_reverses_wire_order() {
        let addr = BdAddr([0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
        assert_eq!(addr.to_string(), "11:22:33:44:55:66");
    }
}
