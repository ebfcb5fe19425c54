//! HCI commands and their return parameters.
//!
//! Each command knows its opcode and how to encode its parameters; each
//! response type knows how to decode itself from the return parameters that
//! follow the status byte of a Command Complete event. The set is the minimum
//! a peripheral needs to reach an advertising, connectable state.

use std::fmt;

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

use crate::advertise::{AdvertisingData, AdvertisingParameters};
use crate::coding::{self, BufExt, BufMutExt, Codec};
use crate::packet::PACKET_TYPE_COMMAND;
use crate::BdAddr;

/// A command opcode: ten bits of OGF and six bits of OCF, treated as opaque.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct Opcode(pub u16);

impl Codec for Opcode {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        Ok(Self(buf.get()?))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write(self.0);
    }
}

macro_rules! opcodes {
    {$($(#[$doc:meta])* $name:ident = $val:expr,)*} => {
        impl Opcode {
            $($(#[$doc])* pub const $name: Opcode = Opcode($val);)*
        }

        impl fmt::Debug for Opcode {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    _ => write!(f, "Opcode({:#06x})", self.0),
                }
            }
        }
    }
}

opcodes! {
    /// Controller & Baseband: Set Event Mask.
    SET_EVENT_MASK = 0x0c01,
    /// Controller & Baseband: Reset.
    RESET = 0x0c03,
    /// Informational: Read BD_ADDR.
    READ_BD_ADDR = 0x1009,
    /// LE: Set Event Mask.
    LE_SET_EVENT_MASK = 0x2001,
    /// LE: Read Buffer Size.
    LE_READ_BUFFER_SIZE = 0x2002,
    /// LE: Set Advertising Parameters.
    LE_SET_ADVERTISING_PARAMETERS = 0x2006,
    /// LE: Set Advertising Data.
    LE_SET_ADVERTISING_DATA = 0x2008,
    /// LE: Set Advertising Enable.
    LE_SET_ADVERTISING_ENABLE = 0x200a,
    /// LE: Read Filter Accept List Size.
    READ_FILTER_ACCEPT_LIST_SIZE = 0x200f,
    /// LE: Clear Filter Accept List.
    CLEAR_FILTER_ACCEPT_LIST = 0x2010,
    /// LE: Read Supported States.
    LE_READ_SUPPORTED_STATES = 0x201c,
}

/// A controller status code; zero is success.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Status(pub u8);

impl Status {
    /// The success status.
    pub const SUCCESS: Status = Status(0x00);

    /// Whether the status reports success.
    pub fn is_success(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Status({:#04x})", self.0)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// A host-to-controller command with a fixed opcode.
pub trait Command {
    /// The opcode this command is issued and correlated under.
    const OPCODE: Opcode;
    /// Decoded representation of the return parameters after the status byte.
    type Response: ResponseParams;

    /// Append the command parameters to `buf`.
    fn encode_params<B: BufMut>(&self, buf: &mut B);

    /// Encode the whole command packet, including the type discriminator.
    fn encode(&self) -> Vec<u8> {
        let mut params = Vec::new();
        self.encode_params(&mut params);
        debug_assert!(params.len() <= usize::from(u8::MAX));
        let mut buf = Vec::with_capacity(4 + params.len());
        buf.write(PACKET_TYPE_COMMAND);
        buf.write(Self::OPCODE);
        buf.write(params.len() as u8);
        buf.put_slice(&params);
        buf
    }
}

/// Return parameters of a command, after the leading status byte.
pub trait ResponseParams: Sized {
    /// Decode from the bytes following the status byte.
    fn decode(params: &mut Bytes) -> Result<Self, ResponseDecodeError>;
}

/// The return parameters of a Command Complete did not match the command.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("malformed return parameters")]
pub struct ResponseDecodeError;

impl From<coding::UnexpectedEnd> for ResponseDecodeError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        Self
    }
}

impl ResponseParams for () {
    fn decode(_: &mut Bytes) -> Result<Self, ResponseDecodeError> {
        Ok(())
    }
}

impl ResponseParams for u8 {
    fn decode(params: &mut Bytes) -> Result<Self, ResponseDecodeError> {
        Ok(params.get()?)
    }
}

impl ResponseParams for u64 {
    fn decode(params: &mut Bytes) -> Result<Self, ResponseDecodeError> {
        Ok(params.get()?)
    }
}

impl ResponseParams for BdAddr {
    fn decode(params: &mut Bytes) -> Result<Self, ResponseDecodeError> {
        Ok(params.get()?)
    }
}

/// Event mask bits for Set Event Mask (Core spec Vol 4 Part E §7.3.1).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct EventMask(pub u64);

impl EventMask {
    /// Disconnection Complete event.
    pub const DISCONNECTION_COMPLETE: EventMask = EventMask(1 << 4);
    /// Encryption Change event.
    pub const ENCRYPTION_CHANGE: EventMask = EventMask(1 << 7);
    /// Hardware Error event.
    pub const HARDWARE_ERROR: EventMask = EventMask(1 << 15);
    /// Encryption Key Refresh Complete event.
    pub const ENCRYPTION_KEY_REFRESH_COMPLETE: EventMask = EventMask(1 << 47);
    /// LE Meta event.
    pub const LE_META: EventMask = EventMask(1 << 61);
}

impl std::ops::BitOr for EventMask {
    type Output = EventMask;
    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

/// Event mask bits for LE Set Event Mask (§7.8.1).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct LeEventMask(pub u64);

impl LeEventMask {
    /// LE Connection Complete event.
    pub const CONNECTION_COMPLETE: LeEventMask = LeEventMask(1 << 0);
    /// LE Advertising Report event.
    pub const ADVERTISING_REPORT: LeEventMask = LeEventMask(1 << 1);
    /// LE Connection Update Complete event.
    pub const CONNECTION_UPDATE_COMPLETE: LeEventMask = LeEventMask(1 << 2);
    /// LE Read Remote Features Complete event.
    pub const READ_REMOTE_FEATURES_COMPLETE: LeEventMask = LeEventMask(1 << 3);
    /// LE Long Term Key Request event.
    pub const LONG_TERM_KEY_REQUEST: LeEventMask = LeEventMask(1 << 4);
}

impl std::ops::BitOr for LeEventMask {
    type Output = LeEventMask;
    fn bitor(self, rhs: LeEventMask) -> LeEventMask {
        LeEventMask(self.0 | rhs.0)
    }
}

/// Reset the controller to its power-on state.
#[derive(Debug, Clone, Copy)]
pub struct Reset;

impl Command for Reset {
    const OPCODE: Opcode = Opcode::RESET;
    type Response = ();
    fn encode_params<B: BufMut>(&self, _: &mut B) {}
}

/// Read the controller's public device address.
#[derive(Debug, Clone, Copy)]
pub struct ReadBdAddr;

impl Command for ReadBdAddr {
    const OPCODE: Opcode = Opcode::READ_BD_ADDR;
    type Response = BdAddr;
    fn encode_params<B: BufMut>(&self, _: &mut B) {}
}

/// Select which events the controller reports.
#[derive(Debug, Clone, Copy)]
pub struct SetEventMask(pub EventMask);

impl Command for SetEventMask {
    const OPCODE: Opcode = Opcode::SET_EVENT_MASK;
    type Response = ();
    fn encode_params<B: BufMut>(&self, buf: &mut B) {
        buf.write(self.0 .0);
    }
}

/// Select which LE Meta subevents the controller reports.
#[derive(Debug, Clone, Copy)]
pub struct LeSetEventMask(pub LeEventMask);

impl Command for LeSetEventMask {
    const OPCODE: Opcode = Opcode::LE_SET_EVENT_MASK;
    type Response = ();
    fn encode_params<B: BufMut>(&self, buf: &mut B) {
        buf.write(self.0 .0);
    }
}

/// Read the controller's LE ACL (and optionally ISO) buffer dimensions.
#[derive(Debug, Clone, Copy)]
pub struct LeReadBufferSize;

/// Return parameters of [`LeReadBufferSize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeBufferSize {
    /// Largest ACL data payload the controller accepts per packet.
    pub acl_data_packet_length: u16,
    /// Number of ACL data packets the controller can buffer.
    pub total_num_acl_data_packets: u8,
    /// ISO payload size, when the controller reports the v2 parameters.
    pub iso_data_packet_length: Option<u16>,
    /// ISO packet count, when the controller reports the v2 parameters.
    pub total_num_iso_data_packets: Option<u8>,
}

impl Command for LeReadBufferSize {
    const OPCODE: Opcode = Opcode::LE_READ_BUFFER_SIZE;
    type Response = LeBufferSize;
    fn encode_params<B: BufMut>(&self, _: &mut B) {}
}

impl ResponseParams for LeBufferSize {
    fn decode(params: &mut Bytes) -> Result<Self, ResponseDecodeError> {
        let acl_data_packet_length = params.get()?;
        let total_num_acl_data_packets = params.get()?;
        let (iso_data_packet_length, total_num_iso_data_packets) = if params.has_remaining() {
            (Some(params.get()?), Some(params.get()?))
        } else {
            (None, None)
        };
        Ok(Self {
            acl_data_packet_length,
            total_num_acl_data_packets,
            iso_data_packet_length,
            total_num_iso_data_packets,
        })
    }
}

/// Read the LE states and state combinations the controller supports.
#[derive(Debug, Clone, Copy)]
pub struct LeReadSupportedStates;

impl Command for LeReadSupportedStates {
    const OPCODE: Opcode = Opcode::LE_READ_SUPPORTED_STATES;
    type Response = u64;
    fn encode_params<B: BufMut>(&self, _: &mut B) {}
}

/// Empty the filter accept list.
#[derive(Debug, Clone, Copy)]
pub struct ClearFilterAcceptList;

impl Command for ClearFilterAcceptList {
    const OPCODE: Opcode = Opcode::CLEAR_FILTER_ACCEPT_LIST;
    type Response = ();
    fn encode_params<B: BufMut>(&self, _: &mut B) {}
}

/// Read the capacity of the filter accept list.
#[derive(Debug, Clone, Copy)]
pub struct ReadFilterAcceptListSize;

impl Command for ReadFilterAcceptListSize {
    const OPCODE: Opcode = Opcode::READ_FILTER_ACCEPT_LIST_SIZE;
    type Response = u8;
    fn encode_params<B: BufMut>(&self, _: &mut B) {}
}

/// Install assembled advertising data.
///
/// The parameter block is a fixed 32 bytes: the significant length followed
/// by the data padded out to 31 bytes.
#[derive(Debug, Clone, Copy)]
pub struct LeSetAdvertisingData(pub AdvertisingData);

impl Command for LeSetAdvertisingData {
    const OPCODE: Opcode = Opcode::LE_SET_ADVERTISING_DATA;
    type Response = ();
    fn encode_params<B: BufMut>(&self, buf: &mut B) {
        buf.write(self.0.significant_len());
        buf.put_slice(self.0.padded());
    }
}

/// Configure undirected advertising.
#[derive(Debug, Clone, Copy)]
pub struct LeSetAdvertisingParameters(pub AdvertisingParameters);

impl Command for LeSetAdvertisingParameters {
    const OPCODE: Opcode = Opcode::LE_SET_ADVERTISING_PARAMETERS;
    type Response = ();
    fn encode_params<B: BufMut>(&self, buf: &mut B) {
        let p = &self.0;
        buf.write(p.interval_min);
        buf.write(p.interval_max);
        buf.write(p.kind as u8);
        buf.write(u8::from(p.own_addr_kind));
        buf.write(u8::from(p.peer_addr_kind));
        buf.write(p.peer_addr);
        buf.write(p.channel_map.0);
        buf.write(p.filter_policy as u8);
    }
}

/// Start or stop advertising.
#[derive(Debug, Clone, Copy)]
pub struct LeSetAdvertisingEnable(pub bool);

impl Command for LeSetAdvertisingEnable {
    const OPCODE: Opcode = Opcode::LE_SET_ADVERTISING_ENABLE;
    type Response = ();
    fn encode_params<B: BufMut>(&self, buf: &mut B) {
        buf.write(u8::from(self.0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advertise::AdStructure;
    use hex_literal::hex;

    #[test]
    fn opcode_debug_names() {
        assert_eq!(format!("{:?}", Opcode::RESET), "RESET");
        assert_eq!(format!("{:?}", Opcode(0x1234)), "Opcode(0x1234)");
    }

    #[test]
    fn reset_encoding() {
        assert_eq!(Reset.encode(), hex!("01 03 0c 00"));
    }

    #[test]
    fn event_mask_encoding() {
        let cmd = SetEventMask(
            EventMask::DISCONNECTION_COMPLETE
                | EventMask::ENCRYPTION_CHANGE
                | EventMask::HARDWARE_ERROR
                | EventMask::ENCRYPTION_KEY_REFRESH_COMPLETE
                | EventMask::LE_META,
        );
        assert_eq!(cmd.encode(), hex!("01 01 0c 08 90 80 00 00 00 80 00 20"));
    }

    #[test]
    fn le_buffer_size_v1_and_v2() {
        let mut v1 = Bytes::from_static(&hex!("1b 00 04"));
        let r = LeBufferSize::decode(&mut v1).unwrap();
        assert_eq!(r.acl_data_packet_length, 27);
        assert_eq!(r.total_num_acl_data_packets, 4);
        assert_eq!(r.iso_data_packet_length, None);

        let mut v2 = Bytes::from_static(&hex!("1b 00 04 40 00 02"));
        let r = LeBufferSize::decode(&mut v2).unwrap();
        assert_eq!(r.iso_data_packet_length, Some(0x40));
        assert_eq!(r.total_num_iso_data_packets, Some(2));
    }

    #[test]
    fn advertising_enable_encoding() {
        assert_eq!(LeSetAdvertisingEnable(true).encode(), hex!("01 0a 20 01 01"));
        assert_eq!(LeSetAdvertisingEnable(false).encode(), hex!("01 0a 20 01 00"));
    }

    #[test]
    fn advertising_parameters_defaults() {
        let cmd = LeSetAdvertisingParameters(AdvertisingParameters::default());
        let encoded = cmd.encode();
        assert_eq!(encoded.len(), 4 + 15);
        assert_eq!(
            encoded,
            hex!("01 06 20 0f 00 08 00 08 00 00 00 00 00 00 00 00 00 07 00")
        );
    }

    #[test]
    fn advertising_data_padded_to_31() {
        let data =
            AdvertisingData::from_structures(&[AdStructure::Flags(0x06)]).unwrap();
        let encoded = LeSetAdvertisingData(data).encode();
        assert_eq!(encoded.len(), 4 + 32);
        assert_eq!(&encoded[..8], hex!("01 08 20 20 03 02 01 06"));
        assert!(encoded[8..].iter().all(|&b| b == 0));
    }
}
