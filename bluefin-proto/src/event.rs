//! HCI event decoding.
//!
//! Only the events the host acts on are modeled; anything else decodes to a
//! typed [`EventDecodeError::Unknown`] so the event loop can log and move on
//! without conflating "unknown" with "malformed".

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

use crate::cmd::{Opcode, Status};
use crate::coding::{BufExt, BufMutExt, InvalidValue, UnexpectedEnd};
use crate::{AddrKind, BdAddr, ConnHandle, Role};

const EVENT_DISCONNECTION_COMPLETE: u8 = 0x05;
const EVENT_COMMAND_COMPLETE: u8 = 0x0e;
const EVENT_NUMBER_OF_COMPLETED_PACKETS: u8 = 0x13;
const EVENT_LE_META: u8 = 0x3e;

const LE_META_CONNECTION_COMPLETE: u8 = 0x01;

/// A controller-to-host event the host acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A command finished; carries its return parameters.
    CommandComplete {
        /// Number of command packets the controller will accept next.
        num_hci_command_packets: u8,
        /// Opcode of the completed command.
        opcode: Opcode,
        /// Return parameters; the first byte is the command status.
        return_parameters: Bytes,
    },
    /// The controller freed transmit buffers: `(handle, packets)` pairs.
    NumberOfCompletedPackets(Vec<(ConnHandle, u16)>),
    /// A link went away.
    DisconnectionComplete {
        /// Status of the disconnection itself.
        status: Status,
        /// Handle of the disconnected link.
        handle: ConnHandle,
        /// Controller error code naming the reason.
        reason: u8,
    },
    /// LE Meta: a new LE link was established.
    LeConnectionComplete(LeConnectionComplete),
}

/// Parameters of the LE Connection Complete subevent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeConnectionComplete {
    /// Zero on success; a failed connection attempt otherwise.
    pub status: Status,
    /// Handle assigned to the new link.
    pub handle: ConnHandle,
    /// Local role on the link.
    pub role: Role,
    /// Peer address kind.
    pub peer_addr_kind: AddrKind,
    /// Peer device address.
    pub peer_addr: BdAddr,
    /// Connection interval, in 1.25 ms units.
    pub interval: u16,
    /// Peripheral latency, in connection events.
    pub latency: u16,
    /// Supervision timeout, in 10 ms units.
    pub supervision_timeout: u16,
    /// Central clock accuracy code.
    pub clock_accuracy: u8,
}

/// Reasons an event body can fail to decode.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventDecodeError {
    /// The buffer ended before the declared structure did.
    #[error("unexpected end of event")]
    UnexpectedEnd,
    /// The parameter length disagrees with the buffer tail.
    #[error("event length does not match parameters")]
    LengthMismatch,
    /// An event code this host does not model.
    #[error("unknown event code {code:#04x}")]
    Unknown {
        /// The raw event code.
        code: u8,
    },
    /// An LE Meta subevent this host does not model.
    #[error("unknown LE meta subevent {subevent:#04x}")]
    UnknownLeMeta {
        /// The raw subevent code.
        subevent: u8,
    },
    /// A field held a value outside its assigned range.
    #[error("invalid field value")]
    InvalidValue,
}

impl From<UnexpectedEnd> for EventDecodeError {
    fn from(_: UnexpectedEnd) -> Self {
        Self::UnexpectedEnd
    }
}

impl From<InvalidValue> for EventDecodeError {
    fn from(_: InvalidValue) -> Self {
        Self::InvalidValue
    }
}

impl Event {
    /// Decode an event body (everything after the packet type discriminator).
    pub fn decode(mut buf: Bytes) -> Result<Self, EventDecodeError> {
        let code: u8 = buf.get()?;
        let param_len: u8 = buf.get()?;
        if buf.len() != usize::from(param_len) {
            return Err(EventDecodeError::LengthMismatch);
        }
        match code {
            EVENT_COMMAND_COMPLETE => {
                let num_hci_command_packets = buf.get()?;
                let opcode = Opcode(buf.get()?);
                Ok(Self::CommandComplete {
                    num_hci_command_packets,
                    opcode,
                    return_parameters: buf,
                })
            }
            EVENT_NUMBER_OF_COMPLETED_PACKETS => {
                let num_handles: u8 = buf.get()?;
                let n = usize::from(num_handles);
                // All handles first, then all counts.
                if buf.len() != n * 4 {
                    return Err(EventDecodeError::LengthMismatch);
                }
                let mut handles = Vec::with_capacity(n);
                for _ in 0..n {
                    handles.push(ConnHandle(buf.get()?));
                }
                let mut completed = Vec::with_capacity(n);
                for handle in handles {
                    completed.push((handle, buf.get()?));
                }
                Ok(Self::NumberOfCompletedPackets(completed))
            }
            EVENT_DISCONNECTION_COMPLETE => {
                let status = Status(buf.get()?);
                let handle = ConnHandle(buf.get()?);
                let reason = buf.get()?;
                Ok(Self::DisconnectionComplete {
                    status,
                    handle,
                    reason,
                })
            }
            EVENT_LE_META => {
                let subevent: u8 = buf.get()?;
                match subevent {
                    LE_META_CONNECTION_COMPLETE => {
                        Ok(Self::LeConnectionComplete(LeConnectionComplete {
                            status: Status(buf.get()?),
                            handle: ConnHandle(buf.get()?),
                            role: Role::try_from(buf.get::<u8>()?)?,
                            peer_addr_kind: AddrKind::try_from(buf.get::<u8>()?)?,
                            peer_addr: buf.get()?,
                            interval: buf.get()?,
                            latency: buf.get()?,
                            supervision_timeout: buf.get()?,
                            clock_accuracy: buf.get()?,
                        }))
                    }
                    subevent => Err(EventDecodeError::UnknownLeMeta { subevent }),
                }
            }
            code => Err(EventDecodeError::Unknown { code }),
        }
    }

    /// Encode the event body (everything after the packet type discriminator).
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        let mut params = Vec::new();
        let code = match self {
            Self::CommandComplete {
                num_hci_command_packets,
                opcode,
                return_parameters,
            } => {
                params.write(*num_hci_command_packets);
                params.write(opcode.0);
                params.put_slice(return_parameters);
                EVENT_COMMAND_COMPLETE
            }
            Self::NumberOfCompletedPackets(completed) => {
                params.write(completed.len() as u8);
                for (handle, _) in completed {
                    params.write(handle.0);
                }
                for (_, packets) in completed {
                    params.write(*packets);
                }
                EVENT_NUMBER_OF_COMPLETED_PACKETS
            }
            Self::DisconnectionComplete {
                status,
                handle,
                reason,
            } => {
                params.write(status.0);
                params.write(handle.0);
                params.write(*reason);
                EVENT_DISCONNECTION_COMPLETE
            }
            Self::LeConnectionComplete(c) => {
                params.write(LE_META_CONNECTION_COMPLETE);
                params.write(c.status.0);
                params.write(c.handle.0);
                params.write(u8::from(c.role));
                params.write(u8::from(c.peer_addr_kind));
                params.write(c.peer_addr);
                params.write(c.interval);
                params.write(c.latency);
                params.write(c.supervision_timeout);
                params.write(c.clock_accuracy);
                EVENT_LE_META
            }
        };
        debug_assert!(params.len() <= usize::from(u8::MAX));
        buf.put_u8(code);
        buf.put_u8(params.len() as u8);
        buf.put_slice(&params);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use hex_literal::hex;

    fn round_trip(event: Event) -> Event {
        let mut buf = Vec::new();
        event.encode(&mut buf);
        let decoded = Event::decode(Bytes::from(buf)).unwrap();
        assert_eq!(decoded, event);
        decoded
    }

    #[test]
    fn command_complete() {
        let raw = Bytes::from_static(&hex!("0e 04 01 03 0c 00"));
        let event = Event::decode(raw).unwrap();
        assert_matches!(
            event,
            Event::CommandComplete {
                num_hci_command_packets: 1,
                opcode: Opcode::RESET,
                ref return_parameters,
            } if return_parameters[..] == [0x00]
        );
        round_trip(event);
    }

    #[test]
    fn number_of_completed_packets_pairs() {
        // Two handles: 0x0003 -> 2 packets, 0x0004 -> 1 packet.
        let raw = Bytes::from_static(&hex!("13 09 02 03 00 04 00 02 00 01 00"));
        let event = Event::decode(raw).unwrap();
        assert_eq!(
            event,
            Event::NumberOfCompletedPackets(vec![
                (ConnHandle(0x0003), 2),
                (ConnHandle(0x0004), 1)
            ])
        );
        round_trip(event);
    }

    #[test]
    fn number_of_completed_packets_bad_count() {
        // Declares two handles but carries bytes for one pair only.
        let raw = Bytes::from_static(&hex!("13 05 02 03 00 02 00"));
        assert_matches!(
            Event::decode(raw),
            Err(EventDecodeError::LengthMismatch)
        );
    }

    #[test]
    fn disconnection_complete() {
        let raw = Bytes::from_static(&hex!("05 04 00 03 00 13"));
        let event = Event::decode(raw).unwrap();
        assert_eq!(
            event,
            Event::DisconnectionComplete {
                status: Status(0),
                handle: ConnHandle(3),
                reason: 0x13,
            }
        );
        round_trip(event);
    }

    #[test]
    fn le_connection_complete() {
        let raw = Bytes::from_static(&hex!(
            "3e 13 01 00 03 00 01 00 66 55 44 33 22 11 28 00 00 00 c8 00 05"
        ));
        let event = Event::decode(raw).unwrap();
        assert_eq!(
            event,
            Event::LeConnectionComplete(LeConnectionComplete {
                status: Status(0),
                handle: ConnHandle(3),
                role: Role::Peripheral,
                peer_addr_kind: AddrKind::Public,
                peer_addr: BdAddr([0x66, 0x55, 0x44, 0x33, 0x22, 0x11]),
                interval: 0x0028,
                latency: 0,
                supervision_timeout: 0x00c8,
                clock_accuracy: 5,
            })
        );
        round_trip(event);
    }

    #[test]
    fn unknown_event_is_distinct() {
        let raw = Bytes::from_static(&hex!("10 01 00"));
        assert_matches!(
            Event::decode(raw),
            Err(EventDecodeError::Unknown { code: 0x10 })
        );
    }

    #[test]
    fn unknown_le_meta_subevent() {
        let raw = Bytes::from_static(&hex!("3e 01 0d"));
        assert_matches!(
            Event::decode(raw),
            Err(EventDecodeError::UnknownLeMeta { subevent: 0x0d })
        );
    }
}
