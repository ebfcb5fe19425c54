//! L2CAP basic frames and LE-U signalling PDUs.
//!
//! A basic frame (B-frame) is `length, cid, payload`; the signalling channel
//! (CID 0x0005 on LE) carries `code, identifier, length, body` PDUs. Only the
//! PDUs a credit-based peripheral acts on get full codecs; other assigned
//! opcodes decode to [`Signal::Other`] so the state machine can tell
//! "recognized but ignored" from "not understood".

use std::fmt;

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

use crate::coding::{BufExt, BufMutExt, UnexpectedEnd};

/// Fixed channel for the Attribute Protocol on LE.
pub const CID_ATT: u16 = 0x0004;
/// Fixed channel for LE-U signalling.
pub const CID_LE_SIGNALING: u16 = 0x0005;
/// First dynamically allocated channel identifier.
pub const CID_DYNAMIC_START: u16 = 0x0040;

/// Smallest MTU/MPS a credit-based channel may negotiate.
pub const LE_CREDIT_MTU_MIN: u16 = 23;
/// Largest MPS a credit-based channel may negotiate.
pub const LE_CREDIT_MPS_MAX: u16 = 65533;
/// Largest fragment size this host will ever declare or emit; bounds a
/// K-frame to what fits a single well-formed PDU on common controllers.
pub const MPS_CAP: u16 = 1004;

/// Encode a B-frame around `payload` on channel `cid`.
pub fn bframe(cid: u16, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= usize::from(u16::MAX));
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.write(payload.len() as u16);
    buf.write(cid);
    buf.put_slice(payload);
    buf
}

/// A malformed B-frame.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecodeError {
    /// The buffer is shorter than a frame header.
    #[error("truncated basic frame")]
    UnexpectedEnd,
    /// The length field disagrees with the payload.
    #[error("basic frame length does not match payload")]
    LengthMismatch,
}

impl From<UnexpectedEnd> for FrameDecodeError {
    fn from(_: UnexpectedEnd) -> Self {
        Self::UnexpectedEnd
    }
}

/// Split a B-frame into its channel identifier and payload.
pub fn parse_bframe(mut buf: Bytes) -> Result<(u16, Bytes), FrameDecodeError> {
    let length: u16 = buf.get()?;
    let cid: u16 = buf.get()?;
    if buf.len() != usize::from(length) {
        return Err(FrameDecodeError::LengthMismatch);
    }
    Ok((cid, buf))
}

/// A signalling opcode.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct SignalCode(pub u8);

macro_rules! signal_codes {
    {$($(#[$doc:meta])* $name:ident = $val:expr,)*} => {
        impl SignalCode {
            $($(#[$doc])* pub const $name: SignalCode = SignalCode($val);)*

            /// Whether this opcode is assigned by the Core Specification.
            pub fn is_known(self) -> bool {
                matches!(self.0, $($val)|*)
            }
        }

        impl fmt::Debug for SignalCode {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    _ => write!(f, "SignalCode({:#04x})", self.0),
                }
            }
        }
    }
}

signal_codes! {
    /// Command Reject response.
    COMMAND_REJECT = 0x01,
    /// BR/EDR Connection Request.
    CONNECTION_REQ = 0x02,
    /// BR/EDR Connection Response.
    CONNECTION_RES = 0x03,
    /// BR/EDR Configuration Request.
    CONFIGURATION_REQ = 0x04,
    /// BR/EDR Configuration Response.
    CONFIGURATION_RES = 0x05,
    /// Disconnection Request.
    DISCONNECTION_REQ = 0x06,
    /// Disconnection Response.
    DISCONNECTION_RES = 0x07,
    /// Echo Request.
    ECHO_REQ = 0x08,
    /// Echo Response.
    ECHO_RES = 0x09,
    /// Information Request.
    INFORMATION_REQ = 0x0a,
    /// Information Response.
    INFORMATION_RES = 0x0b,
    /// Connection Parameter Update Request.
    CONN_PARAM_UPDATE_REQ = 0x12,
    /// Connection Parameter Update Response.
    CONN_PARAM_UPDATE_RES = 0x13,
    /// LE Credit Based Connection Request.
    LE_CREDIT_CONNECTION_REQ = 0x14,
    /// LE Credit Based Connection Response.
    LE_CREDIT_CONNECTION_RES = 0x15,
    /// Flow Control Credit Indication.
    FLOW_CONTROL_CREDIT = 0x16,
    /// Credit Based Connection Request (enhanced mode).
    CREDIT_CONNECTION_REQ = 0x17,
    /// Credit Based Connection Response (enhanced mode).
    CREDIT_CONNECTION_RES = 0x18,
    /// Credit Based Reconfigure Request.
    CREDIT_RECONFIGURE_REQ = 0x19,
    /// Credit Based Reconfigure Response.
    CREDIT_RECONFIGURE_RES = 0x1a,
}

/// Reason carried by a Command Reject response.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u16)]
pub enum RejectReason {
    /// The command was not understood.
    CommandNotUnderstood = 0x0000,
    /// The command exceeded the signalling MTU.
    SignalingMtuExceeded = 0x0001,
    /// The command referenced an invalid CID.
    InvalidCid = 0x0002,
}

impl TryFrom<u16> for RejectReason {
    type Error = SignalDecodeError;
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0000 => Ok(Self::CommandNotUnderstood),
            0x0001 => Ok(Self::SignalingMtuExceeded),
            0x0002 => Ok(Self::InvalidCid),
            _ => Err(SignalDecodeError::InvalidValue),
        }
    }
}

/// Result of an LE Credit Based Connection Request.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u16)]
pub enum LeCreditConnectionResult {
    /// Connection successful.
    Success = 0x0000,
    /// Connection refused: SPSM not supported.
    SpsmNotSupported = 0x0002,
    /// Connection refused: no resources available.
    NoResourcesAvailable = 0x0004,
    /// Connection refused: insufficient authentication.
    InsufficientAuthentication = 0x0005,
    /// Connection refused: insufficient authorization.
    InsufficientAuthorization = 0x0006,
    /// Connection refused: encryption key size too short.
    EncryptionKeyTooShort = 0x0007,
    /// Connection refused: insufficient encryption.
    InsufficientEncryption = 0x0008,
    /// Connection refused: invalid Source CID.
    InvalidSourceCid = 0x0009,
    /// Connection refused: Source CID already allocated.
    SourceCidAlreadyAllocated = 0x000a,
    /// Connection refused: unacceptable parameters.
    UnacceptableParameters = 0x000b,
}

impl TryFrom<u16> for LeCreditConnectionResult {
    type Error = SignalDecodeError;
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0000 => Ok(Self::Success),
            0x0002 => Ok(Self::SpsmNotSupported),
            0x0004 => Ok(Self::NoResourcesAvailable),
            0x0005 => Ok(Self::InsufficientAuthentication),
            0x0006 => Ok(Self::InsufficientAuthorization),
            0x0007 => Ok(Self::EncryptionKeyTooShort),
            0x0008 => Ok(Self::InsufficientEncryption),
            0x0009 => Ok(Self::InvalidSourceCid),
            0x000a => Ok(Self::SourceCidAlreadyAllocated),
            0x000b => Ok(Self::UnacceptableParameters),
            _ => Err(SignalDecodeError::InvalidValue),
        }
    }
}

/// Command Reject response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReject {
    /// Identifier of the rejected request.
    pub identifier: u8,
    /// Why the request was rejected.
    pub reason: RejectReason,
    /// Reason-specific data.
    pub data: Bytes,
}

/// LE Credit Based Connection Request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeCreditConnectionReq {
    /// Request identifier, echoed by the response.
    pub identifier: u8,
    /// Simplified protocol/service multiplexer the peer wants to reach.
    pub spsm: u16,
    /// The peer's CID for this channel (our transmit CID).
    pub scid: u16,
    /// Largest SDU the peer can receive.
    pub mtu: u16,
    /// Largest fragment the peer can receive.
    pub mps: u16,
    /// Transmit credits granted to us up front.
    pub initial_credits: u16,
}

/// LE Credit Based Connection Response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeCreditConnectionRes {
    /// Identifier of the request this answers.
    pub identifier: u8,
    /// Our CID for this channel (the peer's transmit CID); zero on refusal.
    pub dcid: u16,
    /// Largest SDU we can receive.
    pub mtu: u16,
    /// Largest fragment we can receive.
    pub mps: u16,
    /// Transmit credits granted to the peer up front.
    pub initial_credits: u16,
    /// Success or the refusal reason.
    pub result: LeCreditConnectionResult,
}

/// Flow Control Credit Indication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControlCredit {
    /// Indication identifier (not answered).
    pub identifier: u8,
    /// CID of the sender's end of the channel.
    pub cid: u16,
    /// Number of additional credits granted; never zero.
    pub credits: u16,
}

/// Disconnection Request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectionReq {
    /// Request identifier, echoed by the response.
    pub identifier: u8,
    /// The receiver's CID for the channel being torn down.
    pub dcid: u16,
    /// The sender's CID for the channel being torn down.
    pub scid: u16,
}

/// Disconnection Response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectionRes {
    /// Identifier of the request this answers.
    pub identifier: u8,
    /// Echo of the request's destination CID.
    pub dcid: u16,
    /// Echo of the request's source CID.
    pub scid: u16,
}

/// Any PDU that can arrive on the LE-U signalling channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Command Reject response.
    CommandReject(CommandReject),
    /// LE Credit Based Connection Request.
    LeCreditConnectionReq(LeCreditConnectionReq),
    /// LE Credit Based Connection Response.
    LeCreditConnectionRes(LeCreditConnectionRes),
    /// Flow Control Credit Indication.
    FlowControlCredit(FlowControlCredit),
    /// Disconnection Request.
    DisconnectionReq(DisconnectionReq),
    /// Disconnection Response.
    DisconnectionRes(DisconnectionRes),
    /// An assigned opcode the peripheral role does not act on.
    Other {
        /// The recognized opcode.
        code: SignalCode,
        /// Identifier of the PDU.
        identifier: u8,
        /// Raw PDU body.
        body: Bytes,
    },
}

/// Reasons a signalling PDU can fail to decode.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SignalDecodeError {
    /// The buffer ended before the declared structure did.
    #[error("truncated signalling packet")]
    UnexpectedEnd,
    /// The length field disagrees with the PDU body.
    #[error("signalling length does not match body")]
    LengthMismatch,
    /// A field held a value outside its assigned range.
    #[error("invalid field value")]
    InvalidValue,
    /// An opcode the Core Specification does not assign. Carries the
    /// identifier so the caller can address a Command Reject.
    #[error("unknown signalling opcode {code:#04x}")]
    UnknownOpcode {
        /// The raw opcode.
        code: u8,
        /// Identifier of the offending PDU.
        identifier: u8,
    },
}

impl From<UnexpectedEnd> for SignalDecodeError {
    fn from(_: UnexpectedEnd) -> Self {
        Self::UnexpectedEnd
    }
}

impl Signal {
    /// Decode one signalling PDU from a B-frame payload.
    pub fn decode(mut buf: Bytes) -> Result<Self, SignalDecodeError> {
        let code = SignalCode(buf.get()?);
        let identifier: u8 = buf.get()?;
        let length: u16 = buf.get()?;
        if buf.len() != usize::from(length) {
            return Err(SignalDecodeError::LengthMismatch);
        }
        if !code.is_known() {
            return Err(SignalDecodeError::UnknownOpcode {
                code: code.0,
                identifier,
            });
        }
        Ok(match code {
            SignalCode::COMMAND_REJECT => {
                let reason = RejectReason::try_from(buf.get::<u16>()?)?;
                Self::CommandReject(CommandReject {
                    identifier,
                    reason,
                    data: buf,
                })
            }
            SignalCode::LE_CREDIT_CONNECTION_REQ => {
                if length != 10 {
                    return Err(SignalDecodeError::LengthMismatch);
                }
                Self::LeCreditConnectionReq(LeCreditConnectionReq {
                    identifier,
                    spsm: buf.get()?,
                    scid: buf.get()?,
                    mtu: buf.get()?,
                    mps: buf.get()?,
                    initial_credits: buf.get()?,
                })
            }
            SignalCode::LE_CREDIT_CONNECTION_RES => {
                if length != 10 {
                    return Err(SignalDecodeError::LengthMismatch);
                }
                Self::LeCreditConnectionRes(LeCreditConnectionRes {
                    identifier,
                    dcid: buf.get()?,
                    mtu: buf.get()?,
                    mps: buf.get()?,
                    initial_credits: buf.get()?,
                    result: LeCreditConnectionResult::try_from(buf.get::<u16>()?)?,
                })
            }
            SignalCode::FLOW_CONTROL_CREDIT => {
                if length != 4 {
                    return Err(SignalDecodeError::LengthMismatch);
                }
                Self::FlowControlCredit(FlowControlCredit {
                    identifier,
                    cid: buf.get()?,
                    credits: buf.get()?,
                })
            }
            SignalCode::DISCONNECTION_REQ => {
                if length != 4 {
                    return Err(SignalDecodeError::LengthMismatch);
                }
                Self::DisconnectionReq(DisconnectionReq {
                    identifier,
                    dcid: buf.get()?,
                    scid: buf.get()?,
                })
            }
            SignalCode::DISCONNECTION_RES => {
                if length != 4 {
                    return Err(SignalDecodeError::LengthMismatch);
                }
                Self::DisconnectionRes(DisconnectionRes {
                    identifier,
                    dcid: buf.get()?,
                    scid: buf.get()?,
                })
            }
            code => Self::Other {
                code,
                identifier,
                body: buf,
            },
        })
    }

    /// Encode this PDU as a signalling channel payload.
    pub fn encode(&self) -> Vec<u8> {
        fn pdu(code: SignalCode, identifier: u8, body: &[u8]) -> Vec<u8> {
            debug_assert!(body.len() <= usize::from(u16::MAX));
            let mut buf = Vec::with_capacity(4 + body.len());
            buf.write(code.0);
            buf.write(identifier);
            buf.write(body.len() as u16);
            buf.put_slice(body);
            buf
        }

        match self {
            Self::CommandReject(p) => {
                let mut body = Vec::with_capacity(2 + p.data.len());
                body.write(p.reason as u16);
                body.put_slice(&p.data);
                pdu(SignalCode::COMMAND_REJECT, p.identifier, &body)
            }
            Self::LeCreditConnectionReq(p) => {
                let mut body = Vec::with_capacity(10);
                body.write(p.spsm);
                body.write(p.scid);
                body.write(p.mtu);
                body.write(p.mps);
                body.write(p.initial_credits);
                pdu(SignalCode::LE_CREDIT_CONNECTION_REQ, p.identifier, &body)
            }
            Self::LeCreditConnectionRes(p) => {
                let mut body = Vec::with_capacity(10);
                body.write(p.dcid);
                body.write(p.mtu);
                body.write(p.mps);
                body.write(p.initial_credits);
                body.write(p.result as u16);
                pdu(SignalCode::LE_CREDIT_CONNECTION_RES, p.identifier, &body)
            }
            Self::FlowControlCredit(p) => {
                let mut body = Vec::with_capacity(4);
                body.write(p.cid);
                body.write(p.credits);
                pdu(SignalCode::FLOW_CONTROL_CREDIT, p.identifier, &body)
            }
            Self::DisconnectionReq(p) => {
                let mut body = Vec::with_capacity(4);
                body.write(p.dcid);
                body.write(p.scid);
                pdu(SignalCode::DISCONNECTION_REQ, p.identifier, &body)
            }
            Self::DisconnectionRes(p) => {
                let mut body = Vec::with_capacity(4);
                body.write(p.dcid);
                body.write(p.scid);
                pdu(SignalCode::DISCONNECTION_RES, p.identifier, &body)
            }
            Self::Other {
                code,
                identifier,
                body,
            } => pdu(*code, *identifier, body),
        }
    }
}
