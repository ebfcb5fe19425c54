//! Attribute Protocol opcodes and error codes.
//!
//! The host only speaks enough ATT to answer discovery probes with "attribute
//! not found"; a real ATT server consumes the channel payloads instead.

/// Error Response.
pub const OP_ERROR_RESPONSE: u8 = 0x01;
/// Exchange MTU Request.
pub const OP_EXCHANGE_MTU_REQUEST: u8 = 0x02;
/// Find Information Request.
pub const OP_FIND_INFORMATION_REQUEST: u8 = 0x04;
/// Find By Type Value Request.
pub const OP_FIND_BY_TYPE_VALUE_REQUEST: u8 = 0x06;
/// Read By Type Request.
pub const OP_READ_BY_TYPE_REQUEST: u8 = 0x08;
/// Read Request.
pub const OP_READ_REQUEST: u8 = 0x0a;
/// Read By Group Type Request.
pub const OP_READ_BY_GROUP_TYPE_REQUEST: u8 = 0x10;
/// Write Request.
pub const OP_WRITE_REQUEST: u8 = 0x12;

/// Error code: attribute not found.
pub const ERR_ATTRIBUTE_NOT_FOUND: u8 = 0x0a;
