//! Abstracts the duplex channel between the host and a controller.

use std::fmt::Debug;
use std::io;
use std::task::{Context, Poll};

use bytes::Bytes;

/// A byte-oriented duplex channel that frames whole HCI packets.
///
/// Every successful receive yields exactly one controller-to-host packet and
/// every send accepts one host-to-controller packet, including the type
/// discriminator byte. On Linux this is an HCI User Channel socket
/// ([`HciSocket`](crate::HciSocket)); tests substitute in-memory channels.
///
/// Sends are atomic per call, so callers do not need to serialize access for
/// framing correctness (ordering across concurrent senders is up to them).
pub trait Transport: Send + Sync + Debug + 'static {
    /// Poll for the next controller-to-host packet.
    fn poll_recv(&self, cx: &mut Context<'_>) -> Poll<io::Result<Bytes>>;

    /// Poll to write one whole host-to-controller packet.
    fn poll_send(&self, cx: &mut Context<'_>, packet: &[u8]) -> Poll<io::Result<()>>;
}
