//! One LE link and its ACL data path.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

use proto::event::LeConnectionComplete;
use proto::packet::{AclPacket, BoundaryFlag, BroadcastFlag};
use proto::{AddrKind, BdAddr, ConnHandle, Role};

use crate::adapter::{AdapterError, Shared};

/// Failure of a single LE link.
#[derive(Debug, Error, Clone)]
pub enum ConnectionError {
    /// The controller reported the link disconnected.
    #[error("link disconnected (reason {reason:#04x})")]
    Disconnected {
        /// Controller error code naming the reason.
        reason: u8,
    },
    /// The peer violated link framing rules; the link was abandoned.
    #[error("protocol violated on link: {0}")]
    Protocol(&'static str),
    /// The adapter underneath the link failed.
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

/// An established LE link.
///
/// Reads yield whole L2CAP PDUs, already reassembled from their ACL
/// fragments in arrival order. Writes fragment a PDU to the controller's
/// ACL payload size and take one controller buffer credit per fragment,
/// suspending while the controller has no free buffers. All fragments of
/// one PDU are written back to back; concurrent writers interleave only at
/// PDU granularity.
#[derive(Debug)]
pub struct Connection {
    shared: Arc<Shared>,
    params: LeConnectionComplete,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Bytes, ConnectionError>>>,
    failed: Mutex<Option<ConnectionError>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl Connection {
    pub(crate) fn new(
        shared: Arc<Shared>,
        params: LeConnectionComplete,
        rx: mpsc::UnboundedReceiver<Result<Bytes, ConnectionError>>,
    ) -> Self {
        Self {
            shared,
            params,
            rx: tokio::sync::Mutex::new(rx),
            failed: Mutex::new(None),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The link's connection handle.
    pub fn handle(&self) -> ConnHandle {
        self.params.handle
    }

    /// Local role on the link.
    pub fn role(&self) -> Role {
        self.params.role
    }

    /// Peer address kind.
    pub fn peer_addr_kind(&self) -> AddrKind {
        self.params.peer_addr_kind
    }

    /// Peer device address.
    pub fn peer_addr(&self) -> BdAddr {
        self.params.peer_addr
    }

    /// Connection interval, in 1.25 ms units.
    pub fn interval(&self) -> u16 {
        self.params.interval
    }

    /// Peripheral latency, in connection events.
    pub fn latency(&self) -> u16 {
        self.params.latency
    }

    /// Supervision timeout, in 10 ms units.
    pub fn supervision_timeout(&self) -> u16 {
        self.params.supervision_timeout
    }

    /// Central clock accuracy code.
    pub fn clock_accuracy(&self) -> u8 {
        self.params.clock_accuracy
    }

    /// Receive the next complete L2CAP PDU on this link.
    ///
    /// Once the link has failed, every call returns the same error.
    pub async fn read_pdu(&self) -> Result<Bytes, ConnectionError> {
        if let Some(error) = self.failed.lock().unwrap().clone() {
            return Err(error);
        }
        let next = self.rx.lock().await.recv().await;
        match next {
            Some(Ok(pdu)) => Ok(pdu),
            Some(Err(error)) => {
                *self.failed.lock().unwrap() = Some(error.clone());
                Err(error)
            }
            // The adapter dropped the sender without a verdict; it is gone.
            None => {
                let error = ConnectionError::Adapter(AdapterError::Closed);
                *self.failed.lock().unwrap() = Some(error.clone());
                Err(error)
            }
        }
    }

    /// Send one L2CAP PDU on this link, fragmenting as needed.
    pub async fn write_pdu(&self, pdu: &[u8]) -> Result<(), ConnectionError> {
        if let Some(error) = self.failed.lock().unwrap().clone() {
            return Err(error);
        }
        // Fragments of one PDU must be contiguous on the link; hold the
        // write lock across all of them.
        let _guard = self.write_lock.lock().await;
        let mtu = usize::from(self.shared.acl_mtu());
        for (i, fragment) in pdu.chunks(mtu).enumerate() {
            self.shared.acquire_acl_credit(self.handle()).await?;
            let packet = AclPacket {
                handle: self.handle(),
                boundary: if i == 0 {
                    BoundaryFlag::FirstAutoFlushable
                } else {
                    BoundaryFlag::Continuing
                },
                broadcast: BroadcastFlag::PointToPoint,
                data: Bytes::copy_from_slice(fragment),
            };
            trace!(handle = %self.handle(), len = fragment.len(), "send ACL fragment");
            self.shared.send_packet(&packet.encode()).await?;
        }
        Ok(())
    }
}
