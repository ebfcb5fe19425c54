//! HCI adapter: the event loop and command dialogue for one controller.

use std::collections::{HashMap, VecDeque};
use std::future::poll_fn;
use std::io;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, debug_span, trace, warn, Instrument};

use proto::advertise::{AdStructure, AdvertisingData, AdvertisingParameters, TooLong};
use proto::cmd::{
    self, Command, EventMask, LeBufferSize, LeEventMask, Opcode, ResponseParams, Status,
};
use proto::coding::BufExt;
use proto::event::{Event, EventDecodeError};
use proto::packet::{AclPacket, BoundaryFlag, Packet, PacketDecodeError};
use proto::{BdAddr, ConnHandle};

use crate::connection::{Connection, ConnectionError};
use crate::transport::Transport;

/// Advertising intervals are in 0.625 ms units within this range.
const ADV_INTERVAL_MIN: u16 = 0x0020;
const ADV_INTERVAL_MAX: u16 = 0x4000;

/// A fatal, adapter-wide failure.
#[derive(Debug, Error, Clone)]
pub enum AdapterError {
    /// The transport to the controller failed; the adapter is dead.
    #[error("transport failed: {0}")]
    Transport(Arc<io::Error>),
    /// The adapter was closed locally.
    #[error("adapter closed")]
    Closed,
}

/// Failure of a single command round trip.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The adapter failed underneath the command.
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    /// The controller returned a non-zero status.
    #[error("controller reported status {status} for {opcode:?}")]
    Failed {
        /// Opcode of the failed command.
        opcode: Opcode,
        /// The non-zero status byte.
        status: Status,
    },
    /// The return parameters did not decode as the command's response.
    #[error("malformed return parameters for {opcode:?}")]
    Malformed {
        /// Opcode of the command.
        opcode: Opcode,
    },
    /// A parameter was rejected host-side before reaching the controller.
    #[error("illegal parameter: {0}")]
    IllegalParameter(&'static str),
}

impl From<TooLong> for CommandError {
    fn from(_: TooLong) -> Self {
        Self::IllegalParameter("advertising data exceeds 31 bytes")
    }
}

/// Host side of one controller, bound to an exclusive HCI User Channel.
///
/// Cheap to clone; all clones share the same controller. A dedicated reader
/// task decodes every controller-to-host packet and dispatches it to command
/// waiters, the connection acceptor, or per-link reassembly. Dropping the
/// last clone does not stop the reader; use [`close`](Adapter::close) to shut
/// the adapter down deliberately.
#[derive(Debug, Clone)]
pub struct Adapter {
    shared: Arc<Shared>,
    accept: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Connection>>>,
}

#[derive(Debug)]
pub(crate) struct Shared {
    transport: Arc<dyn Transport>,
    state: Mutex<State>,
    pub(crate) acl: AclFlow,
}

#[derive(Debug)]
struct State {
    commands: HashMap<Opcode, VecDeque<oneshot::Sender<Result<Bytes, AdapterError>>>>,
    connections: HashMap<ConnHandle, mpsc::UnboundedSender<Result<Bytes, ConnectionError>>>,
    accept_tx: Option<mpsc::UnboundedSender<Connection>>,
    fatal: Option<AdapterError>,
    driver: Option<JoinHandle<()>>,
}

/// Controller transmit buffer accounting.
///
/// `remaining + sum(pending)` always equals the controller's advertised
/// buffer count: a credit moves to `pending[handle]` when an ACL packet is
/// written and moves back when the controller reports it completed or the
/// link dies.
#[derive(Debug)]
pub(crate) struct AclFlow {
    state: Mutex<AclState>,
    available: Notify,
}

#[derive(Debug)]
struct AclState {
    mtu: u16,
    remaining: u16,
    pending: HashMap<ConnHandle, u16>,
    fatal: bool,
}

impl Adapter {
    /// Open controller `hci<dev>` through a User Channel and start the
    /// reader task.
    #[cfg(target_os = "linux")]
    pub fn open(dev: u16) -> io::Result<Self> {
        Ok(Self::new(crate::socket::HciSocket::open(dev)?))
    }

    /// Run the adapter over an arbitrary packet transport.
    pub fn new<T: Transport>(transport: T) -> Self {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            transport: Arc::new(transport),
            state: Mutex::new(State {
                commands: HashMap::new(),
                connections: HashMap::new(),
                accept_tx: Some(accept_tx),
                fatal: None,
                driver: None,
            }),
            acl: AclFlow {
                state: Mutex::new(AclState {
                    mtu: 1023,
                    remaining: 0,
                    pending: HashMap::new(),
                    fatal: false,
                }),
                available: Notify::new(),
            },
        });
        let driver = tokio::spawn(
            drive(shared.clone()).instrument(debug_span!("hci-reader")),
        );
        shared.state.lock().unwrap().driver = Some(driver);
        Self {
            shared,
            accept: Arc::new(tokio::sync::Mutex::new(accept_rx)),
        }
    }

    /// Shut the adapter down: the reader stops and every pending and future
    /// operation fails with [`AdapterError::Closed`].
    pub fn close(&self) {
        let driver = {
            let mut state = self.shared.state.lock().unwrap();
            state.driver.take()
        };
        if let Some(driver) = driver {
            driver.abort();
        }
        self.shared.fail(AdapterError::Closed);
    }

    /// Issue `cmd` and wait for its Command Complete.
    ///
    /// Commands with distinct opcodes may be issued concurrently; concurrent
    /// commands with the same opcode are answered oldest first.
    pub async fn command<C: Command>(&self, cmd: C) -> Result<C::Response, CommandError> {
        let rx = {
            let mut state = self.shared.state.lock().unwrap();
            if let Some(fatal) = &state.fatal {
                return Err(fatal.clone().into());
            }
            let (tx, rx) = oneshot::channel();
            state.commands.entry(C::OPCODE).or_default().push_back(tx);
            rx
        };
        self.shared.send_packet(&cmd.encode()).await?;
        let mut params = rx.await.map_err(|_| AdapterError::Closed)??;
        let status = Status(params.get::<u8>().map_err(|_| CommandError::Malformed {
            opcode: C::OPCODE,
        })?);
        if !status.is_success() {
            return Err(CommandError::Failed {
                opcode: C::OPCODE,
                status,
            });
        }
        C::Response::decode(&mut params).map_err(|_| CommandError::Malformed { opcode: C::OPCODE })
    }

    /// Wait for the next LE link a central establishes to us.
    pub async fn accept(&self) -> Result<Connection, AdapterError> {
        let mut accept = self.accept.lock().await;
        match accept.recv().await {
            Some(conn) => Ok(conn),
            None => Err(self.shared.fatal_error()),
        }
    }

    /// Reset the controller to a known state.
    pub async fn reset(&self) -> Result<(), CommandError> {
        self.command(cmd::Reset).await
    }

    /// Read the controller's public device address.
    pub async fn read_bd_addr(&self) -> Result<BdAddr, CommandError> {
        self.command(cmd::ReadBdAddr).await
    }

    /// Select which events the controller reports.
    pub async fn set_event_mask(&self, mask: EventMask) -> Result<(), CommandError> {
        self.command(cmd::SetEventMask(mask)).await
    }

    /// Select which LE Meta subevents the controller reports.
    pub async fn le_set_event_mask(&self, mask: LeEventMask) -> Result<(), CommandError> {
        self.command(cmd::LeSetEventMask(mask)).await
    }

    /// Read the controller's buffer dimensions and adopt them for ACL flow
    /// control: the data packet length becomes the fragmentation MTU and the
    /// packet count becomes the credit pool.
    pub async fn le_read_buffer_size(&self) -> Result<LeBufferSize, CommandError> {
        let response = self.command(cmd::LeReadBufferSize).await?;
        {
            let mut acl = self.shared.acl.state.lock().unwrap();
            if response.acl_data_packet_length > 0 {
                acl.mtu = response.acl_data_packet_length;
            }
            acl.remaining = u16::from(response.total_num_acl_data_packets);
        }
        self.shared.acl.available.notify_waiters();
        Ok(response)
    }

    /// Read the LE state combinations the controller supports.
    pub async fn le_read_supported_states(&self) -> Result<u64, CommandError> {
        self.command(cmd::LeReadSupportedStates).await
    }

    /// Empty the filter accept list.
    pub async fn clear_filter_accept_list(&self) -> Result<(), CommandError> {
        self.command(cmd::ClearFilterAcceptList).await
    }

    /// Read the capacity of the filter accept list.
    pub async fn read_filter_accept_list_size(&self) -> Result<u8, CommandError> {
        self.command(cmd::ReadFilterAcceptListSize).await
    }

    /// Assemble and install advertising data.
    pub async fn set_advertising_data(
        &self,
        structures: &[AdStructure<'_>],
    ) -> Result<(), CommandError> {
        let data = AdvertisingData::from_structures(structures)?;
        self.command(cmd::LeSetAdvertisingData(data)).await
    }

    /// Configure legacy advertising.
    pub async fn le_set_advertising_parameters(
        &self,
        params: AdvertisingParameters,
    ) -> Result<(), CommandError> {
        for interval in [params.interval_min, params.interval_max] {
            if !(ADV_INTERVAL_MIN..=ADV_INTERVAL_MAX).contains(&interval) {
                return Err(CommandError::IllegalParameter(
                    "advertising interval outside 0x0020..=0x4000",
                ));
            }
        }
        if params.interval_min > params.interval_max {
            return Err(CommandError::IllegalParameter(
                "advertising interval minimum exceeds maximum",
            ));
        }
        self.command(cmd::LeSetAdvertisingParameters(params)).await
    }

    /// Start or stop advertising.
    pub async fn le_set_advertising_enable(&self, enable: bool) -> Result<(), CommandError> {
        self.command(cmd::LeSetAdvertisingEnable(enable)).await
    }
}

impl Shared {
    /// Write one packet to the controller, marking the adapter dead on
    /// transport failure.
    pub(crate) async fn send_packet(&self, packet: &[u8]) -> Result<(), AdapterError> {
        trace!(len = packet.len(), "send packet");
        match poll_fn(|cx| self.transport.poll_send(cx, packet)).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let error = AdapterError::Transport(Arc::new(e));
                self.fail(error.clone());
                Err(error)
            }
        }
    }

    /// The largest ACL payload the controller accepts per packet.
    pub(crate) fn acl_mtu(&self) -> u16 {
        self.acl.state.lock().unwrap().mtu
    }

    /// Take one controller buffer credit for `handle`, waiting while none
    /// are available.
    pub(crate) async fn acquire_acl_credit(
        &self,
        handle: ConnHandle,
    ) -> Result<(), AdapterError> {
        loop {
            if let Some(result) = self.try_acquire_acl_credit(handle) {
                return result;
            }
            let notified = self.acl.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            // A credit may have been returned between the check and
            // registering; look again before sleeping.
            if let Some(result) = self.try_acquire_acl_credit(handle) {
                return result;
            }
            notified.await;
        }
    }

    fn try_acquire_acl_credit(&self, handle: ConnHandle) -> Option<Result<(), AdapterError>> {
        let mut acl = self.acl.state.lock().unwrap();
        if acl.fatal {
            return Some(Err(self.fatal_error()));
        }
        if acl.remaining > 0 {
            acl.remaining -= 1;
            *acl.pending.entry(handle).or_insert(0) += 1;
            return Some(Ok(()));
        }
        None
    }

    fn fatal_error(&self) -> AdapterError {
        self.state
            .lock()
            .unwrap()
            .fatal
            .clone()
            .unwrap_or(AdapterError::Closed)
    }

    /// Mark the adapter dead and fail every waiter.
    fn fail(&self, error: AdapterError) {
        let (commands, connections) = {
            let mut state = self.state.lock().unwrap();
            if state.fatal.is_some() {
                return;
            }
            state.fatal = Some(error.clone());
            state.accept_tx = None;
            (
                std::mem::take(&mut state.commands),
                std::mem::take(&mut state.connections),
            )
        };
        for (_, waiters) in commands {
            for waiter in waiters {
                let _ = waiter.send(Err(error.clone()));
            }
        }
        for (_, conn) in connections {
            let _ = conn.send(Err(ConnectionError::Adapter(error.clone())));
        }
        {
            let mut acl = self.acl.state.lock().unwrap();
            acl.fatal = true;
        }
        self.acl.available.notify_waiters();
    }

    fn handle_event(self: &Arc<Self>, event: Event) {
        match event {
            Event::CommandComplete {
                opcode,
                return_parameters,
                ..
            } => {
                let waiter = {
                    let mut state = self.state.lock().unwrap();
                    state
                        .commands
                        .get_mut(&opcode)
                        .and_then(|queue| queue.pop_front())
                };
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(Ok(return_parameters));
                    }
                    None => debug!(?opcode, "command complete with no waiter"),
                }
            }
            Event::NumberOfCompletedPackets(completed) => {
                {
                    let mut acl = self.acl.state.lock().unwrap();
                    for (handle, n) in completed {
                        acl.remaining = acl.remaining.saturating_add(n);
                        match acl.pending.get_mut(&handle) {
                            Some(pending) if *pending >= n => *pending -= n,
                            _ => warn!(
                                %handle,
                                n, "controller completed more packets than were pending"
                            ),
                        }
                    }
                }
                self.acl.available.notify_waiters();
            }
            Event::DisconnectionComplete { handle, reason, .. } => {
                debug!(%handle, reason, "disconnected");
                {
                    let mut acl = self.acl.state.lock().unwrap();
                    if let Some(pending) = acl.pending.remove(&handle) {
                        acl.remaining = acl.remaining.saturating_add(pending);
                    }
                }
                self.acl.available.notify_waiters();
                let conn = self.state.lock().unwrap().connections.remove(&handle);
                if let Some(conn) = conn {
                    let _ = conn.send(Err(ConnectionError::Disconnected { reason }));
                }
            }
            Event::LeConnectionComplete(params) => {
                if !params.status.is_success() {
                    warn!(status = %params.status, "LE connection attempt failed");
                    return;
                }
                debug!(handle = %params.handle, peer = %params.peer_addr, "connected");
                let (tx, rx) = mpsc::unbounded_channel();
                let conn = Connection::new(self.clone(), params, rx);
                let mut state = self.state.lock().unwrap();
                if state.connections.insert(params.handle, tx).is_some() {
                    warn!(handle = %params.handle, "handle reused while still live");
                }
                match &state.accept_tx {
                    Some(accept) => {
                        if accept.send(conn).is_err() {
                            warn!("connection arrived with no acceptor");
                        }
                    }
                    None => warn!("connection arrived after shutdown"),
                }
            }
        }
    }

    fn handle_acl(
        self: &Arc<Self>,
        packet: AclPacket,
        reassembly: &mut HashMap<ConnHandle, Vec<u8>>,
    ) {
        let handle = packet.handle;
        if !self.state.lock().unwrap().connections.contains_key(&handle) {
            warn!(%handle, "ACL data for unknown connection");
            return;
        }
        match packet.boundary {
            BoundaryFlag::FirstAutoFlushable
                if reassembly.get(&handle).is_some_and(|buf| !buf.is_empty()) =>
            {
                self.terminate_link(handle, reassembly, "ACL start while a PDU was buffered");
                return;
            }
            BoundaryFlag::FirstAutoFlushable | BoundaryFlag::Continuing => {
                reassembly
                    .entry(handle)
                    .or_default()
                    .extend_from_slice(&packet.data);
            }
            BoundaryFlag::FirstNonAutoFlushable | BoundaryFlag::Complete => {
                self.terminate_link(handle, reassembly, "unsupported ACL boundary flag");
                return;
            }
        }
        // The B-frame's own length field is the reassembly target.
        let (complete, overrun) = match reassembly.get(&handle) {
            Some(buf) if buf.len() >= 4 => {
                let pdu_len = 4 + usize::from(u16::from_le_bytes([buf[0], buf[1]]));
                (buf.len() == pdu_len, buf.len() > pdu_len)
            }
            _ => (false, false),
        };
        if overrun {
            self.terminate_link(handle, reassembly, "ACL data overran the PDU length");
            return;
        }
        if complete {
            let pdu = Bytes::from(reassembly.remove(&handle).unwrap_or_default());
            trace!(%handle, len = pdu.len(), "PDU complete");
            if let Some(conn) = self.state.lock().unwrap().connections.get(&handle) {
                let _ = conn.send(Ok(pdu));
            }
        }
    }

    /// A link violated framing rules: surface the error and forget the link.
    /// The controller still owns its buffers, so pending credits stay put
    /// until it reports them completed or disconnected.
    fn terminate_link(
        &self,
        handle: ConnHandle,
        reassembly: &mut HashMap<ConnHandle, Vec<u8>>,
        reason: &'static str,
    ) {
        warn!(%handle, reason, "terminating link");
        reassembly.remove(&handle);
        let conn = self.state.lock().unwrap().connections.remove(&handle);
        if let Some(conn) = conn {
            let _ = conn.send(Err(ConnectionError::Protocol(reason)));
        }
    }
}

async fn drive(shared: Arc<Shared>) {
    // The reader task is the sole owner of reassembly buffers: exactly one
    // partial PDU can exist per link, and nothing else observes it.
    let mut reassembly: HashMap<ConnHandle, Vec<u8>> = HashMap::new();
    loop {
        let packet = match poll_fn(|cx| shared.transport.poll_recv(cx)).await {
            Ok(packet) => packet,
            Err(e) => {
                debug!(error = %e, "transport closed");
                shared.fail(AdapterError::Transport(Arc::new(e)));
                return;
            }
        };
        trace!(len = packet.len(), "recv packet");
        match Packet::decode(packet) {
            Ok(Packet::Event(event)) => shared.handle_event(event),
            Ok(Packet::Acl(acl)) => shared.handle_acl(acl, &mut reassembly),
            Ok(Packet::Command { opcode, .. }) => {
                warn!(?opcode, "controller sent a command packet")
            }
            Err(PacketDecodeError::Event(EventDecodeError::Unknown { code })) => {
                debug!(code, "ignoring unknown event")
            }
            Err(PacketDecodeError::Event(EventDecodeError::UnknownLeMeta { subevent })) => {
                debug!(subevent, "ignoring unknown LE meta subevent")
            }
            Err(e) => warn!(error = %e, "dropping undecodable packet"),
        }
    }
}
