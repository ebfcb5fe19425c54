//! L2CAP multiplexing over one LE link.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, debug_span, warn, Instrument};

use proto::frame::{
    self, CommandReject, DisconnectionReq, DisconnectionRes, LeCreditConnectionReq,
    LeCreditConnectionRes, LeCreditConnectionResult, RejectReason, Signal, SignalDecodeError,
    CID_ATT, CID_DYNAMIC_START, CID_LE_SIGNALING, LE_CREDIT_MPS_MAX, LE_CREDIT_MTU_MIN, MPS_CAP,
};
use proto::att;

use crate::channel::{Coc, PendingChannel, RxOutcome};
use crate::config::ChannelConfig;
use crate::connection::{Connection, ConnectionError};

/// Dynamic channel identifiers run out at 0xffff; past that, requests are
/// refused (identifiers are never reused).
const CID_DYNAMIC_END: u32 = u16::MAX as u32;

/// Channels both ends of a link can hold at most.
const COC_CAPACITY: usize = 0xffc0;

/// L2CAP multiplexer for one LE link, in the peripheral role.
///
/// Owns the link: a driver task parses every inbound PDU and dispatches it
/// to the signalling state machine, a channel's reassembler, or the ATT
/// shim. Inbound channel requests surface through [`accept`](L2cap::accept)
/// as [`PendingChannel`]s for the application to approve or reject.
#[derive(Debug)]
pub struct L2cap {
    inner: Arc<Inner>,
    accept: tokio::sync::Mutex<mpsc::UnboundedReceiver<PendingChannel>>,
}

#[derive(Debug)]
pub(crate) struct Inner {
    pub(crate) conn: Connection,
    pub(crate) config: ChannelConfig,
    state: Mutex<MuxState>,
}

#[derive(Debug)]
struct MuxState {
    cocs: HashMap<u16, Arc<Coc>>,
    next_cid: u32,
    next_identifier: u8,
    accept_tx: Option<mpsc::UnboundedSender<PendingChannel>>,
    closed: Option<ConnectionError>,
}

impl L2cap {
    /// Multiplex `conn` with the default channel configuration.
    pub fn new(conn: Connection) -> Self {
        Self::with_config(conn, ChannelConfig::default())
    }

    /// Multiplex `conn` with an explicit channel configuration.
    pub fn with_config(conn: Connection, config: ChannelConfig) -> Self {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let handle = conn.handle();
        let inner = Arc::new(Inner {
            conn,
            config,
            state: Mutex::new(MuxState {
                cocs: HashMap::new(),
                next_cid: u32::from(CID_DYNAMIC_START),
                next_identifier: 1,
                accept_tx: Some(accept_tx),
                closed: None,
            }),
        });
        tokio::spawn(
            drive(inner.clone()).instrument(debug_span!("l2cap", handle = %handle)),
        );
        Self {
            inner,
            accept: tokio::sync::Mutex::new(accept_rx),
        }
    }

    /// Wait for the next inbound channel request.
    ///
    /// Fails once the underlying link is gone.
    pub async fn accept(&self) -> Result<PendingChannel, ConnectionError> {
        let mut accept = self.accept.lock().await;
        match accept.recv().await {
            Some(pending) => Ok(pending),
            None => Err(self.inner.closed_error()),
        }
    }

    /// The link this multiplexer runs on.
    pub fn connection(&self) -> &Connection {
        &self.inner.conn
    }
}

impl Inner {
    fn next_identifier(&self) -> u8 {
        let mut state = self.state.lock().unwrap();
        // Zero is not a valid signalling identifier.
        if state.next_identifier == 0 {
            state.next_identifier = 1;
        }
        let id = state.next_identifier;
        state.next_identifier = state.next_identifier.wrapping_add(1);
        id
    }

    fn closed_error(&self) -> ConnectionError {
        self.state
            .lock()
            .unwrap()
            .closed
            .clone()
            .unwrap_or(ConnectionError::Adapter(crate::AdapterError::Closed))
    }

    pub(crate) fn register(&self, coc: Arc<Coc>) -> Result<(), ConnectionError> {
        let mut state = self.state.lock().unwrap();
        if let Some(closed) = &state.closed {
            return Err(closed.clone());
        }
        state.cocs.insert(coc.rx_cid, coc);
        Ok(())
    }

    pub(crate) fn remove(&self, rx_cid: u16) -> Option<Arc<Coc>> {
        self.state.lock().unwrap().cocs.remove(&rx_cid)
    }

    fn lookup(&self, rx_cid: u16) -> Option<Arc<Coc>> {
        self.state.lock().unwrap().cocs.get(&rx_cid).cloned()
    }

    fn lookup_by_tx_cid(&self, tx_cid: u16) -> Option<Arc<Coc>> {
        let state = self.state.lock().unwrap();
        state.cocs.values().find(|coc| coc.tx_cid == tx_cid).cloned()
    }

    pub(crate) async fn send_signal(&self, signal: &Signal) -> Result<(), ConnectionError> {
        self.conn
            .write_pdu(&frame::bframe(CID_LE_SIGNALING, &signal.encode()))
            .await
    }

    /// Host-initiated teardown of one channel.
    pub(crate) async fn request_disconnection(&self, coc: &Coc) -> Result<(), ConnectionError> {
        let identifier = self.next_identifier();
        self.send_signal(&Signal::DisconnectionReq(DisconnectionReq {
            identifier,
            dcid: coc.tx_cid,
            scid: coc.rx_cid,
        }))
        .await
    }

    async fn disconnect_for_violation(&self, coc: &Coc, reason: &'static str) {
        warn!(cid = coc.rx_cid, reason, "disconnecting channel");
        self.remove(coc.rx_cid);
        coc.close_local();
        if let Err(e) = self.request_disconnection(coc).await {
            debug!(error = %e, "disconnection request not sent");
        }
    }

    fn shutdown(&self, error: ConnectionError) {
        let cocs = {
            let mut state = self.state.lock().unwrap();
            state.closed = Some(error);
            state.accept_tx = None;
            std::mem::take(&mut state.cocs)
        };
        for (_, coc) in cocs {
            coc.close_local();
        }
    }

    async fn handle_att(&self, payload: Bytes) {
        match payload.first() {
            Some(&att::OP_READ_BY_TYPE_REQUEST) => {
                // No attribute database: answer discovery probes with
                // "attribute not found" on handle 0x0001.
                let reply = [
                    att::OP_ERROR_RESPONSE,
                    att::OP_READ_BY_TYPE_REQUEST,
                    0x01,
                    0x00,
                    att::ERR_ATTRIBUTE_NOT_FOUND,
                ];
                if let Err(e) = self
                    .conn
                    .write_pdu(&frame::bframe(CID_ATT, &reply))
                    .await
                {
                    debug!(error = %e, "ATT reply not sent");
                }
            }
            Some(&opcode) => warn!(opcode, "no ATT server; ignoring ATT packet"),
            None => warn!("empty ATT packet"),
        }
    }

    async fn handle_signal(self: &Arc<Self>, payload: Bytes) {
        let signal = match Signal::decode(payload) {
            Ok(signal) => signal,
            Err(SignalDecodeError::UnknownOpcode { code, identifier }) => {
                debug!(code, identifier, "rejecting unknown signalling opcode");
                let reject = Signal::CommandReject(CommandReject {
                    identifier,
                    reason: RejectReason::CommandNotUnderstood,
                    data: Bytes::new(),
                });
                if let Err(e) = self.send_signal(&reject).await {
                    debug!(error = %e, "command reject not sent");
                }
                return;
            }
            Err(e) => {
                warn!(error = %e, "dropping malformed signalling packet");
                return;
            }
        };
        match signal {
            Signal::LeCreditConnectionReq(req) => self.handle_connection_req(req).await,
            Signal::FlowControlCredit(ind) => {
                let Some(coc) = self.lookup_by_tx_cid(ind.cid) else {
                    debug!(cid = ind.cid, "credits for unknown channel");
                    return;
                };
                if ind.credits == 0 {
                    self.disconnect_for_violation(&coc, "zero-credit indication")
                        .await;
                    return;
                }
                if let Err(reason) = coc.grant_tx_credits(ind.credits) {
                    self.disconnect_for_violation(&coc, reason).await;
                }
            }
            Signal::DisconnectionReq(req) => {
                let response = Signal::DisconnectionRes(DisconnectionRes {
                    identifier: req.identifier,
                    dcid: req.dcid,
                    scid: req.scid,
                });
                if let Err(e) = self.send_signal(&response).await {
                    debug!(error = %e, "disconnection response not sent");
                }
                match self.remove(req.dcid) {
                    Some(coc) => {
                        debug!(cid = req.dcid, "peer disconnected channel");
                        coc.close_local();
                    }
                    None => debug!(cid = req.dcid, "disconnection request for unknown channel"),
                }
            }
            Signal::DisconnectionRes(res) => match self.remove(res.dcid) {
                Some(coc) => coc.close_local(),
                // The usual case: we tear channels down when we send the
                // request, so the response finds nothing.
                None => debug!(cid = res.dcid, "disconnection response for closed channel"),
            },
            Signal::CommandReject(rej) => {
                warn!(identifier = rej.identifier, reason = ?rej.reason, "peer rejected a command")
            }
            Signal::LeCreditConnectionRes(res) => {
                // Peripheral-only host: we never initiate channels.
                debug!(identifier = res.identifier, "ignoring unsolicited connection response")
            }
            Signal::Other { code, .. } => debug!(?code, "ignoring signalling packet"),
        }
    }

    async fn handle_connection_req(self: &Arc<Self>, req: LeCreditConnectionReq) {
        let refusal = |result| {
            Signal::LeCreditConnectionRes(LeCreditConnectionRes {
                identifier: req.identifier,
                dcid: 0,
                mtu: 0,
                mps: 0,
                initial_credits: 0,
                result,
            })
        };

        if req.mtu < LE_CREDIT_MTU_MIN
            || req.mps < LE_CREDIT_MTU_MIN
            || req.mps > LE_CREDIT_MPS_MAX
        {
            debug!(mtu = req.mtu, mps = req.mps, "refusing channel: bad parameters");
            let _ = self
                .send_signal(&refusal(LeCreditConnectionResult::UnacceptableParameters))
                .await;
            return;
        }

        let rx_cid = {
            let mut state = self.state.lock().unwrap();
            if state.cocs.len() >= COC_CAPACITY || state.next_cid > CID_DYNAMIC_END {
                None
            } else if req.scid < CID_DYNAMIC_START {
                Some(Err(LeCreditConnectionResult::InvalidSourceCid))
            } else if state.cocs.values().any(|coc| coc.tx_cid == req.scid) {
                Some(Err(LeCreditConnectionResult::SourceCidAlreadyAllocated))
            } else {
                let cid = state.next_cid as u16;
                state.next_cid += 1;
                Some(Ok(cid))
            }
        };
        let rx_cid = match rx_cid {
            None => {
                debug!("refusing channel: at capacity");
                let _ = self
                    .send_signal(&refusal(LeCreditConnectionResult::NoResourcesAvailable))
                    .await;
                return;
            }
            Some(Err(result)) => {
                debug!(scid = req.scid, ?result, "refusing channel");
                let _ = self.send_signal(&refusal(result)).await;
                return;
            }
            Some(Ok(cid)) => cid,
        };

        let pending = PendingChannel {
            inner: self.clone(),
            identifier: req.identifier,
            psm: req.spsm,
            rx_cid,
            tx_cid: req.scid,
            tx_mtu: req.mtu,
            tx_mps: req.mps.min(MPS_CAP),
            initial_credits: req.initial_credits,
        };
        debug!(
            psm = pending.psm,
            rx_cid,
            tx_cid = pending.tx_cid,
            "channel request pending"
        );
        let no_acceptor = {
            let state = self.state.lock().unwrap();
            match &state.accept_tx {
                Some(accept) => accept.send(pending).is_err(),
                None => true,
            }
        };
        if no_acceptor {
            debug!("refusing channel: nothing is accepting");
            let _ = self
                .send_signal(&refusal(LeCreditConnectionResult::NoResourcesAvailable))
                .await;
        }
    }

    async fn handle_data(self: &Arc<Self>, cid: u16, payload: Bytes) {
        let Some(coc) = self.lookup(cid) else {
            warn!(cid, "dropping frame for unknown channel");
            return;
        };
        match coc.receive(payload, &self.config) {
            RxOutcome::Done => {}
            RxOutcome::Replenish(credits) => {
                let identifier = self.next_identifier();
                let indication = Signal::FlowControlCredit(frame::FlowControlCredit {
                    identifier,
                    cid: coc.rx_cid,
                    credits,
                });
                if let Err(e) = self.send_signal(&indication).await {
                    debug!(error = %e, "credit indication not sent");
                }
            }
            RxOutcome::Violation(reason) => self.disconnect_for_violation(&coc, reason).await,
        }
    }
}

async fn drive(inner: Arc<Inner>) {
    loop {
        let pdu = match inner.conn.read_pdu().await {
            Ok(pdu) => pdu,
            Err(error) => {
                debug!(error = %error, "link closed; shutting the multiplexer down");
                inner.shutdown(error);
                return;
            }
        };
        let (cid, payload) = match frame::parse_bframe(pdu) {
            Ok(frame) => frame,
            // The reassembler completed the PDU against this same length
            // field, so only a header shorter than 4 bytes can end up here.
            Err(error) => {
                warn!(error = %error, "dropping malformed basic frame");
                continue;
            }
        };
        match cid {
            CID_ATT => inner.handle_att(payload).await,
            CID_LE_SIGNALING => inner.handle_signal(payload).await,
            _ => inner.handle_data(cid, payload).await,
        }
    }
}
