//! LE Credit Based Flow Control channels.

use std::sync::{Arc, Mutex};

use bytes::{Buf, Bytes};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::trace;

use proto::frame::{
    self, LeCreditConnectionRes, LeCreditConnectionResult, Signal, LE_CREDIT_MTU_MIN, MPS_CAP,
};

use crate::config::ChannelConfig;
use crate::connection::ConnectionError;
use crate::l2cap::Inner;

/// Reading from a channel failed; no data was consumed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    /// The next SDU is larger than the provided buffer. The SDU stays
    /// queued; retry with a buffer of at least the reported size.
    #[error("next SDU of {size} bytes exceeds the provided buffer")]
    ShortBuffer {
        /// Size of the queued SDU.
        size: usize,
    },
}

/// Writing to a channel failed.
#[derive(Debug, Error)]
pub enum WriteError {
    /// The channel was closed locally or by the peer.
    #[error("channel closed")]
    Closed,
    /// The SDU exceeds the MTU the peer declared.
    #[error("SDU exceeds the peer MTU of {max} bytes")]
    TooLarge {
        /// The peer's MTU.
        max: u16,
    },
    /// The link underneath the channel failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// What the multiplexer must do after a channel consumed a B-frame.
pub(crate) enum RxOutcome {
    /// Nothing to transmit.
    Done,
    /// Grant the peer this many more credits.
    Replenish(u16),
    /// The peer broke the channel's rules; disconnect it.
    Violation(&'static str),
}

/// Shared state of one credit-based channel.
#[derive(Debug)]
pub(crate) struct Coc {
    pub(crate) psm: u16,
    pub(crate) rx_cid: u16,
    pub(crate) tx_cid: u16,
    pub(crate) rx_mtu: u16,
    pub(crate) rx_mps: u16,
    pub(crate) tx_mtu: u16,
    pub(crate) tx_mps: u16,
    state: Mutex<CocState>,
    tx_credits_available: Notify,
    write_lock: tokio::sync::Mutex<()>,
}

#[derive(Debug)]
struct CocState {
    rx_credits: u16,
    tx_credits: u16,
    rx_buf: Vec<u8>,
    rx_sdu_remaining: u16,
    sdu_tx: Option<mpsc::UnboundedSender<Bytes>>,
    closed: bool,
}

impl Coc {
    /// Consume one received B-frame payload.
    ///
    /// Each frame costs the peer one credit. The first frame of an SDU
    /// carries a two-byte SDU length; the rest are raw. A completed SDU is
    /// handed to the reader queue.
    pub(crate) fn receive(&self, mut payload: Bytes, config: &ChannelConfig) -> RxOutcome {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return RxOutcome::Done;
        }
        if state.rx_credits == 0 {
            return RxOutcome::Violation("peer sent beyond its credits");
        }
        state.rx_credits -= 1;

        if state.rx_sdu_remaining == 0 {
            if payload.len() < 2 {
                return RxOutcome::Violation("first SDU fragment shorter than the length field");
            }
            state.rx_sdu_remaining = payload.get_u16_le();
            if state.rx_sdu_remaining > self.rx_mtu {
                return RxOutcome::Violation("declared SDU length exceeds the negotiated MTU");
            }
        }
        if payload.len() > usize::from(self.rx_mps) {
            return RxOutcome::Violation("fragment exceeds the negotiated MPS");
        }
        if payload.len() > usize::from(state.rx_sdu_remaining) {
            return RxOutcome::Violation("fragment overruns the declared SDU length");
        }

        state.rx_buf.extend_from_slice(&payload);
        state.rx_sdu_remaining -= payload.len() as u16;
        if state.rx_sdu_remaining == 0 {
            let sdu = Bytes::from(std::mem::take(&mut state.rx_buf));
            trace!(cid = self.rx_cid, len = sdu.len(), "SDU complete");
            if let Some(tx) = &state.sdu_tx {
                let _ = tx.send(sdu);
            }
        }

        if state.rx_credits <= config.credit_low_watermark {
            let grant = config.credits.min(u16::MAX - state.rx_credits);
            if grant > 0 {
                state.rx_credits += grant;
                return RxOutcome::Replenish(grant);
            }
        }
        RxOutcome::Done
    }

    /// Add peer-granted transmit credits. Fails on overflow past 0xFFFF,
    /// which the protocol treats as a peer error.
    pub(crate) fn grant_tx_credits(&self, credits: u16) -> Result<(), &'static str> {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Ok(());
            }
            if u32::from(state.tx_credits) + u32::from(credits) > u32::from(u16::MAX) {
                return Err("transmit credits overflowed");
            }
            state.tx_credits += credits;
        }
        self.tx_credits_available.notify_waiters();
        Ok(())
    }

    async fn take_tx_credit(&self) -> Result<(), WriteError> {
        loop {
            if let Some(result) = self.try_take_tx_credit() {
                return result;
            }
            let notified = self.tx_credits_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            // Credits may have arrived between the check and registering.
            if let Some(result) = self.try_take_tx_credit() {
                return result;
            }
            notified.await;
        }
    }

    fn try_take_tx_credit(&self) -> Option<Result<(), WriteError>> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Some(Err(WriteError::Closed));
        }
        if state.tx_credits > 0 {
            state.tx_credits -= 1;
            return Some(Ok(()));
        }
        None
    }

    /// Tear the channel down locally: readers see end of stream, writers
    /// and credit waiters fail. Idempotent.
    pub(crate) fn close_local(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.closed = true;
            state.sdu_tx = None;
            state.rx_buf.clear();
            state.rx_sdu_remaining = 0;
        }
        self.tx_credits_available.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

/// An inbound channel request awaiting an application verdict.
///
/// Produced by [`L2cap::accept`](crate::L2cap::accept). Must be consumed by
/// exactly one of [`approve`](PendingChannel::approve) or
/// [`reject`](PendingChannel::reject); until then the peer is still waiting
/// for its connection response and no data can flow.
#[derive(Debug)]
pub struct PendingChannel {
    pub(crate) inner: Arc<Inner>,
    pub(crate) identifier: u8,
    pub(crate) psm: u16,
    pub(crate) rx_cid: u16,
    pub(crate) tx_cid: u16,
    pub(crate) tx_mtu: u16,
    pub(crate) tx_mps: u16,
    pub(crate) initial_credits: u16,
}

impl PendingChannel {
    /// The protocol/service multiplexer the peer asked for.
    pub fn psm(&self) -> u16 {
        self.psm
    }

    /// Largest SDU the peer is willing to receive.
    pub fn peer_mtu(&self) -> u16 {
        self.tx_mtu
    }

    /// Largest fragment the peer is willing to receive.
    pub fn peer_mps(&self) -> u16 {
        self.tx_mps
    }

    /// Transmit credits the peer granted up front.
    pub fn initial_credits(&self) -> u16 {
        self.initial_credits
    }

    /// Accept the channel, declaring we can receive SDUs of up to `rx_mtu`
    /// bytes (clamped to the protocol minimum of 23).
    ///
    /// Sends the successful connection response, granting the peer the
    /// configured initial credit batch.
    pub async fn approve(self, rx_mtu: u16) -> Result<Channel, ConnectionError> {
        let rx_mtu = rx_mtu.max(LE_CREDIT_MTU_MIN);
        let rx_mps = rx_mtu.min(MPS_CAP);
        let credits = self.inner.config.credits;
        let (sdu_tx, sdu_rx) = mpsc::unbounded_channel();
        let coc = Arc::new(Coc {
            psm: self.psm,
            rx_cid: self.rx_cid,
            tx_cid: self.tx_cid,
            rx_mtu,
            rx_mps,
            tx_mtu: self.tx_mtu,
            tx_mps: self.tx_mps,
            state: Mutex::new(CocState {
                rx_credits: credits,
                tx_credits: self.initial_credits,
                rx_buf: Vec::new(),
                rx_sdu_remaining: 0,
                sdu_tx: Some(sdu_tx),
                closed: false,
            }),
            tx_credits_available: Notify::new(),
            write_lock: tokio::sync::Mutex::new(()),
        });
        self.inner.register(coc.clone())?;
        self.inner
            .send_signal(&Signal::LeCreditConnectionRes(LeCreditConnectionRes {
                identifier: self.identifier,
                dcid: self.rx_cid,
                mtu: rx_mtu,
                mps: rx_mps,
                initial_credits: credits,
                result: LeCreditConnectionResult::Success,
            }))
            .await?;
        Ok(Channel {
            coc,
            inner: self.inner,
            read: tokio::sync::Mutex::new(ReadHalf {
                sdu_rx,
                peeked: None,
            }),
        })
    }

    /// Refuse the channel with `result`; the request is answered and the
    /// would-be channel is discarded.
    ///
    /// `result` must be one of the refusal codes, not
    /// [`LeCreditConnectionResult::Success`].
    pub async fn reject(self, result: LeCreditConnectionResult) -> Result<(), ConnectionError> {
        debug_assert!(result != LeCreditConnectionResult::Success);
        self.inner
            .send_signal(&Signal::LeCreditConnectionRes(LeCreditConnectionRes {
                identifier: self.identifier,
                dcid: 0,
                mtu: 0,
                mps: 0,
                initial_credits: 0,
                result,
            }))
            .await
    }
}

struct ReadHalf {
    sdu_rx: mpsc::UnboundedReceiver<Bytes>,
    peeked: Option<Bytes>,
}

/// An approved credit-based channel.
///
/// Reads yield whole SDUs in arrival order; writes send one SDU, suspending
/// while the peer has granted no transmit credits. Reads and writes may run
/// concurrently; concurrent reads (or writes) serialize against each other.
pub struct Channel {
    coc: Arc<Coc>,
    inner: Arc<Inner>,
    read: tokio::sync::Mutex<ReadHalf>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("psm", &self.coc.psm)
            .field("rx_cid", &self.coc.rx_cid)
            .field("tx_cid", &self.coc.tx_cid)
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// The protocol/service multiplexer this channel was opened for.
    pub fn psm(&self) -> u16 {
        self.coc.psm
    }

    /// Largest SDU we accept.
    pub fn mtu(&self) -> u16 {
        self.coc.rx_mtu
    }

    /// Largest SDU the peer accepts.
    pub fn peer_mtu(&self) -> u16 {
        self.coc.tx_mtu
    }

    /// Receive the next SDU into `buf`.
    ///
    /// Returns the SDU's size, or `None` once the channel is closed and
    /// drained. A buffer smaller than the next SDU fails with
    /// [`ReadError::ShortBuffer`] without consuming anything.
    pub async fn read(&self, buf: &mut [u8]) -> Result<Option<usize>, ReadError> {
        let mut read = self.read.lock().await;
        let sdu = match read.peeked.take() {
            Some(sdu) => sdu,
            None => match read.sdu_rx.recv().await {
                Some(sdu) => sdu,
                None => return Ok(None),
            },
        };
        if buf.len() < sdu.len() {
            let size = sdu.len();
            read.peeked = Some(sdu);
            return Err(ReadError::ShortBuffer { size });
        }
        buf[..sdu.len()].copy_from_slice(&sdu);
        Ok(Some(sdu.len()))
    }

    /// Send `buf` as one SDU, returning its length.
    ///
    /// The SDU is prefixed with its length and sliced into fragments of at
    /// most the peer's MPS; every fragment consumes one transmit credit,
    /// suspending while the peer has granted none.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, WriteError> {
        if buf.len() > usize::from(self.coc.tx_mtu) {
            return Err(WriteError::TooLarge {
                max: self.coc.tx_mtu,
            });
        }
        let _guard = self.coc.write_lock.lock().await;
        if self.coc.is_closed() {
            return Err(WriteError::Closed);
        }
        let mut sdu = Vec::with_capacity(2 + buf.len());
        sdu.extend_from_slice(&(buf.len() as u16).to_le_bytes());
        sdu.extend_from_slice(buf);
        for fragment in sdu.chunks(usize::from(self.coc.tx_mps)) {
            self.coc.take_tx_credit().await?;
            self.inner
                .conn
                .write_pdu(&frame::bframe(self.coc.tx_cid, fragment))
                .await?;
        }
        Ok(buf.len())
    }

    /// Close the channel.
    ///
    /// Sends a disconnection request to the peer and tears the channel down
    /// immediately: pending and future reads see end of stream, writes fail.
    /// Fragments already handed to the controller are not recalled.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        if self.inner.remove(self.coc.rx_cid).is_none() {
            // Already closed by the peer, a violation, or an earlier call.
            return Ok(());
        }
        self.coc.close_local();
        self.inner.request_disconnection(&self.coc).await
    }
}
