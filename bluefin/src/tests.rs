use std::io;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;
use hex_literal::hex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::time::timeout;

use proto::cmd::{Opcode, Status};
use proto::event::{Event, LeConnectionComplete};
use proto::frame::{
    self, DisconnectionReq, FlowControlCredit, LeCreditConnectionReq, LeCreditConnectionRes,
    LeCreditConnectionResult, RejectReason, Signal, CID_ATT, CID_LE_SIGNALING,
};
use proto::packet::{AclPacket, BoundaryFlag, BroadcastFlag, Packet};
use proto::{AddrKind, BdAddr, ConnHandle, Role};

use crate::{
    Adapter, ChannelConfig, CommandError, Connection, ConnectionError, L2cap, ReadError,
    Transport,
};

const HANDLE: ConnHandle = ConnHandle(0x0003);

fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .finish();
    tracing::subscriber::set_default(sub)
}

#[derive(Debug)]
struct MockTransport {
    rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl Transport for MockTransport {
    fn poll_recv(&self, cx: &mut Context<'_>) -> Poll<io::Result<Bytes>> {
        self.rx
            .lock()
            .unwrap()
            .poll_recv(cx)
            .map(|packet| packet.ok_or_else(|| io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_send(&self, _cx: &mut Context<'_>, packet: &[u8]) -> Poll<io::Result<()>> {
        Poll::Ready(
            self.tx
                .send(Bytes::copy_from_slice(packet))
                .map_err(|_| io::ErrorKind::BrokenPipe.into()),
        )
    }
}

/// The controller side of a mock transport, scripted by each test.
struct Controller {
    to_host: mpsc::UnboundedSender<Bytes>,
    from_host: mpsc::UnboundedReceiver<Bytes>,
}

fn pair() -> (Adapter, Controller) {
    let (to_host, host_rx) = mpsc::unbounded_channel();
    let (host_tx, from_host) = mpsc::unbounded_channel();
    let adapter = Adapter::new(MockTransport {
        rx: Mutex::new(host_rx),
        tx: host_tx,
    });
    (adapter, Controller { to_host, from_host })
}

impl Controller {
    fn send_raw(&self, packet: Vec<u8>) {
        self.to_host.send(Bytes::from(packet)).unwrap();
    }

    fn send_event(&self, event: Event) {
        self.send_raw(Packet::Event(event).encode());
    }

    fn hang_up(&mut self) {
        let (closed, _) = mpsc::unbounded_channel();
        self.to_host = closed;
    }

    async fn recv(&mut self) -> Packet {
        let raw = self.from_host.recv().await.expect("host hung up");
        Packet::decode(raw).expect("host sent an undecodable packet")
    }

    async fn expect_command(&mut self, opcode: Opcode) -> Bytes {
        match self.recv().await {
            Packet::Command {
                opcode: actual,
                params,
            } => {
                assert_eq!(actual, opcode);
                params
            }
            other => panic!("expected {opcode:?}, host sent {other:?}"),
        }
    }

    fn complete(&self, opcode: Opcode, return_parameters: &[u8]) {
        self.send_event(Event::CommandComplete {
            num_hci_command_packets: 1,
            opcode,
            return_parameters: Bytes::copy_from_slice(return_parameters),
        });
    }

    /// Answer the next command, asserting its opcode.
    async fn handle(&mut self, opcode: Opcode, return_parameters: &[u8]) {
        self.expect_command(opcode).await;
        self.complete(opcode, return_parameters);
    }

    fn connect(&self, handle: ConnHandle) {
        self.send_event(Event::LeConnectionComplete(LeConnectionComplete {
            status: Status::SUCCESS,
            handle,
            role: Role::Peripheral,
            peer_addr_kind: AddrKind::Public,
            peer_addr: BdAddr([0x66, 0x55, 0x44, 0x33, 0x22, 0x11]),
            interval: 0x0028,
            latency: 0,
            supervision_timeout: 0x00c8,
            clock_accuracy: 0,
        }));
    }

    fn send_acl(&self, handle: ConnHandle, boundary: BoundaryFlag, payload: &[u8]) {
        self.send_raw(
            AclPacket {
                handle,
                boundary,
                broadcast: BroadcastFlag::PointToPoint,
                data: Bytes::copy_from_slice(payload),
            }
            .encode(),
        );
    }

    /// Deliver a whole B-frame in a single starting ACL fragment.
    fn send_frame(&self, handle: ConnHandle, cid: u16, payload: &[u8]) {
        self.send_acl(
            handle,
            BoundaryFlag::FirstAutoFlushable,
            &frame::bframe(cid, payload),
        );
    }

    fn send_signal(&self, handle: ConnHandle, signal: &Signal) {
        self.send_frame(handle, CID_LE_SIGNALING, &signal.encode());
    }

    async fn recv_acl(&mut self) -> AclPacket {
        match self.recv().await {
            Packet::Acl(acl) => acl,
            other => panic!("expected ACL data, host sent {other:?}"),
        }
    }

    /// Receive one B-frame, reassembling the host's ACL fragments.
    async fn recv_frame(&mut self) -> (u16, Bytes) {
        let first = self.recv_acl().await;
        assert_eq!(first.boundary, BoundaryFlag::FirstAutoFlushable);
        let mut buf = first.data.to_vec();
        while buf.len() < 4
            || buf.len() < 4 + usize::from(u16::from_le_bytes([buf[0], buf[1]]))
        {
            let cont = self.recv_acl().await;
            assert_eq!(cont.boundary, BoundaryFlag::Continuing);
            buf.extend_from_slice(&cont.data);
        }
        frame::parse_bframe(Bytes::from(buf)).expect("host sent a malformed frame")
    }

    async fn recv_signal(&mut self) -> Signal {
        let (cid, payload) = self.recv_frame().await;
        assert_eq!(cid, CID_LE_SIGNALING);
        Signal::decode(payload).expect("host sent a malformed signal")
    }
}

/// Drive the bring-up sequence with the given controller buffer geometry.
async fn bring_up(adapter: &Adapter, ctrl: &mut Controller, acl_len: u16, acl_pkts: u8) {
    let reset = tokio::join!(adapter.reset(), ctrl.handle(Opcode::RESET, &[0x00]));
    reset.0.unwrap();
    let mut params = vec![0x00];
    params.extend_from_slice(&acl_len.to_le_bytes());
    params.push(acl_pkts);
    let buffer = tokio::join!(
        adapter.le_read_buffer_size(),
        ctrl.handle(Opcode::LE_READ_BUFFER_SIZE, &params)
    );
    let buffer = buffer.0.unwrap();
    assert_eq!(buffer.acl_data_packet_length, acl_len);
    assert_eq!(buffer.total_num_acl_data_packets, acl_pkts);
}

async fn connected(adapter: &Adapter, ctrl: &mut Controller) -> Connection {
    ctrl.connect(HANDLE);
    let conn = adapter.accept().await.unwrap();
    assert_eq!(conn.handle(), HANDLE);
    conn
}

/// Open an approved echo-style channel: PSM 0x0080, peer CID 0x0040.
async fn open_channel(
    l2cap: &L2cap,
    ctrl: &mut Controller,
    rx_mtu: u16,
) -> (crate::Channel, LeCreditConnectionRes) {
    ctrl.send_signal(
        HANDLE,
        &Signal::LeCreditConnectionReq(LeCreditConnectionReq {
            identifier: 7,
            spsm: 0x0080,
            scid: 0x0040,
            mtu: 256,
            mps: 64,
            initial_credits: 10,
        }),
    );
    let pending = l2cap.accept().await.unwrap();
    assert_eq!(pending.psm(), 0x0080);
    assert_eq!(pending.peer_mtu(), 256);
    assert_eq!(pending.peer_mps(), 64);
    assert_eq!(pending.initial_credits(), 10);
    let channel = pending.approve(rx_mtu).await.unwrap();
    let response = match ctrl.recv_signal().await {
        Signal::LeCreditConnectionRes(res) => res,
        other => panic!("expected connection response, got {other:?}"),
    };
    (channel, response)
}

// S1: the reset round trip completes against a scripted controller.
#[tokio::test]
async fn bring_up_reset() {
    let _guard = subscribe();
    let (adapter, mut ctrl) = pair();
    let (result, _) = tokio::join!(adapter.reset(), ctrl.handle(Opcode::RESET, &[0x00]));
    result.unwrap();
}

#[tokio::test]
async fn command_failure_carries_status() {
    let (adapter, mut ctrl) = pair();
    let (result, _) = tokio::join!(adapter.reset(), ctrl.handle(Opcode::RESET, &[0x0c]));
    assert_matches!(
        result,
        Err(CommandError::Failed { opcode: Opcode::RESET, status: Status(0x0c) })
    );
}

#[tokio::test]
async fn unknown_events_are_ignored() {
    let (adapter, mut ctrl) = pair();
    // Hardware Error, which this host does not model.
    ctrl.send_raw(hex!("04 10 01 00").to_vec());
    let (result, _) = tokio::join!(adapter.reset(), ctrl.handle(Opcode::RESET, &[0x00]));
    result.unwrap();
}

// S2: four buffers, four in-flight packets; the fifth write waits until the
// controller completes some.
#[tokio::test(start_paused = true)]
async fn acl_credit_tracking() {
    let _guard = subscribe();
    let (adapter, mut ctrl) = pair();
    bring_up(&adapter, &mut ctrl, 27, 4).await;
    let conn = connected(&adapter, &mut ctrl).await;

    let writer = tokio::spawn(async move {
        for i in 0u8..7 {
            conn.write_pdu(&[i; 10]).await.unwrap();
        }
    });

    for _ in 0..4 {
        ctrl.recv_acl().await;
    }
    assert!(
        timeout(Duration::from_millis(100), ctrl.recv_acl())
            .await
            .is_err(),
        "write went through without credits"
    );

    ctrl.send_event(Event::NumberOfCompletedPackets(vec![(HANDLE, 2)]));
    for _ in 0..2 {
        ctrl.recv_acl().await;
    }
    assert!(
        timeout(Duration::from_millis(100), ctrl.recv_acl())
            .await
            .is_err(),
        "more writes than completed packets"
    );

    ctrl.send_event(Event::NumberOfCompletedPackets(vec![(HANDLE, 2)]));
    ctrl.recv_acl().await;
    writer.await.unwrap();
}

#[tokio::test]
async fn acl_writes_fragment_to_the_controller_mtu() {
    let (adapter, mut ctrl) = pair();
    bring_up(&adapter, &mut ctrl, 27, 8).await;
    let conn = connected(&adapter, &mut ctrl).await;

    let pdu: Vec<u8> = (0..=63).collect();
    conn.write_pdu(&pdu).await.unwrap();

    let mut reassembled = Vec::new();
    for i in 0..3 {
        let fragment = ctrl.recv_acl().await;
        assert_eq!(fragment.handle, HANDLE);
        assert_eq!(
            fragment.boundary,
            if i == 0 {
                BoundaryFlag::FirstAutoFlushable
            } else {
                BoundaryFlag::Continuing
            }
        );
        assert!(fragment.data.len() <= 27);
        reassembled.extend_from_slice(&fragment.data);
    }
    assert_eq!(reassembled, pdu);
}

// S3: a PDU split across two ACL fragments reaches the dispatcher whole.
#[tokio::test]
async fn acl_reassembly() {
    let (adapter, mut ctrl) = pair();
    bring_up(&adapter, &mut ctrl, 27, 4).await;
    let conn = connected(&adapter, &mut ctrl).await;

    ctrl.send_acl(
        HANDLE,
        BoundaryFlag::FirstAutoFlushable,
        &hex!("05 00 05 00 41"),
    );
    ctrl.send_acl(HANDLE, BoundaryFlag::Continuing, b"BCDE");

    let pdu = conn.read_pdu().await.unwrap();
    let (cid, payload) = frame::parse_bframe(pdu).unwrap();
    assert_eq!(cid, 0x0005);
    assert_eq!(&payload[..], b"ABCDE");
}

#[tokio::test]
async fn acl_start_while_buffered_is_fatal() {
    let (adapter, mut ctrl) = pair();
    bring_up(&adapter, &mut ctrl, 27, 4).await;
    let conn = connected(&adapter, &mut ctrl).await;

    ctrl.send_acl(
        HANDLE,
        BoundaryFlag::FirstAutoFlushable,
        &hex!("05 00 05 00 41"),
    );
    ctrl.send_acl(
        HANDLE,
        BoundaryFlag::FirstAutoFlushable,
        &hex!("05 00 05 00 41"),
    );
    assert_matches!(
        conn.read_pdu().await,
        Err(ConnectionError::Protocol(_))
    );
    // The error is sticky.
    assert_matches!(
        conn.read_pdu().await,
        Err(ConnectionError::Protocol(_))
    );
}

#[tokio::test]
async fn random_fragmentation_reassembles() {
    let mut rng = StdRng::seed_from_u64(0x0b1e);
    let (adapter, mut ctrl) = pair();
    bring_up(&adapter, &mut ctrl, 1021, 4).await;
    let conn = connected(&adapter, &mut ctrl).await;

    for _ in 0..32 {
        let payload_len = rng.random_range(0..2000);
        let payload: Vec<u8> = (0..payload_len).map(|_| rng.random()).collect();
        let pdu = frame::bframe(0x0040, &payload);

        let mut offset = 0;
        let mut first = true;
        while offset < pdu.len() {
            let fragment_len = rng.random_range(1..=pdu.len() - offset);
            ctrl.send_acl(
                HANDLE,
                if first {
                    BoundaryFlag::FirstAutoFlushable
                } else {
                    BoundaryFlag::Continuing
                },
                &pdu[offset..offset + fragment_len],
            );
            offset += fragment_len;
            first = false;
        }
        assert_eq!(&conn.read_pdu().await.unwrap()[..], pdu);
    }
}

#[tokio::test]
async fn disconnection_fails_the_connection() {
    let (adapter, mut ctrl) = pair();
    bring_up(&adapter, &mut ctrl, 27, 4).await;
    let conn = connected(&adapter, &mut ctrl).await;

    ctrl.send_event(Event::DisconnectionComplete {
        status: Status::SUCCESS,
        handle: HANDLE,
        reason: 0x13,
    });
    assert_matches!(
        conn.read_pdu().await,
        Err(ConnectionError::Disconnected { reason: 0x13 })
    );
}

/// Credits stranded on a dying link return to the pool.
#[tokio::test(start_paused = true)]
async fn disconnection_returns_pending_credits() {
    let (adapter, mut ctrl) = pair();
    bring_up(&adapter, &mut ctrl, 27, 2).await;
    let conn = connected(&adapter, &mut ctrl).await;

    conn.write_pdu(&[0; 10]).await.unwrap();
    conn.write_pdu(&[1; 10]).await.unwrap();
    ctrl.recv_acl().await;
    ctrl.recv_acl().await;

    // Second connection cannot send: the first holds both credits.
    ctrl.connect(ConnHandle(0x0004));
    let other = adapter.accept().await.unwrap();
    let writer = tokio::spawn(async move { other.write_pdu(&[2; 10]).await });
    assert!(
        timeout(Duration::from_millis(100), ctrl.recv_acl())
            .await
            .is_err()
    );

    ctrl.send_event(Event::DisconnectionComplete {
        status: Status::SUCCESS,
        handle: HANDLE,
        reason: 0x13,
    });
    ctrl.recv_acl().await;
    writer.await.unwrap().unwrap();
}

// S4: credit-based channel open and echo.
#[tokio::test]
async fn coc_open_and_echo() {
    let _guard = subscribe();
    let (adapter, mut ctrl) = pair();
    bring_up(&adapter, &mut ctrl, 251, 8).await;
    let conn = connected(&adapter, &mut ctrl).await;
    let l2cap = L2cap::new(conn);

    let (channel, response) = open_channel(&l2cap, &mut ctrl, 256).await;
    assert_eq!(
        response,
        LeCreditConnectionRes {
            identifier: 7,
            dcid: 0x0040,
            mtu: 256,
            mps: 256,
            initial_credits: 500,
            result: LeCreditConnectionResult::Success,
        }
    );

    ctrl.send_frame(HANDLE, 0x0040, &hex!("02 00 68 69"));
    let mut buf = [0; 256];
    assert_eq!(channel.read(&mut buf).await.unwrap(), Some(2));
    assert_eq!(&buf[..2], b"hi");

    let written = channel.write(b"hi").await.unwrap();
    assert_eq!(written, 2);
    let (cid, payload) = ctrl.recv_frame().await;
    assert_eq!(cid, 0x0040);
    assert_eq!(&payload[..], hex!("02 00 68 69"));
}

#[tokio::test]
async fn short_read_buffer_keeps_the_sdu() {
    let (adapter, mut ctrl) = pair();
    bring_up(&adapter, &mut ctrl, 251, 8).await;
    let conn = connected(&adapter, &mut ctrl).await;
    let l2cap = L2cap::new(conn);
    let (channel, _) = open_channel(&l2cap, &mut ctrl, 256).await;

    ctrl.send_frame(HANDLE, 0x0040, &hex!("05 00 68 65 6c 6c 6f"));
    let mut small = [0; 2];
    assert_matches!(
        channel.read(&mut small).await,
        Err(ReadError::ShortBuffer { size: 5 })
    );
    let mut big = [0; 16];
    assert_eq!(channel.read(&mut big).await.unwrap(), Some(5));
    assert_eq!(&big[..5], b"hello");
}

#[tokio::test]
async fn sdu_reassembles_across_fragments() {
    let (adapter, mut ctrl) = pair();
    bring_up(&adapter, &mut ctrl, 251, 8).await;
    let conn = connected(&adapter, &mut ctrl).await;
    let l2cap = L2cap::new(conn);
    let (channel, _) = open_channel(&l2cap, &mut ctrl, 256).await;

    // A 100-byte SDU in fragments of 2 + 48, 32 and 20 bytes.
    let sdu: Vec<u8> = (0..100).collect();
    ctrl.send_frame(
        HANDLE,
        0x0040,
        &[&100u16.to_le_bytes()[..], &sdu[..48]].concat(),
    );
    ctrl.send_frame(HANDLE, 0x0040, &sdu[48..80]);
    ctrl.send_frame(HANDLE, 0x0040, &sdu[80..]);

    let mut buf = [0; 256];
    assert_eq!(channel.read(&mut buf).await.unwrap(), Some(100));
    assert_eq!(&buf[..100], &sdu[..]);
}

#[tokio::test]
async fn random_sdu_splits_reassemble() {
    let mut rng = StdRng::seed_from_u64(0xc0c);
    let (adapter, mut ctrl) = pair();
    bring_up(&adapter, &mut ctrl, 251, 8).await;
    let conn = connected(&adapter, &mut ctrl).await;
    let l2cap = L2cap::new(conn);
    let (channel, _) = open_channel(&l2cap, &mut ctrl, 256).await;

    let mut buf = [0; 256];
    for _ in 0..32 {
        let sdu_len = rng.random_range(0..=256usize);
        let sdu: Vec<u8> = (0..sdu_len).map(|_| rng.random()).collect();
        let mut framed = (sdu_len as u16).to_le_bytes().to_vec();
        framed.extend_from_slice(&sdu);

        let mut offset = 0;
        while offset < framed.len() {
            // rx_mps is 256 here; stay within it.
            let fragment_len = rng.random_range(1..=(framed.len() - offset).min(256));
            ctrl.send_frame(HANDLE, 0x0040, &framed[offset..offset + fragment_len]);
            offset += fragment_len;
        }

        assert_eq!(channel.read(&mut buf).await.unwrap(), Some(sdu_len));
        assert_eq!(&buf[..sdu_len], &sdu[..]);
    }
}

// S5: receive credits replenish in batches once the pool runs low.
#[tokio::test]
async fn coc_credit_replenishment() {
    let (adapter, mut ctrl) = pair();
    bring_up(&adapter, &mut ctrl, 251, 8).await;
    let conn = connected(&adapter, &mut ctrl).await;
    let l2cap = L2cap::new(conn);
    let (channel, response) = open_channel(&l2cap, &mut ctrl, 256).await;
    assert_eq!(response.initial_credits, 500);

    // Each empty SDU costs one credit; the 430th takes the pool to the
    // low watermark of 70 and triggers a batch of 500.
    for _ in 0..430 {
        ctrl.send_frame(HANDLE, 0x0040, &hex!("00 00"));
    }
    let signal = ctrl.recv_signal().await;
    assert_matches!(
        signal,
        Signal::FlowControlCredit(FlowControlCredit {
            cid: 0x0040,
            credits: 500,
            identifier,
        }) if identifier != 0
    );

    // All 430 SDUs arrived despite the replenishment traffic.
    let mut buf = [0; 16];
    for _ in 0..430 {
        assert_eq!(channel.read(&mut buf).await.unwrap(), Some(0));
    }
}

// S6: a declared SDU length beyond the negotiated MTU tears the channel down.
#[tokio::test]
async fn coc_mtu_violation_disconnects() {
    let _guard = subscribe();
    let (adapter, mut ctrl) = pair();
    bring_up(&adapter, &mut ctrl, 251, 8).await;
    let conn = connected(&adapter, &mut ctrl).await;
    let l2cap = L2cap::new(conn);
    let (channel, _) = open_channel(&l2cap, &mut ctrl, 64).await;

    // Declares a 100-byte SDU against rx_mtu 64.
    ctrl.send_frame(HANDLE, 0x0040, &hex!("64 00 41 42"));
    let signal = ctrl.recv_signal().await;
    assert_matches!(
        signal,
        Signal::DisconnectionReq(DisconnectionReq {
            dcid: 0x0040, // the peer's CID
            scid: 0x0040, // ours
            ..
        })
    );

    let mut buf = [0; 64];
    assert_eq!(channel.read(&mut buf).await.unwrap(), None);
    assert_matches!(
        channel.write(b"x").await,
        Err(crate::WriteError::Closed)
    );
}

#[tokio::test(start_paused = true)]
async fn coc_write_waits_for_peer_credits() {
    let (adapter, mut ctrl) = pair();
    bring_up(&adapter, &mut ctrl, 251, 8).await;
    let conn = connected(&adapter, &mut ctrl).await;
    let l2cap = L2cap::new(conn);

    // Peer grants no credits up front.
    ctrl.send_signal(
        HANDLE,
        &Signal::LeCreditConnectionReq(LeCreditConnectionReq {
            identifier: 1,
            spsm: 0x0080,
            scid: 0x0040,
            mtu: 256,
            mps: 64,
            initial_credits: 0,
        }),
    );
    let pending = l2cap.accept().await.unwrap();
    let channel = Arc::new(pending.approve(256).await.unwrap());
    ctrl.recv_signal().await;

    let writer = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.write(b"later").await })
    };
    assert!(
        timeout(Duration::from_millis(100), ctrl.recv_acl())
            .await
            .is_err(),
        "wrote without transmit credits"
    );

    ctrl.send_signal(
        HANDLE,
        &Signal::FlowControlCredit(FlowControlCredit {
            identifier: 2,
            cid: 0x0040,
            credits: 1,
        }),
    );
    let (cid, payload) = ctrl.recv_frame().await;
    assert_eq!(cid, 0x0040);
    assert_eq!(&payload[..], hex!("05 00 6c 61 74 65 72"));
    assert_eq!(writer.await.unwrap().unwrap(), 5);
}

#[tokio::test]
async fn coc_sdu_transmits_in_mps_sized_frames() {
    let (adapter, mut ctrl) = pair();
    bring_up(&adapter, &mut ctrl, 251, 32).await;
    let conn = connected(&adapter, &mut ctrl).await;
    let l2cap = L2cap::new(conn);
    let (channel, _) = open_channel(&l2cap, &mut ctrl, 256).await;

    // Peer MPS is 64: a 150-byte SDU leaves as 64 + 64 + 24, each its own
    // B-frame, each costing one of the ten granted credits.
    let sdu: Vec<u8> = (0..150).collect();
    channel.write(&sdu).await.unwrap();

    let mut framed = Vec::new();
    for expected in [64usize, 64, 24] {
        let (cid, payload) = ctrl.recv_frame().await;
        assert_eq!(cid, 0x0040);
        assert_eq!(payload.len(), expected);
        framed.extend_from_slice(&payload);
    }
    assert_eq!(&framed[..2], &150u16.to_le_bytes()[..]);
    assert_eq!(&framed[2..], &sdu[..]);
}

#[tokio::test]
async fn coc_credit_overflow_disconnects() {
    let (adapter, mut ctrl) = pair();
    bring_up(&adapter, &mut ctrl, 251, 8).await;
    let conn = connected(&adapter, &mut ctrl).await;
    let l2cap = L2cap::new(conn);
    let (_channel, _) = open_channel(&l2cap, &mut ctrl, 256).await;

    // 10 initial credits + 0xffff overflows the counter.
    ctrl.send_signal(
        HANDLE,
        &Signal::FlowControlCredit(FlowControlCredit {
            identifier: 2,
            cid: 0x0040,
            credits: 0xffff,
        }),
    );
    assert_matches!(
        ctrl.recv_signal().await,
        Signal::DisconnectionReq(DisconnectionReq { dcid: 0x0040, scid: 0x0040, .. })
    );
}

#[tokio::test]
async fn coc_rejection_sends_the_result() {
    let (adapter, mut ctrl) = pair();
    bring_up(&adapter, &mut ctrl, 251, 8).await;
    let conn = connected(&adapter, &mut ctrl).await;
    let l2cap = L2cap::new(conn);

    ctrl.send_signal(
        HANDLE,
        &Signal::LeCreditConnectionReq(LeCreditConnectionReq {
            identifier: 9,
            spsm: 0x00aa,
            scid: 0x0040,
            mtu: 256,
            mps: 64,
            initial_credits: 10,
        }),
    );
    let pending = l2cap.accept().await.unwrap();
    assert_eq!(pending.psm(), 0x00aa);
    pending
        .reject(LeCreditConnectionResult::SpsmNotSupported)
        .await
        .unwrap();
    assert_matches!(
        ctrl.recv_signal().await,
        Signal::LeCreditConnectionRes(LeCreditConnectionRes {
            identifier: 9,
            dcid: 0,
            result: LeCreditConnectionResult::SpsmNotSupported,
            ..
        })
    );
}

#[tokio::test]
async fn coc_request_validation_refusals() {
    let (adapter, mut ctrl) = pair();
    bring_up(&adapter, &mut ctrl, 251, 8).await;
    let conn = connected(&adapter, &mut ctrl).await;
    let l2cap = L2cap::new(conn);

    // MTU below the protocol minimum.
    ctrl.send_signal(
        HANDLE,
        &Signal::LeCreditConnectionReq(LeCreditConnectionReq {
            identifier: 1,
            spsm: 0x0080,
            scid: 0x0040,
            mtu: 22,
            mps: 64,
            initial_credits: 0,
        }),
    );
    assert_matches!(
        ctrl.recv_signal().await,
        Signal::LeCreditConnectionRes(LeCreditConnectionRes {
            identifier: 1,
            result: LeCreditConnectionResult::UnacceptableParameters,
            ..
        })
    );

    // Source CID inside the reserved range.
    ctrl.send_signal(
        HANDLE,
        &Signal::LeCreditConnectionReq(LeCreditConnectionReq {
            identifier: 2,
            spsm: 0x0080,
            scid: 0x003f,
            mtu: 256,
            mps: 64,
            initial_credits: 0,
        }),
    );
    assert_matches!(
        ctrl.recv_signal().await,
        Signal::LeCreditConnectionRes(LeCreditConnectionRes {
            identifier: 2,
            result: LeCreditConnectionResult::InvalidSourceCid,
            ..
        })
    );

    // A source CID that is already the transmit CID of a live channel.
    let (_channel, _) = open_channel(&l2cap, &mut ctrl, 256).await;
    ctrl.send_signal(
        HANDLE,
        &Signal::LeCreditConnectionReq(LeCreditConnectionReq {
            identifier: 3,
            spsm: 0x0080,
            scid: 0x0040,
            mtu: 256,
            mps: 64,
            initial_credits: 0,
        }),
    );
    assert_matches!(
        ctrl.recv_signal().await,
        Signal::LeCreditConnectionRes(LeCreditConnectionRes {
            identifier: 3,
            result: LeCreditConnectionResult::SourceCidAlreadyAllocated,
            ..
        })
    );
}

#[tokio::test]
async fn peer_disconnection_request_closes_the_channel() {
    let (adapter, mut ctrl) = pair();
    bring_up(&adapter, &mut ctrl, 251, 8).await;
    let conn = connected(&adapter, &mut ctrl).await;
    let l2cap = L2cap::new(conn);
    let (channel, _) = open_channel(&l2cap, &mut ctrl, 256).await;

    ctrl.send_signal(
        HANDLE,
        &Signal::DisconnectionReq(DisconnectionReq {
            identifier: 4,
            dcid: 0x0040, // our CID
            scid: 0x0040, // the peer's CID
        }),
    );
    assert_matches!(
        ctrl.recv_signal().await,
        Signal::DisconnectionRes(frame::DisconnectionRes {
            identifier: 4,
            dcid: 0x0040,
            scid: 0x0040,
        })
    );
    let mut buf = [0; 16];
    assert_eq!(channel.read(&mut buf).await.unwrap(), None);
}

#[tokio::test]
async fn local_close_requests_disconnection() {
    let (adapter, mut ctrl) = pair();
    bring_up(&adapter, &mut ctrl, 251, 8).await;
    let conn = connected(&adapter, &mut ctrl).await;
    let l2cap = L2cap::new(conn);
    let (channel, _) = open_channel(&l2cap, &mut ctrl, 256).await;

    channel.close().await.unwrap();
    assert_matches!(
        ctrl.recv_signal().await,
        Signal::DisconnectionReq(DisconnectionReq { dcid: 0x0040, scid: 0x0040, .. })
    );
    let mut buf = [0; 16];
    assert_eq!(channel.read(&mut buf).await.unwrap(), None);
    assert_matches!(channel.write(b"x").await, Err(crate::WriteError::Closed));
    // Closing again is a no-op.
    channel.close().await.unwrap();
}

#[tokio::test]
async fn unknown_signal_opcode_is_rejected() {
    let (adapter, mut ctrl) = pair();
    bring_up(&adapter, &mut ctrl, 251, 8).await;
    let conn = connected(&adapter, &mut ctrl).await;
    let _l2cap = L2cap::new(conn);

    // Opcode 0x41 with identifier 0x2a and an empty body.
    ctrl.send_frame(HANDLE, CID_LE_SIGNALING, &hex!("41 2a 00 00"));
    assert_matches!(
        ctrl.recv_signal().await,
        Signal::CommandReject(frame::CommandReject {
            identifier: 0x2a,
            reason: RejectReason::CommandNotUnderstood,
            ..
        })
    );
}

#[tokio::test]
async fn att_discovery_gets_not_found() {
    let (adapter, mut ctrl) = pair();
    bring_up(&adapter, &mut ctrl, 251, 8).await;
    let conn = connected(&adapter, &mut ctrl).await;
    let _l2cap = L2cap::new(conn);

    // Read By Type request for the primary service declaration.
    ctrl.send_frame(HANDLE, CID_ATT, &hex!("08 01 00 ff ff 00 28"));
    let (cid, payload) = ctrl.recv_frame().await;
    assert_eq!(cid, CID_ATT);
    assert_eq!(&payload[..], hex!("01 08 01 00 0a"));
}

#[tokio::test]
async fn channel_config_shrinks_the_credit_batch() {
    let (adapter, mut ctrl) = pair();
    bring_up(&adapter, &mut ctrl, 251, 8).await;
    let conn = connected(&adapter, &mut ctrl).await;
    let mut config = ChannelConfig::default();
    config.credits(8).credit_low_watermark(2);
    let l2cap = L2cap::with_config(conn, config);

    let (_channel, response) = open_channel(&l2cap, &mut ctrl, 256).await;
    assert_eq!(response.initial_credits, 8);

    for _ in 0..6 {
        ctrl.send_frame(HANDLE, 0x0040, &hex!("00 00"));
    }
    assert_matches!(
        ctrl.recv_signal().await,
        Signal::FlowControlCredit(FlowControlCredit { cid: 0x0040, credits: 8, .. })
    );
}

#[tokio::test]
async fn transport_failure_fans_out() {
    let (adapter, mut ctrl) = pair();
    bring_up(&adapter, &mut ctrl, 27, 4).await;
    let conn = connected(&adapter, &mut ctrl).await;

    ctrl.hang_up();
    assert_matches!(
        conn.read_pdu().await,
        Err(ConnectionError::Adapter(crate::AdapterError::Transport(_)))
    );
    assert_matches!(
        adapter.reset().await,
        Err(CommandError::Adapter(crate::AdapterError::Transport(_)))
    );
    assert_matches!(adapter.accept().await, Err(_));
}
