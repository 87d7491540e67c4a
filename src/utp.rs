//! uTP: UDP-encapsulated reliable transport (BEP-29).
//!
//! Sockets share the session's UDP socket, demultiplexed by connection
//! id. Congestion control follows LEDBAT: the send window scales with
//! the measured one-way delay against a 100 ms target, so bulk transfer
//! yields to interactive traffic. The socket state machine is
//! {idle, syn-sent, connected, fin-sent, close-wait}; a closing socket
//! keeps draining until its FIN is acknowledged, which may outlive a
//! session abort.
//!
//! The engine owns the [`UtpManager`]; peer pumps see a socket as a
//! [`UtpReader`]/[`UtpWriter`] pair.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::constants::{UTP_DRAIN_TIMEOUT, UTP_HEADER_LEN, UTP_MIN_RTO, UTP_MTU, UTP_TARGET_DELAY};

#[derive(Debug, Error)]
pub enum UtpError {
    #[error("malformed utp header")]
    BadHeader,

    #[error("connection reset")]
    Reset,
}

/// Packet types, encoded in the high nibble of the first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Data = 0,
    Fin = 1,
    State = 2,
    Reset = 3,
    Syn = 4,
}

impl PacketType {
    fn from_nibble(nibble: u8) -> Option<Self> {
        Some(match nibble {
            0 => PacketType::Data,
            1 => PacketType::Fin,
            2 => PacketType::State,
            3 => PacketType::Reset,
            4 => PacketType::Syn,
            _ => return None,
        })
    }
}

/// The 20-byte uTP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub packet_type: PacketType,
    pub connection_id: u16,
    pub timestamp_us: u32,
    pub timestamp_diff_us: u32,
    pub wnd_size: u32,
    pub seq_nr: u16,
    pub ack_nr: u16,
}

impl Header {
    pub fn encode(&self) -> [u8; UTP_HEADER_LEN] {
        let mut buf = [0u8; UTP_HEADER_LEN];
        buf[0] = (self.packet_type as u8) << 4 | 1; // version 1
        buf[1] = 0; // no extensions
        buf[2..4].copy_from_slice(&self.connection_id.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp_us.to_be_bytes());
        buf[8..12].copy_from_slice(&self.timestamp_diff_us.to_be_bytes());
        buf[12..16].copy_from_slice(&self.wnd_size.to_be_bytes());
        buf[16..18].copy_from_slice(&self.seq_nr.to_be_bytes());
        buf[18..20].copy_from_slice(&self.ack_nr.to_be_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<(Self, usize), UtpError> {
        if data.len() < UTP_HEADER_LEN {
            return Err(UtpError::BadHeader);
        }
        if data[0] & 0x0f != 1 {
            return Err(UtpError::BadHeader);
        }
        let packet_type = PacketType::from_nibble(data[0] >> 4).ok_or(UtpError::BadHeader)?;

        // skip extension chain
        let mut offset = UTP_HEADER_LEN;
        let mut ext = data[1];
        while ext != 0 {
            if data.len() < offset + 2 {
                return Err(UtpError::BadHeader);
            }
            ext = data[offset];
            let len = data[offset + 1] as usize;
            offset += 2 + len;
            if data.len() < offset {
                return Err(UtpError::BadHeader);
            }
        }

        let mut fixed = &data[2..UTP_HEADER_LEN];
        Ok((
            Self {
                packet_type,
                connection_id: fixed.get_u16(),
                timestamp_us: fixed.get_u32(),
                timestamp_diff_us: fixed.get_u32(),
                wnd_size: fixed.get_u32(),
                seq_nr: fixed.get_u16(),
                ack_nr: fixed.get_u16(),
            },
            offset,
        ))
    }
}

/// Heuristic: does this datagram look like uTP (as opposed to DHT
/// bencode or a UDP tracker response)?
pub fn looks_like_utp(data: &[u8]) -> bool {
    data.len() >= UTP_HEADER_LEN
        && data[0] & 0x0f == 1
        && PacketType::from_nibble(data[0] >> 4).is_some()
}

/// Socket states per BEP-29.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtpState {
    Idle,
    SynSent,
    Connected,
    /// We sent FIN and are waiting for its ack.
    FinSent,
    /// The remote sent FIN; we drain and close.
    CloseWait,
    Closed,
}

struct InflightPacket {
    seq_nr: u16,
    data: Bytes,
    sent_at: Instant,
    transmissions: u32,
}

/// One uTP connection.
pub struct UtpSocket {
    pub state: UtpState,
    pub remote: SocketAddr,
    /// Id we receive on; send id is this plus one (initiator convention).
    recv_id: u16,
    send_id: u16,
    seq_nr: u16,
    ack_nr: u16,
    /// LEDBAT congestion window, bytes.
    cwnd: usize,
    /// Lowest observed one-way delay, the LEDBAT baseline.
    base_delay_us: u32,
    rtt: Duration,
    rtt_var: Duration,
    rto: Duration,
    inflight: VecDeque<InflightPacket>,
    inflight_bytes: usize,
    send_queue: VecDeque<Bytes>,
    /// Out-of-order segments keyed by seq_nr.
    reorder: HashMap<u16, Bytes>,
    /// Datagrams ready for the wire.
    outgoing: Vec<(Vec<u8>, SocketAddr)>,
    /// Delivery channel to the reader half.
    app_rx_tx: mpsc::UnboundedSender<Bytes>,
    started: Instant,
    fin_deadline: Option<Instant>,
}

impl UtpSocket {
    fn micros(&self, now: Instant) -> u32 {
        now.duration_since(self.started).as_micros() as u32
    }

    fn new(
        remote: SocketAddr,
        recv_id: u16,
        send_id: u16,
        app_rx_tx: mpsc::UnboundedSender<Bytes>,
        now: Instant,
    ) -> Self {
        Self {
            state: UtpState::Idle,
            remote,
            recv_id,
            send_id,
            seq_nr: rand::random(),
            ack_nr: 0,
            cwnd: UTP_MTU * 2,
            base_delay_us: u32::MAX,
            rtt: Duration::from_millis(500),
            rtt_var: Duration::from_millis(250),
            rto: Duration::from_secs(1),
            inflight: VecDeque::new(),
            inflight_bytes: 0,
            send_queue: VecDeque::new(),
            reorder: HashMap::new(),
            outgoing: Vec::new(),
            app_rx_tx,
            started: now,
            fin_deadline: None,
        }
    }

    fn header(&self, packet_type: PacketType, now: Instant) -> Header {
        Header {
            packet_type,
            connection_id: if packet_type == PacketType::Syn {
                self.recv_id
            } else {
                self.send_id
            },
            timestamp_us: self.micros(now),
            timestamp_diff_us: 0,
            wnd_size: 1024 * 1024,
            seq_nr: self.seq_nr,
            ack_nr: self.ack_nr,
        }
    }

    fn emit(&mut self, header: Header, payload: &[u8]) {
        let mut datagram = Vec::with_capacity(UTP_HEADER_LEN + payload.len());
        datagram.extend_from_slice(&header.encode());
        datagram.extend_from_slice(payload);
        self.outgoing.push((datagram, self.remote));
    }

    /// Initiates the connection (SYN).
    fn connect(&mut self, now: Instant) {
        let header = self.header(PacketType::Syn, now);
        self.state = UtpState::SynSent;
        self.inflight.push_back(InflightPacket {
            seq_nr: self.seq_nr,
            data: Bytes::new(),
            sent_at: now,
            transmissions: 1,
        });
        self.seq_nr = self.seq_nr.wrapping_add(1);
        self.emit(header, &[]);
    }

    /// Queues application data and flushes whatever the window allows.
    fn send(&mut self, data: Bytes, now: Instant) {
        for chunk in data.chunks(UTP_MTU) {
            self.send_queue.push_back(Bytes::copy_from_slice(chunk));
        }
        self.flush(now);
    }

    fn flush(&mut self, now: Instant) {
        if !matches!(self.state, UtpState::Connected) {
            return;
        }
        while let Some(chunk) = self.send_queue.front() {
            if self.inflight_bytes + chunk.len() > self.cwnd {
                break;
            }
            let chunk = self.send_queue.pop_front().expect("front checked");
            let header = self.header(PacketType::Data, now);
            self.inflight_bytes += chunk.len();
            self.inflight.push_back(InflightPacket {
                seq_nr: self.seq_nr,
                data: chunk.clone(),
                sent_at: now,
                transmissions: 1,
            });
            self.seq_nr = self.seq_nr.wrapping_add(1);
            self.emit(header, &chunk);
        }
    }

    /// Starts a graceful close: FIN after the queue drains.
    fn close(&mut self, now: Instant) {
        match self.state {
            UtpState::Connected | UtpState::CloseWait => {
                self.flush(now);
                let header = self.header(PacketType::Fin, now);
                self.state = UtpState::FinSent;
                self.fin_deadline = Some(now + UTP_DRAIN_TIMEOUT);
                self.inflight.push_back(InflightPacket {
                    seq_nr: self.seq_nr,
                    data: Bytes::new(),
                    sent_at: now,
                    transmissions: 1,
                });
                self.seq_nr = self.seq_nr.wrapping_add(1);
                self.emit(header, &[]);
            }
            UtpState::Idle | UtpState::SynSent => self.state = UtpState::Closed,
            UtpState::FinSent | UtpState::Closed => {}
        }
    }

    fn on_packet(&mut self, header: Header, payload: Bytes, now: Instant) {
        match header.packet_type {
            PacketType::Reset => {
                debug!(remote = %self.remote, "utp reset");
                self.state = UtpState::Closed;
                return;
            }
            PacketType::Syn => {
                // incoming connection; ack the SYN
                self.ack_nr = header.seq_nr;
                self.state = UtpState::Connected;
                let state = self.header(PacketType::State, now);
                self.emit(state, &[]);
                return;
            }
            _ => {}
        }

        self.process_acks(header.ack_nr, header.timestamp_diff_us, now);

        match header.packet_type {
            PacketType::State => {
                if self.state == UtpState::SynSent {
                    self.state = UtpState::Connected;
                    self.ack_nr = header.seq_nr.wrapping_sub(1);
                    self.flush(now);
                }
                if self.state == UtpState::FinSent && self.inflight.is_empty() {
                    self.state = UtpState::Closed;
                }
            }
            PacketType::Data => {
                self.receive_segment(header.seq_nr, payload, now);
            }
            PacketType::Fin => {
                self.ack_nr = header.seq_nr;
                let state = self.header(PacketType::State, now);
                self.emit(state, &[]);
                self.state = match self.state {
                    UtpState::FinSent => UtpState::Closed,
                    _ => UtpState::CloseWait,
                };
                if self.state == UtpState::CloseWait {
                    self.fin_deadline = Some(now + UTP_DRAIN_TIMEOUT);
                }
            }
            _ => {}
        }
    }

    fn receive_segment(&mut self, seq_nr: u16, payload: Bytes, now: Instant) {
        if payload.is_empty() {
            return;
        }
        let expected = self.ack_nr.wrapping_add(1);
        if seq_nr == expected {
            self.ack_nr = seq_nr;
            let _ = self.app_rx_tx.send(payload);
            // drain any contiguous out-of-order segments
            loop {
                let next = self.ack_nr.wrapping_add(1);
                match self.reorder.remove(&next) {
                    Some(segment) => {
                        self.ack_nr = next;
                        let _ = self.app_rx_tx.send(segment);
                    }
                    None => break,
                }
            }
        } else if seq_nr.wrapping_sub(expected) < 1024 {
            self.reorder.insert(seq_nr, payload);
        }
        let state = self.header(PacketType::State, now);
        self.emit(state, &[]);
    }

    fn process_acks(&mut self, ack_nr: u16, timestamp_diff_us: u32, now: Instant) {
        let mut acked_bytes = 0usize;
        while let Some(front) = self.inflight.front() {
            // wrapping compare: front.seq_nr <= ack_nr
            let delta = ack_nr.wrapping_sub(front.seq_nr);
            if delta >= 0x8000 {
                break;
            }
            let packet = self.inflight.pop_front().expect("front checked");
            acked_bytes += packet.data.len();
            self.inflight_bytes = self.inflight_bytes.saturating_sub(packet.data.len());
            if packet.transmissions == 1 {
                self.update_rtt(now.duration_since(packet.sent_at));
            }
        }
        if acked_bytes > 0 {
            self.apply_ledbat(timestamp_diff_us, acked_bytes);
            self.flush(now);
        }
        if self.state == UtpState::FinSent && self.inflight.is_empty() {
            self.state = UtpState::Closed;
        }
    }

    /// LEDBAT window update from the remote's measured one-way delay.
    fn apply_ledbat(&mut self, timestamp_diff_us: u32, acked_bytes: usize) {
        if timestamp_diff_us == 0 {
            return;
        }
        self.base_delay_us = self.base_delay_us.min(timestamp_diff_us);
        let queuing_delay_us = timestamp_diff_us - self.base_delay_us;
        let target_us = UTP_TARGET_DELAY.as_micros() as f64;
        let off_target = (target_us - queuing_delay_us as f64) / target_us;
        // gain: at most one MTU of growth per RTT's worth of acked bytes
        let gain = off_target * acked_bytes as f64 * UTP_MTU as f64
            / self.cwnd.max(UTP_MTU) as f64;
        let next = self.cwnd as f64 + gain;
        self.cwnd = next.max(UTP_MTU as f64).min((4 * 1024 * 1024) as f64) as usize;
    }

    fn update_rtt(&mut self, sample: Duration) {
        // Jacobson/Karels
        let err = if sample > self.rtt {
            sample - self.rtt
        } else {
            self.rtt - sample
        };
        self.rtt_var = (self.rtt_var * 3 + err) / 4;
        self.rtt = (self.rtt * 7 + sample) / 8;
        self.rto = (self.rtt + self.rtt_var * 4).max(UTP_MIN_RTO);
    }

    /// Retransmits expired packets and times out dead connections.
    fn tick(&mut self, now: Instant) {
        if let Some(deadline) = self.fin_deadline {
            if now >= deadline {
                self.state = UtpState::Closed;
                return;
            }
        }
        let rto = self.rto;
        let mut retransmit: Vec<usize> = Vec::new();
        for (i, packet) in self.inflight.iter().enumerate() {
            if now.duration_since(packet.sent_at) >= rto {
                retransmit.push(i);
            }
        }
        if retransmit.is_empty() {
            return;
        }
        // timeout halves the window
        self.cwnd = (self.cwnd / 2).max(UTP_MTU);
        self.rto = (self.rto * 2).min(Duration::from_secs(30));
        for i in retransmit {
            let (seq_nr, data, transmissions) = {
                let packet = &self.inflight[i];
                (packet.seq_nr, packet.data.clone(), packet.transmissions)
            };
            if transmissions > 5 {
                trace!(remote = %self.remote, "utp retransmit limit, closing");
                self.state = UtpState::Closed;
                return;
            }
            let packet_type = if data.is_empty() {
                match self.state {
                    UtpState::SynSent => PacketType::Syn,
                    _ => PacketType::Fin,
                }
            } else {
                PacketType::Data
            };
            let mut header = self.header(packet_type, now);
            header.seq_nr = seq_nr;
            self.emit(header, &data);
            let packet = &mut self.inflight[i];
            packet.sent_at = now;
            packet.transmissions += 1;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == UtpState::Closed
    }
}

// ----------------------------------------------------------------------
// reader / writer halves used by peer pumps
// ----------------------------------------------------------------------

/// Commands from writer halves into the manager.
#[derive(Debug)]
pub enum AppCommand {
    Data(Bytes),
    Shutdown,
}

/// The read half of a uTP stream.
pub struct UtpReader {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl UtpReader {
    /// Appends the next received segment to `buf`; 0 means EOF.
    pub async fn read_into(&mut self, buf: &mut BytesMut) -> std::io::Result<usize> {
        match self.rx.recv().await {
            Some(segment) => {
                buf.put_slice(&segment);
                Ok(segment.len())
            }
            None => Ok(0),
        }
    }
}

/// The write half of a uTP stream.
pub struct UtpWriter {
    conn_id: u16,
    tx: mpsc::UnboundedSender<(u16, AppCommand)>,
}

impl UtpWriter {
    pub fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.tx
            .send((self.conn_id, AppCommand::Data(Bytes::copy_from_slice(data))))
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))
    }
}

impl Drop for UtpWriter {
    fn drop(&mut self) {
        // the pump went away; begin the graceful close
        let _ = self.tx.send((self.conn_id, AppCommand::Shutdown));
    }
}

/// All uTP sockets sharing the session UDP socket.
pub struct UtpManager {
    sockets: HashMap<u16, UtpSocket>,
    app_tx: mpsc::UnboundedSender<(u16, AppCommand)>,
}

impl UtpManager {
    /// Returns the manager and the channel the engine must drain for
    /// writer-half commands.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(u16, AppCommand)>) {
        let (app_tx, app_rx) = mpsc::unbounded_channel();
        (
            Self {
                sockets: HashMap::new(),
                app_tx,
            },
            app_rx,
        )
    }

    pub fn num_sockets(&self) -> usize {
        self.sockets.len()
    }

    /// Opens an outgoing connection; the SYN goes out on the next drain.
    pub fn connect(&mut self, remote: SocketAddr, now: Instant) -> (UtpReader, UtpWriter) {
        let recv_id: u16 = rand::random();
        let send_id = recv_id.wrapping_add(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut socket = UtpSocket::new(remote, recv_id, send_id, tx, now);
        socket.connect(now);
        self.sockets.insert(recv_id, socket);
        (
            UtpReader { rx },
            UtpWriter {
                conn_id: recv_id,
                tx: self.app_tx.clone(),
            },
        )
    }

    /// Handles one datagram. A SYN for an unknown id creates a socket
    /// and returns its stream halves for the engine to wrap in a peer
    /// connection.
    pub fn incoming_packet(
        &mut self,
        data: &[u8],
        source: SocketAddr,
        now: Instant,
    ) -> Option<(UtpReader, UtpWriter)> {
        let (header, payload_at) = match Header::decode(data) {
            Ok(pair) => pair,
            Err(_) => return None,
        };
        let payload = Bytes::copy_from_slice(&data[payload_at..]);

        if header.packet_type == PacketType::Syn {
            // receiver convention: we receive on id+1, send on id
            let recv_id = header.connection_id.wrapping_add(1);
            let send_id = header.connection_id;
            let (tx, rx) = mpsc::unbounded_channel();
            let mut socket = UtpSocket::new(source, recv_id, send_id, tx, now);
            socket.on_packet(header, payload, now);
            self.sockets.insert(recv_id, socket);
            return Some((
                UtpReader { rx },
                UtpWriter {
                    conn_id: recv_id,
                    tx: self.app_tx.clone(),
                },
            ));
        }

        if let Some(socket) = self.sockets.get_mut(&header.connection_id) {
            socket.on_packet(header, payload, now);
        }
        None
    }

    /// Applies a writer-half command.
    pub fn on_app_command(&mut self, conn_id: u16, cmd: AppCommand, now: Instant) {
        let Some(socket) = self.sockets.get_mut(&conn_id) else {
            return;
        };
        match cmd {
            AppCommand::Data(data) => socket.send(data, now),
            AppCommand::Shutdown => socket.close(now),
        }
    }

    /// Timer pass; closes dead sockets.
    pub fn tick(&mut self, now: Instant) {
        for socket in self.sockets.values_mut() {
            socket.tick(now);
        }
        self.sockets.retain(|_, s| !s.is_closed());
    }

    /// Begins a graceful close on every socket (session abort). Sockets
    /// keep draining until closed or their FIN deadline passes.
    pub fn close_all(&mut self, now: Instant) {
        for socket in self.sockets.values_mut() {
            socket.close(now);
        }
    }

    /// True when every socket has finished its graceful close.
    pub fn drained(&self) -> bool {
        self.sockets.is_empty()
    }

    /// Collects datagrams to put on the wire.
    pub fn take_outgoing(&mut self) -> Vec<(Vec<u8>, SocketAddr)> {
        let mut out = Vec::new();
        for socket in self.sockets.values_mut() {
            out.append(&mut socket.outgoing);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(packet_type: PacketType, seq_nr: u16, ack_nr: u16) -> Header {
        Header {
            packet_type,
            connection_id: 0x1234,
            timestamp_us: 1000,
            timestamp_diff_us: 0,
            wnd_size: 1 << 20,
            seq_nr,
            ack_nr,
        }
    }

    #[test]
    fn header_round_trip() {
        let hdr = header(PacketType::Data, 7, 3);
        let encoded = hdr.encode();
        let (decoded, payload_at) = Header::decode(&encoded).unwrap();
        assert_eq!(decoded, hdr);
        assert_eq!(payload_at, UTP_HEADER_LEN);
    }

    #[test]
    fn decode_rejects_bad_version_and_type() {
        let mut encoded = header(PacketType::Syn, 1, 0).encode();
        encoded[0] = (4 << 4) | 2; // version 2
        assert!(Header::decode(&encoded).is_err());
        let mut encoded = header(PacketType::Syn, 1, 0).encode();
        encoded[0] = (9 << 4) | 1; // unknown type
        assert!(Header::decode(&encoded).is_err());
        assert!(Header::decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn utp_recognizer() {
        let encoded = header(PacketType::State, 1, 0).encode();
        assert!(looks_like_utp(&encoded));
        assert!(!looks_like_utp(b"d1:y1:qe"));
        assert!(!looks_like_utp(&[0u8; 4]));
    }

    #[tokio::test]
    async fn syn_handshake_reaches_connected() {
        let now = std::time::Instant::now();
        let (mut manager, _app_rx) = UtpManager::new();
        let remote = "10.0.0.2:6881".parse().unwrap();

        let (_reader, _writer) = manager.connect(remote, now);
        let syn = manager.take_outgoing();
        assert_eq!(syn.len(), 1);
        let (decoded, _) = Header::decode(&syn[0].0).unwrap();
        assert_eq!(decoded.packet_type, PacketType::Syn);

        // the remote acks the SYN
        let state = Header {
            packet_type: PacketType::State,
            connection_id: decoded.connection_id,
            timestamp_us: 1,
            timestamp_diff_us: 0,
            wnd_size: 1 << 20,
            seq_nr: 100,
            ack_nr: decoded.seq_nr,
        };
        let mut datagram = state.encode().to_vec();
        manager.incoming_packet(&datagram, remote, now);
        datagram.clear();

        let socket = manager.sockets.values().next().unwrap();
        assert_eq!(socket.state, UtpState::Connected);
    }

    #[tokio::test]
    async fn incoming_syn_creates_socket_and_acks() {
        let now = std::time::Instant::now();
        let (mut manager, _app_rx) = UtpManager::new();
        let remote = "10.0.0.3:6881".parse().unwrap();

        let syn = Header {
            packet_type: PacketType::Syn,
            connection_id: 0x4000,
            timestamp_us: 5,
            timestamp_diff_us: 0,
            wnd_size: 1 << 20,
            seq_nr: 1,
            ack_nr: 0,
        };
        let halves = manager.incoming_packet(&syn.encode(), remote, now);
        assert!(halves.is_some());
        assert_eq!(manager.num_sockets(), 1);

        let out = manager.take_outgoing();
        assert_eq!(out.len(), 1);
        let (reply, _) = Header::decode(&out[0].0).unwrap();
        assert_eq!(reply.packet_type, PacketType::State);
        assert_eq!(reply.ack_nr, 1);
    }

    #[tokio::test]
    async fn in_order_data_is_delivered_and_acked() {
        let now = std::time::Instant::now();
        let (mut manager, _app_rx) = UtpManager::new();
        let remote = "10.0.0.4:6881".parse().unwrap();

        let syn = Header {
            packet_type: PacketType::Syn,
            connection_id: 0x2000,
            timestamp_us: 5,
            timestamp_diff_us: 0,
            wnd_size: 1 << 20,
            seq_nr: 10,
            ack_nr: 0,
        };
        let (mut reader, _writer) = manager.incoming_packet(&syn.encode(), remote, now).unwrap();
        manager.take_outgoing();

        // data segments 11 then 12; 13 arrives early and is reordered
        for (seq, body) in [(11u16, b"aa".as_slice()), (13, b"cc"), (12, b"bb")] {
            let hdr = Header {
                packet_type: PacketType::Data,
                connection_id: 0x2001,
                timestamp_us: 9,
                timestamp_diff_us: 0,
                wnd_size: 1 << 20,
                seq_nr: seq,
                ack_nr: 0,
            };
            let mut datagram = hdr.encode().to_vec();
            datagram.extend_from_slice(body);
            manager.incoming_packet(&datagram, remote, now);
        }

        let mut assembled = BytesMut::new();
        while assembled.len() < 6 {
            let n = reader.read_into(&mut assembled).await.unwrap();
            assert!(n > 0);
        }
        assert_eq!(&assembled[..], b"aabbcc");
    }

    #[tokio::test]
    async fn graceful_close_drains_then_closes() {
        let now = std::time::Instant::now();
        let (mut manager, _app_rx) = UtpManager::new();
        let remote = "10.0.0.5:6881".parse().unwrap();
        manager.connect(remote, now);
        manager.take_outgoing();

        manager.close_all(now);
        assert!(!manager.drained());
        // the fin deadline forces the socket closed
        manager.tick(now + UTP_DRAIN_TIMEOUT + Duration::from_secs(1));
        assert!(manager.drained());
    }
}
