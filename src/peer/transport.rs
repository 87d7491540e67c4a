//! Socket pumps for peer connections.
//!
//! The engine owns all protocol state; a pump task owns only the socket.
//! Pumps decode length-prefixed frames and forward them as events, and
//! write pre-encoded frames handed to them over the command channel. A
//! pump never reads and writes concurrently, so the two halves share one
//! select loop.
//!
//! Bandwidth is paid here: the upload limiter is drained before each
//! write, the download limiter after each read, using the class buckets
//! the engine assigned at construction.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::trace;

use super::connection::ConnId;
use super::error::PeerError;
use super::message::{Handshake, Message};
use crate::bandwidth::ChannelLimiter;
use crate::constants::{CONNECT_TIMEOUT, HANDSHAKE_LEN, HANDSHAKE_TIMEOUT, MAX_MESSAGE_SIZE};
use crate::gate::HalfOpenTicket;
use crate::utp::{UtpReader, UtpWriter};

/// Events a pump delivers to the engine.
#[derive(Debug)]
pub enum PumpEvent {
    /// Outbound TCP connect completed; the half-open slot is released.
    Connected,
    /// Bytes left the send buffer; feeds the backpressure watermark.
    Wrote(usize),
    /// The remote's handshake arrived.
    Handshake(Handshake),
    /// A decoded wire message.
    Message(Message),
    /// Terminal failure; the pump is exiting.
    Error(PeerError),
    /// Clean shutdown (EOF or a `Close` command).
    Closed,
}

/// Commands the engine sends a pump.
#[derive(Debug)]
pub enum PumpCommand {
    /// Write pre-encoded frame bytes.
    Send(Bytes),
    /// Flush nothing further and exit.
    Close,
}

/// The engine's handle to a pump task.
pub struct PumpHandle {
    cmd_tx: mpsc::UnboundedSender<PumpCommand>,
    task: JoinHandle<()>,
}

impl PumpHandle {
    /// Queues frame bytes for writing. Returns the buffered size delta,
    /// zero if the pump is already gone.
    pub fn send(&self, frame: Bytes) -> usize {
        let len = frame.len();
        match self.cmd_tx.send(PumpCommand::Send(frame)) {
            Ok(()) => len,
            Err(_) => 0,
        }
    }

    pub fn close(&self) {
        let _ = self.cmd_tx.send(PumpCommand::Close);
    }

    /// True once the pump task has exited; used by undead reaping.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// A peer-facing byte stream: TCP or uTP.
pub enum PeerStream {
    Tcp(TcpStream),
    Utp(UtpReader, UtpWriter),
}

enum Reader {
    Tcp(OwnedReadHalf),
    Utp(UtpReader),
}

enum Writer {
    Tcp(OwnedWriteHalf),
    Utp(UtpWriter),
}

impl Reader {
    async fn read_into(&mut self, buf: &mut BytesMut) -> std::io::Result<usize> {
        match self {
            Reader::Tcp(rd) => rd.read_buf(buf).await,
            Reader::Utp(rd) => rd.read_into(buf).await,
        }
    }
}

impl Writer {
    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Writer::Tcp(wr) => wr.write_all(data).await,
            Writer::Utp(wr) => wr.write_all(data),
        }
    }
}

fn split(stream: PeerStream) -> (Reader, Writer) {
    match stream {
        PeerStream::Tcp(tcp) => {
            let (rd, wr) = tcp.into_split();
            (Reader::Tcp(rd), Writer::Tcp(wr))
        }
        PeerStream::Utp(rd, wr) => (Reader::Utp(rd), Writer::Utp(wr)),
    }
}

type EventTx = mpsc::UnboundedSender<(ConnId, PumpEvent)>;

/// Limiters a pump drains, one per channel.
#[derive(Clone, Default)]
pub struct PumpLimits {
    pub upload: ChannelLimiter,
    pub download: ChannelLimiter,
}

/// Spawns a pump that dials `addr`, sends `handshake` and then runs the
/// framed protocol. The half-open ticket is dropped as soon as the
/// connect resolves, success or not.
pub fn spawn_outgoing(
    id: ConnId,
    addr: std::net::SocketAddr,
    handshake: Bytes,
    limits: PumpLimits,
    events: EventTx,
    ticket: Option<HalfOpenTicket>,
) -> PumpHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        let connected = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await;
        drop(ticket);
        let stream = match connected {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let _ = events.send((id, PumpEvent::Error(PeerError::Io(e))));
                return;
            }
            Err(_) => {
                let _ = events.send((id, PumpEvent::Error(PeerError::Timeout)));
                return;
            }
        };
        let _ = stream.set_nodelay(true);
        let _ = events.send((id, PumpEvent::Connected));

        let (mut rd, mut wr) = split(PeerStream::Tcp(stream));
        if let Err(e) = wr.write_all(&handshake).await {
            let _ = events.send((id, PumpEvent::Error(PeerError::Io(e))));
            return;
        }
        // the read buffer is shared with the frame loop so that bytes
        // arriving right behind the handshake are not lost
        let mut buf = BytesMut::with_capacity(64 * 1024);
        let handshake_ok = rd_handshake_first(&mut rd, &mut buf, &events, id).await;
        run_pump(id, handshake_ok, rd, wr, buf, cmd_rx, limits, events).await;
    });
    PumpHandle { cmd_tx, task }
}

/// Spawns an outgoing pump over an already-established stream (uTP,
/// where the transport connects underneath): our handshake goes out
/// first, then the frame loop runs.
pub fn spawn_outgoing_stream(
    id: ConnId,
    stream: PeerStream,
    handshake: Bytes,
    limits: PumpLimits,
    events: EventTx,
) -> PumpHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        let (mut rd, mut wr) = split(stream);
        if let Err(e) = wr.write_all(&handshake).await {
            let _ = events.send((id, PumpEvent::Error(PeerError::Io(e))));
            return;
        }
        let _ = events.send((id, PumpEvent::Connected));
        let mut buf = BytesMut::with_capacity(64 * 1024);
        let handshake_ok = rd_handshake_first(&mut rd, &mut buf, &events, id).await;
        run_pump(id, handshake_ok, rd, wr, buf, cmd_rx, limits, events).await;
    });
    PumpHandle { cmd_tx, task }
}

/// Spawns a pump over an accepted stream. The remote speaks first; its
/// handshake is forwarded and the engine replies with a `Send` carrying
/// our handshake once the info hash checks out.
pub fn spawn_incoming(
    id: ConnId,
    stream: PeerStream,
    limits: PumpLimits,
    events: EventTx,
) -> PumpHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        let (mut rd, wr) = split(stream);
        let mut buf = BytesMut::with_capacity(64 * 1024);
        let handshake_ok = rd_handshake_first(&mut rd, &mut buf, &events, id).await;
        run_pump(id, handshake_ok, rd, wr, buf, cmd_rx, limits, events).await;
    });
    PumpHandle { cmd_tx, task }
}

/// Reads and forwards the remote handshake; returns false on failure
/// (the error event has already been sent). Bytes beyond the handshake
/// stay in `buf` for the frame loop.
async fn rd_handshake_first(
    rd: &mut Reader,
    buf: &mut BytesMut,
    events: &EventTx,
    id: ConnId,
) -> bool {
    let read = timeout(HANDSHAKE_TIMEOUT, async {
        while buf.len() < HANDSHAKE_LEN {
            match rd.read_into(buf).await {
                Ok(0) => return Err(PeerError::ConnectionClosed),
                Ok(_) => {}
                Err(e) => return Err(PeerError::Io(e)),
            }
        }
        Ok(())
    })
    .await;

    let result = match read {
        Ok(Ok(())) => {
            let hs_bytes = buf.split_to(HANDSHAKE_LEN);
            Handshake::decode(&hs_bytes)
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(PeerError::Timeout),
    };
    match result {
        Ok(hs) => {
            let _ = events.send((id, PumpEvent::Handshake(hs)));
            true
        }
        Err(e) => {
            let _ = events.send((id, PumpEvent::Error(e)));
            false
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_pump(
    id: ConnId,
    handshake_ok: bool,
    mut rd: Reader,
    mut wr: Writer,
    mut buf: BytesMut,
    mut cmd_rx: mpsc::UnboundedReceiver<PumpCommand>,
    limits: PumpLimits,
    events: EventTx,
) {
    if !handshake_ok {
        return;
    }
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(PumpCommand::Send(frame)) => {
                    limits.upload.throttle(frame.len()).await;
                    if let Err(e) = wr.write_all(&frame).await {
                        let _ = events.send((id, PumpEvent::Error(PeerError::Io(e))));
                        return;
                    }
                    let _ = events.send((id, PumpEvent::Wrote(frame.len())));
                }
                Some(PumpCommand::Close) | None => {
                    trace!(conn = id.0, "pump closing");
                    let _ = events.send((id, PumpEvent::Closed));
                    return;
                }
            },
            frame = read_frame(&mut rd, &mut buf) => match frame {
                Ok(Some(frame)) => {
                    limits.download.throttle(frame.len()).await;
                    match Message::decode(frame) {
                        Ok(msg) => {
                            let _ = events.send((id, PumpEvent::Message(msg)));
                        }
                        Err(e) => {
                            let _ = events.send((id, PumpEvent::Error(e)));
                            return;
                        }
                    }
                }
                Ok(None) => {
                    let _ = events.send((id, PumpEvent::Closed));
                    return;
                }
                Err(e) => {
                    let _ = events.send((id, PumpEvent::Error(e)));
                    return;
                }
            },
        }
    }
}

/// A pump handle backed by an idle task, for state-machine tests that
/// never touch a socket.
#[cfg(test)]
pub(crate) fn test_pump() -> (PumpHandle, mpsc::UnboundedReceiver<PumpCommand>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(std::future::pending::<()>());
    (PumpHandle { cmd_tx, task }, cmd_rx)
}

/// Reads one length-prefixed frame. `Ok(None)` is a clean EOF at a frame
/// boundary. The returned bytes exclude the length prefix.
async fn read_frame(rd: &mut Reader, buf: &mut BytesMut) -> Result<Option<Bytes>, PeerError> {
    loop {
        if buf.len() >= 4 {
            let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
            if len > MAX_MESSAGE_SIZE {
                return Err(PeerError::MessageTooLarge(len));
            }
            if buf.len() >= 4 + len {
                let mut frame = buf.split_to(4 + len);
                let _ = frame.split_to(4);
                return Ok(Some(frame.freeze()));
            }
        }
        match rd.read_into(buf).await {
            Ok(0) => {
                if buf.is_empty() {
                    return Ok(None);
                }
                return Err(PeerError::ConnectionClosed);
            }
            Ok(_) => {}
            Err(e) => return Err(PeerError::Io(e)),
        }
    }
}
