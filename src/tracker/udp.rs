//! UDP tracker protocol (BEP-15) over the session's shared socket.
//!
//! The engine demultiplexes inbound datagrams; anything that is neither
//! DHT nor uTP is offered to the [`TrackerRouter`], which completes the
//! pending request with a matching transaction id. Requests double their
//! timeout per retry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use rand::Rng as _;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::debug;

use super::error::TrackerError;
use super::response::{parse_compact_peers, AnnounceResponse, ScrapeResponse};
use super::AnnounceRequest;
use crate::constants::{
    UDP_TRACKER_PROTOCOL_ID, UDP_TRACKER_RETRIES, UDP_TRACKER_TIMEOUT,
};

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_SCRAPE: u32 = 2;
const ACTION_ERROR: u32 = 3;

/// Routes tracker datagrams from the shared socket to waiting requests.
#[derive(Default)]
pub struct TrackerRouter {
    pending: Mutex<HashMap<(SocketAddr, u32), oneshot::Sender<Vec<u8>>>>,
}

impl TrackerRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Offers a datagram; returns true if a pending request consumed it.
    pub fn dispatch(&self, source: SocketAddr, data: &[u8]) -> bool {
        if data.len() < 8 {
            return false;
        }
        let tid = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if let Some(waiter) = self.pending.lock().remove(&(source, tid)) {
            let _ = waiter.send(data.to_vec());
            true
        } else {
            false
        }
    }

    fn register(&self, source: SocketAddr, tid: u32) -> oneshot::Receiver<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert((source, tid), tx);
        rx
    }

    fn forget(&self, source: SocketAddr, tid: u32) {
        self.pending.lock().remove(&(source, tid));
    }
}

/// A UDP tracker client bound to the shared session socket.
pub struct UdpTracker {
    socket: Arc<UdpSocket>,
    router: Arc<TrackerRouter>,
    addr: SocketAddr,
    connection_id: Option<u64>,
}

impl UdpTracker {
    /// Resolves `udp://host:port[/...]` and prepares a client. No
    /// packets are sent until the first request.
    pub async fn new(
        url: &str,
        socket: Arc<UdpSocket>,
        router: Arc<TrackerRouter>,
    ) -> Result<Self, TrackerError> {
        let addr = resolve_udp_url(url).await?;
        Ok(Self {
            socket,
            router,
            addr,
            connection_id: None,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Obtains a connection id if we lack one, then announces.
    pub async fn announce(
        &mut self,
        req: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let connection_id = self.connect().await?;
        let tid: u32 = rand::rng().random();

        let mut packet = BytesMut::with_capacity(98);
        packet.put_u64(connection_id);
        packet.put_u32(ACTION_ANNOUNCE);
        packet.put_u32(tid);
        packet.put_slice(req.info_hash.as_bytes());
        packet.put_slice(&req.peer_id);
        packet.put_u64(req.downloaded);
        packet.put_u64(req.left);
        packet.put_u64(req.uploaded);
        packet.put_u32(req.event.as_udp_id());
        packet.put_u32(0); // ip: default to source address
        packet.put_u32(req.key);
        packet.put_i32(req.num_want);
        packet.put_u16(req.port);

        let mut body = self.exchange(&packet, tid, 20).await?;
        let action = body.get_u32();
        let _tid = body.get_u32();
        if action == ACTION_ERROR {
            return Err(TrackerError::Failure(
                String::from_utf8_lossy(body.chunk()).into_owned(),
            ));
        }
        if action != ACTION_ANNOUNCE {
            return Err(TrackerError::InvalidResponse("unexpected action"));
        }

        let interval = body.get_u32();
        let leechers = body.get_u32();
        let seeders = body.get_u32();

        let mut response = AnnounceResponse::new(Duration::from_secs(interval as u64));
        response.incomplete = Some(leechers);
        response.complete = Some(seeders);
        response.peers = parse_compact_peers(body.chunk());
        Ok(response)
    }

    /// Scrapes one info hash.
    pub async fn scrape(
        &mut self,
        info_hash: &crate::meta::InfoHash,
    ) -> Result<ScrapeResponse, TrackerError> {
        let connection_id = self.connect().await?;
        let tid: u32 = rand::rng().random();

        let mut packet = BytesMut::with_capacity(36);
        packet.put_u64(connection_id);
        packet.put_u32(ACTION_SCRAPE);
        packet.put_u32(tid);
        packet.put_slice(info_hash.as_bytes());

        let mut body = self.exchange(&packet, tid, 20).await?;
        let action = body.get_u32();
        let _tid = body.get_u32();
        if action != ACTION_SCRAPE {
            return Err(TrackerError::InvalidResponse("unexpected action"));
        }
        Ok(ScrapeResponse {
            complete: body.get_u32(),
            downloaded: body.get_u32(),
            incomplete: body.get_u32(),
        })
    }

    /// The 16-byte connect exchange yielding a connection id, cached for
    /// subsequent requests.
    async fn connect(&mut self) -> Result<u64, TrackerError> {
        if let Some(id) = self.connection_id {
            return Ok(id);
        }
        let tid: u32 = rand::rng().random();
        let mut packet = BytesMut::with_capacity(16);
        packet.put_u64(UDP_TRACKER_PROTOCOL_ID);
        packet.put_u32(ACTION_CONNECT);
        packet.put_u32(tid);

        let mut body = self.exchange(&packet, tid, 16).await?;
        let action = body.get_u32();
        let _tid = body.get_u32();
        if action != ACTION_CONNECT {
            return Err(TrackerError::InvalidResponse("unexpected action"));
        }
        let id = body.get_u64();
        self.connection_id = Some(id);
        Ok(id)
    }

    /// Sends a request and waits for its routed response, retrying with
    /// a doubling timeout.
    async fn exchange(
        &self,
        packet: &[u8],
        tid: u32,
        min_len: usize,
    ) -> Result<BytesMut, TrackerError> {
        for attempt in 0..UDP_TRACKER_RETRIES {
            let rx = self.router.register(self.addr, tid);
            self.socket.send_to(packet, self.addr).await?;

            let wait = UDP_TRACKER_TIMEOUT * (1 << attempt);
            match timeout(wait, rx).await {
                Ok(Ok(data)) if data.len() >= min_len => {
                    return Ok(BytesMut::from(data.as_slice()));
                }
                Ok(Ok(_)) => {
                    return Err(TrackerError::InvalidResponse("response too short"));
                }
                Ok(Err(_)) | Err(_) => {
                    self.router.forget(self.addr, tid);
                    debug!(tracker = %self.addr, attempt, "udp tracker timeout");
                }
            }
        }
        Err(TrackerError::Timeout)
    }
}

async fn resolve_udp_url(url: &str) -> Result<SocketAddr, TrackerError> {
    let rest = url
        .strip_prefix("udp://")
        .ok_or_else(|| TrackerError::InvalidUrl(url.to_string()))?;
    let host_port = rest.split('/').next().unwrap_or(rest);
    tokio::net::lookup_host(host_port)
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| TrackerError::InvalidUrl(url.to_string()))
}
