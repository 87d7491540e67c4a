//! Local Service Discovery (BEP-14).
//!
//! Torrents are advertised to the local network with `BT-SEARCH`
//! datagrams on the well-known multicast groups; announcements from
//! other hosts come back as peer candidates. A random cookie marks our
//! own datagrams so multicast loopback does not feed us ourselves.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Arc;

use rand::Rng as _;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::constants::LSD_PORT;
use crate::meta::{hex_decode, hex_encode, InfoHash};

const MULTICAST_V4: Ipv4Addr = Ipv4Addr::new(239, 192, 152, 143);
const MULTICAST_V6: Ipv6Addr = Ipv6Addr::new(0xff15, 0, 0, 0, 0, 0, 0xefc0, 0x988f);
const COOKIE_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum LsdError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no multicast socket could be bound")]
    NoSocket,
}

/// A peer discovered via LSD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LsdPeer {
    pub info_hash: InfoHash,
    pub addr: SocketAddr,
}

/// The LSD announcer and listener.
pub struct LsdService {
    socket_v4: Option<Arc<UdpSocket>>,
    socket_v6: Option<Arc<UdpSocket>>,
    cookie: String,
}

impl LsdService {
    /// Binds the multicast sockets. Either family may fail (no route,
    /// no v6); only both failing is an error.
    pub async fn bind() -> Result<Self, LsdError> {
        let mut cookie_bytes = [0u8; COOKIE_LEN];
        rand::rng().fill(&mut cookie_bytes);

        let socket_v4 = bind_v4().await.map(Arc::new).ok();
        let socket_v6 = bind_v6().await.map(Arc::new).ok();
        if socket_v4.is_none() && socket_v6.is_none() {
            return Err(LsdError::NoSocket);
        }

        Ok(Self {
            socket_v4,
            socket_v6,
            cookie: hex_encode(&cookie_bytes),
        })
    }

    /// Spawns the receive loop; discovered peers arrive on `peers_tx`.
    pub fn start(self: &Arc<Self>, peers_tx: mpsc::UnboundedSender<LsdPeer>) {
        for socket in [self.socket_v4.clone(), self.socket_v6.clone()]
            .into_iter()
            .flatten()
        {
            let service = Arc::clone(self);
            let tx = peers_tx.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1400];
                loop {
                    let (n, source) = match socket.recv_from(&mut buf).await {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "lsd receive failed");
                            return;
                        }
                    };
                    if let Some(peer) = service.parse_announce(&buf[..n], source) {
                        if tx.send(peer).is_err() {
                            return;
                        }
                    }
                }
            });
        }
    }

    /// Multicasts one announce for `info_hash`, naming our listen port.
    pub async fn announce(&self, info_hash: &InfoHash, port: u16) {
        if let Some(socket) = &self.socket_v4 {
            let dest = SocketAddrV4::new(MULTICAST_V4, LSD_PORT);
            let msg = self.format_announce(info_hash, port, &format!("{}:{}", MULTICAST_V4, LSD_PORT));
            let _ = socket.send_to(msg.as_bytes(), dest).await;
        }
        if let Some(socket) = &self.socket_v6 {
            let dest = SocketAddrV6::new(MULTICAST_V6, LSD_PORT, 0, 0);
            let msg = self.format_announce(info_hash, port, &format!("[{}]:{}", MULTICAST_V6, LSD_PORT));
            let _ = socket.send_to(msg.as_bytes(), dest).await;
        }
    }

    fn format_announce(&self, info_hash: &InfoHash, port: u16, host: &str) -> String {
        format!(
            "BT-SEARCH * HTTP/1.1\r\n\
             Host: {}\r\n\
             Port: {}\r\n\
             Infohash: {}\r\n\
             cookie: {}\r\n\
             \r\n\r\n",
            host,
            port,
            info_hash.to_hex(),
            self.cookie
        )
    }

    fn parse_announce(&self, data: &[u8], source: SocketAddr) -> Option<LsdPeer> {
        let text = std::str::from_utf8(data).ok()?;
        if !text.starts_with("BT-SEARCH") {
            return None;
        }

        let mut port = None;
        let mut info_hash = None;
        let mut cookie = None;
        for line in text.lines() {
            let line = line.trim();
            if let Some(value) = line.strip_prefix("Port:") {
                port = value.trim().parse::<u16>().ok();
            } else if let Some(value) = line.strip_prefix("Infohash:") {
                info_hash = hex_decode(value.trim())
                    .filter(|b| b.len() == 20)
                    .map(|b| {
                        let mut arr = [0u8; 20];
                        arr.copy_from_slice(&b);
                        InfoHash(arr)
                    });
            } else if let Some(value) = line.strip_prefix("cookie:") {
                cookie = Some(value.trim().to_string());
            }
        }

        if cookie.as_deref() == Some(self.cookie.as_str()) {
            return None; // our own datagram
        }
        let peer = LsdPeer {
            info_hash: info_hash?,
            addr: SocketAddr::new(source.ip(), port.filter(|p| *p != 0)?),
        };
        debug!(torrent = %peer.info_hash, addr = %peer.addr, "lsd peer");
        Some(peer)
    }
}

async fn bind_v4() -> Result<UdpSocket, LsdError> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, LSD_PORT)).await?;
    socket.join_multicast_v4(MULTICAST_V4, Ipv4Addr::UNSPECIFIED)?;
    Ok(socket)
}

async fn bind_v6() -> Result<UdpSocket, LsdError> {
    let socket = UdpSocket::bind(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, LSD_PORT, 0, 0)).await?;
    socket.join_multicast_v6(&MULTICAST_V6, 0)?;
    Ok(socket)
}
