//! Listen sockets.
//!
//! The engine may listen on any number of (interface, port) pairs. Each
//! pair gets a TCP acceptor (plus an SSL-capable one when enabled); one
//! UDP socket on the same port serves tracker, DHT and uTP traffic.
//! Bind failures retry on incrementing ports up to
//! `max_retry_port_bind`, then optionally fall back to an OS-chosen
//! port. Every outcome is reported as a listen alert.
//!
//! Accept loops and UDP readers run as helper tasks feeding the engine
//! channels; accept *errors* are forwarded too, because running out of
//! file descriptors triggers the connection-shedding policy.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use super::alert::{Alert, AlertQueue};
use super::settings::SessionSettings;

/// What the accept tasks deliver: a connection or the error that made
/// accepting fail.
pub type AcceptEvent = Result<(TcpStream, SocketAddr), std::io::Error>;

/// One bound listen endpoint. The acceptors live in their tasks; this
/// record keeps what the engine needs to reason about the socket.
pub struct ListenSocket {
    pub device: String,
    pub udp: Arc<UdpSocket>,
    /// The locally bound TCP/UDP port.
    pub local_port: u16,
    /// The SSL acceptor's port, when enabled.
    pub ssl_port: Option<u16>,
    /// The router-visible port once a port mapping succeeds.
    pub external_port: Option<u16>,
}

impl ListenSocket {
    /// The port to advertise to trackers and the DHT.
    pub fn advertised_port(&self) -> u16 {
        self.external_port.unwrap_or(self.local_port)
    }
}

/// Resolves a configured interface string to a bind address. Plain IP
/// literals are used directly; an empty string binds all v4 addresses.
/// Device names (`eth0`) need the platform enumerator, which lives
/// outside this crate, so unknown names fail the bind with an alert.
fn resolve_bind_addr(device: &str) -> Option<IpAddr> {
    if device.is_empty() {
        return Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }
    device.parse().ok()
}

/// Binds all configured listen sockets and spawns their reader tasks.
/// Failures are reported and skipped; the engine runs with whatever
/// bound.
///
/// `shutdown` scopes the spawned tasks to this listen generation: when
/// the engine rebinds (`listen_on`), dropping the matching sender makes
/// the previous generation's acceptors and readers exit.
pub async fn open_listen_sockets(
    settings: &SessionSettings,
    alerts: &AlertQueue,
    accept_tx: mpsc::UnboundedSender<AcceptEvent>,
    udp_tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    shutdown: watch::Receiver<()>,
) -> Vec<ListenSocket> {
    let mut sockets = Vec::new();
    for (device, port) in &settings.listen_interfaces {
        if let Some(socket) =
            open_one(device, *port, settings, alerts, &accept_tx, &udp_tx, &shutdown).await
        {
            sockets.push(socket);
        }
    }
    sockets
}

#[allow(clippy::too_many_arguments)]
async fn open_one(
    device: &str,
    initial_port: u16,
    settings: &SessionSettings,
    alerts: &AlertQueue,
    accept_tx: &mpsc::UnboundedSender<AcceptEvent>,
    udp_tx: &mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    shutdown: &watch::Receiver<()>,
) -> Option<ListenSocket> {
    let Some(ip) = resolve_bind_addr(device) else {
        alerts.post(Alert::ListenFailed {
            device: device.to_string(),
            port: initial_port,
            message: "unknown device".to_string(),
        });
        warn!(device, "cannot resolve listen interface");
        return None;
    };

    let mut port = initial_port;
    let mut retries = settings.max_retry_port_bind;
    let (tcp, udp) = loop {
        match bind_pair(ip, port).await {
            Ok(pair) => break pair,
            Err(e) => {
                if retries > 0 && port != 0 {
                    retries -= 1;
                    port = port.wrapping_add(1).max(1);
                    continue;
                }
                if settings.allow_system_port_fallback && port != 0 {
                    match bind_pair(ip, 0).await {
                        Ok(pair) => break pair,
                        Err(e) => {
                            alerts.post(Alert::ListenFailed {
                                device: device.to_string(),
                                port: initial_port,
                                message: e.to_string(),
                            });
                            return None;
                        }
                    }
                }
                alerts.post(Alert::ListenFailed {
                    device: device.to_string(),
                    port: initial_port,
                    message: e.to_string(),
                });
                return None;
            }
        }
    };

    let local_addr = tcp.local_addr().ok()?;
    let local_port = local_addr.port();

    // the SSL acceptor sits on the adjacent port; the TLS filter itself
    // is plugged in outside this crate
    let ssl_port = if settings.ssl_listen {
        match TcpListener::bind(SocketAddr::new(ip, local_port.wrapping_add(1))).await {
            Ok(listener) => {
                let port = listener.local_addr().ok().map(|a| a.port());
                spawn_acceptor(listener, accept_tx.clone(), shutdown.clone());
                port
            }
            Err(_) => None,
        }
    } else {
        None
    };

    let udp = Arc::new(udp);
    spawn_acceptor(tcp, accept_tx.clone(), shutdown.clone());
    spawn_udp_reader(Arc::clone(&udp), udp_tx.clone(), shutdown.clone());

    alerts.post(Alert::ListenSucceeded { addr: local_addr });
    info!(device, port = local_port, "listening");

    Some(ListenSocket {
        device: device.to_string(),
        udp,
        local_port,
        ssl_port,
        external_port: None,
    })
}

fn spawn_acceptor(
    listener: TcpListener,
    accept_tx: mpsc::UnboundedSender<AcceptEvent>,
    mut shutdown: watch::Receiver<()>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => {
                        if accept_tx.send(Ok(pair)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let fatal = e.kind() != std::io::ErrorKind::ConnectionAborted;
                        if accept_tx.send(Err(e)).is_err() || fatal {
                            return;
                        }
                    }
                },
                // the sender only goes away on rebind or engine exit
                _ = shutdown.changed() => return,
            }
        }
    });
}

fn spawn_udp_reader(
    udp: Arc<UdpSocket>,
    udp_tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    mut shutdown: watch::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        loop {
            tokio::select! {
                received = udp.recv_from(&mut buf) => match received {
                    Ok((n, source)) => {
                        if udp_tx.send((buf[..n].to_vec(), source)).is_err() {
                            return;
                        }
                    }
                    Err(_) => return,
                },
                _ = shutdown.changed() => return,
            }
        }
    });
}

/// TCP and UDP must land on the same port; retry as a unit.
async fn bind_pair(ip: IpAddr, port: u16) -> std::io::Result<(TcpListener, UdpSocket)> {
    let tcp = TcpListener::bind(SocketAddr::new(ip, port)).await?;
    let actual = tcp.local_addr()?.port();
    let udp = UdpSocket::bind(SocketAddr::new(ip, actual)).await?;
    Ok((tcp, udp))
}
