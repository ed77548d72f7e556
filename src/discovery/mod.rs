//! Passive discovery of LAN peers from Dahua broadcast chatter.
//!
//! Nothing is ever transmitted. One listener task per bound socket feeds a
//! MAC-keyed inventory; a sweeper evicts peers that have gone quiet. NVRs
//! announce several times a minute and cameras roughly every two minutes,
//! so the ten-minute staleness floor is more than three missed intervals
//! for either.

mod packet;

pub use packet::{encode_announcement, parse_announcement, Announcement, PeerKind};

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Dahua discovery announcements arrive here.
pub const DISCOVERY_PORT: u16 = 5050;

/// A peer older than this is dead to us.
pub const STALENESS_THRESHOLD: Duration = Duration::from_secs(600);

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const RECV_BUFFER: usize = 4096;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("cannot bind discovery socket on {addr}: {source}")]
    Bind {
        addr: SocketAddrV4,
        #[source]
        source: std::io::Error,
    },
}

/// A live LAN peer. Snapshots are owned copies; holding one keeps the data
/// valid regardless of later eviction.
#[derive(Debug, Clone)]
pub struct Peer {
    pub kind: PeerKind,
    pub ip: Ipv4Addr,
    pub hostname: String,
    pub mac: String,
    pub serial: String,
    pub version: String,
    pub last_seen: Instant,
}

/// MAC-keyed peer table. Last writer wins on every field.
#[derive(Debug, Default)]
struct Inventory {
    peers: HashMap<String, Peer>,
}

impl Inventory {
    /// Returns true when the peer is new to the table.
    fn upsert(&mut self, ann: Announcement, now: Instant) -> bool {
        let peer = Peer {
            kind: ann.kind,
            ip: ann.ip,
            hostname: ann.hostname,
            mac: ann.mac.clone(),
            serial: ann.serial,
            version: ann.version,
            last_seen: now,
        };
        self.peers.insert(ann.mac, peer).is_none()
    }

    fn snapshot(&self, kind: PeerKind, now: Instant) -> Vec<Peer> {
        self.peers
            .values()
            .filter(|p| p.kind == kind)
            .filter(|p| now.saturating_duration_since(p.last_seen) < STALENESS_THRESHOLD)
            .cloned()
            .collect()
    }

    fn evict_stale(&mut self, now: Instant) -> usize {
        let before = self.peers.len();
        self.peers
            .retain(|_, p| now.saturating_duration_since(p.last_seen) < STALENESS_THRESHOLD);
        before - self.peers.len()
    }
}

/// Handle to the discovery subsystem. Clones share the inventory.
#[derive(Clone)]
pub struct Discovery {
    inventory: Arc<Mutex<Inventory>>,
    changed: Arc<Notify>,
    cancel: CancellationToken,
    local_addrs: Vec<SocketAddr>,
}

impl Discovery {
    /// Bind UDP:5050 and begin listening. An empty interface list means one
    /// wildcard socket; otherwise one socket per address, tolerating
    /// individual bind failures as long as at least one socket comes up.
    pub fn start(
        interfaces: &[Ipv4Addr],
        cancel: CancellationToken,
    ) -> Result<Discovery, DiscoveryError> {
        Self::start_on(interfaces, DISCOVERY_PORT, cancel)
    }

    /// As `start`, with an explicit port (tests bind port 0).
    pub fn start_on(
        interfaces: &[Ipv4Addr],
        port: u16,
        cancel: CancellationToken,
    ) -> Result<Discovery, DiscoveryError> {
        let addrs: Vec<Ipv4Addr> = if interfaces.is_empty() {
            vec![Ipv4Addr::UNSPECIFIED]
        } else {
            interfaces.to_vec()
        };

        let mut sockets = Vec::new();
        let mut last_err = None;
        for ip in addrs {
            let addr = SocketAddrV4::new(ip, port);
            match bind_discovery_socket(addr) {
                Ok(socket) => sockets.push(socket),
                Err(source) => {
                    warn!(%addr, error = %source, "discovery socket bind failed, continuing");
                    last_err = Some(DiscoveryError::Bind { addr, source });
                }
            }
        }
        if sockets.is_empty() {
            return Err(last_err.expect("at least one bind was attempted"));
        }

        let local_addrs = sockets
            .iter()
            .filter_map(|s| s.local_addr().ok())
            .collect::<Vec<_>>();

        let discovery = Discovery {
            inventory: Arc::new(Mutex::new(Inventory::default())),
            changed: Arc::new(Notify::new()),
            cancel,
            local_addrs,
        };

        for socket in sockets {
            let listener = discovery.clone();
            tokio::spawn(async move { listener.listen(socket).await });
        }
        let sweeper = discovery.clone();
        tokio::spawn(async move { sweeper.sweep().await });

        Ok(discovery)
    }

    /// Addresses actually bound, for logs and tests.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Owned copies of every live peer of the given kind.
    pub fn snapshot(&self, kind: PeerKind) -> Vec<Peer> {
        let now = Instant::now();
        self.inventory
            .lock()
            .expect("inventory lock")
            .snapshot(kind, now)
    }

    /// Wait until a peer of `kind` matches `predicate`, up to `deadline`
    /// from now. Returns `None` on timeout or cancellation.
    pub async fn wait_for<F>(&self, kind: PeerKind, predicate: F, deadline: Duration) -> Option<Peer>
    where
        F: Fn(&Peer) -> bool,
    {
        let deadline = Instant::now() + deadline;
        loop {
            // Register interest before scanning so an announcement landing
            // between the scan and the wait is not lost.
            let notified = self.changed.notified();
            if let Some(peer) = self.snapshot(kind).into_iter().find(|p| predicate(p)) {
                return Some(peer);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep_until(deadline) => {
                    return self.snapshot(kind).into_iter().find(|p| predicate(p));
                }
                _ = notified => {}
            }
        }
    }

    async fn listen(self, socket: UdpSocket) {
        let mut buf = [0u8; RECV_BUFFER];
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("discovery listener shutting down");
                    return;
                }
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => {
                            let Some(ann) = parse_announcement(&buf[..len]) else {
                                debug!(%from, len, "dropping unparseable datagram");
                                continue;
                            };
                            let is_new = self
                                .inventory
                                .lock()
                                .expect("inventory lock")
                                .upsert(ann.clone(), Instant::now());
                            if is_new {
                                info!(kind = %ann.kind, mac = %ann.mac, ip = %ann.ip,
                                    hostname = %ann.hostname, "peer discovered");
                            }
                            self.changed.notify_waiters();
                        }
                        Err(error) => {
                            // Interface gone. Drop this socket; any others
                            // keep the subsystem alive.
                            warn!(%error, "discovery socket failed, dropping listener");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn sweep(self) {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tick.tick() => {
                    let evicted = self
                        .inventory
                        .lock()
                        .expect("inventory lock")
                        .evict_stale(Instant::now());
                    if evicted > 0 {
                        info!(evicted, "evicted stale peers");
                    }
                }
            }
        }
    }
}

fn bind_discovery_socket(addr: SocketAddrV4) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}
