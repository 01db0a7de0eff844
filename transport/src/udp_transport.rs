use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use crate::config::UdpTransportConfig;
use crate::connection_token::{ConnectionId, ConnectionToken};
use crate::generic_transport::{Transport, TransportId, TransportKind, BROADCAST_CLIENT};
use crate::interfaces::find_interface;
use crate::socket_options::apply_common_options;
use crate::task::Task;

struct UdpPeer {
    token: ConnectionToken,
    address: SocketAddr,
    backlog: Mutex<VecDeque<Bytes>>,
}

#[derive(Default)]
struct UdpPeers {
    by_id: FxHashMap<ConnectionId, UdpPeer>,
    by_address: FxHashMap<SocketAddr, ConnectionId>,
}

fn copy_datagram(datagram: &[u8], buf: &mut [u8], from: &SocketAddr) -> usize {
    if datagram.len() > buf.len() {
        warn!("not enough space in buffer for UDP datagram from {:?} ({} > {} bytes) - truncating", from, datagram.len(), buf.len());
    }
    let n = datagram.len().min(buf.len());
    buf[..n].copy_from_slice(&datagram[..n]);
    n
}

/// UdpTransport tracks peers of a single UDP socket as virtual connections, keyed by their
///  address. A peer's token is created either explicitly by [`UdpTransport::connect`], or
///  implicitly when the first datagram from its address arrives.
///
/// Datagrams that arrive while reading for a different peer are kept in the sending peer's
///  backlog, and are returned by the next read for that peer.
pub struct UdpTransport {
    id: TransportId,
    config: UdpTransportConfig,
    self_ref: Weak<UdpTransport>,
    socket: UdpSocket,
    local_addr: SocketAddr,
    broadcast_address: SocketAddr,
    peers: RwLock<UdpPeers>,
    /// receive buffer for datagrams that are not copied straight into the caller's buffer
    scratch: Mutex<Vec<u8>>,
}

impl UdpTransport {
    pub async fn new(config: UdpTransportConfig) -> anyhow::Result<Arc<UdpTransport>> {
        config.validate()?;

        let interface = match config.interface.as_deref() {
            Some(name) => {
                let found = find_interface(name);
                if found.is_none() {
                    warn!("network interface {} not found - broadcasting to the wildcard address", name);
                }
                found
            }
            None => None,
        };

        let socket = Self::bind_socket(&config)?;
        let local_addr = socket.local_addr()?;

        let broadcast_ip = interface
            .map(|iface| iface.broadcast)
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        let broadcast_address = SocketAddr::new(broadcast_ip.into(), Self::peer_port(&config, &local_addr));

        info!("bound UDP socket to {:?}, broadcasting to {:?}", local_addr, broadcast_address);
        let scratch = Mutex::new(vec![0u8; config.receive_buffer_size]);
        Ok(Arc::new_cyclic(|self_ref| UdpTransport {
            id: TransportId::next(),
            config,
            self_ref: self_ref.clone(),
            socket,
            local_addr,
            broadcast_address,
            peers: Default::default(),
            scratch,
        }))
    }

    fn bind_socket(config: &UdpTransportConfig) -> anyhow::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        apply_common_options(&socket, "UDP", config.interface.as_deref());
        if let Err(e) = socket.set_broadcast(true) {
            warn!("UDP failed to enable broadcast: {}", e);
        }
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), config.port).into())?;

        let socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(socket)?)
    }

    fn peer_port(config: &UdpTransportConfig, local_addr: &SocketAddr) -> u16 {
        if config.port == 0 {
            local_addr.port()
        }
        else {
            config.port
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn broadcast_address(&self) -> SocketAddr {
        self.broadcast_address
    }

    /// Resolves a peer name to an address: [`BROADCAST_CLIENT`], an IP address (using this
    ///  transport's port), or an IP address with port.
    fn resolve(&self, address: &str) -> anyhow::Result<SocketAddr> {
        if address == BROADCAST_CLIENT {
            return Ok(self.broadcast_address);
        }
        if let Ok(socket_addr) = address.parse::<SocketAddr>() {
            return Ok(socket_addr);
        }
        let ip: IpAddr = address.parse()
            .map_err(|e| anyhow!("invalid UDP peer address {:?}: {}", address, e))?;
        Ok(SocketAddr::new(ip, Self::peer_port(&self.config, &self.local_addr)))
    }

    /// Returns the token for a peer address, creating one if the address is not registered yet.
    ///  Connecting the same address repeatedly yields the same token.
    pub async fn connect(&self, address: &str) -> anyhow::Result<ConnectionToken> {
        let socket_addr = self.resolve(address)?;
        let name = if address == BROADCAST_CLIENT {
            BROADCAST_CLIENT.to_string()
        }
        else {
            socket_addr.to_string()
        };
        Ok(self.token_for_address(socket_addr, name).await)
    }

    async fn lookup_address(&self, address: &SocketAddr) -> Option<ConnectionToken> {
        let peers = self.peers.read().await;
        let id = peers.by_address.get(address)?;
        peers.by_id.get(id).map(|peer| peer.token.clone())
    }

    async fn token_for_address(&self, address: SocketAddr, name: String) -> ConnectionToken {
        if let Some(token) = self.lookup_address(&address).await {
            return token;
        }

        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.by_address.get(&address).and_then(|id| peers.by_id.get(id)) {
            return peer.token.clone();
        }

        let owner: Weak<dyn Transport> = self.self_ref.clone();
        let token = ConnectionToken::new(name, self.id, owner);
        debug!("registered UDP peer {:?}", address);
        peers.by_address.insert(address, token.id());
        peers.by_id.insert(token.id(), UdpPeer {
            token: token.clone(),
            address,
            backlog: Default::default(),
        });
        token
    }

    async fn token_for_sender(&self, from: SocketAddr) -> ConnectionToken {
        self.token_for_address(from, from.to_string()).await
    }

    async fn address_of(&self, token: &ConnectionToken) -> Option<SocketAddr> {
        self.peers.read().await
            .by_id
            .get(&token.id())
            .map(|peer| peer.address)
    }

    async fn enqueue(&self, token: &ConnectionToken, datagram: Bytes) {
        let peers = self.peers.read().await;
        let Some(peer) = peers.by_id.get(&token.id()) else {
            return;
        };

        let mut backlog = peer.backlog.lock().await;
        if backlog.len() >= self.config.max_backlog_len {
            warn!("UDP backlog for {:?} is full - dropping the oldest datagram", peer.address);
            backlog.pop_front();
        }
        backlog.push_back(datagram);
    }

    fn try_recv(&self, scratch: &mut [u8]) -> Option<(usize, SocketAddr)> {
        loop {
            match self.socket.try_recv_from(scratch) {
                Ok(x) => return Some(x),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return None,
                Err(e) if e.kind() == ErrorKind::ConnectionRefused || e.kind() == ErrorKind::ConnectionReset => {
                    debug!("UDP peer unreachable: {}", e);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    error!("UDP receive error: {}", e);
                    return None;
                }
            }
        }
    }

    /// Returns the oldest backlogged datagram of the token's peer, or 0 if there is none.
    ///  Returns `None` if the token is not registered.
    pub async fn receive_backlog(&self, token: &ConnectionToken, buf: &mut [u8]) -> Option<usize> {
        let peers = self.peers.read().await;
        let peer = peers.by_id.get(&token.id())?;
        let datagram = peer.backlog.lock().await.pop_front();
        Some(datagram
            .map(|datagram| copy_datagram(&datagram, buf, &peer.address))
            .unwrap_or(0))
    }

    /// Reads the next datagram from the socket regardless of its sender, registering the sender
    ///  if it is unknown. This does not look at backlogs.
    pub async fn receive_fresh(&self, buf: &mut [u8]) -> Option<(ConnectionToken, usize)> {
        let mut scratch = self.scratch.lock().await;
        let (n, from) = self.try_recv(&mut scratch)?;
        let token = self.token_for_sender(from).await;
        trace!("UDP received {} bytes from {:?}", n, from);
        Some((token, copy_datagram(&scratch[..n], buf, &from)))
    }

    /// returns a backlogged datagram of any peer, or else the next fresh datagram
    pub async fn receive_any(&self, buf: &mut [u8]) -> Option<(ConnectionToken, usize)> {
        {
            let peers = self.peers.read().await;
            for peer in peers.by_id.values() {
                let datagram = peer.backlog.lock().await.pop_front();
                if let Some(datagram) = datagram {
                    return Some((peer.token.clone(), copy_datagram(&datagram, buf, &peer.address)));
                }
            }
        }
        self.receive_fresh(buf).await
    }

    /// Moves all datagrams pending on the socket into their senders' backlogs, returning the
    ///  number of datagrams moved.
    pub async fn drain_socket(&self) -> usize {
        let mut scratch = self.scratch.lock().await;
        let mut num_drained = 0;
        while let Some((n, from)) = self.try_recv(&mut scratch) {
            let token = self.token_for_sender(from).await;
            self.enqueue(&token, Bytes::copy_from_slice(&scratch[..n])).await;
            num_drained += 1;
        }
        num_drained
    }

    /// Spawns a task that periodically drains the socket into the peers' backlogs, so that
    ///  datagrams are taken from the OS buffer even if the application reads infrequently.
    pub fn spawn_receive_task(self: &Arc<Self>, period: Duration) -> anyhow::Result<Task> {
        let transport = Arc::downgrade(self);
        Task::periodic("udp-receive", period, move || {
            let transport = transport.clone();
            async move {
                if let Some(transport) = transport.upgrade() {
                    let num_drained = transport.drain_socket().await;
                    if num_drained > 0 {
                        trace!("UDP receive task buffered {} datagrams", num_drained);
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn preserves_message_boundaries(&self) -> bool {
        true
    }

    async fn get_clients(&self) -> Vec<ConnectionToken> {
        self.peers.read().await
            .by_id
            .values()
            .map(|peer| peer.token.clone())
            .collect()
    }

    async fn receive(&self, token: &ConnectionToken, buf: &mut [u8]) -> Option<usize> {
        if !self.check_token(token) {
            return None;
        }

        let from_backlog = self.receive_backlog(token, buf).await?;
        if from_backlog > 0 {
            return Some(from_backlog);
        }

        let mut scratch = self.scratch.lock().await;
        while let Some((n, from)) = self.try_recv(&mut scratch) {
            let source = self.token_for_sender(from).await;
            if source == *token {
                trace!("UDP received {} bytes from {:?}", n, from);
                return Some(copy_datagram(&scratch[..n], buf, &from));
            }
            self.enqueue(&source, Bytes::copy_from_slice(&scratch[..n])).await;
        }
        Some(0)
    }

    async fn send(&self, token: &ConnectionToken, buf: &[u8]) -> bool {
        if !self.check_token(token) {
            return false;
        }
        let Some(address) = self.address_of(token).await else {
            debug!("{:?} not found in UDP peers", token);
            return false;
        };

        if buf.len() > self.config.max_safe_datagram_size {
            warn!("UDP datagram of {} bytes is over {} bytes and may be dropped", buf.len(), self.config.max_safe_datagram_size);
        }
        match self.socket.send_to(buf, address).await {
            Ok(n) => trace!("UDP sent {} bytes to {:?}", n, address),
            Err(e) => warn!("UDP failed to send data to {:?}: {}", address, e),
        }
        token.is_connected()
    }

    async fn disconnect_client(&self, token: &ConnectionToken) {
        token.mark_disconnected();

        let mut peers = self.peers.write().await;
        match peers.by_id.remove(&token.id()) {
            Some(peer) => {
                peers.by_address.remove(&peer.address);
                info!("UDP peer {:?} disconnected", peer.address);
            }
            None => debug!("{:?} not found in UDP peers while disconnecting", token),
        }
    }

    async fn shut_down(&self) {
        let mut peers = self.peers.write().await;
        for (_, peer) in peers.by_id.drain() {
            peer.token.mark_disconnected();
        }
        peers.by_address.clear();
        info!("UDP transport on {:?} shut down", self.local_addr);
    }

    /// UDP peers are addressed by name, so sending to a name reaches that address even if no
    ///  token was created for it yet.
    async fn send_named(&self, name: &str, buf: &[u8]) -> bool {
        match self.connect(name).await {
            Ok(token) => self.send(&token, buf).await,
            Err(e) => {
                warn!("can not send to {:?}: {}", name, e);
                false
            }
        }
    }

    async fn receive_named(&self, name: &str, buf: &mut [u8]) -> Option<usize> {
        match self.connect(name).await {
            Ok(token) => self.receive(&token, buf).await,
            Err(e) => {
                warn!("can not receive from {:?}: {}", name, e);
                None
            }
        }
    }
}
