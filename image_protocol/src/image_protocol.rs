use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Instant;

use anyhow::anyhow;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};
use transport::any_transport::AnyTransport;
use transport::config::{ReliableUdpConfig, Role, StreamTransportConfig, UdpTransportConfig};
use transport::reliable_udp::ReliableUdpTransport;
use transport::stream_transport::{StreamProtocol, StreamTransport};
use transport::udp_transport::UdpTransport;
use transport::{ConnectionId, ConnectionToken, TransportKind, BROADCAST_CLIENT};

use crate::config::ImageProtocolConfig;
use crate::framing::{frame, StreamDeframer};
use crate::header::{ImageMetadata, PacketHeader, PacketType, PROTOCOL_VERSION};
use crate::segmentation::{segment_image, Image, Reassembler};

/// upper bound for the payload of a UDP datagram
const MAX_DATAGRAM_SIZE: usize = 65536;

enum Pulled {
    Packet(Bytes),
    Nothing,
    Disconnected,
}

struct ReceiveState {
    buf: Vec<u8>,
    deframers: FxHashMap<ConnectionId, StreamDeframer>,
    reassemblers: FxHashMap<ConnectionId, Reassembler>,
}

impl ReceiveState {
    fn forget(&mut self, peer: &ConnectionToken) {
        self.deframers.remove(&peer.id());
        self.reassemblers.remove(&peer.id());
    }

    /// drops the state of peers that are no longer registered with the transport
    fn retain_peers(&mut self, peers: &[ConnectionToken]) {
        let is_current = |id: &ConnectionId| peers.iter().any(|peer| peer.id() == *id);
        self.deframers.retain(|id, _| is_current(id));
        self.reassemblers.retain(|id, _| is_current(id));
    }
}

fn server_socket_addr(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let ip: IpAddr = host.parse()
        .map_err(|e| anyhow!("invalid server address {:?}: {}", host, e))?;
    Ok(SocketAddr::new(ip, port))
}

async fn open_transport(role: Role, config: &ImageProtocolConfig, server_addr: Option<SocketAddr>) -> anyhow::Result<AnyTransport> {
    match config.transport {
        TransportKind::Tcp | TransportKind::Sctp => {
            let protocol = if config.transport == TransportKind::Tcp {
                StreamProtocol::Tcp
            }
            else {
                StreamProtocol::Sctp
            };
            let mut stream_config = match server_addr {
                Some(addr) => StreamTransportConfig::client(addr.ip(), addr.port()),
                None => StreamTransportConfig::server(config.port),
            };
            stream_config.interface = config.interface.clone();
            Ok(StreamTransport::new(protocol, stream_config).await?.into())
        }
        TransportKind::Udp | TransportKind::ReliableUdp => {
            let local_port = match role {
                Role::Server => config.port,
                Role::Client => config.client_bind_port.unwrap_or(config.port),
            };
            let mut udp_config = UdpTransportConfig::new(local_port);
            udp_config.interface = config.interface.clone();
            udp_config.receive_buffer_size = config.max_receive_size.clamp(udp_config.max_safe_datagram_size, MAX_DATAGRAM_SIZE);

            if config.transport == TransportKind::Udp {
                Ok(UdpTransport::new(udp_config).await?.into())
            }
            else {
                let reliable_config = ReliableUdpConfig {
                    udp: udp_config,
                    ..ReliableUdpConfig::new(local_port)
                };
                Ok(ReliableUdpTransport::new(reliable_config).await?.into())
            }
        }
    }
}

/// ImageProtocol sends images from a server to any number of clients, segmenting them so that
///  every packet fits the configured segment size. Clients announce themselves with a handshake
///  and reassemble images from their segments.
///
/// Over stream transports, packets are framed with a length prefix since the transport does not
///  preserve message boundaries.
pub struct ImageProtocol {
    role: Role,
    config: ImageProtocolConfig,
    server_address: String,
    transport: AnyTransport,
    broadcast_token: Option<ConnectionToken>,
    next_index: AtomicU16,
    receive_state: Mutex<ReceiveState>,
}

impl ImageProtocol {
    #[tracing::instrument(skip_all, fields(transport = %config.transport, port = config.port))]
    pub async fn server(config: ImageProtocolConfig) -> anyhow::Result<ImageProtocol> {
        config.validate()?;

        let transport = open_transport(Role::Server, &config, None).await?;
        let broadcast_token = match &transport {
            AnyTransport::Udp(udp) => Some(udp.connect(BROADCAST_CLIENT).await?),
            _ => None,
        };
        info!("image server started");
        Ok(Self::new(Role::Server, config, String::new(), transport, broadcast_token))
    }

    /// Creates a client for the server at `host`, which is an IP address (connecting to the
    ///  configured port) or an IP address with port.
    #[tracing::instrument(skip(config), fields(transport = %config.transport))]
    pub async fn client(host: &str, config: ImageProtocolConfig) -> anyhow::Result<ImageProtocol> {
        config.validate()?;

        let server_addr = server_socket_addr(host, config.port)?;
        let transport = open_transport(Role::Client, &config, Some(server_addr)).await?;
        info!("image client for server {:?} started", server_addr);
        Ok(Self::new(Role::Client, config, server_addr.to_string(), transport, None))
    }

    fn new(role: Role, config: ImageProtocolConfig, server_address: String, transport: AnyTransport, broadcast_token: Option<ConnectionToken>) -> ImageProtocol {
        let receive_state = ReceiveState {
            buf: vec![0u8; config.max_receive_size],
            deframers: Default::default(),
            reassemblers: Default::default(),
        };
        ImageProtocol {
            role,
            config,
            server_address,
            transport,
            broadcast_token,
            next_index: AtomicU16::new(0),
            receive_state: Mutex::new(receive_state),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn transport(&self) -> &AnyTransport {
        &self.transport
    }

    /// the local address of a server, or of a datagram client
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match &self.transport {
            AnyTransport::Stream(t) => t.local_addr().await,
            AnyTransport::Udp(t) => Some(t.local_addr()),
            AnyTransport::ReliableUdp(t) => Some(t.local_addr()),
        }
    }

    fn next_index(&self) -> u16 {
        self.next_index.fetch_add(1, Ordering::Relaxed)
    }

    /// registers new clients: accepts connections for stream transports, and picks up datagrams
    ///  from unknown senders for UDP
    async fn refresh_peers(&self) {
        for token in self.transport.accept_new_connections().await {
            info!("image client {} connected", token.name());
        }
        if let AnyTransport::Udp(udp) = &self.transport {
            udp.drain_socket().await;
        }
    }

    async fn peers(&self) -> Vec<ConnectionToken> {
        self.transport.transport()
            .get_clients().await
            .into_iter()
            .filter(|t| Some(t) != self.broadcast_token.as_ref())
            .collect()
    }

    async fn send_packet(&self, peer: &ConnectionToken, packet: &[u8]) -> bool {
        if self.transport.transport().preserves_message_boundaries() {
            peer.send(packet).await
        }
        else {
            peer.send(&frame(packet)).await
        }
    }

    /// Sends an image to every known client, returning the number of clients that were still
    ///  connected after all segments were sent.
    pub async fn send_image(&self, metadata: &ImageMetadata, payload: &[u8]) -> usize {
        if self.role != Role::Server {
            warn!("only an image server can send images");
            return 0;
        }

        self.refresh_peers().await;
        let peers = self.peers().await;
        if peers.is_empty() {
            trace!("no image clients - not sending");
            return 0;
        }

        let index = self.next_index();
        let packets = match segment_image(metadata, payload, self.config.max_segment_size, index, self.config.header_format) {
            Ok(packets) => packets,
            Err(e) => {
                warn!("can not send image: {}", e);
                return 0;
            }
        };

        let mut num_served = 0;
        'peers: for peer in &peers {
            for packet in &packets {
                if !self.send_packet(peer, packet).await {
                    debug!("image client {} disconnected while sending image #{}", peer.name(), index);
                    self.receive_state.lock().await.forget(peer);
                    continue 'peers;
                }
            }
            num_served += 1;
        }
        debug!("sent image #{} ({} bytes, {} packets) to {} clients", index, payload.len(), packets.len(), num_served);
        num_served
    }

    /// Processes all packets pending from clients, returning the number of handshakes.
    pub async fn server_receive(&self) -> usize {
        if self.role != Role::Server {
            warn!("only an image server receives from clients");
            return 0;
        }

        self.refresh_peers().await;
        let mut state = self.receive_state.lock().await;
        let peers = self.peers().await;
        state.retain_peers(&peers);

        let mut num_handshakes = 0;
        for peer in peers {
            loop {
                match self.pull_packet(&mut state, &peer).await {
                    Pulled::Packet(packet) => {
                        if self.on_client_packet(&peer, &packet) {
                            num_handshakes += 1;
                        }
                    }
                    Pulled::Nothing => break,
                    Pulled::Disconnected => {
                        info!("image client {} disconnected", peer.name());
                        state.forget(&peer);
                        break;
                    }
                }
            }
        }
        num_handshakes
    }

    fn on_client_packet(&self, peer: &ConnectionToken, packet: &[u8]) -> bool {
        let Some((header, _)) = self.parse_packet(peer, packet) else {
            return false;
        };
        match header.packet_type() {
            Some(PacketType::Handshake) => {
                info!("image client {} announced itself", peer.name());
                true
            }
            other => {
                debug!("ignoring {:?} packet from image client {}", other, peer.name());
                false
            }
        }
    }

    /// Connects to the server if necessary, and announces this client.
    #[tracing::instrument(skip(self), fields(server = %self.server_address))]
    pub async fn handshake(&self) -> bool {
        if self.role != Role::Client {
            warn!("only an image client does a handshake");
            return false;
        }
        let Some(server) = self.transport.connect(&self.server_address).await else {
            warn!("image server is not reachable");
            return false;
        };

        let mut packet = BytesMut::with_capacity(self.config.header_format.serialized_len());
        PacketHeader::single(PacketType::Handshake, self.next_index()).ser(&mut packet, self.config.header_format);
        self.send_packet(&server, &packet).await
    }

    /// Pulls a single packet from the server, returning the image it completes, if any.
    pub async fn receive_image(&self) -> Option<Image> {
        if self.role != Role::Client {
            warn!("only an image client receives images");
            return None;
        }
        let server = self.transport.connect(&self.server_address).await?;

        let mut state = self.receive_state.lock().await;
        match self.pull_packet(&mut state, &server).await {
            Pulled::Packet(packet) => self.on_server_packet(&mut state, &server, &packet),
            Pulled::Nothing => None,
            Pulled::Disconnected => {
                info!("image server {} disconnected", server.name());
                state.forget(&server);
                None
            }
        }
    }

    fn on_server_packet(&self, state: &mut ReceiveState, server: &ConnectionToken, packet: &[u8]) -> Option<Image> {
        let (header, body) = self.parse_packet(server, packet)?;
        match header.packet_type() {
            Some(PacketType::Image) => {}
            Some(other) => {
                warn!("dropping unexpected {:?} packet from image server", other);
                return None;
            }
            None => {
                warn!("dropping packet with unknown type from image server: {:?}", header);
                return None;
            }
        }

        let timeout = self.config.partial_message_timeout;
        let max_partial_messages = self.config.max_partial_messages;
        state.reassemblers
            .entry(server.id())
            .or_insert_with(|| Reassembler::new(timeout, max_partial_messages))
            .add_segment(&header, body, Instant::now())
    }

    /// number of partially received images, across all peers
    pub async fn num_partial_messages(&self) -> usize {
        self.receive_state.lock().await
            .reassemblers
            .values()
            .map(|r| r.num_partial_messages())
            .sum()
    }

    fn parse_packet<'a>(&self, peer: &ConnectionToken, packet: &'a [u8]) -> Option<(PacketHeader, &'a [u8])> {
        let mut body = packet;
        let header = match PacketHeader::deser(&mut body, self.config.header_format) {
            Ok(header) => header,
            Err(e) => {
                warn!("dropping packet from {}: {}", peer.name(), e);
                return None;
            }
        };
        if header.version != PROTOCOL_VERSION {
            warn!("dropping packet from {} with unsupported protocol version {}", peer.name(), header.version);
            return None;
        }
        trace!("received {:?} from {}", header, peer.name());
        Some((header, body))
    }

    async fn pull_packet(&self, state: &mut ReceiveState, peer: &ConnectionToken) -> Pulled {
        let ReceiveState { buf, deframers, .. } = state;

        if self.transport.transport().preserves_message_boundaries() {
            return match peer.receive(buf).await {
                Some(0) => Pulled::Nothing,
                Some(n) => Pulled::Packet(Bytes::copy_from_slice(&buf[..n])),
                None => Pulled::Disconnected,
            };
        }

        let deframer = deframers
            .entry(peer.id())
            .or_insert_with(|| StreamDeframer::new(self.config.max_receive_size));
        loop {
            match deframer.next_frame() {
                Ok(Some(packet)) => return Pulled::Packet(packet),
                Ok(None) => {}
                Err(e) => {
                    warn!("closing connection to {}: {}", peer.name(), e);
                    peer.disconnect().await;
                    return Pulled::Disconnected;
                }
            }
            match peer.receive(buf).await {
                Some(0) => return Pulled::Nothing,
                Some(n) => deframer.push(&buf[..n]),
                None => return Pulled::Disconnected,
            }
        }
    }

    pub async fn shut_down(&self) {
        self.transport.transport().shut_down().await;
        info!("image protocol {:?} shut down", self.role);
    }
}
