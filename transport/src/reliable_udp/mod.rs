//! A thin reliability layer on top of [`UdpTransport`]: every DATA packet carries a sequence
//!  number and is acknowledged individually, unacknowledged packets are re-sent, and received
//!  packets are delivered in sequence order without duplicates.

mod headers;
mod peer_state;

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Instant;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::config::ReliableUdpConfig;
use crate::connection_token::{ConnectionId, ConnectionToken};
use crate::generic_transport::{Transport, TransportId, TransportKind, BROADCAST_CLIENT};
use crate::reliable_udp::headers::{PacketKind, ReliableHeader};
use crate::reliable_udp::peer_state::{Overdue, PeerState};
use crate::task::Task;
use crate::udp_transport::UdpTransport;

/// upper bound for datagrams processed in a single pump
const MAX_DATAGRAMS_PER_PUMP: usize = 1024;

struct ReliablePeer {
    token: ConnectionToken,
    udp_token: ConnectionToken,
    state: Mutex<PeerState>,
}

#[derive(Default)]
struct ReliablePeers {
    by_id: FxHashMap<ConnectionId, ReliablePeer>,
    by_udp_id: FxHashMap<ConnectionId, ConnectionId>,
}

enum SendSlot {
    Ready(ConnectionToken, Bytes),
    WindowFull,
    Unknown,
}

pub struct ReliableUdpTransport {
    id: TransportId,
    config: ReliableUdpConfig,
    self_ref: Weak<ReliableUdpTransport>,
    udp: Arc<UdpTransport>,
    peers: RwLock<ReliablePeers>,
    ticker: Mutex<Option<Task>>,
}

impl ReliableUdpTransport {
    pub async fn new(config: ReliableUdpConfig) -> anyhow::Result<Arc<ReliableUdpTransport>> {
        config.validate()?;

        let udp = UdpTransport::new(config.udp.clone()).await?;
        let tick_interval = config.tick_interval;
        let transport = Arc::new_cyclic(|self_ref| ReliableUdpTransport {
            id: TransportId::next(),
            config,
            self_ref: self_ref.clone(),
            udp,
            peers: Default::default(),
            ticker: Mutex::new(None),
        });

        let weak = Arc::downgrade(&transport);
        let ticker = Task::periodic("reliable-udp-tick", tick_interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(transport) = weak.upgrade() {
                    transport.on_tick().await;
                }
            }
        })?;
        *transport.ticker.lock().await = Some(ticker);

        info!("created reliable UDP transport on {:?}", transport.udp.local_addr());
        Ok(transport)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.udp.local_addr()
    }

    /// Returns the token for a peer address, see [`UdpTransport::connect`]. Broadcasting is not
    ///  supported since there is no way to track acknowledgements for it.
    pub async fn connect(&self, address: &str) -> anyhow::Result<ConnectionToken> {
        if address == BROADCAST_CLIENT {
            bail!("reliable UDP does not support broadcast");
        }
        let udp_token = self.udp.connect(address).await?;
        Ok(self.peer_for(&udp_token).await)
    }

    async fn peer_for(&self, udp_token: &ConnectionToken) -> ConnectionToken {
        {
            let peers = self.peers.read().await;
            if let Some(peer) = peers.by_udp_id.get(&udp_token.id()).and_then(|id| peers.by_id.get(id)) {
                return peer.token.clone();
            }
        }

        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.by_udp_id.get(&udp_token.id()).and_then(|id| peers.by_id.get(id)) {
            return peer.token.clone();
        }

        let owner: Weak<dyn Transport> = self.self_ref.clone();
        let token = ConnectionToken::new(udp_token.name(), self.id, owner);
        debug!("registered reliable UDP peer {}", udp_token.name());
        peers.by_udp_id.insert(udp_token.id(), token.id());
        peers.by_id.insert(token.id(), ReliablePeer {
            token: token.clone(),
            udp_token: udp_token.clone(),
            state: Default::default(),
        });
        token
    }

    async fn on_tick(&self) {
        self.pump().await;
        self.retransmit_overdue().await;
    }

    /// processes all datagrams pending on the UDP socket, returning the number processed
    async fn pump(&self) -> usize {
        let mut buf = vec![0u8; self.config.udp.receive_buffer_size];
        let mut num_processed = 0;
        while num_processed < MAX_DATAGRAMS_PER_PUMP {
            let Some((udp_token, n)) = self.udp.receive_any(&mut buf).await else {
                break;
            };
            self.on_datagram(&udp_token, &buf[..n]).await;
            num_processed += 1;
        }
        num_processed
    }

    async fn on_datagram(&self, udp_token: &ConnectionToken, datagram: &[u8]) {
        let mut parse_buf = datagram;
        let header = match ReliableHeader::deser(&mut parse_buf) {
            Ok(header) => header,
            Err(e) => {
                debug!("dropping malformed reliable UDP packet from {}: {}", udp_token.name(), e);
                return;
            }
        };
        trace!("received {:?} from {}", header, udp_token.name());

        let token = self.peer_for(udp_token).await;
        let peers = self.peers.read().await;
        let Some(peer) = peers.by_id.get(&token.id()) else {
            return;
        };

        match header.kind {
            PacketKind::Data => {
                let is_accepted = peer.state.lock().await
                    .on_data(header.sequence, Bytes::copy_from_slice(parse_buf), self.config.receive_window_size);
                if is_accepted {
                    let ack = ReliableHeader::packet(PacketKind::Ack, header.sequence, &[]);
                    self.udp.send(&peer.udp_token, &ack).await;
                }
            }
            PacketKind::Ack => {
                if !peer.state.lock().await.on_ack(header.sequence) {
                    trace!("ACK for unknown packet #{} from {}", header.sequence, udp_token.name());
                }
            }
        }
    }

    async fn retransmit_overdue(&self) {
        let now = Instant::now();
        let mut resend = Vec::new();
        let mut failed = Vec::new();
        {
            let peers = self.peers.read().await;
            for peer in peers.by_id.values() {
                let overdue = peer.state.lock().await
                    .collect_overdue(now, self.config.retransmit_timeout, self.config.max_retransmissions);
                match overdue {
                    Overdue::Resend(packets) => {
                        resend.extend(packets.into_iter().map(|packet| (peer.udp_token.clone(), packet)));
                    }
                    Overdue::GiveUp => failed.push(peer.token.clone()),
                }
            }
        }

        for (udp_token, packet) in resend {
            trace!("re-sending packet to {}", udp_token.name());
            self.udp.send(&udp_token, &packet).await;
        }
        for token in failed {
            warn!("reliable UDP peer {} did not acknowledge after {} retransmissions - disconnecting", token.name(), self.config.max_retransmissions);
            token.disconnect().await;
        }
    }

    async fn reserve_send_slot(&self, token: &ConnectionToken, payload: &[u8]) -> SendSlot {
        let peers = self.peers.read().await;
        let Some(peer) = peers.by_id.get(&token.id()) else {
            return SendSlot::Unknown;
        };

        let mut state = peer.state.lock().await;
        if state.num_unacked() >= self.config.send_window_size {
            return SendSlot::WindowFull;
        }
        let (_, packet) = state.register_send(Instant::now(), |sequence| {
            ReliableHeader::packet(PacketKind::Data, sequence, payload).freeze()
        });
        SendSlot::Ready(peer.udp_token.clone(), packet)
    }
}

#[async_trait]
impl Transport for ReliableUdpTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::ReliableUdp
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
        self.pump().await;

        let peers = self.peers.read().await;
        let peer = peers.by_id.get(&token.id())?;
        let Some(payload) = peer.state.lock().await.pop_deliverable() else {
            return Some(0);
        };

        if payload.len() > buf.len() {
            warn!("not enough space in buffer for reliable UDP message from {} ({} > {} bytes) - truncating", token.name(), payload.len(), buf.len());
        }
        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        Some(n)
    }

    /// Sends a DATA packet, waiting while the peer's send window is full.
    async fn send(&self, token: &ConnectionToken, buf: &[u8]) -> bool {
        loop {
            if !self.check_token(token) {
                return false;
            }
            match self.reserve_send_slot(token, buf).await {
                SendSlot::Ready(udp_token, packet) => {
                    self.udp.send(&udp_token, &packet).await;
                    return token.is_connected();
                }
                SendSlot::WindowFull => {
                    trace!("send window for {} is full - waiting", token.name());
                    self.pump().await;
                    sleep(self.config.tick_interval).await;
                }
                SendSlot::Unknown => {
                    debug!("{:?} not found in reliable UDP peers", token);
                    return false;
                }
            }
        }
    }

    async fn disconnect_client(&self, token: &ConnectionToken) {
        token.mark_disconnected();

        let removed = {
            let mut peers = self.peers.write().await;
            let removed = peers.by_id.remove(&token.id());
            if let Some(peer) = &removed {
                peers.by_udp_id.remove(&peer.udp_token.id());
            }
            removed
        };

        match removed {
            Some(peer) => {
                self.udp.disconnect_client(&peer.udp_token).await;
                info!("reliable UDP peer {} disconnected", token.name());
            }
            None => debug!("{:?} not found in reliable UDP peers while disconnecting", token),
        }
    }

    async fn shut_down(&self) {
        let ticker = self.ticker.lock().await.take();
        if let Some(mut ticker) = ticker {
            ticker.stop().await;
        }

        let mut peers = self.peers.write().await;
        for (_, peer) in peers.by_id.drain() {
            peer.token.mark_disconnected();
        }
        peers.by_udp_id.clear();
        drop(peers);

        self.udp.shut_down().await;
        info!("reliable UDP transport shut down");
    }
}
