use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::Role;
use crate::connection_token::ConnectionToken;
use crate::generic_transport::{Transport, TransportKind};
use crate::reliable_udp::ReliableUdpTransport;
use crate::stream_transport::StreamTransport;
use crate::udp_transport::UdpTransport;

/// One of the concrete transports, for code that selects the transport at runtime but still
///  needs the operations that are specific to a kind of transport.
#[derive(Clone)]
pub enum AnyTransport {
    Stream(Arc<StreamTransport>),
    Udp(Arc<UdpTransport>),
    ReliableUdp(Arc<ReliableUdpTransport>),
}

impl AnyTransport {
    pub fn transport(&self) -> &dyn Transport {
        match self {
            AnyTransport::Stream(t) => t.as_ref(),
            AnyTransport::Udp(t) => t.as_ref(),
            AnyTransport::ReliableUdp(t) => t.as_ref(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.transport().kind()
    }

    /// Returns a token for the given peer. Stream clients always connect to their configured
    ///  server and ignore `address`.
    pub async fn connect(&self, address: &str) -> Option<ConnectionToken> {
        let result = match self {
            AnyTransport::Stream(t) => return t.connect().await,
            AnyTransport::Udp(t) => t.connect(address).await,
            AnyTransport::ReliableUdp(t) => t.connect(address).await,
        };
        match result {
            Ok(token) => Some(token),
            Err(e) => {
                warn!("{} failed to connect to {:?}: {}", self.kind(), address, e);
                None
            }
        }
    }

    /// Accepts pending clients for stream servers. Other transports register peers implicitly
    ///  and return an empty list.
    pub async fn accept_new_connections(&self) -> Vec<ConnectionToken> {
        match self {
            AnyTransport::Stream(t) if t.role() == Role::Server => t.accept_new_connections().await,
            _ => Vec::new(),
        }
    }
}

impl From<Arc<StreamTransport>> for AnyTransport {
    fn from(value: Arc<StreamTransport>) -> Self {
        AnyTransport::Stream(value)
    }
}

impl From<Arc<UdpTransport>> for AnyTransport {
    fn from(value: Arc<UdpTransport>) -> Self {
        AnyTransport::Udp(value)
    }
}

impl From<Arc<ReliableUdpTransport>> for AnyTransport {
    fn from(value: Arc<ReliableUdpTransport>) -> Self {
        AnyTransport::ReliableUdp(value)
    }
}

/// The set of transports an application uses, each with its own connection table. Several
///  transports of the same kind can be used at the same time.
#[derive(Default)]
pub struct TransportSet {
    transports: Vec<AnyTransport>,
}

impl TransportSet {
    pub fn new() -> TransportSet {
        Default::default()
    }

    pub fn add(&mut self, transport: impl Into<AnyTransport>) -> AnyTransport {
        let transport = transport.into();
        debug!("adding {} transport", transport.kind());
        self.transports.push(transport.clone());
        transport
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AnyTransport> {
        self.transports.iter()
    }

    pub fn of_kind(&self, kind: TransportKind) -> impl Iterator<Item = &AnyTransport> {
        self.transports.iter()
            .filter(move |t| t.kind() == kind)
    }

    /// the transport that issued a token, if it is part of this set
    pub fn owner_of(&self, token: &ConnectionToken) -> Option<&AnyTransport> {
        self.transports.iter()
            .find(|t| t.transport().id() == token.transport_id())
    }

    /// shuts down all transports and removes them from the set
    pub async fn shut_down_all(&mut self) {
        for transport in self.transports.drain(..) {
            info!("shutting down {} transport", transport.kind());
            transport.transport().shut_down().await;
        }
    }
}
