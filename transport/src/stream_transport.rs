use std::fmt::{Display, Formatter};
use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::config::{Role, StreamTransportConfig};
use crate::connection_token::{ConnectionId, ConnectionToken};
use crate::generic_transport::{Transport, TransportId, TransportKind};
use crate::socket_options::apply_common_options;

const IPPROTO_SCTP: i32 = 132;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamProtocol {
    Tcp,
    Sctp,
}

impl StreamProtocol {
    fn socket_protocol(self) -> Protocol {
        match self {
            StreamProtocol::Tcp => Protocol::TCP,
            StreamProtocol::Sctp => Protocol::from(IPPROTO_SCTP),
        }
    }

    pub fn transport_kind(self) -> TransportKind {
        match self {
            StreamProtocol::Tcp => TransportKind::Tcp,
            StreamProtocol::Sctp => TransportKind::Sctp,
        }
    }

    /// `true` if the OS allows creating sockets for this protocol. SCTP in particular depends
    ///  on a kernel module that is often not loaded.
    pub fn is_supported(self) -> bool {
        Socket::new(Domain::IPV4, Type::STREAM, Some(self.socket_protocol())).is_ok()
    }
}

impl Display for StreamProtocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.transport_kind(), f)
    }
}

#[derive(Debug, Eq, PartialEq)]
enum WriteOutcome {
    Written,
    /// the socket's send buffer was full, nothing was written
    Skipped,
}

struct Session {
    stream: TcpStream,
    /// keeps concurrent sends to the same peer from interleaving
    write_lock: Mutex<()>,
}

impl Session {
    fn new(stream: TcpStream) -> Session {
        Session {
            stream,
            write_lock: Mutex::new(()),
        }
    }

    /// Writes `buf` without waiting if the socket does not accept any data right now. Once part
    ///  of `buf` is written, the rest must follow for the peer to stay in sync, so this waits for
    ///  up to `send_timeout` to complete the write.
    async fn write(&self, buf: &[u8], send_timeout: Duration) -> io::Result<WriteOutcome> {
        let _guard = self.write_lock.lock().await;
        if buf.is_empty() {
            return Ok(WriteOutcome::Written);
        }

        let written = match self.stream.try_write(buf) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                return Ok(WriteOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };
        if written < buf.len() {
            timeout(send_timeout, self.write_remaining(&buf[written..])).await
                .map_err(|_| io::Error::new(ErrorKind::TimedOut, "peer did not accept data within the send timeout"))??;
        }
        Ok(WriteOutcome::Written)
    }

    async fn write_remaining(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            self.stream.writable().await?;
            match self.stream.try_write(buf) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn close(&self) {
        if let Err(e) = SockRef::from(&self.stream).shutdown(Shutdown::Both) {
            if e.kind() != ErrorKind::NotConnected {
                debug!("error shutting down socket: {}", e);
            }
        }
    }
}

struct StreamConnection {
    token: ConnectionToken,
    address: SocketAddr,
    session: Arc<Session>,
}

fn is_connection_loss(e: &io::Error) -> bool {
    matches!(e.kind(),
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::NotConnected
        | ErrorKind::UnexpectedEof
    )
}

/// StreamTransport is the connection-oriented transport for both TCP and SCTP (one-to-one
///  style), which differ only in the protocol their sockets are created with.
///
/// A server listens on its port (lazily re-trying if the port cannot be bound initially) and
///  accepts new clients in [`StreamTransport::accept_new_connections`]. A client has at most one
///  session with its server, which is (re-)established by [`StreamTransport::connect`].
pub struct StreamTransport {
    id: TransportId,
    protocol: StreamProtocol,
    config: StreamTransportConfig,
    self_ref: Weak<StreamTransport>,
    listener: Mutex<Option<std::net::TcpListener>>,
    connect_lock: Mutex<()>,
    is_shut_down: AtomicBool,
    connections: RwLock<FxHashMap<ConnectionId, StreamConnection>>,
}

impl StreamTransport {
    pub async fn tcp(config: StreamTransportConfig) -> anyhow::Result<Arc<StreamTransport>> {
        Self::new(StreamProtocol::Tcp, config).await
    }

    pub async fn sctp(config: StreamTransportConfig) -> anyhow::Result<Arc<StreamTransport>> {
        Self::new(StreamProtocol::Sctp, config).await
    }

    /// Creates the transport. Failure to listen (for a server) or to connect (for a client) is
    ///  logged, and re-tried on the next call to `accept_new_connections` or `connect`.
    pub async fn new(protocol: StreamProtocol, config: StreamTransportConfig) -> anyhow::Result<Arc<StreamTransport>> {
        config.validate()?;

        let transport = Arc::new_cyclic(|self_ref| StreamTransport {
            id: TransportId::next(),
            protocol,
            config,
            self_ref: self_ref.clone(),
            listener: Mutex::new(None),
            connect_lock: Mutex::new(()),
            is_shut_down: AtomicBool::new(false),
            connections: Default::default(),
        });

        match transport.config.role {
            Role::Server => {
                let mut listener = transport.listener.lock().await;
                *listener = transport.try_listen();
            }
            Role::Client => {
                if transport.connect().await.is_none() {
                    warn!("{} client could not connect to {}:{} - re-trying on the next connect", protocol, transport.config.ip, transport.config.port);
                }
            }
        }

        info!("created {} {:?} transport on port {}", protocol, transport.config.role, transport.config.port);
        Ok(transport)
    }

    pub fn protocol(&self) -> StreamProtocol {
        self.protocol
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    /// the address a server is listening on, if it is currently listening
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().await
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    fn create_socket(&self, domain: Domain) -> anyhow::Result<Socket> {
        let socket = Socket::new(domain, Type::STREAM, Some(self.protocol.socket_protocol()))?;
        apply_common_options(&socket, &self.protocol.to_string(), self.config.interface.as_deref());
        socket.set_nonblocking(true)?;
        Ok(socket)
    }

    fn listen(&self) -> anyhow::Result<std::net::TcpListener> {
        let bind_addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), self.config.port);
        let socket = self.create_socket(Domain::IPV4)?;
        socket.bind(&bind_addr.into())?;
        socket.listen(self.config.listen_backlog)?;

        let listener: std::net::TcpListener = socket.into();
        info!("{} server listening on {:?}", self.protocol, listener.local_addr()?);
        Ok(listener)
    }

    fn try_listen(&self) -> Option<std::net::TcpListener> {
        match self.listen() {
            Ok(listener) => Some(listener),
            Err(e) => {
                error!("{} server can not listen on port {}: {}", self.protocol, self.config.port, e);
                None
            }
        }
    }

    fn new_token(&self, name: String) -> ConnectionToken {
        let owner: Weak<dyn Transport> = self.self_ref.clone();
        ConnectionToken::new(name, self.id, owner)
    }

    /// Accepts all pending clients without blocking, returning their tokens. If the server is
    ///  not listening yet, this attempts to start listening first.
    ///
    /// Clients are never rejected, not even if another client from the same address is
    ///  connected already.
    pub async fn accept_new_connections(&self) -> Vec<ConnectionToken> {
        if self.config.role != Role::Server {
            warn!("accepting connections is only supported for {} servers", self.protocol);
            return Vec::new();
        }
        if self.is_shut_down.load(Ordering::Acquire) {
            return Vec::new();
        }

        let mut new_tokens = Vec::new();
        for (stream, address) in self.drain_pending_accepts().await {
            if let Some(token) = self.register_accepted(stream, address).await {
                new_tokens.push(token);
            }
        }
        new_tokens
    }

    async fn drain_pending_accepts(&self) -> Vec<(std::net::TcpStream, SocketAddr)> {
        let mut listener = self.listener.lock().await;
        if listener.is_none() {
            *listener = self.try_listen();
        }
        let Some(listener) = listener.as_ref() else {
            return Vec::new();
        };

        let mut accepted = Vec::new();
        loop {
            match listener.accept() {
                Ok(x) => accepted.push(x),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("{} unhandled error on accept: {}", self.protocol, e);
                    break;
                }
            }
        }
        accepted
    }

    async fn register_accepted(&self, stream: std::net::TcpStream, address: SocketAddr) -> Option<ConnectionToken> {
        let stream = match stream.set_nonblocking(true).and_then(|_| TcpStream::from_std(stream)) {
            Ok(stream) => stream,
            Err(e) => {
                error!("{} failed to register socket for client {:?}: {}", self.protocol, address, e);
                return None;
            }
        };
        self.apply_low_latency(&stream);

        info!("{} client connecting from {:?}", self.protocol, address);
        let same_address = self.connections.read().await
            .values()
            .filter(|c| c.address.ip() == address.ip())
            .count();
        if same_address > 0 {
            warn!("{} client {} is connected {} time(s) already", self.protocol, address.ip(), same_address);
        }

        Some(self.register_session(stream, address.ip().to_string(), address).await)
    }

    async fn register_session(&self, stream: TcpStream, name: String, address: SocketAddr) -> ConnectionToken {
        let token = self.new_token(name);
        self.connections.write().await
            .insert(token.id(), StreamConnection {
                token: token.clone(),
                address,
                session: Arc::new(Session::new(stream)),
            });
        token
    }

    fn apply_low_latency(&self, stream: &TcpStream) {
        if self.protocol == StreamProtocol::Tcp && self.config.low_latency {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("failed to set TCP_NODELAY: {}", e);
            }
        }
    }

    /// For a client, returns the token for the session with the server, connecting first if there
    ///  is no session. Returns `None` if the server can not be reached.
    pub async fn connect(&self) -> Option<ConnectionToken> {
        if self.config.role != Role::Client {
            warn!("connecting is only supported for {} clients", self.protocol);
            return None;
        }
        if let Some(token) = self.current_session().await {
            return Some(token);
        }

        let _guard = self.connect_lock.lock().await;
        if let Some(token) = self.current_session().await {
            return Some(token);
        }
        if self.is_shut_down.load(Ordering::Acquire) {
            return None;
        }

        let address = SocketAddr::new(self.config.ip, self.config.port);
        match self.open_session(address).await {
            Ok(stream) => {
                info!("{} connected to server {:?}", self.protocol, address);
                Some(self.register_session(stream, self.config.ip.to_string(), address).await)
            }
            Err(e) => {
                debug!("{} failed to connect to {:?}: {}", self.protocol, address, e);
                None
            }
        }
    }

    async fn current_session(&self) -> Option<ConnectionToken> {
        self.connections.read().await
            .values()
            .map(|c| c.token.clone())
            .next()
    }

    async fn open_session(&self, address: SocketAddr) -> anyhow::Result<TcpStream> {
        let socket = self.create_socket(Domain::for_address(address))?;
        let socket = TcpSocket::from_std_stream(socket.into());
        let stream = timeout(self.config.connect_timeout, socket.connect(address)).await??;
        self.apply_low_latency(&stream);
        Ok(stream)
    }

    async fn session_for(&self, token: &ConnectionToken) -> Option<Arc<Session>> {
        let connections = self.connections.read().await;
        match connections.get(&token.id()) {
            Some(connection) => Some(connection.session.clone()),
            None => {
                debug!("{:?} not found in {} connections", token, self.protocol);
                None
            }
        }
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        self.protocol.transport_kind()
    }

    /// SCTP is message oriented even on a one-to-one style socket, TCP is a plain byte stream
    fn preserves_message_boundaries(&self) -> bool {
        self.protocol == StreamProtocol::Sctp
    }

    async fn get_clients(&self) -> Vec<ConnectionToken> {
        self.connections.read().await
            .values()
            .map(|c| c.token.clone())
            .collect()
    }

    async fn receive(&self, token: &ConnectionToken, buf: &mut [u8]) -> Option<usize> {
        if !self.check_token(token) {
            return None;
        }
        let session = self.session_for(token).await?;
        if buf.is_empty() {
            return Some(0);
        }

        match session.stream.try_read(buf) {
            Ok(0) => {
                debug!("{} peer {} closed the connection", self.protocol, token.name());
                token.disconnect().await;
                None
            }
            Ok(n) => {
                trace!("{} received {} bytes from {}", self.protocol, n, token.name());
                Some(n)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => Some(0),
            Err(e) if is_connection_loss(&e) => {
                debug!("{} lost connection to {}: {}", self.protocol, token.name(), e);
                token.disconnect().await;
                None
            }
            Err(e) => {
                warn!("{} receive error from {}: {}", self.protocol, token.name(), e);
                Some(0)
            }
        }
    }

    async fn send(&self, token: &ConnectionToken, buf: &[u8]) -> bool {
        if !self.check_token(token) {
            return false;
        }
        let Some(session) = self.session_for(token).await else {
            return false;
        };

        match session.write(buf, self.config.send_timeout).await {
            Ok(WriteOutcome::Written) => trace!("{} sent {} bytes to {}", self.protocol, buf.len(), token.name()),
            Ok(WriteOutcome::Skipped) => debug!("{} send buffer for {} is full - dropping {} bytes", self.protocol, token.name(), buf.len()),
            Err(e) if e.kind() == ErrorKind::TimedOut => {
                warn!("{} peer {} stopped accepting data in the middle of a send: {}", self.protocol, token.name(), e);
                token.disconnect().await;
            }
            Err(e) if is_connection_loss(&e) => {
                debug!("{} lost connection to {}: {}", self.protocol, token.name(), e);
                token.disconnect().await;
            }
            Err(e) => warn!("{} failed to send data to {}: {}", self.protocol, token.name(), e),
        }
        token.is_connected()
    }

    async fn disconnect_client(&self, token: &ConnectionToken) {
        token.mark_disconnected();

        let removed = self.connections.write().await.remove(&token.id());
        match removed {
            Some(connection) => {
                connection.session.close();
                let peer_kind = match self.config.role {
                    Role::Server => "client",
                    Role::Client => "server",
                };
                info!("{} {} {} disconnected", self.protocol, peer_kind, token.name());
            }
            None => debug!("{:?} not found in {} connections while disconnecting", token, self.protocol),
        }
    }

    async fn shut_down(&self) {
        self.is_shut_down.store(true, Ordering::Release);

        let drained: Vec<StreamConnection> = self.connections.write().await
            .drain()
            .map(|(_, connection)| connection)
            .collect();
        for connection in drained {
            connection.token.mark_disconnected();
            connection.session.close();
        }

        if self.listener.lock().await.take().is_some() {
            debug!("{} server stopped listening on port {}", self.protocol, self.config.port);
        }
        info!("{} transport shut down", self.protocol);
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        for (_, connection) in self.connections.get_mut().drain() {
            connection.token.mark_disconnected();
            connection.session.close();
        }
    }
}
