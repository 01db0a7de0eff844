use std::net::IpAddr;
use std::time::Duration;

use anyhow::bail;

use crate::safe_converter::SafeCast;

/// The fixed role of a stream transport
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    /// listens on a port and accepts any number of clients
    Server,
    /// connects to a single server
    Client,
}

#[derive(Clone, Debug)]
pub struct StreamTransportConfig {
    pub role: Role,

    /// The server address a client connects to. Servers always listen on the wildcard address,
    ///  and ignore this setting.
    pub ip: IpAddr,

    /// The port a server listens on, or a client connects to. A server with port 0 listens on
    ///  an ephemeral port.
    pub port: u16,

    /// Optional network interface to bind sockets to (e.g. `eth0`). Binding failures are logged
    ///  but not fatal.
    pub interface: Option<String>,

    /// disables Nagle's algorithm for TCP, ignored for SCTP
    pub low_latency: bool,

    /// upper bound for a single connection attempt of a client
    pub connect_timeout: Duration,

    /// A send that the socket does not accept at all is dropped right away. A send that was
    ///  partially written gets this long to complete, after that the peer is disconnected.
    pub send_timeout: Duration,

    pub listen_backlog: i32,
}

impl StreamTransportConfig {
    pub fn server(port: u16) -> StreamTransportConfig {
        StreamTransportConfig {
            role: Role::Server,
            ip: IpAddr::from([0, 0, 0, 0]),
            port,
            interface: None,
            low_latency: true,
            connect_timeout: Duration::from_secs(1),
            send_timeout: Duration::from_secs(1),
            listen_backlog: 20,
        }
    }

    pub fn client(ip: IpAddr, port: u16) -> StreamTransportConfig {
        StreamTransportConfig {
            role: Role::Client,
            ip,
            ..Self::server(port)
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.role == Role::Client && self.port == 0 {
            bail!("a client needs the server's port to connect to");
        }
        if self.connect_timeout.is_zero() {
            bail!("connect timeout must not be zero");
        }
        if self.send_timeout.is_zero() {
            bail!("send timeout must not be zero");
        }
        if self.listen_backlog <= 0 {
            bail!("listen backlog must be positive");
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct UdpTransportConfig {
    /// The port that this transport binds to, and that peers are assumed to listen on if they
    ///  are connected by IP address only. Port 0 binds to an ephemeral port.
    pub port: u16,

    /// Optional network interface to bind to. Its broadcast address is the target of the
    ///  broadcast peer; without an interface, broadcasts go to the wildcard address.
    pub interface: Option<String>,

    /// Datagrams bigger than this are sent anyway, but a warning is logged since they are likely
    ///  to be fragmented or dropped on the way.
    ///
    /// With full Ethernet frames and no optional IP headers, this is `1500 - 20 - 8 = 1472`.
    pub max_safe_datagram_size: usize,

    /// size of the buffer a single datagram is received into - bigger datagrams are truncated
    pub receive_buffer_size: usize,

    /// Maximum number of datagrams buffered per peer while waiting to be read. The oldest
    ///  datagram is dropped when a backlog overflows.
    pub max_backlog_len: usize,
}

impl UdpTransportConfig {
    pub fn new(port: u16) -> UdpTransportConfig {
        UdpTransportConfig {
            port,
            interface: None,
            max_safe_datagram_size: 1472,
            receive_buffer_size: 65536,
            max_backlog_len: 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_safe_datagram_size == 0 {
            bail!("max safe datagram size must not be zero");
        }
        if self.receive_buffer_size < self.max_safe_datagram_size {
            bail!("receive buffer size {} is smaller than the max safe datagram size {}", self.receive_buffer_size, self.max_safe_datagram_size);
        }
        if self.max_backlog_len == 0 {
            bail!("max backlog length must not be zero");
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ReliableUdpConfig {
    pub udp: UdpTransportConfig,

    /// interval for processing incoming packets and checking for overdue acknowledgements
    pub tick_interval: Duration,

    /// a packet is re-sent if it is not acknowledged for this long
    pub retransmit_timeout: Duration,

    /// a peer is disconnected if a packet is still not acknowledged after this many re-sends
    pub max_retransmissions: u32,

    /// This is the maximum number of *packets* (not bytes) per peer stored on the sender side
    ///  pending an ack. Sending blocks while the window is full.
    pub send_window_size: usize,

    /// maximum number of packets buffered per peer while waiting for a gap in the sequence to
    ///  be filled
    pub receive_window_size: u32,
}

impl ReliableUdpConfig {
    pub fn new(port: u16) -> ReliableUdpConfig {
        ReliableUdpConfig {
            udp: UdpTransportConfig::new(port),
            tick_interval: Duration::from_millis(10),
            retransmit_timeout: Duration::from_millis(200),
            max_retransmissions: 10,
            send_window_size: 64,
            receive_window_size: 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.udp.validate()?;

        if self.tick_interval.is_zero() {
            bail!("tick interval must not be zero");
        }
        if self.retransmit_timeout < self.tick_interval {
            bail!("retransmit timeout must not be shorter than the tick interval");
        }
        if self.send_window_size == 0 {
            bail!("send window size must not be zero");
        }
        if self.receive_window_size == 0 {
            bail!("receive window size must not be zero");
        }
        if self.send_window_size > self.receive_window_size.safe_cast() {
            bail!("send window size must not exceed the receive window size");
        }
        Ok(())
    }
}
