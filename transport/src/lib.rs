//! Connection-oriented facade over TCP, SCTP, UDP and a small reliable-UDP flavour.
//!
//! ## Design goals
//!
//! * Application code handles *peers* through opaque [`ConnectionToken`]s, regardless of the
//!    underlying protocol
//!   * a token is cheap to clone and compares by identity, never by content
//!   * a token knows whether its peer is still connected, and which transport owns it
//! * All I/O is non-blocking: a receive returns immediately with zero bytes if nothing is pending
//!   * a disconnect is distinct from "nothing pending", allowing callers to notice peer loss
//!     without a separate polling API
//! * Stream transports (TCP and SCTP) have a fixed role:
//!   * a *server* listens and accepts any number of clients
//!   * a *client* connects to exactly one server, reconnecting lazily after a connection loss
//! * UDP is connectionless, but peers are tracked as *virtual connections* keyed by their
//!    address so that they are indistinguishable from stream peers for application code
//!   * datagrams from peers other than the one being read from are kept in a per-peer backlog
//!     rather than being dropped
//!   * the `"all"` peer is an alias for the interface's broadcast address
//! * Applications may use any combination of transports at the same time, each with its own
//!    connection table
//!
//! ## Concurrency
//!
//! Every transport guards its connection table with a `tokio::sync::RwLock`. Send and receive
//!  hold the shared lock only long enough to look up the socket for a token; adding and removing
//!  peers takes the exclusive lock. The exclusive lock is never requested while the shared lock
//!  is held by the same task.
//!
//! ## Reliable UDP
//!
//! ```ascii
//! 0: packet kind (u8): 0 = DATA, 1 = ACK
//! 1: sequence number (u32 BE)
//! 5: payload (DATA only)
//! ```
//!
//! Every DATA packet is acknowledged individually. Unacknowledged packets are re-sent after a
//!  configurable timeout, and a peer that fails to acknowledge after a configurable number of
//!  retransmissions is disconnected.

pub mod any_transport;
pub mod config;
pub mod connection_token;
pub mod generic_transport;
pub mod interfaces;
pub mod reliable_udp;
pub mod safe_converter;
mod socket_options;
pub mod stream_transport;
pub mod task;
pub mod udp_transport;

pub use connection_token::{ConnectionId, ConnectionToken};
pub use generic_transport::{Transport, TransportId, TransportKind, BROADCAST_CLIENT};
