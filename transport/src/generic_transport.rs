use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::bail;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::connection_token::ConnectionToken;

/// Peer name that addresses every peer of a transport. For UDP it is an alias for the
///  broadcast address.
pub const BROADCAST_CLIENT: &str = "all";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct TransportId(u64);

impl TransportId {
    pub(crate) fn next() -> TransportId {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        TransportId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TransportKind {
    Tcp,
    Sctp,
    Udp,
    ReliableUdp,
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportKind::Tcp => "TCP",
            TransportKind::Sctp => "SCTP",
            TransportKind::Udp => "UDP",
            TransportKind::ReliableUdp => "RUDP",
        };
        f.write_str(name)
    }
}

impl FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportKind::Tcp),
            "sctp" => Ok(TransportKind::Sctp),
            "udp" => Ok(TransportKind::Udp),
            "rudp" | "reliable-udp" => Ok(TransportKind::ReliableUdp),
            _ => bail!("unknown transport {:?} - expected tcp, sctp, udp or rudp", s),
        }
    }
}

/// The contract shared by all transports. Operations never block on the network: a receive
///  with nothing pending returns `Some(0)`, and `None` signals that the token's peer is gone.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn id(&self) -> TransportId;

    fn kind(&self) -> TransportKind;

    /// `true` if every successful receive returns exactly one message as it was sent. Stream
    ///  transports return `false`, requiring application-level framing.
    fn preserves_message_boundaries(&self) -> bool;

    /// snapshot of the currently registered peers
    async fn get_clients(&self) -> Vec<ConnectionToken>;

    /// `true` iff the token is connected and was issued by this transport
    fn check_token(&self, token: &ConnectionToken) -> bool {
        token.is_connected() && token.transport_id() == self.id()
    }

    /// Reads whatever is pending for the token's peer into `buf`, returning the number of bytes
    ///  read (possibly 0), or `None` if the token is no longer connected. Data that does not fit
    ///  into `buf` is truncated for message-oriented transports and left pending for stream
    ///  transports.
    async fn receive(&self, token: &ConnectionToken, buf: &mut [u8]) -> Option<usize>;

    /// Sends `buf` to the token's peer, returning whether the token is still connected
    ///  afterwards. Transient send failures are logged but do not disconnect.
    async fn send(&self, token: &ConnectionToken, buf: &[u8]) -> bool;

    /// Forgets the token's peer, closing its socket if it has one. Unknown tokens are ignored.
    async fn disconnect_client(&self, token: &ConnectionToken);

    /// Disconnects all peers and releases listening sockets.
    async fn shut_down(&self);

    /// Sends to every registered peer with the given name, or to all peers for
    ///  [`BROADCAST_CLIENT`]. Returns `true` if at least one peer was still connected afterwards.
    async fn send_named(&self, name: &str, buf: &[u8]) -> bool {
        let mut any_connected = false;
        for token in self.get_clients().await {
            if name != BROADCAST_CLIENT && token.name() != name {
                continue;
            }
            if self.send(&token, buf).await {
                any_connected = true;
            }
        }
        any_connected
    }

    /// Receives from the first peer with the given name that has data pending. Returns `None`
    ///  if there is no such peer that is still connected.
    async fn receive_named(&self, name: &str, buf: &mut [u8]) -> Option<usize> {
        let mut any_connected = false;
        for token in self.get_clients().await {
            if name != BROADCAST_CLIENT && token.name() != name {
                continue;
            }
            match self.receive(&token, buf).await {
                Some(0) => any_connected = true,
                Some(n) => return Some(n),
                None => {}
            }
        }
        any_connected.then_some(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::tcp("tcp", TransportKind::Tcp)]
    #[case::sctp("SCTP", TransportKind::Sctp)]
    #[case::udp("udp", TransportKind::Udp)]
    #[case::rudp("rudp", TransportKind::ReliableUdp)]
    #[case::reliable_udp("reliable-udp", TransportKind::ReliableUdp)]
    fn test_parse_kind(#[case] s: &str, #[case] expected: TransportKind) {
        assert_eq!(s.parse::<TransportKind>().unwrap(), expected);
        assert_eq!(expected.to_string().parse::<TransportKind>().unwrap(), expected);
    }

    #[test]
    fn test_parse_unknown_kind() {
        assert!("quic".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_transport_ids_are_unique() {
        assert_ne!(TransportId::next(), TransportId::next());
    }
}
