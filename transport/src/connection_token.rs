use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tracing::trace;

use crate::generic_transport::{Transport, TransportId};

/// Process-wide unique identity of a connection. Ids are never reused.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> ConnectionId {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn to_raw(self) -> u64 {
        self.0
    }
}

struct TokenInner {
    id: ConnectionId,
    name: String,
    connected: AtomicBool,
    transport_id: TransportId,
    owner: Weak<dyn Transport>,
}

/// ConnectionToken is the application's handle for a single peer of a transport. Clones share
///  the same identity and the same 'connected' flag, and two tokens are equal iff they are
///  clones of each other.
///
/// Tokens hold only a weak reference to the transport that issued them, so an outstanding token
///  does not keep a transport alive. Once the transport is gone, send and receive through the
///  token fail as if the peer had disconnected.
#[derive(Clone)]
pub struct ConnectionToken {
    inner: Arc<TokenInner>,
}

impl ConnectionToken {
    pub(crate) fn new(name: impl Into<String>, transport_id: TransportId, owner: Weak<dyn Transport>) -> ConnectionToken {
        let token = ConnectionToken {
            inner: Arc::new(TokenInner {
                id: ConnectionId::next(),
                name: name.into(),
                connected: AtomicBool::new(true),
                transport_id,
                owner,
            }),
        };
        trace!("new connection token {:?}", token);
        token
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// human-readable peer name, typically the peer's address
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn transport_id(&self) -> TransportId {
        self.inner.transport_id
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// the transport that issued this token if it still exists
    pub fn owner(&self) -> Option<Arc<dyn Transport>> {
        self.inner.owner.upgrade()
    }

    /// clears the 'connected' flag, returning `true` if this call was the one that cleared it
    pub(crate) fn mark_disconnected(&self) -> bool {
        self.inner.connected.swap(false, Ordering::AcqRel)
    }

    /// Disconnects the peer. Only the first call on any clone of a token reaches the owning
    ///  transport, all further calls are no-ops.
    pub async fn disconnect(&self) {
        if !self.mark_disconnected() {
            trace!("{:?} is already disconnected", self);
            return;
        }
        if let Some(owner) = self.owner() {
            owner.disconnect_client(self).await;
        }
    }

    /// Non-blocking receive from this token's peer, see [`Transport::receive`]. Returns `None`
    ///  if the token is disconnected or its transport is gone.
    pub async fn receive(&self, buf: &mut [u8]) -> Option<usize> {
        if !self.is_connected() {
            return None;
        }
        let owner = self.owner()?;
        owner.receive(self, buf).await
    }

    /// Sends to this token's peer, returning whether the token is still connected afterwards.
    pub async fn send(&self, buf: &[u8]) -> bool {
        if !self.is_connected() {
            return false;
        }
        match self.owner() {
            Some(owner) => owner.send(self, buf).await,
            None => false,
        }
    }
}

impl PartialEq for ConnectionToken {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}
impl Eq for ConnectionToken {}

impl Hash for ConnectionToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl Debug for ConnectionToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectionToken{{{}:{}@{:?}{}}}",
               self.inner.id.0,
               self.inner.name,
               self.inner.transport_id,
               if self.is_connected() { "" } else { " (disconnected)" },
        )
    }
}
