//! Session capability consumed by the virtual-socket handshake.
//!
//! A [`Transport`] discovers peers and hands out one [`Session`] per remote
//! peer. A session can only open *outbound* streams; the remote side learns
//! about them asynchronously through [`SessionEvent::InboundStreamOpened`].
//! Nothing here guarantees ordering or delivery time between peers.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

mod loopback;
mod peer;
mod stream;

pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use peer::{Peer, PeerParseError};
pub use stream::{InboundStream, OutboundStream};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,
    #[error("peer {0} is not reachable")]
    PeerUnreachable(Peer),
    #[error("stream {name} rejected: {reason}")]
    StreamRejected { name: String, reason: String },
    #[error("session transport error: {0}")]
    Transport(String),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// A connected session with exactly one remote peer.
///
/// Implementations must not deliver events synchronously from inside
/// [`Session::open_outbound_stream`]; callers may hold locks across it.
pub trait Session: Send + Sync {
    fn id(&self) -> String;
    fn open_outbound_stream(&self, name: &str) -> SessionResult<OutboundStream>;
}

pub enum SessionEvent {
    PeerAvailabilityChanged {
        peer: Peer,
        available: bool,
    },
    /// `session` is the reply path back to whoever opened the stream.
    InboundStreamOpened {
        session: Arc<dyn Session>,
        name: String,
        stream: InboundStream,
    },
    Failed(SessionError),
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::PeerAvailabilityChanged { peer, available } => f
                .debug_struct("PeerAvailabilityChanged")
                .field("peer", peer)
                .field("available", available)
                .finish(),
            SessionEvent::InboundStreamOpened { session, name, .. } => f
                .debug_struct("InboundStreamOpened")
                .field("session", &session.id())
                .field("name", name)
                .finish_non_exhaustive(),
            SessionEvent::Failed(err) => f.debug_tuple("Failed").field(err).finish(),
        }
    }
}

pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// Discovery-level capability: browsing, advertising and per-peer sessions.
pub trait Transport: Send + Sync {
    fn start_browsing(&self) -> SessionResult<SessionEvents>;
    fn stop_browsing(&self);
    fn start_advertising(&self, peer: &Peer) -> SessionResult<SessionEvents>;
    fn stop_advertising(&self, peer: &Peer);
    fn session(&self, peer: &Peer) -> SessionResult<Arc<dyn Session>>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn start_browsing(&self) -> SessionResult<SessionEvents> {
        (**self).start_browsing()
    }

    fn stop_browsing(&self) {
        (**self).stop_browsing()
    }

    fn start_advertising(&self, peer: &Peer) -> SessionResult<SessionEvents> {
        (**self).start_advertising(peer)
    }

    fn stop_advertising(&self, peer: &Peer) {
        (**self).stop_advertising(peer)
    }

    fn session(&self, peer: &Peer) -> SessionResult<Arc<dyn Session>> {
        (**self).session(peer)
    }
}
