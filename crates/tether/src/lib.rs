//! Virtual sockets over peer-to-peer sessions.
//!
//! A [`BrowserManager`] discovers advertising peers and, on connect, opens a
//! named stream to the chosen peer. The [`AdvertiserManager`] on the other side
//! answers with a stream of the same name; the pair becomes a
//! [`VirtualSocket`] that each side exposes as an ordinary local TCP socket.
//!
//! Peers are identified by a UUID plus a generation counter. Restarting
//! advertising bumps the generation, and browsers always connect to the
//! newest generation they have seen.

pub mod advertiser;
pub mod atomic;
pub mod bridge;
pub mod browser;
pub mod builder;
pub mod config;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod socket;
pub mod telemetry;

use std::sync::Arc;

pub use advertiser::{AdvertiserManager, BridgeFactory};
pub use atomic::Atomic;
pub use bridge::{SocketBridge, TcpListenerBridge, TcpRelayBridge};
pub use browser::{BrowserManager, PeersAvailabilityHandler};
pub use builder::{AdvertiserVirtualSocketBuilder, BrowserVirtualSocketBuilder};
pub use config::TetherConfig;
pub use error::{TetherError, TetherResult};
pub use registry::{PeerAvailability, PeerRecord, PeerRegistry};
pub use socket::VirtualSocket;
pub use transport_session::{
    InboundStream, LoopbackNetwork, LoopbackTransport, OutboundStream, Peer, Session,
    SessionError, SessionEvent, Transport,
};

/// Receives failures reported outside of a direct call, such as a session
/// dropping while listening or advertising.
pub type ErrorHandler = Arc<dyn Fn(TetherError) + Send + Sync>;
