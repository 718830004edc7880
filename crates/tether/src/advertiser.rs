use std::collections::HashSet;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use transport_session::{
    InboundStream, Peer, SessionEvent, SessionEvents, SessionResult, Transport,
};

use crate::atomic::Atomic;
use crate::bridge::{SocketBridge, TcpRelayBridge};
use crate::builder::AdvertiserVirtualSocketBuilder;
use crate::config::TetherConfig;
use crate::error::TetherError;
use crate::metrics;
use crate::ErrorHandler;

/// Maps the application's server port to the bridge that relays into it.
pub type BridgeFactory = Arc<dyn Fn(u16) -> Arc<dyn SocketBridge> + Send + Sync>;

struct Advertiser {
    peer: Peer,
    port: u16,
    dispatch: JoinHandle<()>,
}

struct AdvertiserInner {
    transport: Arc<dyn Transport>,
    config: TetherConfig,
    bridge_factory: BridgeFactory,
    /// Oldest generation first.
    advertisers: Atomic<Vec<Advertiser>>,
    identity: Atomic<Option<Peer>>,
}

/// Advertises this device and relays peer-initiated virtual sockets into a
/// local server.
///
/// Must be used from within a Tokio runtime.
#[derive(Clone)]
pub struct AdvertiserManager {
    inner: Arc<AdvertiserInner>,
}

impl AdvertiserManager {
    pub fn new(transport: Arc<dyn Transport>, config: &TetherConfig) -> Self {
        let host = config.bridge_host;
        Self::with_bridge_factory(transport, config, move |port| {
            Arc::new(TcpRelayBridge::new(host, port)) as Arc<dyn SocketBridge>
        })
    }

    pub fn with_bridge_factory(
        transport: Arc<dyn Transport>,
        config: &TetherConfig,
        bridge_factory: impl Fn(u16) -> Arc<dyn SocketBridge> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(AdvertiserInner {
                transport,
                config: config.clone(),
                bridge_factory: Arc::new(bridge_factory),
                advertisers: Atomic::new(Vec::new()),
                identity: Atomic::new(None),
            }),
        }
    }

    pub fn is_advertising(&self) -> bool {
        self.inner.advertisers.with_value(|advertisers| !advertisers.is_empty())
    }

    /// Every generation still advertised, oldest first.
    pub fn advertisers(&self) -> Vec<Peer> {
        self.inner
            .advertisers
            .with_value(|advertisers| advertisers.iter().map(|a| a.peer).collect())
    }

    /// The newest advertised generation.
    pub fn current_peer(&self) -> Option<Peer> {
        self.inner
            .advertisers
            .with_value(|advertisers| advertisers.last().map(|a| a.peer))
    }

    /// Starts advertising for `port`; a no-op when already advertising.
    pub fn start_advertising(
        &self,
        port: u16,
        on_error: impl Fn(TetherError) + Send + Sync + 'static,
    ) {
        let on_error: ErrorHandler = Arc::new(on_error);
        let started = self.inner.advertisers.modify(|advertisers| {
            if !advertisers.is_empty() {
                return Ok(None);
            }
            self.inner.advertise(advertisers, port, &on_error).map(Some)
        });
        match started {
            Ok(Some(peer)) => {
                info!(target = "tether::advertiser", peer = %peer, port, "advertising started")
            }
            Ok(None) => trace!(target = "tether::advertiser", "already advertising"),
            Err(err) => {
                warn!(target = "tether::advertiser", error = %err, "failed to start advertising");
                on_error(TetherError::Session(err));
            }
        }
    }

    /// Advertises a new generation of this device's identity for `port`.
    ///
    /// The previous generation keeps serving for `dispose_advertiser_timeout`
    /// so peers mid-connect can finish, then it is withdrawn.
    pub fn start_update_advertising_and_listening(
        &self,
        port: u16,
        on_error: impl Fn(TetherError) + Send + Sync + 'static,
    ) {
        let on_error: ErrorHandler = Arc::new(on_error);
        let started = self.inner.advertisers.modify(|advertisers| {
            let superseded = advertisers.last().map(|a| a.peer);
            self.inner
                .advertise(advertisers, port, &on_error)
                .map(|peer| (peer, superseded))
        });
        match started {
            Ok((peer, superseded)) => {
                info!(target = "tether::advertiser", peer = %peer, port, "advertising generation");
                if let Some(old) = superseded {
                    self.schedule_dispose(old);
                }
            }
            Err(err) => {
                warn!(target = "tether::advertiser", error = %err, "failed to update advertising");
                on_error(TetherError::Session(err));
            }
        }
    }

    /// Withdraws every generation; a no-op when not advertising.
    pub fn stop_advertising(&self) {
        let stopped = self.inner.advertisers.modify(std::mem::take);
        if stopped.is_empty() {
            return;
        }
        for advertiser in stopped {
            self.inner.withdraw(advertiser);
        }
        info!(target = "tether::advertiser", "advertising stopped");
    }

    fn schedule_dispose(&self, peer: Peer) {
        let inner = Arc::downgrade(&self.inner);
        let delay = self.inner.config.dispose_advertiser_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                inner.dispose(peer);
            }
        });
    }
}

impl AdvertiserInner {
    /// Picks the next identity, starts advertising it and appends it to
    /// `advertisers`. Called with the advertiser list locked.
    fn advertise(
        &self,
        advertisers: &mut Vec<Advertiser>,
        port: u16,
        on_error: &ErrorHandler,
    ) -> SessionResult<Peer> {
        let previous = advertisers
            .last()
            .map(|latest| latest.peer)
            .or_else(|| self.identity.get());
        let peer = match previous {
            Some(previous) => previous.next_generation().unwrap_or_else(|| {
                warn!(target = "tether::advertiser", peer = %previous, "generations exhausted, advertising a fresh identity");
                Peer::new()
            }),
            None => Peer::new(),
        };
        let events = self.transport.start_advertising(&peer)?;
        let bridge = (self.bridge_factory)(port);
        let dispatch = tokio::spawn(dispatch_events(
            peer,
            events,
            bridge,
            Arc::clone(on_error),
        ));
        self.identity.modify(|identity| *identity = Some(peer));
        advertisers.push(Advertiser {
            peer,
            port,
            dispatch,
        });
        Ok(peer)
    }

    fn dispose(&self, peer: Peer) {
        let removed = self.advertisers.modify(|advertisers| {
            let index = advertisers.iter().position(|a| a.peer == peer)?;
            Some(advertisers.remove(index))
        });
        if let Some(advertiser) = removed {
            debug!(target = "tether::advertiser", peer = %peer, "superseded generation disposed");
            self.withdraw(advertiser);
        }
    }

    fn withdraw(&self, advertiser: Advertiser) {
        advertiser.dispatch.abort();
        self.transport.stop_advertising(&advertiser.peer);
        trace!(target = "tether::advertiser", peer = %advertiser.peer, port = advertiser.port, "withdrawn");
    }
}

impl Drop for AdvertiserInner {
    fn drop(&mut self) {
        for advertiser in self.advertisers.modify(std::mem::take) {
            self.withdraw(advertiser);
        }
    }
}

/// Stream names with a live virtual socket on one advertiser generation.
#[derive(Clone, Default)]
struct LiveStreams(Arc<Atomic<HashSet<String>>>);

impl LiveStreams {
    /// Claims `name`; `None` while a socket of that name is still alive.
    fn claim(&self, name: &str) -> Option<StreamClaim> {
        let claimed = self.0.modify(|names| names.insert(name.to_string()));
        claimed.then(|| StreamClaim {
            streams: self.clone(),
            name: name.to_string(),
        })
    }
}

struct StreamClaim {
    streams: LiveStreams,
    name: String,
}

impl Drop for StreamClaim {
    fn drop(&mut self) {
        self.streams.0.modify(|names| names.remove(&self.name));
    }
}

/// Inbound half that gives its name back once the socket is dropped.
struct ClaimedReader {
    inner: InboundStream,
    _claim: StreamClaim,
}

impl AsyncRead for ClaimedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

async fn dispatch_events(
    peer: Peer,
    mut events: SessionEvents,
    bridge: Arc<dyn SocketBridge>,
    on_error: ErrorHandler,
) {
    let live = LiveStreams::default();
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::InboundStreamOpened {
                session,
                name,
                stream,
            } => {
                let Some(claim) = live.claim(&name) else {
                    warn!(target = "tether::advertiser", peer = %peer, stream = %name, "duplicate stream name rejected");
                    let result: Result<(), _> = Err(TetherError::ConnectionFailed);
                    metrics::record_advertiser_socket(&result);
                    on_error(TetherError::ConnectionFailed);
                    continue;
                };
                let stream = InboundStream::new(
                    name.clone(),
                    ClaimedReader {
                        inner: stream,
                        _claim: claim,
                    },
                );
                debug!(target = "tether::advertiser", peer = %peer, stream = %name, session = %session.id(), "peer opened stream");
                let socket =
                    AdvertiserVirtualSocketBuilder::new(session).create_virtual_socket(stream, &name);
                let bridge = Arc::clone(&bridge);
                let on_error = Arc::clone(&on_error);
                tokio::spawn(async move {
                    let result = match socket {
                        Ok(socket) => bridge.bridge(socket).await,
                        Err(err) => Err(err),
                    };
                    metrics::record_advertiser_socket(&result);
                    if let Err(err) = result {
                        warn!(target = "tether::advertiser", stream = %name, error = %err, "virtual socket not relayed");
                        on_error(err);
                    }
                });
            }
            SessionEvent::Failed(err) => {
                warn!(target = "tether::advertiser", peer = %peer, error = %err, "session failed");
                on_error(TetherError::Session(err));
            }
            SessionEvent::PeerAvailabilityChanged { .. } => {}
        }
    }
    trace!(target = "tether::advertiser", peer = %peer, "dispatch finished");
}
