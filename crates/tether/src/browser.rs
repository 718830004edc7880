use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::ReentrantMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use transport_session::{
    InboundStream, Peer, SessionError, SessionEvent, SessionEvents, Transport,
};
use uuid::Uuid;

use crate::atomic::Atomic;
use crate::bridge::{SocketBridge, TcpListenerBridge};
use crate::builder::BrowserVirtualSocketBuilder;
use crate::config::TetherConfig;
use crate::error::{TetherError, TetherResult};
use crate::metrics;
use crate::registry::{PeerAvailability, PeerRecord, PeerRegistry};
use crate::ErrorHandler;

pub type PeersAvailabilityHandler = Arc<dyn Fn(Vec<PeerAvailability>) + Send + Sync>;

struct Listening {
    epoch: u64,
    dispatch: JoinHandle<()>,
}

struct BrowserInner {
    transport: Arc<dyn Transport>,
    bridge: Arc<dyn SocketBridge>,
    config: TetherConfig,
    registry: Atomic<PeerRegistry>,
    builders: Atomic<HashMap<String, Arc<BrowserVirtualSocketBuilder>>>,
    listening: Atomic<Option<Listening>>,
    next_epoch: Atomic<u64>,
    /// Held while the availability handler runs; reentrant so the handler
    /// may stop its own manager.
    delivery: ReentrantMutex<()>,
    availability_handler: PeersAvailabilityHandler,
}

/// Discovers advertising peers and connects to them through virtual sockets.
///
/// Must be used from within a Tokio runtime.
#[derive(Clone)]
pub struct BrowserManager {
    inner: Arc<BrowserInner>,
}

impl BrowserManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: &TetherConfig,
        availability_handler: impl Fn(Vec<PeerAvailability>) + Send + Sync + 'static,
    ) -> Self {
        let bridge = Arc::new(TcpListenerBridge::new(
            config.bridge_host,
            config.bridge_accept_timeout,
        ));
        Self::with_bridge(transport, config, bridge, availability_handler)
    }

    pub fn with_bridge(
        transport: Arc<dyn Transport>,
        config: &TetherConfig,
        bridge: Arc<dyn SocketBridge>,
        availability_handler: impl Fn(Vec<PeerAvailability>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(BrowserInner {
                transport,
                bridge,
                config: config.clone(),
                registry: Atomic::new(PeerRegistry::new()),
                builders: Atomic::new(HashMap::new()),
                listening: Atomic::new(None),
                next_epoch: Atomic::new(0),
                delivery: ReentrantMutex::new(()),
                availability_handler: Arc::new(availability_handler),
            }),
        }
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listening.with_value(Option::is_some)
    }

    /// Starts browsing; a no-op when already listening.
    ///
    /// `on_error` receives transport failures for as long as this listening
    /// epoch lasts, including a failure to start at all.
    pub fn start_listening(&self, on_error: impl Fn(TetherError) + Send + Sync + 'static) {
        let on_error: ErrorHandler = Arc::new(on_error);
        let started = self.inner.listening.modify(|listening| -> Result<bool, SessionError> {
            if listening.is_some() {
                return Ok(false);
            }
            let events = self.inner.transport.start_browsing()?;
            let epoch = self.inner.next_epoch.modify(|next| {
                *next += 1;
                *next
            });
            let dispatch = tokio::spawn(dispatch_events(
                Arc::downgrade(&self.inner),
                events,
                Arc::clone(&on_error),
                epoch,
            ));
            *listening = Some(Listening { epoch, dispatch });
            Ok(true)
        });

        match started {
            Ok(true) => info!(target = "tether::browser", "listening for advertisements"),
            Ok(false) => trace!(target = "tether::browser", "already listening"),
            Err(err) => {
                warn!(target = "tether::browser", error = %err, "failed to start listening");
                on_error(TetherError::Session(err));
            }
        }
    }

    /// Stops browsing; a no-op when not listening.
    ///
    /// The registry is cleared and no availability event is delivered once this
    /// returns; a handler call already running is waited for. Connects already
    /// in flight resolve on their own, normally by timing out.
    pub fn stop_listening(&self) {
        let Some(listening) = self.inner.listening.modify(Option::take) else {
            return;
        };
        listening.dispatch.abort();
        self.inner.transport.stop_browsing();
        self.inner.registry.modify(PeerRegistry::clear);
        drop(self.inner.delivery.lock());
        info!(target = "tether::browser", epoch = listening.epoch, "stopped listening");
    }

    pub fn available_peers(&self) -> Vec<Peer> {
        self.inner.registry.with_value(PeerRegistry::available_peers)
    }

    pub fn last_generation_peer(&self, peer_identifier: Uuid) -> Option<PeerRecord> {
        self.inner
            .registry
            .with_value(|registry| registry.last_generation_peer(peer_identifier))
    }

    /// Connects to the latest generation of `peer_identifier` and returns the
    /// local TCP port bridged to it.
    pub async fn connect(&self, peer_identifier: Uuid) -> TetherResult<u16> {
        let result = self.inner.connect(peer_identifier).await;
        metrics::record_connect(&result);
        result
    }

    /// Callback flavour of [`BrowserManager::connect`]; `sync_value` is handed
    /// back untouched so callers can correlate responses.
    pub fn connect_to_peer<F>(&self, peer_identifier: Uuid, sync_value: impl Into<String>, on_complete: F)
    where
        F: FnOnce(String, TetherResult<u16>) + Send + 'static,
    {
        let manager = self.clone();
        let sync_value = sync_value.into();
        tokio::spawn(async move {
            let result = manager.connect(peer_identifier).await;
            on_complete(sync_value, result);
        });
    }

    #[cfg(test)]
    fn pending_builders(&self) -> usize {
        self.inner.builders.with_value(HashMap::len)
    }
}

/// Keeps a builder routable for as long as its connect is being awaited,
/// including when the connect future is dropped early.
struct PendingBuilder<'a> {
    builders: &'a Atomic<HashMap<String, Arc<BrowserVirtualSocketBuilder>>>,
    stream_name: String,
}

impl<'a> PendingBuilder<'a> {
    fn register(
        builders: &'a Atomic<HashMap<String, Arc<BrowserVirtualSocketBuilder>>>,
        builder: &Arc<BrowserVirtualSocketBuilder>,
    ) -> Self {
        let stream_name = builder.stream_name().to_string();
        builders.modify(|map| map.insert(stream_name.clone(), Arc::clone(builder)));
        Self {
            builders,
            stream_name,
        }
    }
}

impl Drop for PendingBuilder<'_> {
    fn drop(&mut self) {
        self.builders.modify(|map| map.remove(&self.stream_name));
    }
}

impl BrowserInner {
    fn is_epoch_active(&self, epoch: u64) -> bool {
        self.listening
            .with_value(|listening| listening.as_ref().map(|l| l.epoch) == Some(epoch))
    }

    async fn connect(&self, peer_identifier: Uuid) -> TetherResult<u16> {
        if self.listening.with_value(Option::is_none) {
            return Err(TetherError::StartListeningNotActive);
        }
        let peer = self
            .registry
            .with_value(|registry| registry.connectable_peer(peer_identifier))
            .ok_or(TetherError::IllegalPeerId)?;

        let session = self.transport.session(&peer).map_err(|err| {
            warn!(target = "tether::browser", peer = %peer, error = %err, "no session to peer");
            TetherError::ConnectionFailed
        })?;

        let stream_name = Uuid::new_v4().to_string();
        let builder = BrowserVirtualSocketBuilder::new(
            session,
            stream_name.clone(),
            self.config.input_stream_receive_timeout,
        );
        let pending = PendingBuilder::register(&self.builders, &builder);
        debug!(target = "tether::browser", peer = %peer, stream = %stream_name, "building virtual socket");

        let built = builder.start_building().await;
        drop(pending);
        let socket = built?;

        let port = self.bridge.bridge(socket).await?;
        info!(target = "tether::browser", peer = %peer, stream = %stream_name, port, "peer connected");
        Ok(port)
    }

    fn handle_availability(&self, epoch: u64, peer: Peer, available: bool) {
        // The registry is only touched while this epoch still owns the
        // listening slot, so a concurrent stop cannot be undone.
        let event = self.listening.with_value(|listening| {
            if listening.as_ref().map(|l| l.epoch) != Some(epoch) {
                return None;
            }
            self.registry.modify(|registry| {
                if available {
                    registry.peer_found(peer)
                } else {
                    registry.peer_lost(peer)
                }
            })
        });
        let Some(event) = event else {
            trace!(target = "tether::browser", peer = %peer, available, "availability unchanged");
            return;
        };
        let _delivering = self.delivery.lock();
        if !self.is_epoch_active(epoch) {
            return;
        }
        debug!(target = "tether::browser", peer = %peer, available, "peer availability changed");
        metrics::record_availability(available);
        (self.availability_handler)(vec![event]);
    }

    fn handle_inbound_stream(&self, name: String, stream: InboundStream) {
        let builder = self.builders.with_value(|builders| builders.get(&name).cloned());
        let Some(builder) = builder else {
            warn!(target = "tether::browser", stream = %name, "inbound stream without pending connect dropped");
            return;
        };
        if let Err(err) = builder.complete_virtual_socket(stream) {
            warn!(target = "tether::browser", stream = %name, error = %err, "inbound stream rejected");
        }
    }
}

async fn dispatch_events(
    inner: Weak<BrowserInner>,
    mut events: SessionEvents,
    on_error: ErrorHandler,
    epoch: u64,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if !inner.is_epoch_active(epoch) {
            break;
        }
        match event {
            SessionEvent::PeerAvailabilityChanged { peer, available } => {
                inner.handle_availability(epoch, peer, available)
            }
            SessionEvent::InboundStreamOpened { name, stream, .. } => {
                inner.handle_inbound_stream(name, stream)
            }
            SessionEvent::Failed(err) => {
                warn!(target = "tether::browser", error = %err, "session failed");
                on_error(TetherError::Session(err));
            }
        }
    }
    trace!(target = "tether::browser", epoch, "dispatch finished");
}

impl Drop for BrowserInner {
    fn drop(&mut self) {
        if let Some(listening) = self.listening.modify(Option::take) {
            listening.dispatch.abort();
            self.transport.stop_browsing();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;
    use transport_session::{LoopbackNetwork, Session, SessionResult};

    fn unexpected_error(err: TetherError) {
        panic!("unexpected error: {err}");
    }

    /// Browse-only transport that keeps every browse sender alive, even
    /// across `stop_browsing`, so late deliveries still reach the manager.
    #[derive(Default)]
    struct StickyTransport {
        browse: Atomic<Vec<mpsc::UnboundedSender<SessionEvent>>>,
    }

    impl StickyTransport {
        fn announce(&self, peer: Peer) {
            self.browse.with_value(|senders| {
                for tx in senders {
                    let _ = tx.send(SessionEvent::PeerAvailabilityChanged {
                        peer,
                        available: true,
                    });
                }
            });
        }
    }

    impl Transport for StickyTransport {
        fn start_browsing(&self) -> SessionResult<SessionEvents> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.browse.modify(|senders| senders.push(tx));
            Ok(rx)
        }

        fn stop_browsing(&self) {}

        fn start_advertising(&self, _peer: &Peer) -> SessionResult<SessionEvents> {
            Err(SessionError::Transport("browse only".into()))
        }

        fn stop_advertising(&self, _peer: &Peer) {}

        fn session(&self, peer: &Peer) -> SessionResult<Arc<dyn Session>> {
            Err(SessionError::PeerUnreachable(*peer))
        }
    }

    fn browser(network: &LoopbackNetwork) -> BrowserManager {
        BrowserManager::new(
            Arc::new(network.transport()),
            &TetherConfig::default().with_input_stream_receive_timeout(Duration::from_secs(1)),
            |_| {},
        )
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let manager = browser(&LoopbackNetwork::new());
        assert!(!manager.is_listening());

        manager.start_listening(unexpected_error);
        manager.start_listening(unexpected_error);
        assert!(manager.is_listening());

        manager.stop_listening();
        manager.stop_listening();
        assert!(!manager.is_listening());

        manager.start_listening(unexpected_error);
        assert!(manager.is_listening());
        manager.stop_listening();
    }

    #[tokio::test]
    async fn connect_without_listening_is_rejected() {
        let manager = browser(&LoopbackNetwork::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.connect_to_peer(Peer::new().uuid(), "0", move |sync_value, result| {
            let _ = tx.send((sync_value, result));
        });
        let (sync_value, result) = rx.recv().await.expect("completion");
        assert_eq!(sync_value, "0");
        assert_eq!(result, Err(TetherError::StartListeningNotActive));
    }

    #[tokio::test]
    async fn connect_to_unknown_peer_is_illegal() {
        let manager = browser(&LoopbackNetwork::new());
        manager.start_listening(unexpected_error);
        assert_eq!(
            manager.connect(Peer::new().uuid()).await,
            Err(TetherError::IllegalPeerId)
        );
        manager.stop_listening();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out_and_leaves_registry_alone() {
        let network = LoopbackNetwork::new();
        let advertiser = network.transport();
        let peer = Peer::new();
        // Advertised, but nobody answers inbound streams.
        let _silent = advertiser.start_advertising(&peer).expect("advertise");

        let manager = browser(&network);
        manager.start_listening(unexpected_error);
        while manager.available_peers().is_empty() {
            tokio::task::yield_now().await;
        }

        let started = tokio::time::Instant::now();
        let result = manager.connect(peer.uuid()).await;
        assert_eq!(result, Err(TetherError::ConnectionTimedOut));
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_secs(1) + Duration::from_millis(50));
        assert_eq!(manager.pending_builders(), 0);
        assert_eq!(manager.available_peers(), vec![peer]);
        manager.stop_listening();
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_connect_releases_its_builder() {
        let network = LoopbackNetwork::new();
        let advertiser = network.transport();
        let peer = Peer::new();
        let _silent = advertiser.start_advertising(&peer).expect("advertise");

        let manager = browser(&network);
        manager.start_listening(unexpected_error);
        while manager.available_peers().is_empty() {
            tokio::task::yield_now().await;
        }

        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), manager.connect(peer.uuid())).await;
        assert!(abandoned.is_err());
        assert_eq!(manager.pending_builders(), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(manager.pending_builders(), 0);
        manager.stop_listening();
    }

    #[tokio::test]
    async fn availability_events_are_deduplicated() {
        let network = LoopbackNetwork::new();
        let advertiser = network.transport();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = BrowserManager::new(
            Arc::new(network.transport()),
            &TetherConfig::default(),
            move |events| {
                let _ = tx.send(events);
            },
        );
        manager.start_listening(unexpected_error);

        let peer = Peer::new();
        let _adv = advertiser.start_advertising(&peer).expect("advertise");
        let _again = advertiser.start_advertising(&peer).expect("re-advertise");
        advertiser.stop_advertising(&peer);

        let found = rx.recv().await.expect("found");
        assert_eq!(found.len(), 1);
        assert!(found[0].available);
        let lost = rx.recv().await.expect("lost");
        assert!(!lost[0].available);
        manager.stop_listening();
    }

    #[tokio::test]
    async fn events_from_a_stopped_epoch_are_ignored() {
        let transport = Arc::new(StickyTransport::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = BrowserManager::new(transport.clone(), &TetherConfig::default(), move |events| {
            let _ = tx.send(events);
        });

        manager.start_listening(unexpected_error);
        let first = Peer::new();
        transport.announce(first);
        assert_eq!(rx.recv().await.expect("first")[0].peer_identifier, first.uuid());

        manager.stop_listening();
        // Only the stopped epoch's sender exists, and it is still open.
        transport.announce(Peer::new());
        manager.start_listening(unexpected_error);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
        assert!(manager.available_peers().is_empty());

        let second = Peer::new();
        transport.announce(second);
        let events = rx.recv().await.expect("second");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].peer_identifier, second.uuid());
        assert_eq!(manager.available_peers(), vec![second]);
        manager.stop_listening();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_waits_for_a_delivery_in_progress() {
        let transport = Arc::new(StickyTransport::default());
        let (started_tx, mut started) = mpsc::unbounded_channel();
        let finished = Arc::new(AtomicBool::new(false));
        let manager = {
            let finished = Arc::clone(&finished);
            BrowserManager::new(transport.clone(), &TetherConfig::default(), move |_| {
                let _ = started_tx.send(());
                std::thread::sleep(Duration::from_millis(200));
                finished.store(true, Ordering::SeqCst);
            })
        };

        manager.start_listening(unexpected_error);
        transport.announce(Peer::new());
        started.recv().await.expect("delivery started");

        manager.stop_listening();
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn session_failures_reach_error_handler() {
        let network = LoopbackNetwork::new();
        let manager = browser(&network);
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.start_listening(move |err| {
            let _ = tx.send(err);
        });
        network.inject_failure(SessionError::Transport("radio off".into()));
        assert_eq!(
            rx.recv().await,
            Some(TetherError::Session(SessionError::Transport("radio off".into())))
        );
        manager.stop_listening();
    }
}
