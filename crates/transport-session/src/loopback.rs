use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::{
    InboundStream, OutboundStream, Peer, Session, SessionError, SessionEvent, SessionEvents,
    SessionResult, Transport,
};

const PIPE_CAPACITY: usize = 64 * 1024;

type EndpointId = u64;
type EventSender = mpsc::UnboundedSender<SessionEvent>;

/// Where events for one side of a loopback session are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Browser(EndpointId),
    Advertiser(Peer),
}

#[derive(Default)]
struct NetworkState {
    browsers: HashMap<EndpointId, EventSender>,
    advertisers: HashMap<Peer, (EndpointId, EventSender)>,
}

impl NetworkState {
    fn sender_for(&self, route: Route) -> Option<EventSender> {
        match route {
            Route::Browser(endpoint) => self.browsers.get(&endpoint).cloned(),
            Route::Advertiser(peer) => self.advertisers.get(&peer).map(|(_, tx)| tx.clone()),
        }
    }

    fn notify_browsers(&mut self, origin: EndpointId, peer: Peer, available: bool) {
        self.browsers.retain(|endpoint, tx| {
            if *endpoint == origin {
                return true;
            }
            tx.send(SessionEvent::PeerAvailabilityChanged { peer, available })
                .is_ok()
        });
    }
}

/// In-process network connecting any number of [`LoopbackTransport`] endpoints.
///
/// Streams are tokio duplex pipes used in one direction only, which matches the
/// open-outbound / receive-inbound shape of a real peer-to-peer session.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
    next_endpoint: Arc<AtomicU64>,
    next_session: Arc<AtomicU64>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport {
            network: self.clone(),
            endpoint: self.next_endpoint.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Reports `error` to every browsing endpoint.
    pub fn inject_failure(&self, error: SessionError) {
        let state = self.state.lock();
        for tx in state.browsers.values() {
            let _ = tx.send(SessionEvent::Failed(error.clone()));
        }
    }

    fn session(&self, local: Route, remote: Route) -> LoopbackSession {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        LoopbackSession {
            id: format!("loopback-{id}"),
            network: self.clone(),
            local,
            remote,
        }
    }
}

/// One endpoint on a [`LoopbackNetwork`]; may browse and advertise at once.
#[derive(Clone)]
pub struct LoopbackTransport {
    network: LoopbackNetwork,
    endpoint: EndpointId,
}

impl Transport for LoopbackTransport {
    fn start_browsing(&self) -> SessionResult<SessionEvents> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.network.state.lock();
        let mut visible: Vec<Peer> = state
            .advertisers
            .iter()
            .filter(|(_, (endpoint, _))| *endpoint != self.endpoint)
            .map(|(peer, _)| *peer)
            .collect();
        visible.sort();
        for peer in visible {
            let _ = tx.send(SessionEvent::PeerAvailabilityChanged {
                peer,
                available: true,
            });
        }
        state.browsers.insert(self.endpoint, tx);
        debug!(target = "loopback", endpoint = self.endpoint, "browsing started");
        Ok(rx)
    }

    fn stop_browsing(&self) {
        if self.network.state.lock().browsers.remove(&self.endpoint).is_some() {
            debug!(target = "loopback", endpoint = self.endpoint, "browsing stopped");
        }
    }

    fn start_advertising(&self, peer: &Peer) -> SessionResult<SessionEvents> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.network.state.lock();
        state.advertisers.insert(*peer, (self.endpoint, tx));
        state.notify_browsers(self.endpoint, *peer, true);
        debug!(target = "loopback", endpoint = self.endpoint, peer = %peer, "advertising started");
        Ok(rx)
    }

    fn stop_advertising(&self, peer: &Peer) {
        let mut state = self.network.state.lock();
        if state.advertisers.remove(peer).is_some() {
            state.notify_browsers(self.endpoint, *peer, false);
            debug!(target = "loopback", endpoint = self.endpoint, peer = %peer, "advertising stopped");
        }
    }

    fn session(&self, peer: &Peer) -> SessionResult<Arc<dyn Session>> {
        if !self.network.state.lock().advertisers.contains_key(peer) {
            return Err(SessionError::PeerUnreachable(*peer));
        }
        Ok(Arc::new(self.network.session(
            Route::Browser(self.endpoint),
            Route::Advertiser(*peer),
        )))
    }
}

struct LoopbackSession {
    id: String,
    network: LoopbackNetwork,
    local: Route,
    remote: Route,
}

impl Session for LoopbackSession {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn open_outbound_stream(&self, name: &str) -> SessionResult<OutboundStream> {
        let sender = self
            .network
            .state
            .lock()
            .sender_for(self.remote)
            .ok_or(SessionError::Closed)?;
        let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        let reply = self.network.session(self.remote, self.local);
        sender
            .send(SessionEvent::InboundStreamOpened {
                session: Arc::new(reply),
                name: name.to_string(),
                stream: InboundStream::new(name, reader),
            })
            .map_err(|_| SessionError::Closed)?;
        trace!(target = "loopback", session = %self.id, stream = %name, "outbound stream opened");
        Ok(OutboundStream::new(name, writer))
    }
}
