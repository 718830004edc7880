//! Handshake builders that turn named one-way streams into a [`VirtualSocket`].
//!
//! The browser (active) side opens an outbound stream under a fresh name and
//! waits, bounded by a timeout, for the peer to open a stream back under the
//! same name. The advertiser (passive) side reacts to that inbound stream by
//! opening the matching outbound stream immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use transport_session::{InboundStream, OutboundStream, Session};

use crate::atomic::Atomic;
use crate::error::{TetherError, TetherResult};
use crate::socket::VirtualSocket;

/// Single-fire result slot.
///
/// The first caller to flip `fired` owns the sender; every later caller gets
/// its value handed back untouched.
pub(crate) struct Completion<T> {
    fired: AtomicBool,
    sender: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> Completion<T> {
    pub(crate) fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
            sender: Mutex::new(None),
        }
    }

    pub(crate) fn arm(&self) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        *self.sender.lock() = Some(tx);
        rx
    }

    pub(crate) fn fire(&self, value: T) -> Result<(), T> {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(value);
        }
        match self.sender.lock().take() {
            Some(tx) => tx.send(value),
            None => Err(value),
        }
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// Active-side builder: opens the outbound stream, then waits for the echo.
pub struct BrowserVirtualSocketBuilder {
    session: Arc<dyn Session>,
    stream_name: String,
    stream_received_back_timeout: Duration,
    stream_received_back: Atomic<bool>,
    outbound: Atomic<Option<OutboundStream>>,
    timer: Atomic<Option<JoinHandle<()>>>,
    completion: Completion<TetherResult<VirtualSocket>>,
}

impl BrowserVirtualSocketBuilder {
    pub fn new(
        session: Arc<dyn Session>,
        stream_name: impl Into<String>,
        stream_received_back_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            stream_name: stream_name.into(),
            stream_received_back_timeout,
            stream_received_back: Atomic::new(false),
            outbound: Atomic::new(None),
            timer: Atomic::new(None),
            completion: Completion::new(),
        })
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn is_completed(&self) -> bool {
        self.completion.is_fired()
    }

    /// Opens the outbound stream and resolves once the handshake terminates.
    ///
    /// Exactly one of success, [`TetherError::ConnectionFailed`] or
    /// [`TetherError::ConnectionTimedOut`] is produced.
    pub async fn start_building(self: &Arc<Self>) -> TetherResult<VirtualSocket> {
        let receiver = self.completion.arm();

        // Held across the open so an early echo cannot observe an empty slot.
        let opened = self.outbound.modify(|slot| {
            self.session
                .open_outbound_stream(&self.stream_name)
                .map(|stream| *slot = Some(stream))
        });

        match opened {
            Ok(()) => self.arm_timer(),
            Err(err) => {
                warn!(
                    target = "tether::builder",
                    stream = %self.stream_name,
                    session = %self.session.id(),
                    error = %err,
                    "failed to open outbound stream"
                );
                let _ = self.completion.fire(Err(TetherError::ConnectionFailed));
            }
        }

        receiver
            .await
            .unwrap_or(Err(TetherError::ConnectionFailed))
    }

    fn arm_timer(self: &Arc<Self>) {
        let builder: Weak<Self> = Arc::downgrade(self);
        let timeout = self.stream_received_back_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(builder) = builder.upgrade() {
                builder.expire();
            }
        });
        self.timer.modify(|timer| *timer = Some(handle));
    }

    fn expire(&self) {
        if self.stream_received_back.get() {
            return;
        }
        if self
            .completion
            .fire(Err(TetherError::ConnectionTimedOut))
            .is_ok()
        {
            info!(
                target = "tether::builder",
                stream = %self.stream_name,
                timeout_ms = self.stream_received_back_timeout.as_millis() as u64,
                "inbound stream was not received back in time"
            );
        }
    }

    /// Pairs the peer's inbound stream with the stored outbound stream.
    ///
    /// Returns an error when the stream could not be delivered: a duplicate
    /// delivery of the same name, or an arrival after the timeout fired.
    pub fn complete_virtual_socket(&self, inbound: InboundStream) -> TetherResult<()> {
        let already_received = self
            .stream_received_back
            .modify(|received| std::mem::replace(received, true));
        if already_received {
            warn!(
                target = "tether::builder",
                stream = %self.stream_name,
                "duplicate inbound stream dropped"
            );
            return Err(TetherError::ConnectionFailed);
        }

        if let Some(timer) = self.timer.modify(Option::take) {
            timer.abort();
        }

        let Some(outbound) = self.outbound.modify(Option::take) else {
            let _ = self.completion.fire(Err(TetherError::ConnectionFailed));
            return Err(TetherError::ConnectionFailed);
        };

        let socket = VirtualSocket::new(inbound, outbound);
        match self.completion.fire(Ok(socket)) {
            Ok(()) => {
                debug!(target = "tether::builder", stream = %self.stream_name, "virtual socket built");
                Ok(())
            }
            Err(_late) => {
                debug!(
                    target = "tether::builder",
                    stream = %self.stream_name,
                    "inbound stream arrived after the handshake resolved"
                );
                Err(TetherError::ConnectionTimedOut)
            }
        }
    }
}

impl Drop for BrowserVirtualSocketBuilder {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.modify(Option::take) {
            timer.abort();
        }
    }
}

/// Passive-side builder: the peer's inbound stream is already here, so only
/// the matching outbound open can fail.
pub struct AdvertiserVirtualSocketBuilder {
    session: Arc<dyn Session>,
}

impl AdvertiserVirtualSocketBuilder {
    pub fn new(session: Arc<dyn Session>) -> Self {
        Self { session }
    }

    pub fn create_virtual_socket(
        &self,
        inbound: InboundStream,
        inbound_stream_name: &str,
    ) -> TetherResult<VirtualSocket> {
        let outbound = self.session.open_outbound_stream(inbound_stream_name)?;
        Ok(VirtualSocket::new(inbound, outbound))
    }
}
