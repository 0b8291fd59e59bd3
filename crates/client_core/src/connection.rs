//! The single logical connection to the chat server.
//!
//! [`Connection`] owns at most one transport link at a time, exposes its state
//! through a watch channel and fans inbound traffic out to any number of
//! subscribers as [`ConnectionEvent`]s. When auto-reconnect is enabled, an
//! unintended drop arms a one-shot timer that reconnects to the last address.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use futures::StreamExt;
use parking_lot::Mutex;
use shared::Envelope;
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::ConnectionError,
    transport::{Frame, TransportConnector, TransportLink},
};

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(5000);
const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Disconnected with a reconnect timer armed.
    Reconnecting,
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Error(String),
    MessageReceived(Envelope),
    RawDataReceived(Vec<u8>),
    /// A text frame that is not a JSON object. The bytes follow as `RawDataReceived`.
    DecodeFailed(String),
    /// `true` on entering `Connected`, `false` on leaving it.
    StateChanged(bool),
}

/// What the services and the liveness monitor need from a connection.
pub trait MessageLink: Send + Sync {
    fn is_connected(&self) -> bool;
    fn send(&self, envelope: &Envelope) -> Result<(), ConnectionError>;
    fn send_raw(&self, bytes: Vec<u8>) -> Result<(), ConnectionError>;
    /// Queues a metadata envelope and the binary frame it describes back to back.
    fn send_with_payload(&self, envelope: &Envelope, bytes: Vec<u8>)
        -> Result<(), ConnectionError>;
    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent>;
}

struct ConnectionInner {
    last_address: Option<String>,
    auto_reconnect: bool,
    reconnect_interval: Duration,
    /// Bumped by every `connect`/`disconnect`; link tasks from older generations
    /// are ignored.
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    link_task: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
}

pub struct Connection {
    connector: Arc<dyn TransportConnector>,
    events: broadcast::Sender<ConnectionEvent>,
    state: watch::Sender<ConnectionState>,
    inner: Mutex<ConnectionInner>,
    /// Unbounded per-consumer copies of decoded inbound envelopes.
    inbound_taps: Mutex<Vec<mpsc::UnboundedSender<Envelope>>>,
}

impl Connection {
    pub fn new(connector: Arc<dyn TransportConnector>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            connector,
            events,
            state,
            inner: Mutex::new(ConnectionInner {
                last_address: None,
                auto_reconnect: false,
                reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
                generation: 0,
                outbound: None,
                link_task: None,
                reconnect_timer: None,
            }),
            inbound_taps: Mutex::new(Vec::new()),
        })
    }

    /// Opens a new transport to `address`, closing any existing one first.
    ///
    /// Returns immediately; the outcome arrives as `Connected` or `Error` events.
    pub fn connect(self: &Arc<Self>, address: impl Into<String>) {
        let address = address.into();
        let mut inner = self.inner.lock();
        Self::cancel_reconnect(&mut inner);
        self.close_link(&mut inner);

        inner.generation += 1;
        inner.last_address = Some(address.clone());
        self.transition(ConnectionState::Connecting);
        info!(%address, "connecting to chat server");

        let generation = inner.generation;
        inner.link_task = Some(tokio::spawn(
            Arc::clone(self).run_link(generation, address),
        ));
    }

    /// Reconnects to the last address used by [`Connection::connect`].
    pub fn reconnect(self: &Arc<Self>) -> bool {
        let Some(address) = self.last_address() else {
            warn!("reconnect requested before any connect");
            return false;
        };
        self.connect(address);
        true
    }

    /// Closes the transport and cancels any pending reconnect. Idempotent.
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock();
        let previous = self.state();
        Self::cancel_reconnect(&mut inner);
        inner.generation += 1;
        self.close_link(&mut inner);
        self.transition(ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            info!(?previous, "disconnected from chat server");
        }
    }

    pub fn send(&self, envelope: &Envelope) -> Result<(), ConnectionError> {
        let inner = self.inner.lock();
        let outbound = self.writable(&inner)?;
        let text = self.encode(envelope)?;
        outbound
            .send(Frame::Text(text))
            .map_err(|_| ConnectionError::LinkClosed)
    }

    pub fn send_raw(&self, bytes: impl Into<Vec<u8>>) -> Result<(), ConnectionError> {
        let inner = self.inner.lock();
        let outbound = self.writable(&inner)?;
        outbound
            .send(Frame::Binary(bytes.into()))
            .map_err(|_| ConnectionError::LinkClosed)
    }

    /// Sends a metadata envelope immediately followed by one binary frame.
    ///
    /// Both frames are queued under the same lock, so no other send can land
    /// between them.
    pub fn send_with_payload(
        &self,
        envelope: &Envelope,
        bytes: impl Into<Vec<u8>>,
    ) -> Result<(), ConnectionError> {
        let inner = self.inner.lock();
        let outbound = self.writable(&inner)?;
        let text = self.encode(envelope)?;
        outbound
            .send(Frame::Text(text))
            .and_then(|()| outbound.send(Frame::Binary(bytes.into())))
            .map_err(|_| ConnectionError::LinkClosed)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Every decoded inbound envelope, in arrival order, without the lag limit
    /// of [`Connection::subscribe`]. Dropping the receiver detaches it.
    pub fn inbound(&self) -> mpsc::UnboundedReceiver<Envelope> {
        let (tap, receiver) = mpsc::unbounded_channel();
        self.inbound_taps.lock().push(tap);
        receiver
    }

    pub fn last_address(&self) -> Option<String> {
        self.inner.lock().last_address.clone()
    }

    /// Configuration only; takes effect on the next unintended disconnect.
    pub fn set_auto_reconnect(&self, enabled: bool, interval: Duration) {
        let mut inner = self.inner.lock();
        inner.auto_reconnect = enabled;
        inner.reconnect_interval = interval;
        debug!(enabled, interval_ms = interval.as_millis() as u64, "auto-reconnect configured");
    }

    pub fn auto_reconnect(&self) -> (bool, Duration) {
        let inner = self.inner.lock();
        (inner.auto_reconnect, inner.reconnect_interval)
    }

    fn writable<'a>(
        &self,
        inner: &'a ConnectionInner,
    ) -> Result<&'a mpsc::UnboundedSender<Frame>, ConnectionError> {
        match &inner.outbound {
            Some(outbound) if self.is_connected() => Ok(outbound),
            _ => {
                warn!("WebSocket not connected, dropping outbound frame");
                Err(ConnectionError::NotConnected)
            }
        }
    }

    fn encode(&self, envelope: &Envelope) -> Result<String, ConnectionError> {
        envelope.encode().map_err(|err| {
            error!(%err, "failed to encode outbound envelope");
            self.emit(ConnectionEvent::Error(err.to_string()));
            ConnectionError::from(err)
        })
    }

    async fn run_link(self: Arc<Self>, generation: u64, address: String) {
        let TransportLink {
            outbound,
            mut inbound,
        } = match self.connector.open(&address).await {
            Ok(link) => link,
            Err(err) => {
                error!(%address, %err, "WebSocket error");
                self.link_down(generation, Some(err.to_string()));
                return;
            }
        };

        {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return;
            }
            inner.outbound = Some(outbound);
            Self::cancel_reconnect(&mut inner);
            self.transition(ConnectionState::Connected);
            self.emit(ConnectionEvent::Connected);
            self.emit(ConnectionEvent::StateChanged(true));
        }
        info!(%address, "WebSocket connected");

        let mut failure = None;
        while let Some(frame) = inbound.next().await {
            match frame {
                Ok(Frame::Text(text)) => self.handle_text(text),
                Ok(Frame::Binary(bytes)) => self.emit(ConnectionEvent::RawDataReceived(bytes)),
                Err(err) => {
                    error!(%address, %err, "WebSocket error");
                    failure = Some(err.to_string());
                    break;
                }
            }
        }
        self.link_down(generation, failure);
    }

    fn handle_text(&self, text: String) {
        match Envelope::decode(&text) {
            Ok(envelope) => {
                self.inbound_taps
                    .lock()
                    .retain(|tap| tap.send(envelope.clone()).is_ok());
                self.emit(ConnectionEvent::MessageReceived(envelope));
            }
            Err(err) => {
                warn!(%err, "failed to decode inbound frame, forwarding raw bytes");
                self.emit(ConnectionEvent::DecodeFailed(err.to_string()));
                self.emit(ConnectionEvent::RawDataReceived(text.into_bytes()));
            }
        }
    }

    /// The link of `generation` has ended without an explicit disconnect.
    fn link_down(self: &Arc<Self>, generation: u64, failure: Option<String>) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        if let Some(message) = failure {
            self.emit(ConnectionEvent::Error(message));
        }
        inner.outbound = None;
        // This is the handle of the task running us; dropping it detaches.
        inner.link_task = None;

        let previous = self.transition(ConnectionState::Disconnected);
        if previous == ConnectionState::Connected {
            info!("WebSocket disconnected");
            self.emit(ConnectionEvent::Disconnected);
            self.emit(ConnectionEvent::StateChanged(false));
        }
        if inner.auto_reconnect {
            self.arm_reconnect(&mut inner);
        }
    }

    fn arm_reconnect(self: &Arc<Self>, inner: &mut ConnectionInner) {
        if inner.reconnect_timer.is_some() || inner.last_address.is_none() {
            return;
        }
        let interval = inner.reconnect_interval;
        let generation = inner.generation;
        let connection: Weak<Self> = Arc::downgrade(self);
        debug!(interval_ms = interval.as_millis() as u64, "starting auto-reconnect timer");
        inner.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(connection) = connection.upgrade() {
                connection.reconnect_fired(generation);
            }
        }));
        self.transition(ConnectionState::Reconnecting);
    }

    fn reconnect_fired(self: &Arc<Self>, generation: u64) {
        let address = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return;
            }
            // Our own handle: clear it so `connect` does not abort the running timer.
            inner.reconnect_timer = None;
            inner.last_address.clone()
        };
        if let Some(address) = address {
            info!(%address, "auto-reconnecting");
            self.connect(address);
        }
    }

    fn cancel_reconnect(inner: &mut ConnectionInner) {
        if let Some(timer) = inner.reconnect_timer.take() {
            timer.abort();
            debug!("auto-reconnect timer cancelled");
        }
    }

    /// Tears down the current link. Emits the disconnect events when it was up.
    fn close_link(&self, inner: &mut ConnectionInner) {
        if let Some(task) = inner.link_task.take() {
            task.abort();
        }
        inner.outbound = None;
        if self.is_connected() {
            self.transition(ConnectionState::Disconnected);
            self.emit(ConnectionEvent::Disconnected);
            self.emit(ConnectionEvent::StateChanged(false));
        }
    }

    fn transition(&self, next: ConnectionState) -> ConnectionState {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(?previous, ?next, "connection state changed");
        }
        previous
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl MessageLink for Connection {
    fn is_connected(&self) -> bool {
        Connection::is_connected(self)
    }

    fn send(&self, envelope: &Envelope) -> Result<(), ConnectionError> {
        Connection::send(self, envelope)
    }

    fn send_raw(&self, bytes: Vec<u8>) -> Result<(), ConnectionError> {
        Connection::send_raw(self, bytes)
    }

    fn send_with_payload(
        &self,
        envelope: &Envelope,
        bytes: Vec<u8>,
    ) -> Result<(), ConnectionError> {
        Connection::send_with_payload(self, envelope, bytes)
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        Connection::subscribe(self)
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
