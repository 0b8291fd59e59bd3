//! In-memory doubles for the transport and the connection.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use shared::Envelope;
use tokio::sync::{broadcast, mpsc};

use crate::{
    connection::{ConnectionEvent, MessageLink},
    error::{ConnectionError, TransportError},
    transport::{Frame, TransportConnector, TransportLink},
};

/// The server end of one link opened through [`MockConnector`].
pub(crate) struct Peer {
    pub address: String,
    pub from_client: mpsc::UnboundedReceiver<Frame>,
    /// Dropping this ends the client's inbound stream.
    pub to_client: mpsc::UnboundedSender<Result<Frame, TransportError>>,
}

impl Peer {
    pub fn push_text(&self, text: &str) {
        let _ = self.to_client.send(Ok(Frame::Text(text.to_string())));
    }

    pub fn push_envelope(&self, envelope: &Envelope) {
        self.push_text(&envelope.encode().expect("encode"));
    }

    pub async fn next_frame(&mut self) -> Frame {
        self.from_client.recv().await.expect("client link closed")
    }
}

pub(crate) struct MockConnector {
    peers: mpsc::UnboundedSender<Peer>,
    refuse: AtomicBool,
    attempts: Mutex<Vec<String>>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Peer>) {
        let (peers, accepted) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            peers,
            refuse: AtomicBool::new(false),
            attempts: Mutex::new(Vec::new()),
        });
        (connector, accepted)
    }

    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn open(&self, address: &str) -> Result<TransportLink, TransportError> {
        self.attempts.lock().push(address.to_string());
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect {
                address: address.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, mut inbound_rx) = mpsc::unbounded_channel();
        let _ = self.peers.send(Peer {
            address: address.to_string(),
            from_client,
            to_client,
        });
        let inbound = futures::stream::poll_fn(move |cx| inbound_rx.poll_recv(cx)).boxed();
        Ok(TransportLink { outbound, inbound })
    }
}

/// A [`MessageLink`] whose connected flag is set by the test and that records
/// every frame sent through it.
pub(crate) struct FakeLink {
    connected: AtomicBool,
    fail_sends: AtomicBool,
    sent: Mutex<Vec<Frame>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl FakeLink {
    pub fn new(connected: bool) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            connected: AtomicBool::new(connected),
            fail_sends: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            events,
        })
    }

    /// Flips the flag without emitting anything, like a silently dead socket.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    pub fn sent_frames(&self) -> Vec<Frame> {
        self.sent.lock().clone()
    }

    pub fn sent_envelopes(&self) -> Vec<Envelope> {
        self.sent
            .lock()
            .iter()
            .filter_map(|frame| match frame {
                Frame::Text(text) => Envelope::decode(text).ok(),
                Frame::Binary(_) => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    fn check(&self) -> Result<(), ConnectionError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotConnected);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ConnectionError::LinkClosed);
        }
        Ok(())
    }
}

impl MessageLink for FakeLink {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, envelope: &Envelope) -> Result<(), ConnectionError> {
        self.check()?;
        self.sent.lock().push(Frame::Text(envelope.encode()?));
        Ok(())
    }

    fn send_raw(&self, bytes: Vec<u8>) -> Result<(), ConnectionError> {
        self.check()?;
        self.sent.lock().push(Frame::Binary(bytes));
        Ok(())
    }

    fn send_with_payload(
        &self,
        envelope: &Envelope,
        bytes: Vec<u8>,
    ) -> Result<(), ConnectionError> {
        self.check()?;
        let text = envelope.encode()?;
        let mut sent = self.sent.lock();
        sent.push(Frame::Text(text));
        sent.push(Frame::Binary(bytes));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}

/// Receives until `pick` matches, skipping everything else.
pub(crate) async fn next_matching<T, R>(
    events: &mut broadcast::Receiver<T>,
    mut pick: impl FnMut(&T) -> Option<R>,
) -> R
where
    T: Clone,
{
    loop {
        let event = events.recv().await.expect("event channel closed");
        if let Some(found) = pick(&event) {
            return found;
        }
    }
}
