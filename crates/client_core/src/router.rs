//! Type-keyed dispatch of inbound envelopes to business handlers.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use parking_lot::RwLock;
use shared::{Envelope, EnvelopeError};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::error::RouterError;

pub const UNKNOWN_TYPE_KEY: &str = "unknown";

pub type Handler = Arc<dyn Fn(&Envelope) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    Dispatched { type_key: String },
    DispatchError { type_key: String, reason: String },
}

pub struct MessageRouter {
    handlers: RwLock<HashMap<String, Handler>>,
    events: broadcast::Sender<RouterEvent>,
}

impl Default for MessageRouter {
    fn default() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            handlers: RwLock::new(HashMap::new()),
            events,
        }
    }
}

impl MessageRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `handler` for `type_key`, silently replacing any previous one.
    pub fn register_handler<F>(
        &self,
        type_key: impl Into<String>,
        handler: F,
    ) -> Result<(), RouterError>
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let type_key = type_key.into();
        if type_key.is_empty() {
            warn!("Cannot register handler for an empty message type");
            return Err(RouterError::EmptyTypeKey);
        }
        debug!(%type_key, "Handler registered");
        self.handlers.write().insert(type_key, Arc::new(handler));
        Ok(())
    }

    /// Returns whether a handler was removed.
    pub fn unregister_handler(&self, type_key: &str) -> bool {
        let removed = self.handlers.write().remove(type_key).is_some();
        if removed {
            debug!(%type_key, "Handler unregistered");
        }
        removed
    }

    /// Routes `envelope` to the handler for its type key and returns that key.
    ///
    /// The handler runs synchronously on the caller's task, outside the registry
    /// lock, so it may register, unregister or dispatch again.
    pub fn dispatch(&self, envelope: &Envelope) -> Result<String, RouterError> {
        let type_key = match envelope.type_key() {
            Ok(type_key) => type_key,
            Err(err) => {
                let reason = match err {
                    EnvelopeError::MissingType => {
                        warn!("Message does not contain 'type' or 'module'/'action' fields");
                        err.to_string()
                    }
                    other => {
                        warn!(err = %other, "Dispatch error");
                        other.to_string()
                    }
                };
                self.emit(RouterEvent::DispatchError {
                    type_key: UNKNOWN_TYPE_KEY.to_string(),
                    reason: reason.clone(),
                });
                return Err(RouterError::MissingType(reason));
            }
        };

        let handler = self.handlers.read().get(&type_key).cloned();
        let Some(handler) = handler else {
            warn!(%type_key, "No handler registered for message type");
            self.emit(RouterEvent::DispatchError {
                type_key: type_key.clone(),
                reason: "No handler registered".to_string(),
            });
            return Err(RouterError::NoHandler(type_key));
        };

        handler(envelope);
        debug!(%type_key, "Message dispatched to handler");
        self.emit(RouterEvent::Dispatched {
            type_key: type_key.clone(),
        });
        Ok(type_key)
    }

    pub fn registered_types(&self) -> BTreeSet<String> {
        self.handlers.read().keys().cloned().collect()
    }

    pub fn is_registered(&self, type_key: &str) -> bool {
        self.handlers.read().contains_key(type_key)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.events.subscribe()
    }

    /// Dispatches every envelope from `inbound` in arrival order until the sending
    /// side goes away.
    pub fn spawn_feed(
        self: &Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<Envelope>,
    ) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(envelope) = inbound.recv().await {
                // Failures are already reported as router events.
                let _ = router.dispatch(&envelope);
            }
            debug!("router feed closed");
        })
    }

    fn emit(&self, event: RouterEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;
