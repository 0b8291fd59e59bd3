//! Wires the connection, router and liveness monitor together.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::{
    sync::broadcast::{error::RecvError, Receiver},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, ConnectionEvent, MessageLink},
    heartbeat::{HeartbeatEvent, LivenessMonitor},
    router::MessageRouter,
    settings::ClientSettings,
    transport::TransportConnector,
};

pub struct Backbone {
    settings: ClientSettings,
    connection: Arc<Connection>,
    router: Arc<MessageRouter>,
    monitor: Arc<LivenessMonitor>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Backbone {
    pub fn new(settings: ClientSettings, connector: Arc<dyn TransportConnector>) -> Arc<Self> {
        let connection = Connection::new(connector);
        connection.set_auto_reconnect(settings.auto_reconnect, settings.reconnect_interval());
        let link: Arc<dyn MessageLink> = connection.clone();
        let monitor = LivenessMonitor::with_max_missed(link, settings.heartbeat_max_missed);
        Arc::new(Self {
            settings,
            connection,
            router: MessageRouter::new(),
            monitor,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Starts the router feed and the supervisor. Call once, before `connect`.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            debug!("backbone already started");
            return;
        }
        tasks.push(self.router.spawn_feed(self.connection.inbound()));
        tasks.push(tokio::spawn(supervise(
            Arc::clone(&self.connection),
            Arc::clone(&self.monitor),
            self.connection.subscribe(),
            self.monitor.subscribe(),
            self.settings.clone(),
        )));
    }

    /// Connects to the configured server URL.
    pub fn connect(&self) {
        self.connection.connect(self.settings.server_url.clone());
    }

    pub fn connect_to(&self, address: impl Into<String>) {
        self.connection.connect(address);
    }

    /// Stops probing, closes the link and stops the background tasks.
    pub fn shutdown(&self) {
        self.monitor.stop();
        self.connection.disconnect();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("backbone shut down");
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// The connection as the narrow handle the services take.
    pub fn link(&self) -> Arc<dyn MessageLink> {
        self.connection.clone()
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn monitor(&self) -> &Arc<LivenessMonitor> {
        &self.monitor
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }
}

impl Drop for Backbone {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn supervise(
    connection: Arc<Connection>,
    monitor: Arc<LivenessMonitor>,
    mut connection_events: Receiver<ConnectionEvent>,
    mut heartbeat_events: Receiver<HeartbeatEvent>,
    settings: ClientSettings,
) {
    loop {
        tokio::select! {
            event = connection_events.recv() => match event {
                Ok(ConnectionEvent::Connected) => {
                    monitor.start(settings.heartbeat_interval());
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "backbone lagged behind connection events");
                }
                Err(RecvError::Closed) => break,
            },
            event = heartbeat_events.recv() => match event {
                Ok(HeartbeatEvent::Timeout { missed }) => {
                    if settings.reconnect_on_heartbeat_timeout {
                        warn!(missed, "heartbeat timed out, forcing reconnect");
                        connection.reconnect();
                    } else {
                        warn!(missed, "heartbeat timed out");
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }
}

#[cfg(test)]
#[path = "tests/backbone_tests.rs"]
mod tests;
