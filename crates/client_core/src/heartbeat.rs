//! Application-level liveness probing.
//!
//! A half-open TCP path can look healthy to the OS for minutes. The monitor sends
//! a probe envelope every interval and raises [`HeartbeatEvent::Timeout`] after
//! `max_missed` consecutive ticks on which the probe could not be sent.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use chrono::Utc;
use parking_lot::Mutex;
use shared::{protocol::type_keys, Envelope};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectionEvent, MessageLink};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(30_000);
pub const DEFAULT_MAX_MISSED: u32 = 3;
const TIMESTAMP_FIELD: &str = "timestamp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatEvent {
    Sent { timestamp_ms: i64 },
    Timeout { missed: u32 },
    /// The peer answered with an envelope carrying the probe's type key.
    Acked { echoed_timestamp_ms: Option<i64> },
}

struct MonitorInner {
    timer: Option<JoinHandle<()>>,
    run_id: u64,
    missed_count: u32,
    interval: Duration,
    probe: Envelope,
}

pub struct LivenessMonitor {
    link: Arc<dyn MessageLink>,
    max_missed: u32,
    events: broadcast::Sender<HeartbeatEvent>,
    inner: Mutex<MonitorInner>,
}

pub fn default_probe() -> Envelope {
    Envelope::typed(type_keys::HEARTBEAT).with(TIMESTAMP_FIELD, 0)
}

impl LivenessMonitor {
    pub fn new(link: Arc<dyn MessageLink>) -> Arc<Self> {
        Self::with_max_missed(link, DEFAULT_MAX_MISSED)
    }

    pub fn with_max_missed(link: Arc<dyn MessageLink>, max_missed: u32) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            link,
            max_missed: max_missed.max(1),
            events,
            inner: Mutex::new(MonitorInner {
                timer: None,
                run_id: 0,
                missed_count: 0,
                interval: DEFAULT_HEARTBEAT_INTERVAL,
                probe: default_probe(),
            }),
        })
    }

    /// Arms the repeating probe timer. The first probe goes out after one interval.
    ///
    /// Returns `false` without side effects when already running, when the link
    /// is not connected, or when `interval` is zero.
    pub fn start(self: &Arc<Self>, interval: Duration) -> bool {
        if interval.is_zero() {
            warn!("heartbeat interval must be non-zero, heartbeat not started");
            return false;
        }
        let mut inner = self.inner.lock();
        if inner.timer.is_some() {
            warn!("Heartbeat already running");
            return false;
        }
        if !self.link.is_connected() {
            warn!("WebSocket client is not connected, heartbeat not started");
            return false;
        }

        inner.interval = interval;
        inner.missed_count = 0;
        inner.run_id += 1;
        let run_id = inner.run_id;
        let events = self.link.subscribe();
        inner.timer = Some(tokio::spawn(Self::run(
            Arc::downgrade(self),
            run_id,
            interval,
            events,
        )));
        info!(interval_ms = interval.as_millis() as u64, "starting heartbeat");
        true
    }

    /// Disarms the timer. Safe to call when not running.
    pub fn stop(&self) {
        if let Some(timer) = self.inner.lock().timer.take() {
            timer.abort();
            info!("Heartbeat stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().timer.is_some()
    }

    pub fn missed_count(&self) -> u32 {
        self.inner.lock().missed_count
    }

    pub fn interval(&self) -> Duration {
        self.inner.lock().interval
    }

    pub fn max_missed(&self) -> u32 {
        self.max_missed
    }

    /// Replaces the probe template. `timestamp` is overwritten on every tick.
    pub fn set_probe_payload(&self, probe: Envelope) {
        debug!(probe = ?probe, "heartbeat probe updated");
        self.inner.lock().probe = probe;
    }

    pub fn probe_payload(&self) -> Envelope {
        self.inner.lock().probe.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HeartbeatEvent> {
        self.events.subscribe()
    }

    async fn run(
        monitor: Weak<Self>,
        run_id: u64,
        interval: Duration,
        mut events: broadcast::Receiver<ConnectionEvent>,
    ) {
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(monitor) = monitor.upgrade() else { break };
                    if !monitor.on_tick(run_id) {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Ok(ConnectionEvent::Disconnected) => {
                        if let Some(monitor) = monitor.upgrade() {
                            monitor.finish(run_id, "WebSocket client disconnected, stopping heartbeat");
                        }
                        break;
                    }
                    Ok(ConnectionEvent::MessageReceived(envelope)) => {
                        let Some(monitor) = monitor.upgrade() else { break };
                        monitor.observe_inbound(&envelope);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "heartbeat lagged behind connection events");
                    }
                    Err(RecvError::Closed) => {
                        if let Some(monitor) = monitor.upgrade() {
                            monitor.finish(run_id, "connection dropped, stopping heartbeat");
                        }
                        break;
                    }
                },
            }
        }
    }

    /// One probe tick. Returns whether the timer keeps running.
    fn on_tick(&self, run_id: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.run_id != run_id || inner.timer.is_none() {
            return false;
        }

        if self.link.is_connected() {
            let timestamp_ms = Utc::now().timestamp_millis();
            let probe = inner.probe.clone().with(TIMESTAMP_FIELD, timestamp_ms);
            match self.link.send(&probe) {
                Ok(()) => {
                    inner.missed_count = 0;
                    debug!(timestamp_ms, "Heartbeat sent");
                    let _ = self.events.send(HeartbeatEvent::Sent { timestamp_ms });
                    return true;
                }
                Err(err) => {
                    inner.missed_count += 1;
                    error!(%err, missed = inner.missed_count, "Failed to send heartbeat");
                }
            }
        } else {
            inner.missed_count += 1;
            warn!(missed = inner.missed_count, "WebSocket not connected, missed heartbeat");
        }

        if inner.missed_count >= self.max_missed {
            // Detach our own handle; the caller breaks out of the loop.
            inner.timer = None;
            let missed = inner.missed_count;
            warn!(missed, "heartbeat timed out");
            let _ = self.events.send(HeartbeatEvent::Timeout { missed });
            return false;
        }
        true
    }

    fn observe_inbound(&self, envelope: &Envelope) {
        let probe_type = {
            let inner = self.inner.lock();
            match inner.probe.type_key() {
                Ok(type_key) => type_key,
                Err(_) => return,
            }
        };
        if envelope.type_key().ok().as_deref() != Some(probe_type.as_str()) {
            return;
        }
        let echoed_timestamp_ms = envelope.i64_field(TIMESTAMP_FIELD).ok();
        debug!(?echoed_timestamp_ms, "heartbeat acknowledged");
        let _ = self
            .events
            .send(HeartbeatEvent::Acked { echoed_timestamp_ms });
    }

    fn finish(&self, run_id: u64, reason: &str) {
        let mut inner = self.inner.lock();
        if inner.run_id == run_id && inner.timer.take().is_some() {
            info!("{reason}");
        }
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        if let Some(timer) = self.inner.get_mut().timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/heartbeat_tests.rs"]
mod tests;
