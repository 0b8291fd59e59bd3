//! Caller-owned buffer for envelopes accepted while the connection is down.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use shared::{domain::MessageId, Envelope};

use crate::error::{ConnectionError, ServiceError};

#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub id: MessageId,
    pub payload: Envelope,
    pub enqueued_at: DateTime<Utc>,
    pub sent: bool,
}

#[derive(Debug, Default, PartialEq)]
pub struct FlushReport {
    pub sent: Vec<MessageId>,
    pub remaining: usize,
}

#[derive(Debug)]
pub struct PendingOutboundQueue {
    entries: VecDeque<PendingEntry>,
    limit: usize,
}

impl PendingOutboundQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit,
        }
    }

    pub fn push(&mut self, id: MessageId, payload: Envelope) -> Result<(), ServiceError> {
        if self.entries.len() >= self.limit {
            return Err(ServiceError::QueueFull { limit: self.limit });
        }
        self.entries.push_back(PendingEntry {
            id,
            payload,
            enqueued_at: Utc::now(),
            sent: false,
        });
        Ok(())
    }

    /// Sends entries front to back and stops at the first failure so order is
    /// kept. Sent entries are removed.
    pub fn flush<F>(&mut self, mut send: F) -> FlushReport
    where
        F: FnMut(&Envelope) -> Result<(), ConnectionError>,
    {
        let mut report = FlushReport::default();
        for entry in self.entries.iter_mut().filter(|entry| !entry.sent) {
            if send(&entry.payload).is_err() {
                break;
            }
            entry.sent = true;
            report.sent.push(entry.id.clone());
        }
        self.entries.retain(|entry| !entry.sent);
        report.remaining = self.entries.len();
        report
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn entries(&self) -> impl Iterator<Item = &PendingEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: u32) -> (MessageId, Envelope) {
        (
            MessageId(format!("m-{n}")),
            Envelope::typed("im.message").with("seq", n),
        )
    }

    #[test]
    fn push_respects_limit() {
        let mut queue = PendingOutboundQueue::new(2);
        for n in 0..2 {
            let (id, payload) = entry(n);
            queue.push(id, payload).expect("room left");
        }
        let (id, payload) = entry(2);
        assert!(matches!(
            queue.push(id, payload),
            Err(ServiceError::QueueFull { limit: 2 })
        ));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn flush_sends_in_order_and_removes_sent() {
        let mut queue = PendingOutboundQueue::new(10);
        for n in 0..3 {
            let (id, payload) = entry(n);
            queue.push(id, payload).expect("push");
        }

        let mut seen = Vec::new();
        let report = queue.flush(|payload| {
            seen.push(payload.i64_field("seq").expect("seq"));
            Ok(())
        });

        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(report.sent.len(), 3);
        assert_eq!(report.remaining, 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn flush_stops_at_first_failure() {
        let mut queue = PendingOutboundQueue::new(10);
        for n in 0..3 {
            let (id, payload) = entry(n);
            queue.push(id, payload).expect("push");
        }

        let mut calls = 0;
        let report = queue.flush(|_| {
            calls += 1;
            if calls == 2 {
                Err(ConnectionError::NotConnected)
            } else {
                Ok(())
            }
        });

        assert_eq!(report.sent, vec![MessageId("m-0".into())]);
        assert_eq!(report.remaining, 2);
        let left: Vec<_> = queue.entries().map(|entry| entry.id.0.clone()).collect();
        assert_eq!(left, vec!["m-1", "m-2"]);
    }
}
