//! One-to-one chat on top of the connection layer.

use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use shared::{
    domain::{ContentType, MessageId, UserId},
    protocol::{actions, type_keys, ChatMessage},
    Envelope,
};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    connection::{ConnectionEvent, MessageLink},
    error::{ConnectionError, RouterError, ServiceError},
    pending::{FlushReport, PendingOutboundQueue},
    router::MessageRouter,
    session::{Session, SessionStore},
};

pub const DEFAULT_PENDING_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    MessageReceived(ChatMessage),
    /// The server acknowledged delivery.
    MessageSent(MessageId),
    /// Accepted while disconnected; goes out on the next connect.
    MessageQueued(MessageId),
    PendingFlushed(Vec<MessageId>),
    ReadStatusChanged(MessageId),
    HistoryLoaded(Vec<ChatMessage>),
    TypingChanged { user_id: UserId, is_typing: bool },
    Error(String),
}

struct ChatState {
    messages: Vec<ChatMessage>,
    pending: PendingOutboundQueue,
}

pub struct ChatService {
    link: Arc<dyn MessageLink>,
    session: Arc<SessionStore>,
    state: Mutex<ChatState>,
    events: broadcast::Sender<ChatEvent>,
}

type ChatHandler = fn(&ChatService, &Envelope) -> Result<(), ServiceError>;

impl ChatService {
    pub fn new(
        link: Arc<dyn MessageLink>,
        session: Arc<SessionStore>,
        pending_limit: usize,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            link,
            session,
            state: Mutex::new(ChatState {
                messages: Vec::new(),
                pending: PendingOutboundQueue::new(pending_limit),
            }),
            events,
        })
    }

    pub fn register_handlers(self: &Arc<Self>, router: &MessageRouter) -> Result<(), RouterError> {
        let routes: [(&'static str, ChatHandler); 4] = [
            (type_keys::IM_MESSAGE, Self::handle_incoming_message),
            (type_keys::IM_ACK, Self::handle_message_ack),
            (type_keys::IM_TYPING, Self::handle_typing_notification),
            (type_keys::IM_HISTORY, Self::handle_history_response),
        ];
        for (type_key, handle) in routes {
            let service = Arc::downgrade(self);
            router.register_handler(type_key, move |envelope| {
                let Some(service) = service.upgrade() else {
                    return;
                };
                if let Err(err) = handle(&service, envelope) {
                    warn!(type_key, %err, "Error processing chat message");
                    service.emit(ChatEvent::Error(err.to_string()));
                }
            })?;
        }
        Ok(())
    }

    /// Flushes the pending queue every time the link comes up.
    pub fn spawn_flush_on_connect(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.link.subscribe();
        let service: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::Connected) => {
                        let Some(service) = service.upgrade() else {
                            break;
                        };
                        service.flush_pending();
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Sends a text message, or queues it when the link is down. Anything still
    /// queued is sent first, and if that backlog cannot drain the text joins it.
    pub fn send_text(&self, receiver_id: &UserId, content: &str) -> Result<MessageId, ServiceError> {
        let session = self.require_session()?;
        let message_id = MessageId::random();
        let envelope = Envelope::request(type_keys::IM_MESSAGE, actions::SEND)
            .with("messageId", message_id.as_str())
            .with("senderId", session.user_id.as_str())
            .with("senderName", session.user_name.as_str())
            .with("senderAvatar", session.avatar.as_str())
            .with("receiverId", receiver_id.as_str())
            .with("content", content)
            .with("contentType", content_type_name(ContentType::Text))
            .with("timestamp", Utc::now().timestamp_millis());

        // Queued texts go out ahead of this one.
        let (flushed, sent) = {
            let mut state = self.state.lock();
            let flushed = if self.link.is_connected() && !state.pending.is_empty() {
                state.pending.flush(|queued| self.link.send(queued))
            } else {
                FlushReport::default()
            };
            let sent = if state.pending.is_empty() && self.link.is_connected() {
                match self.link.send(&envelope) {
                    Ok(()) => Ok(true),
                    Err(ConnectionError::NotConnected) => {
                        state.pending.push(message_id.clone(), envelope).map(|()| false)
                    }
                    Err(err) => Err(err.into()),
                }
            } else {
                state.pending.push(message_id.clone(), envelope).map(|()| false)
            };
            (flushed, sent)
        };
        self.report_flush(&flushed);

        if sent? {
            debug!(%receiver_id, %message_id, "Message sent");
        } else {
            warn!(%message_id, "WebSocket not connected, message will be sent when connected");
            self.emit(ChatEvent::MessageQueued(message_id.clone()));
        }
        Ok(message_id)
    }

    /// Sends the `im.file` metadata envelope followed by the file bytes.
    pub fn send_file(
        &self,
        receiver_id: &UserId,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<(), ServiceError> {
        let session = self.require_session()?;
        self.require_connected()?;
        let envelope = Envelope::request(type_keys::IM_FILE, actions::SEND)
            .with("senderId", session.user_id.as_str())
            .with("receiverId", receiver_id.as_str())
            .with("fileName", file_name)
            .with("fileSize", bytes.len())
            .with("timestamp", Utc::now().timestamp_millis());
        self.link.send_with_payload(&envelope, bytes)?;
        info!(%receiver_id, file_name, "File sent");
        Ok(())
    }

    pub fn fetch_history(&self, contact_id: &UserId, limit: u32) -> Result<(), ServiceError> {
        self.require_connected()?;
        let request = Envelope::request(type_keys::IM_HISTORY, actions::FETCH)
            .with("contactId", contact_id.as_str())
            .with("limit", limit);
        self.link.send(&request)?;
        debug!(%contact_id, limit, "Fetching message history");
        Ok(())
    }

    pub fn mark_read(&self, message_id: &MessageId) -> Result<(), ServiceError> {
        if !self.link.is_connected() {
            return Err(ServiceError::NotConnected);
        }
        let session = self.session.require()?;
        let ack = Envelope::request(type_keys::IM_ACK, actions::READ)
            .with("messageId", message_id.as_str())
            .with("userId", session.user_id.as_str());
        self.link.send(&ack)?;
        self.emit(ChatEvent::ReadStatusChanged(message_id.clone()));
        Ok(())
    }

    pub fn notify_typing(&self, target_id: &UserId, is_typing: bool) -> Result<(), ServiceError> {
        if !self.link.is_connected() {
            return Err(ServiceError::NotConnected);
        }
        let session = self.session.require()?;
        let notification = Envelope::typed(type_keys::IM_TYPING)
            .with("userId", session.user_id.as_str())
            .with("targetId", target_id.as_str())
            .with("isTyping", is_typing);
        self.link.send(&notification)?;
        Ok(())
    }

    /// Sends queued messages in order. Anything that fails stays queued.
    pub fn flush_pending(&self) -> FlushReport {
        let report = {
            let mut state = self.state.lock();
            if state.pending.is_empty() {
                return FlushReport::default();
            }
            state.pending.flush(|envelope| self.link.send(envelope))
        };
        self.report_flush(&report);
        report
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.state.lock().messages.clone()
    }

    pub fn clear_messages(&self) {
        self.state.lock().messages.clear();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    fn handle_incoming_message(&self, envelope: &Envelope) -> Result<(), ServiceError> {
        let message: ChatMessage = envelope
            .decode_as()
            .map_err(|source| payload_error(type_keys::IM_MESSAGE, source))?;
        debug!(sender = %message.sender_name, "Message received");
        self.state.lock().messages.push(message.clone());
        let message_id = message.id.clone();
        self.emit(ChatEvent::MessageReceived(message));

        if let Err(err) = self.mark_read(&message_id) {
            debug!(%message_id, %err, "could not mark message as read");
        }
        Ok(())
    }

    fn handle_message_ack(&self, envelope: &Envelope) -> Result<(), ServiceError> {
        let message_id = envelope
            .opt_str("messageId")
            .map_err(|source| payload_error(type_keys::IM_ACK, source))?;
        if let Some(message_id) = message_id {
            self.emit(ChatEvent::MessageSent(MessageId::from(message_id)));
        }
        Ok(())
    }

    fn handle_typing_notification(&self, envelope: &Envelope) -> Result<(), ServiceError> {
        if !(envelope.contains("userId") && envelope.contains("isTyping")) {
            return Ok(());
        }
        let user_id = envelope
            .str_field("userId")
            .map_err(|source| payload_error(type_keys::IM_TYPING, source))?;
        let is_typing = envelope
            .bool_field("isTyping")
            .map_err(|source| payload_error(type_keys::IM_TYPING, source))?;
        self.emit(ChatEvent::TypingChanged {
            user_id: UserId::from(user_id),
            is_typing,
        });
        Ok(())
    }

    fn handle_history_response(&self, envelope: &Envelope) -> Result<(), ServiceError> {
        let history = match envelope.get("messages") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| serde_json::from_value::<ChatMessage>(item.clone()))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|source| {
                    payload_error(
                        type_keys::IM_HISTORY,
                        shared::EnvelopeError::Field {
                            field: "messages".to_string(),
                            source,
                        },
                    )
                })?,
            _ => Vec::new(),
        };
        self.state.lock().messages.extend(history.iter().cloned());
        debug!(count = history.len(), "Loaded messages from history");
        self.emit(ChatEvent::HistoryLoaded(history));
        Ok(())
    }

    fn require_session(&self) -> Result<Session, ServiceError> {
        self.session.require().map_err(|err| {
            warn!("Current user not set");
            self.emit(ChatEvent::Error(err.to_string()));
            err
        })
    }

    fn require_connected(&self) -> Result<(), ServiceError> {
        if self.link.is_connected() {
            return Ok(());
        }
        let err = ServiceError::NotConnected;
        self.emit(ChatEvent::Error(err.to_string()));
        Err(err)
    }

    fn report_flush(&self, report: &FlushReport) {
        if report.sent.is_empty() {
            return;
        }
        info!(
            sent = report.sent.len(),
            remaining = report.remaining,
            "pending messages flushed"
        );
        self.emit(ChatEvent::PendingFlushed(report.sent.clone()));
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }
}

pub(crate) fn payload_error(type_key: &'static str, source: shared::EnvelopeError) -> ServiceError {
    ServiceError::Payload { type_key, source }
}

fn content_type_name(content_type: ContentType) -> &'static str {
    match content_type {
        ContentType::Text => "text",
        ContentType::Image => "image",
        ContentType::File => "file",
    }
}

#[cfg(test)]
#[path = "tests/chat_tests.rs"]
mod tests;
