//! Legacy numeric login handshake (`"0"`) and the friend-detail follow-up (`"2"`).

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;
use serde_json::Value;
use shared::{
    domain::AccountId,
    protocol::{type_keys, FriendDetail, FriendDetailsData, LoginCredentials, LoginProfile},
    Envelope,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    chat::payload_error,
    connection::MessageLink,
    error::{RouterError, ServiceError},
    router::MessageRouter,
    session::{Session, SessionStore},
};

/// How many friends get their details requested right after login.
pub const FRIEND_DETAIL_BATCH: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum LoginEvent {
    LoggedIn(LoginProfile),
    LoginFailed(String),
    FriendDetailsLoaded(Vec<FriendDetail>),
    LoggedOut,
}

pub struct LoginFlow {
    link: Arc<dyn MessageLink>,
    session: Arc<SessionStore>,
    friends: Mutex<BTreeMap<AccountId, FriendDetail>>,
    events: broadcast::Sender<LoginEvent>,
}

impl LoginFlow {
    pub fn new(link: Arc<dyn MessageLink>, session: Arc<SessionStore>) -> Arc<Self> {
        let (events, _) = broadcast::channel(32);
        Arc::new(Self {
            link,
            session,
            friends: Mutex::new(BTreeMap::new()),
            events,
        })
    }

    pub fn register_handlers(self: &Arc<Self>, router: &MessageRouter) -> Result<(), RouterError> {
        let flow = Arc::downgrade(self);
        router.register_handler(type_keys::LOGIN, move |envelope| {
            if let Some(flow) = flow.upgrade() {
                if let Err(err) = flow.handle_login_response(envelope) {
                    warn!(%err, "Error processing login response");
                    flow.emit(LoginEvent::LoginFailed(err.to_string()));
                }
            }
        })?;

        let flow = Arc::downgrade(self);
        router.register_handler(type_keys::FRIEND_DETAIL, move |envelope| {
            if let Some(flow) = flow.upgrade() {
                if let Err(err) = flow.handle_friend_details(envelope) {
                    warn!(%err, "Error processing friend details");
                }
            }
        })
    }

    pub fn login(&self, account: &str, password: &str) -> Result<(), ServiceError> {
        if !self.link.is_connected() {
            return Err(ServiceError::NotConnected);
        }
        let credentials = LoginCredentials {
            account: account.to_string(),
            password: password.to_string(),
        };
        let login = serde_json::to_value(&credentials)
            .map_err(|source| payload_error(type_keys::LOGIN, shared::EnvelopeError::Encode(source)))?;
        self.link
            .send(&Envelope::typed(type_keys::LOGIN).with("login", login))?;
        info!(account, "send login request");
        Ok(())
    }

    pub fn logout(&self) {
        self.friends.lock().clear();
        if self.session.end().is_some() {
            self.emit(LoginEvent::LoggedOut);
        }
    }

    pub fn request_friend_details(&self, friend_ids: &[AccountId]) -> Result<(), ServiceError> {
        let ids: Vec<Value> = friend_ids.iter().map(|id| Value::from(id.0)).collect();
        self.link.send(
            &Envelope::typed(type_keys::FRIEND_DETAIL).with("friendIds", Value::Array(ids)),
        )?;
        debug!(count = friend_ids.len(), "Requesting friend details");
        Ok(())
    }

    /// Friends known from the last login, detailed where the server answered.
    pub fn friends(&self) -> Vec<FriendDetail> {
        self.friends.lock().values().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoginEvent> {
        self.events.subscribe()
    }

    fn handle_login_response(&self, envelope: &Envelope) -> Result<(), ServiceError> {
        let profile: LoginProfile = match envelope.get("data") {
            Some(Value::Object(_)) => envelope
                .field_as("data")
                .map_err(|source| payload_error(type_keys::LOGIN, source))?,
            _ => LoginProfile {
                user_id: AccountId(-1),
                ..LoginProfile::default()
            },
        };
        if profile.user_id.0 < 0 {
            self.reject(envelope);
            return Ok(());
        }

        info!(
            user_id = profile.user_id.0,
            user_name = %profile.user_name,
            friend_count = profile.friend_count,
            "User info"
        );
        let batch: Vec<AccountId> = {
            let mut friends = self.friends.lock();
            friends.clear();
            for summary in &profile.list {
                friends.insert(
                    summary.id,
                    FriendDetail {
                        id: summary.id,
                        name: summary.name.clone(),
                        ..FriendDetail::default()
                    },
                );
            }
            profile
                .list
                .iter()
                .take(FRIEND_DETAIL_BATCH)
                .map(|summary| summary.id)
                .collect()
        };

        self.session.begin(Session::from(&profile));
        self.emit(LoginEvent::LoggedIn(profile));

        if !batch.is_empty() {
            self.request_friend_details(&batch)?;
        }
        Ok(())
    }

    fn handle_friend_details(&self, envelope: &Envelope) -> Result<(), ServiceError> {
        let data: FriendDetailsData = match envelope.get("data") {
            Some(Value::Object(_)) => envelope
                .field_as("data")
                .map_err(|source| payload_error(type_keys::FRIEND_DETAIL, source))?,
            _ => FriendDetailsData::default(),
        };

        let merged: Vec<FriendDetail> = {
            let mut friends = self.friends.lock();
            data.friend_details
                .into_iter()
                .filter_map(|detail| {
                    // Details for ids we never listed are ignored.
                    let known = friends.get_mut(&detail.id)?;
                    known.part = detail.part;
                    known.email = detail.email;
                    known.img = detail.img;
                    known.sign = detail.sign;
                    Some(known.clone())
                })
                .collect()
        };
        debug!(count = merged.len(), "friend details merged");
        self.emit(LoginEvent::FriendDetailsLoaded(merged));
        Ok(())
    }

    fn reject(&self, envelope: &Envelope) {
        let reason = envelope
            .opt_str("desc")
            .ok()
            .flatten()
            .filter(|desc| !desc.is_empty())
            .unwrap_or("login rejected")
            .to_string();
        warn!(%reason, "login failed");
        self.emit(LoginEvent::LoginFailed(reason));
    }

    fn emit(&self, event: LoginEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[path = "tests/login_tests.rs"]
mod tests;
