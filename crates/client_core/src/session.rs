use parking_lot::RwLock;
use shared::{domain::UserId, protocol::LoginProfile};
use tracing::info;

use crate::error::ServiceError;

/// The signed-in user, created on login success and dropped on logout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub user_name: String,
    pub avatar: String,
    pub department: String,
    pub email: String,
}

impl Session {
    pub fn new(user_id: impl Into<UserId>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            avatar: String::new(),
            department: String::new(),
            email: String::new(),
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = avatar.into();
        self
    }
}

impl From<&LoginProfile> for Session {
    fn from(profile: &LoginProfile) -> Self {
        Self {
            user_id: UserId::from(profile.user_id),
            user_name: profile.user_name.clone(),
            avatar: profile.user_img.clone(),
            department: profile.user_part.clone(),
            email: profile.user_email.clone(),
        }
    }
}

/// Shared holder of the current [`Session`].
#[derive(Default)]
pub struct SessionStore {
    current: RwLock<Option<Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `session`, returning the one it replaced.
    pub fn begin(&self, session: Session) -> Option<Session> {
        info!(user_id = %session.user_id, user_name = %session.user_name, "session started");
        self.current.write().replace(session)
    }

    pub fn end(&self) -> Option<Session> {
        let ended = self.current.write().take();
        if let Some(session) = &ended {
            info!(user_id = %session.user_id, "session ended");
        }
        ended
    }

    pub fn current(&self) -> Option<Session> {
        self.current.read().clone()
    }

    pub fn is_active(&self) -> bool {
        self.current.read().is_some()
    }

    pub fn require(&self) -> Result<Session, ServiceError> {
        self.current().ok_or(ServiceError::NotAuthenticated)
    }
}
