use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AccountId, ContentType, GroupId, MessageId, UserId};

/// Type keys understood by the chat server.
pub mod type_keys {
    pub const IM_MESSAGE: &str = "im.message";
    pub const IM_FILE: &str = "im.file";
    pub const IM_HISTORY: &str = "im.history";
    pub const IM_ACK: &str = "im.ack";
    pub const IM_TYPING: &str = "im.typing";
    pub const CONTACT_LIST: &str = "contact.list";
    pub const CONTACT_MANAGE: &str = "contact.manage";
    pub const CONTACT_STATUS: &str = "contact.status";
    pub const GROUP_MANAGE: &str = "group.manage";
    pub const GROUP_LIST: &str = "group.list";
    pub const GROUP_UPDATE: &str = "group.update";
    pub const HEARTBEAT: &str = "heartbeat";
    /// Legacy numeric login request/response.
    pub const LOGIN: &str = "0";
    /// Legacy numeric friend-detail request/response.
    pub const FRIEND_DETAIL: &str = "2";

    pub const ALL: &[&str] = &[
        IM_MESSAGE,
        IM_FILE,
        IM_HISTORY,
        IM_ACK,
        IM_TYPING,
        CONTACT_LIST,
        CONTACT_MANAGE,
        CONTACT_STATUS,
        GROUP_MANAGE,
        GROUP_LIST,
        GROUP_UPDATE,
        HEARTBEAT,
        LOGIN,
        FRIEND_DETAIL,
    ];
}

/// Actions carried next to a type key.
pub mod actions {
    pub const SEND: &str = "send";
    pub const FETCH: &str = "fetch";
    pub const READ: &str = "read";
    pub const ADD: &str = "add";
    pub const REMOVE: &str = "remove";
    pub const UPDATE_REMARK: &str = "updateRemark";
    pub const CREATE: &str = "create";
    pub const JOIN: &str = "join";
    pub const LEAVE: &str = "leave";
    pub const INVITE: &str = "invite";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(alias = "messageId", default)]
    pub id: MessageId,
    #[serde(default)]
    pub sender_id: UserId,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default)]
    pub sender_avatar: String,
    #[serde(default)]
    pub receiver_id: UserId,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(with = "chrono::serde::ts_milliseconds", default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_sent: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Contact {
    pub id: UserId,
    pub name: String,
    pub avatar: String,
    pub status: String,
    pub remark: String,
}

impl Contact {
    /// Case-insensitive match on name and remark; substring match on id.
    pub fn matches(&self, keyword: &str) -> bool {
        let keyword = keyword.to_lowercase();
        self.name.to_lowercase().contains(&keyword)
            || self.remark.to_lowercase().contains(&keyword)
            || self.id.as_str().contains(&keyword)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub avatar: String,
    pub description: String,
    pub members: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginCredentials {
    pub account: String,
    pub password: String,
}

/// `data` object of a successful login response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoginProfile {
    #[serde(default = "unknown_account")]
    pub user_id: AccountId,
    pub user_name: String,
    pub user_part: String,
    pub user_email: String,
    pub user_img: String,
    pub friend_count: u32,
    pub list: Vec<FriendSummary>,
}

fn unknown_account() -> AccountId {
    AccountId(-1)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FriendSummary {
    pub id: AccountId,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FriendDetail {
    pub id: AccountId,
    pub name: String,
    pub part: String,
    pub email: String,
    pub img: String,
    pub sign: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FriendDetailsData {
    pub friend_details: Vec<FriendDetail>,
}
