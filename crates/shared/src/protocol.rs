use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{FileId, GroupId, MessageId, UserId},
    error::ApiError,
};

/// Push frames delivered by the server over the websocket channel.
///
/// Private frames carry both endpoint ids so a sent-by-me echo and a
/// received-from-peer message land in the same conversation. `id` is the
/// server-assigned message id; older servers omit it on push frames and it
/// only becomes known through the history endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PushEvent {
    PrivateMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<MessageId>,
        from_id: UserId,
        to_id: UserId,
        sender: String,
        message: String,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_id: Option<FileId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filetype: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    GroupMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<MessageId>,
        group_id: GroupId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<UserId>,
        sender: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    MessagesRead {
        reader_id: UserId,
        timestamp: DateTime<Utc>,
    },
    GroupInvite {
        group_id: GroupId,
        group_name: String,
        inviter: String,
    },
    GroupCreated {
        group_id: GroupId,
    },
    MemberJoined {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<GroupId>,
        uid: UserId,
        user: String,
    },
    Error(ApiError),
}

/// Push frames this client emits upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientPush {
    PrivateMessage {
        to: UserId,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_id: Option<FileId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filetype: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    GroupMessage {
        group_id: GroupId,
        message: String,
    },
    GroupCreate {
        name: String,
        member_ids: Vec<UserId>,
    },
    GroupAccept {
        group_id: GroupId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendSummary {
    pub id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendsResponse {
    pub friends: Vec<FriendSummary>,
    pub pending_received: Vec<FriendSummary>,
    pub pending_sent: Vec<FriendSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceResponse {
    pub status: PresenceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

/// One row of `/api/chat_history`; rows arrive in ascending time order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    pub sender: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<FileId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filetype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub messages: Vec<HistoryMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub file_id: FileId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filetype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadRequest {
    pub sender_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendRequestBody {
    pub friend_id: UserId,
}
