use thiserror::Error;

/// Failures the engine reports before or instead of touching the network.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("message body and attachment are both empty")]
    EmptyMessage,
    #[error("not connected: missing user identity")]
    NotConnected,
    #[error("group {group_id} membership is not confirmed; sending is disabled")]
    GroupNotJoined { group_id: i64 },
    #[error("push channel is not connected")]
    PushUnavailable,
}
