use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use shared::domain::{ConversationKey, MessageId, UserId};
use tracing::{debug, trace};

use crate::attachments::AttachmentRef;

/// Monotonically increasing watermark used to discard stale history
/// responses after the user has switched conversations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadToken(u64);

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Server-assigned id. `None` while the message only exists locally,
    /// before the history row or an id-bearing echo names it.
    pub id: Option<MessageId>,
    pub sender_id: Option<UserId>,
    pub sender: String,
    pub body: String,
    pub attachment: Option<AttachmentRef>,
    pub sent_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Sort key: `sent_at`, then known ids before unknown, then id.
    fn sort_key(&self) -> (DateTime<Utc>, bool, Option<MessageId>) {
        (self.sent_at, self.id.is_none(), self.id)
    }
}

#[derive(Debug, Clone)]
pub struct Conversation {
    pub key: ConversationKey,
    messages: Vec<Message>,
    pub unread_count: u32,
    pub last_loaded_at: Option<DateTime<Utc>>,
    latest_load_token: Option<LoadToken>,
}

impl Conversation {
    fn new(key: ConversationKey) -> Self {
        Self {
            key,
            messages: Vec::new(),
            unread_count: 0,
            last_loaded_at: None,
            latest_load_token: None,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    fn contains_id(&self, id: MessageId) -> bool {
        self.messages.iter().any(|message| message.id == Some(id))
    }

    fn insert_sorted(&mut self, message: Message) {
        let key = message.sort_key();
        let index = self
            .messages
            .partition_point(|existing| existing.sort_key() <= key);
        self.messages.insert(index, message);
    }
}

/// Exclusive owner of every conversation and message. All mutation happens
/// through the engine's serialized state lock.
#[derive(Debug)]
pub struct ConversationStore {
    own_user_id: UserId,
    conversations: HashMap<ConversationKey, Conversation>,
    active: Option<ConversationKey>,
    next_load_token: u64,
}

impl ConversationStore {
    pub fn new(own_user_id: UserId) -> Self {
        Self {
            own_user_id,
            conversations: HashMap::new(),
            active: None,
            next_load_token: 0,
        }
    }

    pub fn own_user_id(&self) -> UserId {
        self.own_user_id
    }

    pub fn active(&self) -> Option<ConversationKey> {
        self.active
    }

    pub fn conversation(&self, key: ConversationKey) -> Option<&Conversation> {
        self.conversations.get(&key)
    }

    /// Idempotent get-or-create.
    pub fn ensure_conversation(&mut self, key: ConversationKey) -> &mut Conversation {
        self.conversations
            .entry(key)
            .or_insert_with(|| Conversation::new(key))
    }

    /// Switching away invalidates the previous selection's load token so an
    /// in-flight history response for it can no longer land. No message data
    /// is cleared.
    pub fn set_active(&mut self, key: Option<ConversationKey>) {
        if let Some(previous) = self.active {
            if Some(previous) != key {
                if let Some(conversation) = self.conversations.get_mut(&previous) {
                    conversation.latest_load_token = None;
                }
            }
        }
        self.active = key;
        if let Some(key) = key {
            self.ensure_conversation(key);
            self.mark_read(key);
        }
    }

    pub fn issue_load_token(&mut self, key: ConversationKey) -> LoadToken {
        self.next_load_token += 1;
        let token = LoadToken(self.next_load_token);
        self.ensure_conversation(key).latest_load_token = Some(token);
        token
    }

    /// Inserts preserving `(sent_at, id)` order. A message whose known id is
    /// already stored is rejected without any side effect.
    pub fn append_incoming(&mut self, key: ConversationKey, message: Message) -> bool {
        let active = self.active == Some(key);
        // Own echoes are already read.
        let from_self = message.sender_id == Some(self.own_user_id);
        let conversation = self.ensure_conversation(key);

        if let Some(id) = message.id {
            if conversation.contains_id(id) {
                debug!(?key, id = id.0, "sync: duplicate message id ignored");
                return false;
            }
        }

        conversation.insert_sorted(message);
        if !active && !from_self {
            conversation.unread_count += 1;
        }
        true
    }

    /// Applies a history snapshot iff `token` is still the latest issued for
    /// this conversation; a superseded response is discarded silently.
    pub fn replace_history(
        &mut self,
        key: ConversationKey,
        mut messages: Vec<Message>,
        token: LoadToken,
    ) -> bool {
        let conversation = self.ensure_conversation(key);
        if conversation.latest_load_token != Some(token) {
            debug!(?key, token = token.0, "sync: stale history response discarded");
            return false;
        }

        messages.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        let mut seen = HashSet::new();
        messages.retain(|message| match message.id {
            Some(id) => seen.insert(id),
            None => true,
        });

        conversation.messages = messages;
        conversation.last_loaded_at = Some(Utc::now());
        true
    }

    /// Local-view read: the user has seen everything currently stored.
    pub fn mark_read(&mut self, key: ConversationKey) {
        if let Some(conversation) = self.conversations.get_mut(&key) {
            conversation.unread_count = 0;
        }
    }

    /// Tags this client's own messages acknowledged by the peer. Reapplying
    /// the same receipt changes nothing.
    pub fn apply_read_receipt(
        &mut self,
        key: ConversationKey,
        reader_id: UserId,
        read_at: DateTime<Utc>,
    ) {
        let own = self.own_user_id;
        let Some(conversation) = self.conversations.get_mut(&key) else {
            return;
        };

        let mut tagged = 0u32;
        for message in &mut conversation.messages {
            if message.sender_id == Some(own)
                && message.read_at.is_none()
                && message.sent_at <= read_at
            {
                message.read_at = Some(read_at);
                tagged += 1;
            }
        }
        trace!(?key, reader_id = reader_id.0, tagged, "sync: read receipt applied");
    }
}

#[cfg(test)]
#[path = "tests/conversations_tests.rs"]
mod tests;
