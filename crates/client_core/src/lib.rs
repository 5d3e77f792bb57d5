use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use shared::{
    domain::{ConversationKey, GroupId, UserId},
    protocol::{
        ClientPush, FriendRequestBody, FriendSummary, FriendsResponse, HistoryMessage,
        HistoryResponse, MarkReadRequest, PushEvent, UploadResponse,
    },
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::warn;

pub mod attachments;
pub mod config;
pub mod conversations;
pub mod error;
pub mod membership;
pub mod presence;

pub use attachments::AttachmentRef;
pub use config::Settings;
pub use conversations::{Conversation, ConversationStore, LoadToken, Message};
pub use error::ClientError;
pub use membership::{Group, GroupInvite, GroupMembership, MembershipManager};
pub use presence::{Presence, PresenceTracker, DEFAULT_WATCH_INTERVAL};

/// Change notifications for a UI layer. Rendering stays outside this crate;
/// subscribers re-read through `snapshot`/`group`/`friends`.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConversationUpdated { key: ConversationKey },
    FriendsUpdated { friends: Vec<FriendSummary> },
    PresenceUpdated { friend_id: UserId, presence: Presence },
    InviteReceived { invite: GroupInvite },
    GroupUpdated { group_id: GroupId },
    Error(String),
}

/// Outbound half of the push channel. The engine never assumes an emitted
/// message is stored; the authoritative copy arrives as a push echo.
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn emit(&self, event: ClientPush) -> Result<()>;
}

pub struct MissingPushChannel;

#[async_trait]
impl PushChannel for MissingPushChannel {
    async fn emit(&self, _event: ClientPush) -> Result<()> {
        Err(ClientError::PushUnavailable.into())
    }
}

type WsSink = futures::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;

struct WsPushChannel {
    writer: Mutex<WsSink>,
}

#[async_trait]
impl PushChannel for WsPushChannel {
    async fn emit(&self, event: ClientPush) -> Result<()> {
        let frame = serde_json::to_string(&event).context("failed to encode push frame")?;
        self.writer
            .lock()
            .await
            .send(WsMessage::Text(frame))
            .await
            .context("failed to send push frame")?;
        Ok(())
    }
}

/// A file handed over for upload before it is referenced from a message.
#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
struct ClientState {
    server_url: Option<String>,
    user_id: Option<UserId>,
    username: Option<String>,
    ws_started: bool,
    friends: Vec<FriendSummary>,
    conversations: Option<ConversationStore>,
    membership: Option<MembershipManager>,
}

impl ClientState {
    fn stores(&mut self) -> Result<(&mut ConversationStore, &mut MembershipManager)> {
        match (self.conversations.as_mut(), self.membership.as_mut()) {
            (Some(conversations), Some(membership)) => Ok((conversations, membership)),
            _ => Err(ClientError::NotConnected.into()),
        }
    }
}

/// The synchronizer. REST responses and push events are funneled through one
/// set of entry points; all store mutation happens under `inner`, and no
/// network call is awaited while it is held.
pub struct ChatClient {
    http: Client,
    settings: Settings,
    inner: Mutex<ClientState>,
    push: Mutex<Arc<dyn PushChannel>>,
    presence: Mutex<Option<Arc<PresenceTracker>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatClient {
    pub fn new(settings: Settings) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            http: Client::new(),
            settings,
            inner: Mutex::new(ClientState::default()),
            push: Mutex::new(Arc::new(MissingPushChannel)),
            presence: Mutex::new(None),
            reader_task: Mutex::new(None),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn identity(&self) -> Option<(UserId, String)> {
        let guard = self.inner.lock().await;
        match (guard.user_id, guard.username.clone()) {
            (Some(user_id), Some(username)) => Some((user_id, username)),
            _ => None,
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.ws_started
    }

    /// Establishes identity and the push channel. Authentication happens
    /// upstream; the caller hands over the session identity.
    pub async fn connect(self: &Arc<Self>, user_id: UserId, username: &str) -> Result<()> {
        let server_url = config::normalize_server_url(&self.settings.server_url);
        self.reset_session(&server_url, user_id, username).await;

        if let Err(err) = self.spawn_ws_events(&server_url, user_id).await {
            self.shutdown().await;
            return Err(err);
        }

        self.inner.lock().await.ws_started = true;
        Ok(())
    }

    /// Embedding and test seam: same session setup as `connect`, but the
    /// caller provides the push channel and no websocket is dialed.
    pub async fn connect_with_push_channel(
        &self,
        user_id: UserId,
        username: &str,
        push: Arc<dyn PushChannel>,
    ) -> Result<()> {
        let server_url = config::normalize_server_url(&self.settings.server_url);
        self.reset_session(&server_url, user_id, username).await;
        *self.push.lock().await = push;
        Ok(())
    }

    /// Cancels the reader task and the presence watch and drops all session
    /// state. Safe to call twice.
    pub async fn shutdown(&self) {
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        if let Some(tracker) = self.presence.lock().await.take() {
            tracker.stop().await;
        }
        *self.push.lock().await = Arc::new(MissingPushChannel);
        *self.inner.lock().await = ClientState::default();
    }

    async fn reset_session(&self, server_url: &str, user_id: UserId, username: &str) {
        let mut guard = self.inner.lock().await;
        guard.server_url = Some(server_url.to_string());
        guard.user_id = Some(user_id);
        guard.username = Some(username.to_string());
        guard.ws_started = false;
        guard.friends.clear();
        guard.conversations = Some(ConversationStore::new(user_id));
        guard.membership = Some(MembershipManager::new(user_id));
    }

    async fn spawn_ws_events(self: &Arc<Self>, server_url: &str, user_id: UserId) -> Result<()> {
        let ws_url = if server_url.starts_with("https://") {
            server_url.replacen("https://", "wss://", 1)
        } else if server_url.starts_with("http://") {
            server_url.replacen("http://", "ws://", 1)
        } else {
            return Err(anyhow!("server_url must start with http:// or https://"));
        };
        let ws_url = format!("{ws_url}/ws?user_id={}", user_id.0);

        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (ws_writer, mut ws_reader) = ws_stream.split();
        *self.push.lock().await = Arc::new(WsPushChannel {
            writer: Mutex::new(ws_writer),
        });

        let client = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<PushEvent>(&text) {
                        Ok(event) => {
                            if let Err(err) = client.handle_push(event).await {
                                let _ = client.events.send(ClientEvent::Error(err.to_string()));
                            }
                        }
                        Err(err) => {
                            let _ = client
                                .events
                                .send(ClientEvent::Error(format!("invalid push frame: {err}")));
                        }
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        let _ = client.events.send(ClientEvent::Error(format!(
                            "push channel receive failed: {err}"
                        )));
                        break;
                    }
                }
            }
            client.inner.lock().await.ws_started = false;
        });
        *self.reader_task.lock().await = Some(task);

        Ok(())
    }

    async fn session(&self) -> Result<(String, UserId)> {
        let guard = self.inner.lock().await;
        let server_url = guard.server_url.clone().ok_or(ClientError::NotConnected)?;
        let user_id = guard.user_id.ok_or(ClientError::NotConnected)?;
        Ok((server_url, user_id))
    }

    async fn emit(&self, event: ClientPush) -> Result<()> {
        let push = { Arc::clone(&*self.push.lock().await) };
        push.emit(event).await
    }

    /// Switches the active conversation and reloads its history. A response
    /// from a superseded selection never lands: the load token issued here
    /// is invalidated by the next switch.
    pub async fn select_conversation(&self, key: Option<ConversationKey>) -> Result<()> {
        let token = {
            let mut guard = self.inner.lock().await;
            let (conversations, _) = guard.stores()?;
            conversations.set_active(key);
            key.map(|key| conversations.issue_load_token(key))
        };
        let (Some(key), Some(token)) = (key, token) else {
            return Ok(());
        };

        let history = match self.fetch_history(key).await {
            Ok(messages) => messages,
            Err(err) => {
                // Prior state stays valid; the user retries by re-selecting.
                warn!(?key, "sync: history fetch failed: {err}");
                return Ok(());
            }
        };

        let applied = {
            let mut guard = self.inner.lock().await;
            let (conversations, _) = guard.stores()?;
            let mut messages: Vec<Message> =
                history.into_iter().map(message_from_history).collect();
            // Keep the newest page; rows arrive in ascending time order.
            let cap = (self.settings.history_page_size as usize).max(1);
            if messages.len() > cap {
                messages.drain(..messages.len() - cap);
            }
            conversations.replace_history(key, messages, token)
        };

        if applied {
            let _ = self.events.send(ClientEvent::ConversationUpdated { key });
            if let ConversationKey::Private(friend_id) = key {
                self.post_mark_read(friend_id).await;
            }
        }
        Ok(())
    }

    /// Single typed entry point for push events, used by the websocket
    /// reader and by any embedding transport.
    pub async fn handle_push(&self, event: PushEvent) -> Result<()> {
        match event {
            PushEvent::PrivateMessage {
                id,
                from_id,
                to_id,
                sender,
                message,
                timestamp,
                file_id,
                filetype,
                filename,
            } => {
                let attachment =
                    attachments::decode(&message, file_id, filetype.as_deref(), filename.as_deref());
                let incoming = Message {
                    id,
                    sender_id: Some(from_id),
                    sender,
                    body: message,
                    attachment,
                    sent_at: timestamp,
                    read_at: None,
                };

                let (key, accepted, acknowledge) = {
                    let mut guard = self.inner.lock().await;
                    let own_id = guard.user_id.ok_or(ClientError::NotConnected)?;
                    // Echo and inbound both land in the peer's conversation.
                    let peer = if from_id == own_id { to_id } else { from_id };
                    let key = ConversationKey::Private(peer);
                    let (conversations, _) = guard.stores()?;
                    let accepted = conversations.append_incoming(key, incoming);
                    let active = conversations.active() == Some(key);
                    (key, accepted, accepted && active && from_id != own_id)
                };

                if accepted {
                    let _ = self.events.send(ClientEvent::ConversationUpdated { key });
                }
                if acknowledge {
                    // Visible immediately, so confirm the read upstream now.
                    self.post_mark_read(from_id).await;
                }
            }
            PushEvent::GroupMessage {
                id,
                group_id,
                sender_id,
                sender,
                message,
                timestamp,
            } => {
                let key = ConversationKey::Group(group_id);
                let attachment = attachments::decode_body(&message);
                let incoming = Message {
                    id,
                    sender_id,
                    sender,
                    body: message,
                    attachment,
                    sent_at: timestamp,
                    read_at: None,
                };

                let accepted = {
                    let mut guard = self.inner.lock().await;
                    let (conversations, membership) = guard.stores()?;
                    membership.ensure_known(group_id);
                    conversations.append_incoming(key, incoming)
                };
                if accepted {
                    let _ = self.events.send(ClientEvent::ConversationUpdated { key });
                }
            }
            PushEvent::MessagesRead {
                reader_id,
                timestamp,
            } => {
                let key = ConversationKey::Private(reader_id);
                {
                    let mut guard = self.inner.lock().await;
                    let (conversations, _) = guard.stores()?;
                    conversations.apply_read_receipt(key, reader_id, timestamp);
                }
                let _ = self.events.send(ClientEvent::ConversationUpdated { key });
            }
            PushEvent::GroupInvite {
                group_id,
                group_name,
                inviter,
            } => {
                let invite = GroupInvite {
                    group_id,
                    group_name,
                    inviter,
                };
                {
                    let mut guard = self.inner.lock().await;
                    let (_, membership) = guard.stores()?;
                    membership.note_invite(&invite);
                }
                let _ = self.events.send(ClientEvent::InviteReceived { invite });
            }
            PushEvent::GroupCreated { group_id } => {
                {
                    let mut guard = self.inner.lock().await;
                    let (_, membership) = guard.stores()?;
                    membership.confirm_created(group_id);
                }
                let _ = self.events.send(ClientEvent::GroupUpdated { group_id });
            }
            PushEvent::MemberJoined { group_id, uid, user } => {
                let applied = {
                    let mut guard = self.inner.lock().await;
                    let (_, membership) = guard.stores()?;
                    membership.apply_member_joined(group_id, uid, &user)
                };
                if let Some(group_id) = applied {
                    let _ = self.events.send(ClientEvent::GroupUpdated { group_id });
                }
            }
            PushEvent::Error(error) => {
                warn!("push: server error: {error}");
                let _ = self.events.send(ClientEvent::Error(error.to_string()));
            }
        }
        Ok(())
    }

    /// Validates locally, then emits upstream. The store is only updated by
    /// the authoritative push echo, which may even arrive before this call
    /// returns.
    pub async fn send_message(
        &self,
        key: ConversationKey,
        body: &str,
        attachment: Option<AttachmentRef>,
    ) -> Result<()> {
        if body.trim().is_empty() && attachment.is_none() {
            return Err(ClientError::EmptyMessage.into());
        }

        let push = match key {
            ConversationKey::Private(friend_id) => match &attachment {
                Some(AttachmentRef::IdRef {
                    file_id,
                    filetype,
                    filename,
                }) => ClientPush::PrivateMessage {
                    to: friend_id,
                    message: body.to_string(),
                    file_id: Some(*file_id),
                    filetype: filetype.clone(),
                    filename: filename.clone(),
                },
                // The current wire has no url fields; fall back to the body
                // encoding for a legacy reference.
                Some(legacy @ AttachmentRef::LegacyUrlRef { .. }) => ClientPush::PrivateMessage {
                    to: friend_id,
                    message: attachments::encode(legacy),
                    file_id: None,
                    filetype: None,
                    filename: None,
                },
                None => ClientPush::PrivateMessage {
                    to: friend_id,
                    message: body.to_string(),
                    file_id: None,
                    filetype: None,
                    filename: None,
                },
            },
            ConversationKey::Group(group_id) => {
                {
                    let mut guard = self.inner.lock().await;
                    let (_, membership) = guard.stores()?;
                    if !membership.can_send(group_id) {
                        return Err(ClientError::GroupNotJoined {
                            group_id: group_id.0,
                        }
                        .into());
                    }
                }
                let message = match &attachment {
                    // Group frames carry no structured file fields; the
                    // reference travels inside the body.
                    Some(attachment) => attachments::encode(attachment),
                    None => body.to_string(),
                };
                ClientPush::GroupMessage { group_id, message }
            }
        };

        self.emit(push).await
    }

    /// Uploads the file for a pending message and returns the reference to
    /// send with `send_message`.
    pub async fn upload_attachment(
        &self,
        key: ConversationKey,
        upload: AttachmentUpload,
    ) -> Result<AttachmentRef> {
        let (server_url, _user_id) = self.session().await?;
        let to = match key {
            ConversationKey::Private(friend_id) => friend_id.0,
            ConversationKey::Group(group_id) => group_id.0,
        };

        let mut part =
            reqwest::multipart::Part::bytes(upload.bytes).file_name(upload.filename.clone());
        if let Some(mime_type) = &upload.mime_type {
            part = part
                .mime_str(mime_type)
                .context("invalid attachment mime type")?;
        }
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("to", to.to_string());

        let response: UploadResponse = self
            .http
            .post(format!("{server_url}/api/upload"))
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(AttachmentRef::IdRef {
            file_id: response.file_id,
            filetype: response.filetype,
            filename: response.filename.or(Some(upload.filename)),
        })
    }

    pub async fn create_group(&self, name: &str, member_ids: Vec<UserId>) -> Result<()> {
        self.emit(ClientPush::GroupCreate {
            name: name.to_string(),
            member_ids,
        })
        .await
    }

    /// Consumes an invite decision. Accept announces upstream and leaves the
    /// group read-only until the membership update for our own id confirms
    /// the join; decline is local-only.
    pub async fn respond_to_invite(&self, group_id: GroupId, accept: bool) -> Result<()> {
        let announce = {
            let mut guard = self.inner.lock().await;
            let (_, membership) = guard.stores()?;
            membership.respond(group_id, accept)
        };
        if announce {
            self.emit(ClientPush::GroupAccept { group_id }).await?;
        }
        let _ = self.events.send(ClientEvent::GroupUpdated { group_id });
        Ok(())
    }

    /// Fetches the roster and pending requests, then re-targets the presence
    /// watch at the new friend set (replacing, never stacking).
    pub async fn load_friends(&self) -> Result<FriendsResponse> {
        let (server_url, _user_id) = self.session().await?;
        let response: FriendsResponse = self
            .http
            .get(format!("{server_url}/api/friends"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        {
            let mut guard = self.inner.lock().await;
            guard.friends = response.friends.clone();
        }
        let _ = self.events.send(ClientEvent::FriendsUpdated {
            friends: response.friends.clone(),
        });

        let friend_ids: Vec<UserId> = response.friends.iter().map(|friend| friend.id).collect();
        let tracker = self.presence_tracker(&server_url).await;
        tracker
            .watch(
                friend_ids,
                Duration::from_secs(self.settings.presence_interval_secs),
            )
            .await;

        Ok(response)
    }

    pub async fn search_users(&self, query: &str) -> Result<Vec<FriendSummary>> {
        let (server_url, _user_id) = self.session().await?;
        let users: Vec<FriendSummary> = self
            .http
            .get(format!("{server_url}/api/search_users"))
            .query(&[("query", query)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(users)
    }

    pub async fn send_friend_request(&self, friend_id: UserId) -> Result<()> {
        let (server_url, _user_id) = self.session().await?;
        self.http
            .post(format!("{server_url}/api/send_friend_request"))
            .json(&FriendRequestBody { friend_id })
            .send()
            .await?
            .error_for_status()?;
        self.load_friends().await?;
        Ok(())
    }

    pub async fn accept_friend_request(&self, friend_id: UserId) -> Result<()> {
        let (server_url, _user_id) = self.session().await?;
        self.http
            .post(format!("{server_url}/api/accept_friend_request"))
            .json(&FriendRequestBody { friend_id })
            .send()
            .await?
            .error_for_status()?;
        self.load_friends().await?;
        Ok(())
    }

    /// Marks a conversation read locally and, for private chats, confirms it
    /// upstream.
    pub async fn mark_read(&self, key: ConversationKey) -> Result<()> {
        {
            let mut guard = self.inner.lock().await;
            let (conversations, _) = guard.stores()?;
            conversations.mark_read(key);
        }
        if let ConversationKey::Private(friend_id) = key {
            self.post_mark_read(friend_id).await;
        }
        Ok(())
    }

    pub async fn refresh_presence(&self, friend_id: UserId) -> Result<Presence> {
        let (server_url, _user_id) = self.session().await?;
        self.presence_tracker(&server_url)
            .await
            .refresh(friend_id)
            .await
    }

    pub async fn presence(&self, friend_id: UserId) -> Option<Presence> {
        let guard = self.presence.lock().await;
        match guard.as_ref() {
            Some(tracker) => tracker.presence(friend_id).await,
            None => None,
        }
    }

    async fn presence_tracker(&self, server_url: &str) -> Arc<PresenceTracker> {
        let mut guard = self.presence.lock().await;
        if let Some(tracker) = guard.as_ref() {
            return Arc::clone(tracker);
        }
        let tracker = PresenceTracker::new(self.http.clone(), server_url, self.events.clone());
        *guard = Some(Arc::clone(&tracker));
        tracker
    }

    /// Cloned read view for a UI; the store keeps exclusive ownership.
    pub async fn snapshot(&self, key: ConversationKey) -> Option<Conversation> {
        let guard = self.inner.lock().await;
        guard
            .conversations
            .as_ref()
            .and_then(|store| store.conversation(key).cloned())
    }

    pub async fn group(&self, group_id: GroupId) -> Option<Group> {
        let guard = self.inner.lock().await;
        guard
            .membership
            .as_ref()
            .and_then(|membership| membership.group(group_id).cloned())
    }

    pub async fn friends(&self) -> Vec<FriendSummary> {
        self.inner.lock().await.friends.clone()
    }

    async fn fetch_history(&self, key: ConversationKey) -> Result<Vec<HistoryMessage>> {
        let (server_url, _user_id) = self.session().await?;
        let request = self.http.get(format!("{server_url}/api/chat_history"));
        let request = match key {
            ConversationKey::Private(friend_id) => request.query(&[("friend_id", friend_id.0)]),
            ConversationKey::Group(group_id) => request.query(&[("group_id", group_id.0)]),
        };
        let response: HistoryResponse = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.messages)
    }

    /// Best effort; a failed acknowledgement is logged and absorbed, the
    /// receipt will be retried on the next selection.
    async fn post_mark_read(&self, sender_id: UserId) {
        let Ok((server_url, _user_id)) = self.session().await else {
            return;
        };
        let result = self
            .http
            .post(format!("{server_url}/api/mark_read"))
            .json(&MarkReadRequest { sender_id })
            .send()
            .await
            .and_then(|response| response.error_for_status());
        if let Err(err) = result {
            warn!(sender_id = sender_id.0, "sync: mark_read failed: {err}");
        }
    }
}

fn message_from_history(row: HistoryMessage) -> Message {
    let attachment = attachments::decode(
        &row.message,
        row.file_id,
        row.filetype.as_deref(),
        row.filename.as_deref(),
    );
    Message {
        id: Some(row.id),
        sender_id: Some(row.sender_id),
        sender: row.sender,
        body: row.message,
        attachment,
        sent_at: row.timestamp,
        read_at: row.read_at,
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
