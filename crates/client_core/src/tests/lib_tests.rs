use std::collections::HashMap;

use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
    routing::{get, post},
    Json, Router,
};
use shared::{
    domain::{FileId, MessageId},
    protocol::{PresenceResponse, PresenceStatus},
};
use tokio::net::TcpListener;

use super::*;

const ALICE: ConversationKey = ConversationKey::Private(UserId(7));
const BETH: ConversationKey = ConversationKey::Private(UserId(8));
const TEAM: GroupId = GroupId(3);

struct RecordingPushChannel {
    sent: Mutex<Vec<ClientPush>>,
}

impl RecordingPushChannel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
        })
    }

    async fn sent(&self) -> Vec<ClientPush> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl PushChannel for RecordingPushChannel {
    async fn emit(&self, event: ClientPush) -> Result<()> {
        self.sent.lock().await.push(event);
        Ok(())
    }
}

#[derive(Clone, Default)]
struct ApiState {
    mark_read_calls: Arc<Mutex<Vec<i64>>>,
    friend_request_calls: Arc<Mutex<Vec<i64>>>,
    history: Arc<Mutex<HashMap<String, Vec<HistoryMessage>>>>,
    delays_ms: Arc<Mutex<HashMap<String, u64>>>,
}

impl ApiState {
    async fn set_history(&self, key: &str, messages: Vec<HistoryMessage>) {
        self.history.lock().await.insert(key.to_string(), messages);
    }

    async fn set_delay(&self, key: &str, delay_ms: u64) {
        self.delays_ms.lock().await.insert(key.to_string(), delay_ms);
    }

    async fn mark_read_calls(&self) -> Vec<i64> {
        self.mark_read_calls.lock().await.clone()
    }

    async fn friend_request_calls(&self) -> Vec<i64> {
        self.friend_request_calls.lock().await.clone()
    }
}

fn history_key(params: &HashMap<String, String>) -> String {
    if let Some(friend_id) = params.get("friend_id") {
        format!("friend:{friend_id}")
    } else if let Some(group_id) = params.get("group_id") {
        format!("group:{group_id}")
    } else {
        "none".to_string()
    }
}

async fn handle_chat_history(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<HistoryResponse> {
    let key = history_key(&params);
    let delay = state.delays_ms.lock().await.get(&key).copied().unwrap_or(0);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    let messages = state
        .history
        .lock()
        .await
        .get(&key)
        .cloned()
        .unwrap_or_default();
    Json(HistoryResponse { messages })
}

async fn handle_mark_read(State(state): State<ApiState>, Json(body): Json<MarkReadRequest>) {
    state.mark_read_calls.lock().await.push(body.sender_id.0);
}

async fn handle_friends(State(_state): State<ApiState>) -> Json<FriendsResponse> {
    Json(FriendsResponse {
        friends: vec![FriendSummary {
            id: UserId(7),
            username: "alice".to_string(),
        }],
        pending_received: vec![FriendSummary {
            id: UserId(9),
            username: "carol".to_string(),
        }],
        pending_sent: Vec::new(),
    })
}

async fn handle_last_seen(
    State(_state): State<ApiState>,
    Query(_params): Query<HashMap<String, String>>,
) -> Json<PresenceResponse> {
    Json(PresenceResponse {
        status: PresenceStatus::Online,
        last_seen: None,
    })
}

async fn handle_search_users(
    State(_state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Vec<FriendSummary>> {
    let query = params.get("query").cloned().unwrap_or_default();
    let results = if "carol".contains(&query) && !query.is_empty() {
        vec![FriendSummary {
            id: UserId(9),
            username: "carol".to_string(),
        }]
    } else {
        Vec::new()
    };
    Json(results)
}

async fn handle_friend_request(
    State(state): State<ApiState>,
    Json(body): Json<FriendRequestBody>,
) {
    state.friend_request_calls.lock().await.push(body.friend_id.0);
}

async fn handle_upload(mut multipart: axum::extract::Multipart) -> Json<UploadResponse> {
    let mut filename = None;
    let mut to = None;
    while let Some(field) = multipart.next_field().await.expect("multipart field") {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                filename = field.file_name().map(str::to_string);
                let _ = field.bytes().await.expect("file bytes");
            }
            Some("to") => to = Some(field.text().await.expect("to field")),
            _ => {}
        }
    }
    assert!(to.is_some(), "upload must name its recipient");
    Json(UploadResponse {
        file_id: FileId(77),
        filetype: Some("text/plain".to_string()),
        filename,
    })
}

async fn spawn_api_server() -> (String, ApiState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = ApiState::default();
    let app = Router::new()
        .route("/api/chat_history", get(handle_chat_history))
        .route("/api/mark_read", post(handle_mark_read))
        .route("/api/friends", get(handle_friends))
        .route("/api/last_seen", get(handle_last_seen))
        .route("/api/search_users", get(handle_search_users))
        .route("/api/send_friend_request", post(handle_friend_request))
        .route("/api/accept_friend_request", post(handle_friend_request))
        .route("/api/upload", post(handle_upload))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

async fn connected_client(server_url: &str) -> (Arc<ChatClient>, Arc<RecordingPushChannel>) {
    let settings = Settings {
        server_url: server_url.to_string(),
        ..Settings::default()
    };
    let client = ChatClient::new(settings);
    let push = RecordingPushChannel::new();
    client
        .connect_with_push_channel(UserId(1), "me", Arc::clone(&push) as Arc<dyn PushChannel>)
        .await
        .expect("connect");
    (client, push)
}

fn history_row(id: i64, sender_id: i64, body: &str, sent_at: &str) -> HistoryMessage {
    HistoryMessage {
        id: MessageId(id),
        sender_id: UserId(sender_id),
        sender: format!("user-{sender_id}"),
        message: body.to_string(),
        timestamp: sent_at.parse().expect("timestamp"),
        read: false,
        read_at: None,
        file_id: None,
        filetype: None,
        filename: None,
    }
}

fn push_private(id: Option<i64>, from: i64, to: i64, body: &str, sent_at: &str) -> PushEvent {
    PushEvent::PrivateMessage {
        id: id.map(MessageId),
        from_id: UserId(from),
        to_id: UserId(to),
        sender: format!("user-{from}"),
        message: body.to_string(),
        timestamp: sent_at.parse().expect("timestamp"),
        file_id: None,
        filetype: None,
        filename: None,
    }
}

async fn expect_event(
    rx: &mut broadcast::Receiver<ClientEvent>,
    matches: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) => continue,
                Err(err) => panic!("event stream closed: {err}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[test]
fn decodes_a_raw_wire_push_frame() {
    let frame = r#"{
        "type": "private_message",
        "payload": {
            "from_id": 7,
            "to_id": 1,
            "sender": "alice",
            "message": "",
            "timestamp": "2024-01-01T10:00:00Z",
            "file_id": 4,
            "filetype": "image/png",
            "filename": "cat.png"
        }
    }"#;
    match serde_json::from_str::<PushEvent>(frame).expect("frame decodes") {
        PushEvent::PrivateMessage {
            id,
            from_id,
            file_id,
            filename,
            ..
        } => {
            assert_eq!(id, None);
            assert_eq!(from_id, UserId(7));
            assert_eq!(file_id, Some(FileId(4)));
            assert_eq!(filename.as_deref(), Some("cat.png"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn empty_send_is_rejected_before_any_network_call() {
    let (client, push) = connected_client("http://127.0.0.1:9").await;

    let err = client
        .send_message(ALICE, "   ", None)
        .await
        .expect_err("must fail");
    assert!(matches!(
        err.downcast_ref::<ClientError>(),
        Some(ClientError::EmptyMessage)
    ));
    assert!(push.sent().await.is_empty());
}

#[tokio::test]
async fn private_send_emits_a_structured_frame() {
    let (client, push) = connected_client("http://127.0.0.1:9").await;

    client
        .send_message(
            ALICE,
            "look at this",
            Some(AttachmentRef::IdRef {
                file_id: FileId(9),
                filetype: Some("image/png".to_string()),
                filename: Some("cat.png".to_string()),
            }),
        )
        .await
        .expect("send");

    match push.sent().await.as_slice() {
        [ClientPush::PrivateMessage {
            to,
            message,
            file_id,
            ..
        }] => {
            assert_eq!(*to, UserId(7));
            assert_eq!(message, "look at this");
            assert_eq!(*file_id, Some(FileId(9)));
        }
        other => panic!("unexpected frames: {other:?}"),
    }
}

#[tokio::test]
async fn group_send_requires_confirmed_membership() {
    let (client, push) = connected_client("http://127.0.0.1:9").await;

    client
        .handle_push(PushEvent::GroupInvite {
            group_id: TEAM,
            group_name: "Team".to_string(),
            inviter: "Bob".to_string(),
        })
        .await
        .expect("invite");
    client.respond_to_invite(TEAM, true).await.expect("accept");

    let err = client
        .send_message(ConversationKey::Group(TEAM), "too early", None)
        .await
        .expect_err("sending before confirmation must fail");
    assert!(matches!(
        err.downcast_ref::<ClientError>(),
        Some(ClientError::GroupNotJoined { group_id: 3 })
    ));
    assert!(matches!(
        push.sent().await.as_slice(),
        [ClientPush::GroupAccept { group_id }] if *group_id == TEAM
    ));

    client
        .handle_push(PushEvent::MemberJoined {
            group_id: Some(TEAM),
            uid: UserId(1),
            user: "me".to_string(),
        })
        .await
        .expect("confirmation");
    client
        .send_message(ConversationKey::Group(TEAM), "hello team", None)
        .await
        .expect("send after confirmation");

    assert!(matches!(
        push.sent().await.last(),
        Some(ClientPush::GroupMessage { group_id, message })
            if *group_id == TEAM && message == "hello team"
    ));
}

#[tokio::test]
async fn group_attachment_travels_inside_the_body() {
    let (client, push) = connected_client("http://127.0.0.1:9").await;

    client
        .handle_push(PushEvent::GroupCreated { group_id: TEAM })
        .await
        .expect("created");
    client
        .send_message(
            ConversationKey::Group(TEAM),
            "",
            Some(AttachmentRef::IdRef {
                file_id: FileId(12),
                filetype: Some("application/pdf".to_string()),
                filename: Some("notes.pdf".to_string()),
            }),
        )
        .await
        .expect("send");

    match push.sent().await.as_slice() {
        [ClientPush::GroupMessage { message, .. }] => {
            assert_eq!(message, "[fileid]12|application/pdf|notes.pdf");
        }
        other => panic!("unexpected frames: {other:?}"),
    }
}

#[tokio::test]
async fn echo_and_inbound_share_one_conversation() {
    let (client, _push) = connected_client("http://127.0.0.1:9").await;

    client
        .handle_push(push_private(Some(1), 1, 7, "hi alice", "2024-01-01T10:00:00Z"))
        .await
        .expect("echo");
    client
        .handle_push(push_private(Some(2), 7, 1, "hi back", "2024-01-01T10:00:05Z"))
        .await
        .expect("inbound");

    let conversation = client.snapshot(ALICE).await.expect("conversation");
    assert_eq!(conversation.messages().len(), 2);
    assert_eq!(conversation.messages()[0].body, "hi alice");
    assert_eq!(conversation.messages()[1].body, "hi back");
}

#[tokio::test]
async fn duplicate_push_ids_store_one_message() {
    let (client, _push) = connected_client("http://127.0.0.1:9").await;

    client
        .handle_push(push_private(Some(5), 7, 1, "once", "2024-01-01T10:00:00Z"))
        .await
        .expect("first");
    client
        .handle_push(push_private(Some(5), 7, 1, "once", "2024-01-01T10:00:00Z"))
        .await
        .expect("duplicate");

    let conversation = client.snapshot(ALICE).await.expect("conversation");
    assert_eq!(conversation.messages().len(), 1);
    assert_eq!(conversation.unread_count, 1);
}

#[tokio::test]
async fn read_receipt_via_push_is_idempotent() {
    let (client, _push) = connected_client("http://127.0.0.1:9").await;

    client
        .handle_push(push_private(Some(1), 1, 7, "mine", "2024-01-01T10:00:00Z"))
        .await
        .expect("echo");

    let receipt = PushEvent::MessagesRead {
        reader_id: UserId(7),
        timestamp: "2024-01-01T11:00:00Z".parse().expect("timestamp"),
    };
    client.handle_push(receipt.clone()).await.expect("receipt");
    let first = client.snapshot(ALICE).await.expect("conversation");

    client.handle_push(receipt).await.expect("receipt again");
    let second = client.snapshot(ALICE).await.expect("conversation");

    assert_eq!(first.messages(), second.messages());
    assert_eq!(
        second.messages()[0].read_at,
        Some("2024-01-01T11:00:00Z".parse().expect("timestamp"))
    );
}

#[tokio::test]
async fn invite_accept_flow_confirms_through_member_joined() {
    let (client, push) = connected_client("http://127.0.0.1:9").await;
    let mut rx = client.subscribe_events();

    client
        .handle_push(PushEvent::GroupInvite {
            group_id: TEAM,
            group_name: "Team".to_string(),
            inviter: "Bob".to_string(),
        })
        .await
        .expect("invite");

    let event = expect_event(&mut rx, |event| {
        matches!(event, ClientEvent::InviteReceived { .. })
    })
    .await;
    match event {
        ClientEvent::InviteReceived { invite } => {
            assert_eq!(invite.group_name, "Team");
            assert_eq!(invite.inviter, "Bob");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    client.respond_to_invite(TEAM, true).await.expect("accept");
    assert!(matches!(
        push.sent().await.as_slice(),
        [ClientPush::GroupAccept { group_id }] if *group_id == TEAM
    ));

    // Confirmation arrives on the old wire form without a group id.
    client
        .handle_push(PushEvent::MemberJoined {
            group_id: None,
            uid: UserId(1),
            user: "me".to_string(),
        })
        .await
        .expect("confirmation");

    let group = client.group(TEAM).await.expect("group");
    assert_eq!(group.membership, GroupMembership::Joined);
}

#[tokio::test]
async fn stale_history_is_discarded_on_rapid_switch() {
    let (server_url, state) = spawn_api_server().await;
    state
        .set_history(
            "friend:7",
            vec![history_row(1, 7, "from A", "2024-01-01T10:00:00Z")],
        )
        .await;
    state.set_delay("friend:7", 300).await;
    state
        .set_history(
            "friend:8",
            vec![history_row(2, 8, "from B", "2024-01-01T10:00:01Z")],
        )
        .await;

    let (client, _push) = connected_client(&server_url).await;

    let slow_client = Arc::clone(&client);
    let slow_select = tokio::spawn(async move { slow_client.select_conversation(Some(ALICE)).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    client
        .select_conversation(Some(BETH))
        .await
        .expect("select B");
    slow_select.await.expect("join").expect("select A settles");

    let alice = client.snapshot(ALICE).await.expect("conversation A");
    assert!(alice.messages().is_empty(), "A's stale history must not land");
    assert!(alice.last_loaded_at.is_none());

    let beth = client.snapshot(BETH).await.expect("conversation B");
    assert_eq!(beth.messages().len(), 1);
    assert_eq!(beth.messages()[0].body, "from B");

    // Only the applied selection acknowledged its reads.
    assert_eq!(state.mark_read_calls().await, vec![8]);
}

#[tokio::test]
async fn active_incoming_message_is_acknowledged_immediately() {
    let (server_url, state) = spawn_api_server().await;
    let (client, _push) = connected_client(&server_url).await;

    client
        .select_conversation(Some(ALICE))
        .await
        .expect("select");
    assert_eq!(state.mark_read_calls().await, vec![7]);

    client
        .handle_push(push_private(Some(1), 7, 1, "hi", "2024-01-01T10:00:00Z"))
        .await
        .expect("incoming");
    let conversation = client.snapshot(ALICE).await.expect("conversation");
    assert_eq!(conversation.unread_count, 0);
    assert_eq!(state.mark_read_calls().await, vec![7, 7]);

    // An inactive conversation accumulates unread and acknowledges nothing.
    client
        .handle_push(push_private(Some(2), 8, 1, "psst", "2024-01-01T10:00:01Z"))
        .await
        .expect("background");
    assert_eq!(
        client.snapshot(BETH).await.expect("conversation").unread_count,
        1
    );
    assert_eq!(state.mark_read_calls().await, vec![7, 7]);
}

#[tokio::test]
async fn unread_then_selection_loads_ordered_history_and_resets() {
    let (server_url, state) = spawn_api_server().await;
    state
        .set_history(
            "friend:7",
            vec![
                history_row(1, 7, "hi", "2024-01-01T10:00:00Z"),
                history_row(2, 7, "there", "2024-01-01T10:00:01Z"),
            ],
        )
        .await;

    let (client, _push) = connected_client(&server_url).await;

    client
        .handle_push(push_private(None, 7, 1, "hi", "2024-01-01T10:00:00Z"))
        .await
        .expect("first");
    client
        .handle_push(push_private(None, 7, 1, "there", "2024-01-01T10:00:01Z"))
        .await
        .expect("second");
    assert_eq!(
        client.snapshot(ALICE).await.expect("conversation").unread_count,
        2
    );

    client
        .select_conversation(Some(ALICE))
        .await
        .expect("select");

    let conversation = client.snapshot(ALICE).await.expect("conversation");
    assert_eq!(conversation.unread_count, 0);
    let bodies: Vec<&str> = conversation
        .messages()
        .iter()
        .map(|message| message.body.as_str())
        .collect();
    assert_eq!(bodies, vec!["hi", "there"]);
}

#[tokio::test]
async fn failed_history_fetch_leaves_prior_state_intact() {
    let (client, _push) = connected_client("http://127.0.0.1:9").await;

    client
        .handle_push(push_private(Some(1), 7, 1, "kept", "2024-01-01T10:00:00Z"))
        .await
        .expect("seed");
    client
        .select_conversation(Some(ALICE))
        .await
        .expect("select absorbs the fetch failure");

    let conversation = client.snapshot(ALICE).await.expect("conversation");
    assert_eq!(conversation.messages().len(), 1);
    assert_eq!(conversation.messages()[0].body, "kept");
}

#[tokio::test]
async fn load_friends_updates_roster_and_emits() {
    let (server_url, _state) = spawn_api_server().await;
    let (client, _push) = connected_client(&server_url).await;
    let mut rx = client.subscribe_events();

    let roster = client.load_friends().await.expect("load friends");
    assert_eq!(roster.friends.len(), 1);
    assert_eq!(roster.pending_received.len(), 1);

    let friends = client.friends().await;
    assert_eq!(friends[0].username, "alice");

    expect_event(&mut rx, |event| {
        matches!(event, ClientEvent::FriendsUpdated { .. })
    })
    .await;

    client.shutdown().await;
}

#[tokio::test]
async fn upload_returns_a_sendable_reference() {
    let (server_url, _state) = spawn_api_server().await;
    let (client, push) = connected_client(&server_url).await;

    let attachment = client
        .upload_attachment(
            ALICE,
            AttachmentUpload {
                filename: "todo.txt".to_string(),
                mime_type: Some("text/plain".to_string()),
                bytes: b"- write tests".to_vec(),
            },
        )
        .await
        .expect("upload");

    match &attachment {
        AttachmentRef::IdRef {
            file_id, filename, ..
        } => {
            assert_eq!(*file_id, FileId(77));
            assert_eq!(filename.as_deref(), Some("todo.txt"));
        }
        other => panic!("unexpected reference: {other:?}"),
    }

    client
        .send_message(ALICE, "", Some(attachment))
        .await
        .expect("send");
    assert!(matches!(
        push.sent().await.as_slice(),
        [ClientPush::PrivateMessage {
            file_id: Some(FileId(77)),
            ..
        }]
    ));
}

#[tokio::test]
async fn friend_requests_post_and_reload_the_roster() {
    let (server_url, state) = spawn_api_server().await;
    let (client, _push) = connected_client(&server_url).await;

    let found = client.search_users("car").await.expect("search");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].username, "carol");

    client
        .send_friend_request(found[0].id)
        .await
        .expect("request");
    client
        .accept_friend_request(UserId(9))
        .await
        .expect("accept");

    assert_eq!(state.friend_request_calls().await, vec![9, 9]);
    assert_eq!(client.friends().await.len(), 1);

    client.shutdown().await;
}

async fn handle_ws(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|mut socket| async move {
        let _ = socket
            .send(AxumWsMessage::Text("not json".to_string()))
            .await;
        let frame = serde_json::to_string(&PushEvent::PrivateMessage {
            id: Some(MessageId(1)),
            from_id: UserId(7),
            to_id: UserId(1),
            sender: "alice".to_string(),
            message: "over the wire".to_string(),
            timestamp: "2024-01-01T10:00:00Z".parse().expect("timestamp"),
            file_id: None,
            filetype: None,
            filename: None,
        })
        .expect("encode");
        let _ = socket.send(AxumWsMessage::Text(frame)).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
    })
}

#[tokio::test]
async fn connect_reads_push_frames_end_to_end() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new().route("/ws", get(handle_ws));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let settings = Settings {
        server_url: format!("http://{addr}"),
        ..Settings::default()
    };
    let client = ChatClient::new(settings);
    let mut rx = client.subscribe_events();
    client.connect(UserId(1), "me").await.expect("connect");
    assert!(client.is_connected().await);
    assert_eq!(client.identity().await, Some((UserId(1), "me".to_string())));

    // The garbage frame surfaces as an error event, the valid one lands.
    expect_event(&mut rx, |event| matches!(event, ClientEvent::Error(_))).await;
    expect_event(&mut rx, |event| {
        matches!(event, ClientEvent::ConversationUpdated { key } if *key == ALICE)
    })
    .await;

    let conversation = client.snapshot(ALICE).await.expect("conversation");
    assert_eq!(conversation.messages()[0].body, "over the wire");
    assert_eq!(conversation.unread_count, 1);

    client.shutdown().await;
}
