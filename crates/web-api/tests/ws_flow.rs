mod support;

use std::time::Duration;

use domain::{PostId, Room};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{net::TcpStream, time::timeout};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as TungsteniteMessage, MaybeTlsStream, WebSocketStream,
};

use support::{spawn_server, TestServer};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Frame {
    Event(Value),
    Close(u16),
}

async fn next_frame(socket: &mut Socket, wait: Duration) -> Option<Frame> {
    loop {
        let message = timeout(wait, socket.next()).await.ok()??;
        match message {
            Ok(TungsteniteMessage::Text(text)) => {
                return Some(Frame::Event(
                    serde_json::from_str(text.as_str()).expect("event json"),
                ))
            }
            Ok(TungsteniteMessage::Close(frame)) => {
                return Some(Frame::Close(frame.map(|f| u16::from(f.code)).unwrap_or(0)))
            }
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

async fn next_event(socket: &mut Socket) -> Value {
    match next_frame(socket, Duration::from_secs(2)).await {
        Some(Frame::Event(event)) => event,
        Some(Frame::Close(code)) => panic!("unexpected close {code}"),
        None => panic!("no event received"),
    }
}

async fn expect_close(socket: &mut Socket) -> u16 {
    loop {
        match next_frame(socket, Duration::from_secs(2)).await {
            Some(Frame::Close(code)) => return code,
            Some(Frame::Event(_)) => continue,
            None => panic!("connection ended without close frame"),
        }
    }
}

async fn assert_silent(socket: &mut Socket) {
    if let Some(Frame::Event(event)) = next_frame(socket, Duration::from_millis(200)).await {
        panic!("unexpected event {event}");
    }
}

/// 等待注册表中的连接数变为 `expected`
async fn wait_for_connections(server: &TestServer, expected: usize) {
    for _ in 0..40 {
        if server.state.registry.stats().await.connections == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("registry never reached {expected} connections");
}

async fn open(url: &str) -> Socket {
    let (socket, _) = connect_async(url).await.expect("websocket connect");
    socket
}

#[tokio::test]
async fn welcome_arrives_first_and_ping_is_answered() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();
    let session = server.login(&client, server.alice.email).await;
    let token = session["accessToken"].as_str().expect("access token");

    let mut socket = open(&server.ws(token)).await;
    let welcome = next_event(&mut socket).await;
    assert_eq!(welcome["type"], "connected");
    assert_eq!(
        welcome["payload"]["userId"],
        server.alice.identity.user_id.to_string()
    );

    socket
        .send(TungsteniteMessage::Text(json!({"type": "ping"}).to_string().into()))
        .await
        .expect("send ping");
    let pong = next_event(&mut socket).await;
    assert_eq!(pong, json!({"type": "pong", "payload": {}}));

    // 未知类型和非法 JSON 被忽略，连接保持打开
    socket
        .send(TungsteniteMessage::Text(r#"{"type":"typing"}"#.into()))
        .await
        .expect("send unknown");
    socket
        .send(TungsteniteMessage::Text("{not json".into()))
        .await
        .expect("send garbage");
    socket
        .send(TungsteniteMessage::Text(json!({"type": "ping"}).to_string().into()))
        .await
        .expect("send ping");
    assert_eq!(next_event(&mut socket).await["type"], "pong");

    let stats = server.state.registry.stats().await;
    assert_eq!(stats.connections, 1);
}

#[tokio::test]
async fn missing_or_invalid_token_closes_with_policy_violation() {
    let server = spawn_server().await;

    let mut socket = open(&format!("ws://{}/ws", server.addr)).await;
    assert_eq!(expect_close(&mut socket).await, 1008);

    let mut socket = open(&server.ws("not.a.token")).await;
    assert_eq!(expect_close(&mut socket).await, 1008);

    assert_eq!(server.state.registry.stats().await.connections, 0);
}

#[tokio::test]
async fn post_created_reaches_community_except_author() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let alice = server.login(&client, server.alice.email).await;
    let bob = server.login(&client, server.bob.email).await;
    let moderator = server.login(&client, server.moderator.email).await;

    let mut alice_ws = open(&server.ws(alice["accessToken"].as_str().unwrap())).await;
    let mut bob_ws = open(&server.ws(bob["accessToken"].as_str().unwrap())).await;
    let mut mod_ws = open(&server.ws(moderator["accessToken"].as_str().unwrap())).await;
    for socket in [&mut alice_ws, &mut bob_ws, &mut mod_ws] {
        assert_eq!(next_event(socket).await["type"], "connected");
    }

    let post = json!({"id": "p-1", "title": "Block party on Saturday"});
    let delivered = server
        .state
        .fanout
        .publish_post_created(server.community, server.alice.identity.user_id, post.clone())
        .await;
    assert_eq!(delivered, 1);

    let event = next_event(&mut bob_ws).await;
    assert_eq!(event, json!({"type": "post.created", "payload": post}));
    assert_silent(&mut alice_ws).await;
    assert_silent(&mut mod_ws).await;

    let notified = server
        .state
        .fanout
        .publish_notification(server.bob.identity.user_id, json!({"text": "hi"}))
        .await;
    assert_eq!(notified, 1);
    assert_eq!(next_event(&mut bob_ws).await["type"], "notification");
}

#[tokio::test]
async fn joined_post_room_receives_comments() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let alice = server.login(&client, server.alice.email).await;
    let bob = server.login(&client, server.bob.email).await;
    let bob_token = bob["accessToken"].as_str().unwrap();

    let mut alice_ws = open(&server.ws(alice["accessToken"].as_str().unwrap())).await;
    let mut bob_ws = open(&server.ws(bob_token)).await;
    next_event(&mut alice_ws).await;
    next_event(&mut bob_ws).await;

    let post_id = PostId::random();
    let response = client
        .put(server.http(&format!("/api/v1/realtime/posts/{post_id}")))
        .bearer_auth(bob_token)
        .send()
        .await
        .expect("join post room");
    assert_eq!(response.status(), 204);

    let delivered = server
        .state
        .fanout
        .publish_comment_created(post_id, server.alice.identity.user_id, json!({"body": "+1"}))
        .await;
    assert_eq!(delivered, 1);
    assert_eq!(next_event(&mut bob_ws).await["type"], "comment.created");
    assert_silent(&mut alice_ws).await;

    let response = client
        .delete(server.http(&format!("/api/v1/realtime/posts/{post_id}")))
        .bearer_auth(bob_token)
        .send()
        .await
        .expect("leave post room");
    assert_eq!(response.status(), 204);

    let delivered = server
        .state
        .fanout
        .publish_comment_created(post_id, server.alice.identity.user_id, json!({"body": "+2"}))
        .await;
    assert_eq!(delivered, 0);
}

#[tokio::test]
async fn newer_connection_supersedes_older_one() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();
    let session = server.login(&client, server.alice.email).await;
    let token = session["accessToken"].as_str().unwrap();

    let mut first = open(&server.ws(token)).await;
    next_event(&mut first).await;
    let mut second = open(&server.ws(token)).await;
    next_event(&mut second).await;

    assert_eq!(expect_close(&mut first).await, 1000);

    let delivered = server
        .state
        .fanout
        .publish_notification(server.alice.identity.user_id, json!({"text": "still here"}))
        .await;
    assert_eq!(delivered, 1);
    assert_eq!(next_event(&mut second).await["type"], "notification");

    // 旧连接的清理不能移除新连接
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.state.registry.stats().await.connections, 1);
}

#[tokio::test]
async fn client_close_removes_connection_from_every_room() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let alice = server.login(&client, server.alice.email).await;
    let bob = server.login(&client, server.bob.email).await;
    let bob_token = bob["accessToken"].as_str().unwrap();

    let mut alice_ws = open(&server.ws(alice["accessToken"].as_str().unwrap())).await;
    let mut bob_ws = open(&server.ws(bob_token)).await;
    next_event(&mut alice_ws).await;
    next_event(&mut bob_ws).await;

    let post_id = PostId::random();
    let response = client
        .put(server.http(&format!("/api/v1/realtime/posts/{post_id}")))
        .bearer_auth(bob_token)
        .send()
        .await
        .expect("join post room");
    assert_eq!(response.status(), 204);
    assert_eq!(
        server.state.registry.room_members(Room::Post(post_id)).await.len(),
        1
    );

    bob_ws.close(None).await.expect("close bob");
    wait_for_connections(&server, 1).await;

    let bob_id = server.bob.identity.user_id;
    assert!(server.state.registry.rooms_of(bob_id).await.is_empty());
    assert!(server
        .state
        .registry
        .room_members(Room::Post(post_id))
        .await
        .is_empty());
    let community = server
        .state
        .registry
        .room_members(Room::Community(server.community))
        .await;
    assert_eq!(community.len(), 1);
    assert!(community.iter().all(|handle| handle.user_id != bob_id));

    alice_ws.close(None).await.expect("close alice");
    wait_for_connections(&server, 0).await;
    let stats = server.state.registry.stats().await;
    assert_eq!(stats.rooms, 0);
    assert!(server
        .state
        .registry
        .room_members(Room::Community(server.community))
        .await
        .is_empty());
}

#[tokio::test]
async fn realtime_stats_requires_moderator() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let resident = server.login(&client, server.alice.email).await;
    let response = client
        .get(server.http("/api/v1/realtime/stats"))
        .bearer_auth(resident["accessToken"].as_str().unwrap())
        .send()
        .await
        .expect("stats as resident");
    assert_eq!(response.status(), 403);
    let body: Value = response.json().await.expect("error json");
    assert_eq!(body["code"], "FORBIDDEN");

    let response = client
        .get(server.http("/api/v1/realtime/stats"))
        .send()
        .await
        .expect("stats without token");
    assert_eq!(response.status(), 401);

    let moderator = server.login(&client, server.moderator.email).await;
    let response = client
        .get(server.http("/api/v1/realtime/stats"))
        .bearer_auth(moderator["accessToken"].as_str().unwrap())
        .send()
        .await
        .expect("stats as moderator");
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.expect("stats json");
    assert_eq!(body["connections"], 0);
    assert_eq!(body["rooms"], 0);
}
