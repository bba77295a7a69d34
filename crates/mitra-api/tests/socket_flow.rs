mod common;

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use uuid::Uuid;

use mitra_gateway::{Heartbeat, RoomKey};
use mitra_types::events::{ClientCommand, ServerEvent};
use mitra_types::models::Role;

use common::{TestApp, TestUser, user};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(addr: SocketAddr, user: &TestUser) -> Ws {
    let (ws, _) = connect_async(format!("ws://{addr}/socket?token={}", user.token))
        .await
        .unwrap();
    ws
}

async fn send(ws: &mut Ws, cmd: ClientCommand) {
    let json = serde_json::to_string(&cmd).unwrap();
    ws.send(WsMessage::text(json)).await.unwrap();
}

async fn next_event(ws: &mut Ws) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    return serde_json::from_str::<ServerEvent>(text.as_str()).unwrap();
                }
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for an event")
}

#[tokio::test]
async fn connect_requires_a_valid_token() {
    let app = TestApp::new("http://localhost").await;
    let addr = app.serve().await;

    assert!(connect_async(format!("ws://{addr}/socket")).await.is_err());
    assert!(
        connect_async(format!("ws://{addr}/socket?token=garbage"))
            .await
            .is_err()
    );

    let asha = user("asha", Role::Volunteer);
    let mut ws = connect(addr, &asha).await;
    match next_event(&mut ws).await {
        ServerEvent::Ready { user_id, role, .. } => {
            assert_eq!(user_id, asha.id);
            assert_eq!(role, Role::Volunteer);
        }
        other => panic!("expected ready, got {other:?}"),
    }
}

#[tokio::test]
async fn messages_reach_every_member_and_errors_only_the_sender() {
    let app = TestApp::new("http://localhost").await;
    let addr = app.serve().await;
    let event_id = Uuid::new_v4();

    let asha = user("asha", Role::Volunteer);
    let ravi = user("ravi", Role::Volunteer);
    let mut a = connect(addr, &asha).await;
    let mut b = connect(addr, &ravi).await;
    next_event(&mut a).await;
    next_event(&mut b).await;

    // not joined yet
    send(
        &mut a,
        ClientCommand::SendMessage {
            event_id,
            text: Some("too early".into()),
            attachment: None,
            reply_to_message_id: None,
        },
    )
    .await;
    match next_event(&mut a).await {
        ServerEvent::Error {
            action,
            event_id: target,
            code,
            ..
        } => {
            assert_eq!(action, "sendMessage");
            assert_eq!(target, Some(event_id));
            assert_eq!(code, "not_joined");
        }
        other => panic!("expected error, got {other:?}"),
    }

    send(&mut a, ClientCommand::JoinEventRoom { event_id }).await;
    send(&mut b, ClientCommand::JoinEventRoom { event_id }).await;
    app.wait_for_members(RoomKey::Chat(event_id), 2).await;

    send(
        &mut a,
        ClientCommand::SendMessage {
            event_id,
            text: Some("hello".into()),
            attachment: None,
            reply_to_message_id: None,
        },
    )
    .await;

    let mine = next_event(&mut a).await;
    let theirs = next_event(&mut b).await;
    assert_eq!(mine, theirs);
    let ServerEvent::ReceiveMessage(message) = mine else {
        panic!("expected receiveMessage");
    };
    assert_eq!(message.text.as_deref(), Some("hello"));

    // a volunteer pinning is refused, and only the sender hears about it
    send(
        &mut b,
        ClientCommand::PinMessage {
            event_id,
            message_id: message.id,
            pinned: true,
        },
    )
    .await;
    assert!(matches!(
        next_event(&mut b).await,
        ServerEvent::Error { code, .. } if code == "forbidden"
    ));

    send(
        &mut a,
        ClientCommand::EditMessage {
            event_id,
            message_id: message.id,
            text: "hello all".into(),
        },
    )
    .await;
    match next_event(&mut a).await {
        ServerEvent::MessageEdited(edited) => assert_eq!(edited.edit_count, 1),
        other => panic!("expected messageEdited, got {other:?}"),
    }
    assert!(matches!(next_event(&mut b).await, ServerEvent::MessageEdited(_)));
}

#[tokio::test]
async fn disconnect_ends_typing_and_frees_rooms() {
    let app = TestApp::new("http://localhost").await;
    let addr = app.serve().await;
    let event_id = Uuid::new_v4();
    let room = RoomKey::Chat(event_id);

    let asha = user("asha", Role::Volunteer);
    let ravi = user("ravi", Role::Volunteer);
    let mut a = connect(addr, &asha).await;
    let mut b = connect(addr, &ravi).await;
    next_event(&mut a).await;
    next_event(&mut b).await;

    send(&mut a, ClientCommand::JoinEventRoom { event_id }).await;
    send(&mut b, ClientCommand::JoinEventRoom { event_id }).await;
    app.wait_for_members(room, 2).await;

    send(&mut a, ClientCommand::Typing { event_id }).await;
    match next_event(&mut b).await {
        ServerEvent::UserTyping { user_id, username, .. } => {
            assert_eq!(user_id, asha.id);
            assert_eq!(username, "asha");
        }
        other => panic!("expected userTyping, got {other:?}"),
    }

    a.close(None).await.unwrap();
    match next_event(&mut b).await {
        ServerEvent::UserStoppedTyping { user_id, .. } => assert_eq!(user_id, asha.id),
        other => panic!("expected userStoppedTyping, got {other:?}"),
    }
    app.wait_for_members(room, 1).await;
}

#[tokio::test]
async fn silent_clients_are_dropped_by_the_heartbeat() {
    let heartbeat = Heartbeat {
        interval: Duration::from_millis(200),
        max_missed: 2,
    };
    let app = TestApp::with_heartbeat("http://localhost", heartbeat).await;
    let addr = app.serve().await;
    let event_id = Uuid::new_v4();
    let room = RoomKey::Chat(event_id);

    let asha = user("asha", Role::Volunteer);
    let ravi = user("ravi", Role::Volunteer);
    let mut a = connect(addr, &asha).await;
    let mut b = connect(addr, &ravi).await;
    next_event(&mut b).await;

    // asha only writes; the pings she is sent are never read, so never answered
    send(&mut a, ClientCommand::JoinEventRoom { event_id }).await;
    send(&mut b, ClientCommand::JoinEventRoom { event_id }).await;
    app.wait_for_members(room, 2).await;
    send(&mut a, ClientCommand::Typing { event_id }).await;

    let mut saw_typing = false;
    let stopped = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(msg)) = b.next().await {
            match msg {
                WsMessage::Ping(payload) => {
                    b.send(WsMessage::Pong(payload)).await.unwrap();
                }
                WsMessage::Text(text) => {
                    match serde_json::from_str::<ServerEvent>(text.as_str()).unwrap() {
                        ServerEvent::UserTyping { user_id, .. } if user_id == asha.id => {
                            saw_typing = true;
                        }
                        ServerEvent::UserStoppedTyping { user_id, .. } if user_id == asha.id => {
                            return true;
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }
        false
    })
    .await
    .expect("silent client was never dropped");
    assert!(saw_typing);
    assert!(stopped);
    app.wait_for_members(room, 1).await;

    // ravi keeps answering and stays connected well past the timeout
    let keep_alive = tokio::time::timeout(Duration::from_millis(1000), async {
        while let Some(Ok(msg)) = b.next().await {
            if let WsMessage::Ping(payload) = msg {
                b.send(WsMessage::Pong(payload)).await.unwrap();
            }
        }
    })
    .await;
    assert!(keep_alive.is_err(), "responsive client was disconnected");
    assert_eq!(app.state.actions.dispatcher().room_size(room).await, 1);
    assert_eq!(app.state.actions.dispatcher().connection_count().await, 1);
}
