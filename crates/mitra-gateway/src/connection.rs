use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use mitra_types::api::Claims;
use mitra_types::events::{ClientCommand, ServerEvent};

use crate::actions::chat::SendRequest;
use crate::actions::{Actions, Caller};
use crate::error::ActionError;

/// Ping cadence. With the defaults the server pings every 15 seconds and
/// drops a connection after 2 consecutive missed pongs (~30s).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub interval: Duration,
    pub max_missed: u8,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            max_missed: 2,
        }
    }
}

/// Drive an authenticated socket until it closes or stops answering pings.
/// The token was validated at the HTTP upgrade.
pub async fn handle_connection(
    socket: WebSocket,
    actions: Actions,
    claims: Claims,
    heartbeat: Heartbeat,
) {
    let (mut sender, mut receiver) = socket.split();
    let dispatcher = actions.dispatcher().clone();
    let (conn_id, mut outbound) = dispatcher.register(claims.sub).await;
    let caller = Caller::from_claims(&claims, Some(conn_id));

    info!("{} ({}) connected [conn={}]", claims.username, claims.sub, conn_id);

    dispatcher
        .send_to(
            conn_id,
            &ServerEvent::Ready {
                user_id: claims.sub,
                username: claims.username.clone(),
                role: claims.role,
            },
        )
        .await;

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Outbound frames + heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat.interval);
        ticker.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                frame = outbound.recv() => {
                    let Some(frame) = frame else { break };
                    if sender.send(Message::Text(frame.as_ref().into())).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= heartbeat.max_missed {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sender.close().await;
    });

    // Inbound commands
    let recv_actions = actions.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(cmd) => {
                        let action = cmd.name();
                        let event_id = cmd.event_id();
                        if let Err(e) = handle_command(&recv_actions, &caller, cmd).await {
                            report(&recv_actions, &caller, action, event_id, &e).await;
                        }
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            caller.username,
                            caller.user_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                        recv_actions
                            .dispatcher()
                            .send_to(
                                conn_id,
                                &ServerEvent::Error {
                                    action: "unknown".into(),
                                    event_id: None,
                                    code: "bad_command".into(),
                                    message: "unrecognized command".into(),
                                },
                            )
                            .await;
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    dispatcher.disconnect(conn_id).await;
    info!("{} ({}) disconnected [conn={}]", claims.username, claims.sub, conn_id);
}

async fn handle_command(actions: &Actions, caller: &Caller, cmd: ClientCommand) -> Result<(), ActionError> {
    debug!("{} ({}) -> {}", caller.username, caller.user_id, cmd.name());

    match cmd {
        ClientCommand::JoinEventRoom { event_id } => actions.join_chat(caller, event_id).await,

        ClientCommand::LeaveEventRoom { event_id } => actions.leave_chat(caller, event_id).await,

        ClientCommand::SendMessage {
            event_id,
            text,
            attachment,
            reply_to_message_id,
        } => {
            let req = SendRequest {
                text,
                attachment,
                reply_to: reply_to_message_id,
            };
            actions.send_message(caller, event_id, req).await?;
        }

        ClientCommand::EditMessage {
            event_id,
            message_id,
            text,
        } => {
            actions.edit_message(caller, event_id, message_id, text).await?;
        }

        ClientCommand::UnsendMessage { event_id, message_id } => {
            actions.unsend_message(caller, event_id, message_id).await?;
        }

        ClientCommand::PinMessage {
            event_id,
            message_id,
            pinned,
        } => {
            actions.pin_message(caller, event_id, message_id, pinned).await?;
        }

        ClientCommand::ReactToMessage {
            event_id,
            message_id,
            emoji,
        } => {
            actions.react_to_message(caller, event_id, message_id, emoji).await?;
        }

        ClientCommand::Typing { event_id } => actions.typing(caller, event_id).await?,

        ClientCommand::StopTyping { event_id } => actions.stop_typing(caller, event_id).await,

        ClientCommand::JoinAttendanceRoom { event_id } => {
            actions.join_attendance(caller, event_id).await?;
        }

        ClientCommand::LeaveAttendanceRoom { event_id } => {
            actions.leave_attendance(caller, event_id).await
        }
    }
    Ok(())
}

/// Failures go back to the initiating connection only.
async fn report(
    actions: &Actions,
    caller: &Caller,
    action: &str,
    event_id: Uuid,
    e: &ActionError,
) {
    warn!("{} ({}) {} rejected: {}", caller.username, caller.user_id, action, e);
    let Some(conn) = caller.conn else { return };
    actions
        .dispatcher()
        .send_to(
            conn,
            &ServerEvent::Error {
                action: action.to_string(),
                event_id: Some(event_id),
                code: e.code().to_string(),
                message: e.public_message(),
            },
        )
        .await;
}
