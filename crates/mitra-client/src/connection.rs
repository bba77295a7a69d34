use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Notify, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use uuid::Uuid;

use mitra_types::events::{ClientCommand, ServerEvent};

use crate::config::ClientConfig;
use crate::error::ClientError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Where controllers push socket commands. Implemented by [`Connection`];
/// tests substitute a recorder.
pub trait CommandSink: Send + Sync {
    /// Queue a command for the server. Fails at once when offline.
    fn send_command(&self, cmd: ClientCommand) -> Result<(), ClientError>;
}

impl<T: CommandSink + ?Sized> CommandSink for Arc<T> {
    fn send_command(&self, cmd: ClientCommand) -> Result<(), ClientError> {
        (**self).send_command(cmd)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Room {
    Chat(Uuid),
    Attendance(Uuid),
}

impl Room {
    fn join_command(self) -> ClientCommand {
        match self {
            Room::Chat(event_id) => ClientCommand::JoinEventRoom { event_id },
            Room::Attendance(event_id) => ClientCommand::JoinAttendanceRoom { event_id },
        }
    }
}

enum Membership {
    Joined(Room),
    Left(Room),
}

impl Membership {
    fn of(cmd: &ClientCommand) -> Option<Self> {
        match *cmd {
            ClientCommand::JoinEventRoom { event_id } => Some(Self::Joined(Room::Chat(event_id))),
            ClientCommand::LeaveEventRoom { event_id } => Some(Self::Left(Room::Chat(event_id))),
            ClientCommand::JoinAttendanceRoom { event_id } => {
                Some(Self::Joined(Room::Attendance(event_id)))
            }
            ClientCommand::LeaveAttendanceRoom { event_id } => {
                Some(Self::Left(Room::Attendance(event_id)))
            }
            _ => None,
        }
    }
}

struct Inner {
    config: ClientConfig,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientCommand>>>,
    rooms: Mutex<HashSet<Room>>,
    events: broadcast::Sender<ServerEvent>,
    closing: AtomicBool,
    shutdown: Notify,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    /// Fresh outbound channel, pre-loaded with a join for every tracked room
    /// and then the commands that never reached the previous socket.
    fn install_channel(
        &self,
        backlog: Vec<ClientCommand>,
    ) -> mpsc::UnboundedReceiver<ClientCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        let joins = lock(&self.rooms)
            .iter()
            .map(|room| room.join_command())
            .collect::<Vec<_>>();
        for cmd in joins.into_iter().chain(backlog) {
            // rx is alive, so this cannot fail
            let _ = tx.send(cmd);
        }
        *lock(&self.outbound) = Some(tx);
        rx
    }

    /// Commands accepted by `send_command` that the socket never took. Joins
    /// and leaves are left out; the tracked room set already covers them.
    fn take_backlog(
        &self,
        unsent: Option<ClientCommand>,
        rx: &mut mpsc::UnboundedReceiver<ClientCommand>,
    ) -> Vec<ClientCommand> {
        lock(&self.outbound).take();
        let mut backlog: Vec<_> = unsent.into_iter().collect();
        while let Ok(cmd) = rx.try_recv() {
            backlog.push(cmd);
        }
        backlog.retain(|cmd| Membership::of(cmd).is_none());
        backlog
    }

    /// Reconnection gave up: surface each lost command to its event's
    /// listeners as a local error.
    fn report_undelivered(&self, backlog: Vec<ClientCommand>) {
        if !backlog.is_empty() {
            warn!("{} queued commands were never delivered", backlog.len());
        }
        for cmd in backlog {
            let _ = self.events.send(ServerEvent::Error {
                action: cmd.name().to_string(),
                event_id: Some(cmd.event_id()),
                code: "not_delivered".into(),
                message: "Connection lost before this was sent.".into(),
            });
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}

/// An owned socket connection. Nothing is global: whoever creates it passes
/// it to the controllers that need it and calls [`Connection::disconnect`]
/// when done.
pub struct Connection {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub fn new(config: ClientConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                config,
                state,
                outbound: Mutex::new(None),
                rooms: Mutex::new(HashSet::new()),
                events,
                closing: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Server events from now on. Slow receivers lose the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    /// Open the socket. A single attempt; reconnect backoff only applies once
    /// a connection has been established and then drops.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if self.state() != ConnectionState::Disconnected {
            return Ok(());
        }
        self.inner.closing.store(false, Ordering::SeqCst);
        self.inner.set_state(ConnectionState::Connecting);

        let ws = match open(&self.inner.config).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("Socket connect failed: {}", e);
                self.inner.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let rx = self.inner.install_channel(Vec::new());
        self.inner.set_state(ConnectionState::Connected);
        info!("Socket connected to {}", self.inner.config.base_url);

        let handle = tokio::spawn(drive(self.inner.clone(), ws, rx));
        *lock(&self.task) = Some(handle);
        Ok(())
    }

    /// Close the socket and forget every joined room.
    pub async fn disconnect(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.shutdown.notify_one();
        lock(&self.inner.outbound).take();
        lock(&self.inner.rooms).clear();

        let handle = lock(&self.task).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Socket task ended abnormally: {}", e);
            }
        }
        self.inner.set_state(ConnectionState::Disconnected);
        info!("Socket disconnected");
    }
}

impl CommandSink for Connection {
    fn send_command(&self, cmd: ClientCommand) -> Result<(), ClientError> {
        let membership = Membership::of(&cmd);
        {
            let outbound = lock(&self.inner.outbound);
            let tx = outbound.as_ref().ok_or(ClientError::Disconnected)?;
            tx.send(cmd).map_err(|_| ClientError::Disconnected)?;
        }
        match membership {
            Some(Membership::Joined(room)) => {
                lock(&self.inner.rooms).insert(room);
            }
            Some(Membership::Left(room)) => {
                lock(&self.inner.rooms).remove(&room);
            }
            None => {}
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.task).take() {
            handle.abort();
        }
    }
}

async fn open(config: &ClientConfig) -> Result<WsStream, ClientError> {
    match connect_async(config.socket_url()).await {
        Ok((ws, _)) => Ok(ws),
        Err(WsError::Http(response)) => Err(ClientError::from_status(
            response.status().as_u16(),
            None,
        )),
        Err(e) => Err(ClientError::Network(e.to_string())),
    }
}

enum Exit {
    /// The local side asked to close.
    Closed,
    /// The socket failed or the server went away, possibly while writing
    /// the carried command.
    Dropped(Option<ClientCommand>),
}

async fn drive(
    inner: Arc<Inner>,
    mut ws: WsStream,
    mut rx: mpsc::UnboundedReceiver<ClientCommand>,
) {
    loop {
        let unsent = match pump(&inner, &mut ws, &mut rx).await {
            Exit::Closed => break,
            Exit::Dropped(unsent) => unsent,
        };
        if inner.closing.load(Ordering::SeqCst) {
            break;
        }

        // sends fail fast until the socket is back
        let backlog = inner.take_backlog(unsent, &mut rx);
        inner.set_state(ConnectionState::Connecting);
        warn!("Socket dropped, reconnecting");

        match reconnect(&inner).await {
            Some(fresh) => {
                ws = fresh;
                info!("Socket reconnected, replaying {} queued commands", backlog.len());
                rx = inner.install_channel(backlog);
                inner.set_state(ConnectionState::Connected);
            }
            None => {
                inner.report_undelivered(backlog);
                break;
            }
        }
    }

    lock(&inner.outbound).take();
    inner.set_state(ConnectionState::Disconnected);
}

async fn reconnect(inner: &Inner) -> Option<WsStream> {
    let policy = inner.config.reconnect;
    let mut attempt = 1;
    while let Some(delay) = policy.delay_for(attempt) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inner.shutdown.notified() => return None,
        }
        if inner.closing.load(Ordering::SeqCst) {
            return None;
        }
        match open(&inner.config).await {
            Ok(ws) => return Some(ws),
            Err(e) => debug!("Reconnect attempt {} failed: {}", attempt, e),
        }
        attempt += 1;
    }
    warn!("Giving up after {} reconnect attempts", policy.max_attempts);
    None
}

async fn pump(
    inner: &Inner,
    ws: &mut WsStream,
    rx: &mut mpsc::UnboundedReceiver<ClientCommand>,
) -> Exit {
    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else {
                    let _ = ws.close(None).await;
                    return Exit::Closed;
                };
                let json = match serde_json::to_string(&cmd) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to encode {}: {}", cmd.name(), e);
                        continue;
                    }
                };
                debug!("-> {}", cmd.name());
                if let Err(e) = ws.send(WsMessage::text(json)).await {
                    warn!("Socket write failed: {}", e);
                    return Exit::Dropped(Some(cmd));
                }
            }
            frame = ws.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    match serde_json::from_str::<ServerEvent>(text.as_str()) {
                        Ok(event) => {
                            debug!("<- {}", event.name());
                            // no subscribers is fine
                            let _ = inner.events.send(event);
                        }
                        Err(e) => debug!("Ignoring unrecognised frame: {}", e),
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => return Exit::Dropped(None),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Socket read failed: {}", e);
                    return Exit::Dropped(None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sends_fail_while_disconnected() {
        let conn = Connection::new(ClientConfig::new("http://127.0.0.1:1", "token"));
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        let err = conn
            .send_command(ClientCommand::Typing {
                event_id: Uuid::new_v4(),
            })
            .unwrap_err();
        assert!(matches!(err, ClientError::Disconnected));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn failed_connect_returns_to_disconnected() {
        let conn = Connection::new(ClientConfig::new("http://127.0.0.1:1", "token"));
        assert!(conn.connect().await.is_err());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn joined_rooms_are_replayed_on_a_new_channel() {
        let conn = Connection::new(ClientConfig::new("http://localhost", "token"));
        let chat = Uuid::new_v4();
        let attendance = Uuid::new_v4();

        let mut first = conn.inner.install_channel(Vec::new());
        conn.send_command(ClientCommand::JoinEventRoom { event_id: chat })
            .unwrap();
        conn.send_command(ClientCommand::JoinAttendanceRoom {
            event_id: attendance,
        })
        .unwrap();
        conn.send_command(ClientCommand::LeaveAttendanceRoom {
            event_id: attendance,
        })
        .unwrap();
        assert_eq!(
            first.try_recv().unwrap(),
            ClientCommand::JoinEventRoom { event_id: chat }
        );

        let mut second = conn.inner.install_channel(Vec::new());
        assert_eq!(
            second.try_recv().unwrap(),
            ClientCommand::JoinEventRoom { event_id: chat }
        );
        assert!(second.try_recv().is_err());
    }

    #[test]
    fn queued_commands_survive_a_dropped_socket() {
        let conn = Connection::new(ClientConfig::new("http://localhost", "token"));
        let event_id = Uuid::new_v4();
        let send = |text: &str| ClientCommand::SendMessage {
            event_id,
            text: Some(text.into()),
            attachment: None,
            reply_to_message_id: None,
        };

        let mut first = conn.inner.install_channel(Vec::new());
        conn.send_command(ClientCommand::JoinEventRoom { event_id })
            .unwrap();
        conn.send_command(send("two")).unwrap();
        conn.send_command(send("three")).unwrap();
        assert_eq!(
            first.try_recv().unwrap(),
            ClientCommand::JoinEventRoom { event_id }
        );
        let in_flight = first.try_recv().unwrap();

        // the write of "two" failed; "three" never left the channel
        let backlog = conn.inner.take_backlog(Some(in_flight), &mut first);
        assert_eq!(backlog, vec![send("two"), send("three")]);
        assert!(matches!(
            conn.send_command(send("four")),
            Err(ClientError::Disconnected)
        ));

        let mut second = conn.inner.install_channel(backlog);
        let replayed: Vec<_> = std::iter::from_fn(|| second.try_recv().ok()).collect();
        assert_eq!(
            replayed,
            vec![
                ClientCommand::JoinEventRoom { event_id },
                send("two"),
                send("three"),
            ]
        );
    }

    #[tokio::test]
    async fn undelivered_commands_become_local_errors() {
        let conn = Connection::new(ClientConfig::new("http://localhost", "token"));
        let mut events = conn.subscribe();
        let event_id = Uuid::new_v4();

        conn.inner.report_undelivered(vec![ClientCommand::EditMessage {
            event_id,
            message_id: Uuid::new_v4(),
            text: "fixed".into(),
        }]);
        match events.recv().await.unwrap() {
            ServerEvent::Error {
                action,
                event_id: target,
                code,
                ..
            } => {
                assert_eq!(action, "editMessage");
                assert_eq!(target, Some(event_id));
                assert_eq!(code, "not_delivered");
            }
            other => panic!("expected error, got {other:?}"),
        }
    }
}
