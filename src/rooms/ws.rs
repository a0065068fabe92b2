use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    debug_handler,
    extract::{Query, State, WebSocketUpgrade, ws::{Message, WebSocket}},
    response::Response,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use serde::Deserialize;

use crate::{
    AppResult,
    config::Config,
    connection::{Connection, ConnectionManager, Outbound, Reply},
    error::CoreError,
    identity::Identity,
};

use super::{MessageBroker, RoomId, validate_room_id};

/// Identity and initial rooms, as forwarded by the auth gateway.
#[derive(Debug, Deserialize)]
pub(crate) struct ConnectQuery {
    id: String,
    name: Option<String>,
    avatar: Option<String>,
    rooms: Option<String>,
}

impl ConnectQuery {
    fn identity(&self) -> Identity {
        let id = self.id.trim();
        Identity {
            id: id.to_owned(),
            display_name: self
                .name
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .unwrap_or(id)
                .to_owned(),
            avatar_ref: self.avatar.clone().filter(|a| !a.is_empty()),
        }
    }

    fn rooms(&self) -> Vec<RoomId> {
        self.rooms
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_owned)
            .collect()
    }
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn room_ws(
    State(manager): State<Arc<ConnectionManager>>,
    State(config): State<Arc<Config>>,
    State(broker): State<Arc<MessageBroker>>,
    Query(query): Query<ConnectQuery>,

    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let identity = query.identity();
    if identity.id.is_empty() {
        return Err(CoreError::invalid("identity id is empty").into());
    }
    let rooms = query.rooms();
    for room in &rooms {
        validate_room_id(room)?;
    }
    let new_rooms: HashSet<&RoomId> = rooms.iter().filter(|r| !broker.has_room(r)).collect();
    if new_rooms.len() > config.max_rooms_per_connection {
        return Err(CoreError::RoomLimit(config.max_rooms_per_connection).into());
    }

    let ping_every = config.heartbeat_interval;
    Ok(ws.on_upgrade(async move |socket| {
        let conn = match manager.on_connect(identity, &rooms).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "connection refused after upgrade");
                return;
            }
        };
        serve(manager, conn, socket, ping_every).await;
    }))
}

async fn serve(
    manager: Arc<ConnectionManager>,
    conn: Arc<Connection>,
    socket: WebSocket,
    ping_every: Duration,
) {
    let (sender, mut receiver) = socket.split();
    let mut writer = tokio::spawn(write_loop(
        Arc::clone(&manager),
        Arc::clone(&conn),
        sender,
        ping_every,
    ));
    let mut writer_done = false;

    loop {
        tokio::select! {
            _ = &mut writer => {
                writer_done = true;
                break;
            }
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let Some(reply) = manager.on_frame(&conn, text.as_str()).await else {
                        continue;
                    };
                    if let Err(e) = conn.reply(&reply) {
                        tracing::warn!(connection = %conn.id, error = %e, "client not reading replies");
                        break;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    conn.touch();
                    let reply = Reply::error("", None, CoreError::invalid("binary frames are not supported"));
                    if conn.reply(&reply).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => conn.touch(),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(connection = %conn.id, error = %e, "websocket read failed");
                    break;
                }
            }
        }
    }

    manager.on_disconnect(&conn).await;
    if !writer_done {
        // The closed outbox makes the writer send a close frame and return.
        let _ = writer.await;
    }
}

async fn write_loop(
    manager: Arc<ConnectionManager>,
    conn: Arc<Connection>,
    mut sender: SplitSink<WebSocket, Message>,
    ping_every: Duration,
) {
    let mut ping = tokio::time::interval(ping_every);
    ping.tick().await;

    loop {
        let msg = tokio::select! {
            next = conn.outbox().recv() => match next {
                Some(Outbound::Frame(text)) => Message::Text(text.to_string().into()),
                Some(Outbound::Resync) => {
                    tracing::debug!(connection = %conn.id, dropped = conn.outbox().dropped(), "sending resync");
                    Message::Text(manager.resync_frame(&conn).to_string().into())
                }
                None => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ping.tick() => Message::Ping(Bytes::new()),
        };

        if let Err(e) = sender.send(msg).await {
            tracing::debug!(connection = %conn.id, error = %e, "websocket write failed");
            break;
        }
    }
}
