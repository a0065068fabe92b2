//! Connection lifecycle, room subscriptions, event dispatch and fan-out.

mod events;
mod outbox;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::Config;
use crate::db::Journal;
use crate::error::{CoreError, CoreResult};
use crate::identity::{ConnectionId, Identity};
use crate::polls::{NewPoll, PollEngine, PollSnapshot};
use crate::presence::{PresenceRecord, PresenceRegistry, PresenceStatus, Transition};
use crate::rooms::{self, GLOBAL_ROOM, Message, MessageBroker, RoomId, validate_room_id};

pub use events::*;
pub use outbox::{Outbound, Outbox};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Open,
    Closing,
    Closed,
}

pub struct Connection {
    pub id: ConnectionId,
    pub identity: Identity,
    state: Mutex<ConnState>,
    rooms: Mutex<BTreeSet<RoomId>>,
    rooms_created: Mutex<usize>,
    outbox: Outbox,
    last_seen: Mutex<Instant>,
}

impl Connection {
    fn new(identity: Identity, queue: usize) -> Self {
        Self {
            id: ConnectionId::new(),
            identity,
            state: Mutex::new(ConnState::Connecting),
            rooms: Mutex::default(),
            rooms_created: Mutex::new(0),
            outbox: Outbox::new(queue),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock()
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn rooms(&self) -> Vec<RoomId> {
        self.rooms.lock().iter().cloned().collect()
    }

    /// Any sign of life from the client: a frame or a pong.
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock()
    }

    /// Queue a direct reply. Fails only when the client has stopped reading.
    pub fn reply(&self, reply: &Reply) -> CoreResult<()> {
        self.outbox.push_reply(reply.encode())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PresenceUpdate<'a> {
    identity_id: &'a str,
    status: PresenceStatus,
    #[serde(with = "time::serde::rfc3339")]
    last_active_at: OffsetDateTime,
}

impl<'a> From<&'a PresenceRecord> for PresenceUpdate<'a> {
    fn from(record: &'a PresenceRecord) -> Self {
        Self {
            identity_id: &record.identity_id,
            status: record.status,
            last_active_at: record.last_active_at,
        }
    }
}

#[derive(Serialize)]
struct Resync {
    presence: Vec<PresenceRecord>,
    polls: Vec<PollSnapshot>,
    rooms: BTreeMap<RoomId, Vec<Arc<Message>>>,
}

/// Store writes to hand to the journal once the in-memory commit is done.
enum Committed {
    Nothing,
    Identity(Identity, OffsetDateTime),
    Message(Arc<Message>),
    Poll(PollSnapshot),
    PollDeleted(PollSnapshot),
}

pub struct ConnectionManager {
    config: Arc<Config>,
    presence: Arc<PresenceRegistry>,
    broker: Arc<MessageBroker>,
    polls: Arc<PollEngine>,
    journal: Journal,
    connections: DashMap<ConnectionId, Arc<Connection>>,
    subscribers: DashMap<RoomId, HashSet<ConnectionId>>,
}

impl ConnectionManager {
    pub fn new(
        config: Arc<Config>,
        presence: Arc<PresenceRegistry>,
        broker: Arc<MessageBroker>,
        polls: Arc<PollEngine>,
        journal: Journal,
    ) -> Self {
        Self {
            config,
            presence,
            broker,
            polls,
            journal,
            connections: DashMap::new(),
            subscribers: DashMap::new(),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|c| Arc::clone(c.value()))
    }

    /// Accept a new connection: subscribe it to `global` plus `rooms` and mark
    /// its identity online.
    pub async fn on_connect(
        &self,
        identity: Identity,
        rooms: &[RoomId],
    ) -> CoreResult<Arc<Connection>> {
        if identity.id.trim().is_empty() {
            return Err(CoreError::invalid("identity id is empty"));
        }
        for room in rooms {
            validate_room_id(room)?;
        }
        let new_rooms: HashSet<&RoomId> = rooms.iter().filter(|r| !self.broker.has_room(r)).collect();
        if new_rooms.len() > self.config.max_rooms_per_connection {
            return Err(CoreError::RoomLimit(self.config.max_rooms_per_connection));
        }

        let conn = Arc::new(Connection::new(identity, self.config.outbound_queue));
        for room in rooms {
            self.open_room_for(&conn, room)?;
        }

        self.connections.insert(conn.id, Arc::clone(&conn));
        self.subscribe(&conn, GLOBAL_ROOM);
        for room in rooms {
            self.subscribe(&conn, room);
        }

        let transition = self.presence.register(&conn.identity, conn.id);
        *conn.state.lock() = ConnState::Open;
        tracing::info!(
            connection = %conn.id,
            identity_id = %conn.identity.id,
            rooms = ?conn.rooms(),
            "connection open"
        );
        self.announce(&transition);

        self.journal
            .record_identity(&conn.identity, transition.record.last_active_at)
            .await;
        Ok(conn)
    }

    /// Parse and handle one raw text frame.
    pub async fn on_frame(&self, conn: &Arc<Connection>, text: &str) -> Option<Reply> {
        match InboundFrame::parse(text) {
            Ok(frame) => {
                self.on_event(conn, &frame.event, frame.data, frame.reference)
                    .await
            }
            Err(e) => {
                if conn.state() != ConnState::Open {
                    return None;
                }
                conn.touch();
                tracing::debug!(connection = %conn.id, error = %e, "malformed frame");
                Some(Reply::error("", None, e))
            }
        }
    }

    /// Handle one inbound event. Returns the reply for the sender, or `None`
    /// when the event is dropped.
    pub async fn on_event(
        &self,
        conn: &Arc<Connection>,
        event: &str,
        data: Value,
        reference: Option<Value>,
    ) -> Option<Reply> {
        if conn.state() != ConnState::Open {
            tracing::trace!(connection = %conn.id, event, "event after close dropped");
            return None;
        }
        conn.touch();
        // A reaper sweep may release this connection after the state check
        // above; keying on the connection keeps that from reviving presence.
        if let Some(transition) = self.presence.touch(conn.id) {
            self.announce(&transition);
        }

        let decoded = match ClientEvent::decode(event, data) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => {
                tracing::warn!(connection = %conn.id, event, "unknown event ignored");
                return None;
            }
            Err(e) => return Some(Reply::error(event, reference, e)),
        };

        match self.dispatch(conn, decoded) {
            Ok((result, committed)) => {
                tracing::debug!(connection = %conn.id, event, "event handled");
                self.journal_commit(committed).await;
                Some(Reply::ack(event, reference, result))
            }
            Err(e) => {
                tracing::debug!(
                    connection = %conn.id,
                    event,
                    kind = ?e.kind(),
                    error = %e,
                    "event rejected"
                );
                Some(Reply::error(event, reference, e))
            }
        }
    }

    fn dispatch(&self, conn: &Connection, event: ClientEvent) -> CoreResult<(Value, Committed)> {
        let me = &conn.identity;
        match event {
            ClientEvent::Heartbeat(payload) => {
                check_identity(me, payload.identity_id.as_deref())?;
                let record = self
                    .presence
                    .get(&me.id)
                    .ok_or_else(|| CoreError::invalid("no presence record"))?;
                Ok((serde_json::to_value(&record)?, Committed::Nothing))
            }
            ClientEvent::SetStatus(payload) => {
                let transition = self
                    .presence
                    .set_connection_status(conn.id, payload.status)
                    .ok_or_else(|| CoreError::Transport("connection is closing".into()))?;
                self.announce(&transition);
                let at = transition.record.last_active_at;
                Ok((
                    serde_json::to_value(&transition.record)?,
                    Committed::Identity(me.clone(), at),
                ))
            }
            ClientEvent::SendMessage(payload) => {
                let message = self.broker.send_with(&payload.room_id, me, &payload.content, |m| {
                    self.broadcast(&m.room_id, encode(MESSAGE_NEW, &**m));
                })?;
                Ok((serde_json::to_value(&*message)?, Committed::Message(message)))
            }
            ClientEvent::History(payload) => {
                let page: Vec<Arc<Message>> = self
                    .broker
                    .history(
                        &payload.room_id,
                        rooms::page_size(payload.limit),
                        payload.before_seq,
                    )?
                    .collect();
                Ok((serde_json::to_value(page)?, Committed::Nothing))
            }
            ClientEvent::JoinRoom(payload) => {
                self.open_room_for(conn, &payload.room_id)?;
                self.subscribe(conn, &payload.room_id);
                let recent: Vec<Arc<Message>> = self
                    .broker
                    .history(&payload.room_id, self.config.resync_history, None)?
                    .collect();
                let result = json!({ "roomId": payload.room_id, "messages": recent });
                Ok((result, Committed::Nothing))
            }
            ClientEvent::LeaveRoom(payload) => {
                if payload.room_id == GLOBAL_ROOM {
                    return Err(CoreError::invalid("cannot leave the global room"));
                }
                self.unsubscribe(conn, &payload.room_id);
                Ok((json!({ "roomId": payload.room_id }), Committed::Nothing))
            }
            ClientEvent::CreatePoll(payload) => {
                check_identity(me, payload.created_by.as_deref())?;
                let room_id = payload.room_id.unwrap_or_else(|| GLOBAL_ROOM.to_owned());
                if !self.broker.has_room(&room_id) {
                    return Err(CoreError::RoomNotFound(room_id));
                }
                let request = NewPoll {
                    room_id,
                    question: payload.question,
                    description: payload.description,
                    options: payload.options,
                    allow_multiple_votes: payload.allow_multiple_votes,
                };
                let snapshot = self.polls.create(request, &me.id)?;
                self.broadcast(&snapshot.poll.room_id, encode(POLL_CREATED, &snapshot));
                Ok((serde_json::to_value(&snapshot)?, Committed::Poll(snapshot)))
            }
            ClientEvent::Vote(payload) => {
                check_identity(me, payload.user_id.as_deref())?;
                let snapshot =
                    self.polls
                        .vote_with(payload.poll_id, &me.id, payload.option_id, |s| {
                            self.broadcast(&s.poll.room_id, encode(POLL_UPDATED, &s.tally()));
                        })?;
                Ok((serde_json::to_value(snapshot.tally())?, Committed::Poll(snapshot)))
            }
            ClientEvent::ClosePoll(payload) => {
                let snapshot = self.polls.close_with(payload.poll_id, &me.id, |s| {
                    let body = json!({ "pollId": s.poll.id });
                    self.broadcast(&s.poll.room_id, encode(POLL_CLOSED, &body));
                })?;
                Ok((serde_json::to_value(&snapshot)?, Committed::Poll(snapshot)))
            }
            ClientEvent::DeletePoll(payload) => {
                let snapshot = self.polls.delete_with(payload.poll_id, &me.id, |s| {
                    let body = json!({ "pollId": s.poll.id });
                    self.broadcast(&s.poll.room_id, encode(POLL_DELETED, &body));
                })?;
                let body = json!({ "pollId": snapshot.poll.id });
                Ok((body, Committed::PollDeleted(snapshot)))
            }
            ClientEvent::ListPolls => Ok((serde_json::to_value(self.polls.list())?, Committed::Nothing)),
        }
    }

    async fn journal_commit(&self, committed: Committed) {
        match committed {
            Committed::Nothing => {}
            Committed::Identity(identity, at) => self.journal.record_identity(&identity, at).await,
            Committed::Message(message) => self.journal.record_message(&message).await,
            Committed::Poll(snapshot) => self.journal.record_poll(&snapshot).await,
            Committed::PollDeleted(last) => self.journal.remove_poll(&last).await,
        }
    }

    /// Tear a connection down. Safe to call more than once and from any side.
    pub async fn on_disconnect(&self, conn: &Arc<Connection>) {
        {
            let mut state = conn.state.lock();
            if matches!(*state, ConnState::Closing | ConnState::Closed) {
                return;
            }
            *state = ConnState::Closing;
        }

        for room in conn.rooms() {
            self.unsubscribe(conn, &room);
        }
        self.connections.remove(&conn.id);
        let released = self.presence.release(conn.id);
        conn.outbox.close();
        *conn.state.lock() = ConnState::Closed;
        tracing::info!(connection = %conn.id, identity_id = %conn.identity.id, "connection closed");

        if let Some(transition) = released {
            self.announce(&transition);
            self.journal
                .record_identity(&conn.identity, transition.record.last_active_at)
                .await;
        }
    }

    /// Open `room_id`, charging the connection if the room is new.
    fn open_room_for(&self, conn: &Connection, room_id: &str) -> CoreResult<()> {
        validate_room_id(room_id)?;
        if self.broker.has_room(room_id) {
            return Ok(());
        }
        let mut created = conn.rooms_created.lock();
        let limit = self.config.max_rooms_per_connection;
        if *created >= limit {
            tracing::debug!(connection = %conn.id, room_id, limit, "room limit reached");
            return Err(CoreError::RoomLimit(limit));
        }
        if self.broker.open_room(room_id)? {
            *created += 1;
        }
        Ok(())
    }

    fn subscribe(&self, conn: &Connection, room_id: &str) {
        conn.rooms.lock().insert(room_id.to_owned());
        self.subscribers
            .entry(room_id.to_owned())
            .or_default()
            .insert(conn.id);
    }

    fn unsubscribe(&self, conn: &Connection, room_id: &str) {
        conn.rooms.lock().remove(room_id);
        if let Some(mut subs) = self.subscribers.get_mut(room_id) {
            subs.remove(&conn.id);
        }
        self.subscribers.remove_if(room_id, |_, subs| subs.is_empty());
    }

    /// Queue `frame` for every subscriber of `room_id`. Never blocks.
    pub fn broadcast(&self, room_id: &str, frame: Arc<str>) -> usize {
        let targets: Vec<ConnectionId> = match self.subscribers.get(room_id) {
            Some(subs) => subs.iter().copied().collect(),
            None => return 0,
        };

        let mut delivered = 0;
        let mut stale = Vec::new();
        for id in targets {
            match self.connections.get(&id).map(|c| Arc::clone(c.value())) {
                Some(conn) if conn.outbox.push_broadcast(Arc::clone(&frame)) => delivered += 1,
                Some(_) => {}
                None => stale.push(id),
            }
        }

        if !stale.is_empty() {
            if let Some(mut subs) = self.subscribers.get_mut(room_id) {
                for id in &stale {
                    subs.remove(id);
                }
            }
        }
        delivered
    }

    fn announce(&self, transition: &Transition) {
        if transition.changed() {
            let update = PresenceUpdate::from(&transition.record);
            self.broadcast(GLOBAL_ROOM, encode(PRESENCE_UPDATE, &update));
        }
    }

    /// Full state a connection needs after it lost broadcasts.
    pub fn resync_frame(&self, conn: &Connection) -> Arc<str> {
        let mut rooms = BTreeMap::new();
        for room in conn.rooms() {
            if let Ok(page) = self.broker.history(&room, self.config.resync_history, None) {
                rooms.insert(room, page.collect());
            }
        }
        let resync = Resync {
            presence: self.presence.list_active().collect(),
            polls: self.polls.list(),
            rooms,
        };
        encode(RESYNC, &resync)
    }

    /// Release every connection silent for longer than the heartbeat timeout.
    pub async fn reap_idle(&self, now: Instant) -> usize {
        let timeout = self.config.heartbeat_timeout;
        let idle: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter(|c| now.saturating_duration_since(c.last_seen()) > timeout)
            .map(|c| Arc::clone(c.value()))
            .collect();

        for conn in &idle {
            tracing::info!(connection = %conn.id, identity_id = %conn.identity.id, "reaping idle connection");
            self.on_disconnect(conn).await;
        }
        idle.len()
    }

    pub fn start_reaper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let reaped = self.reap_idle(Instant::now()).await;
                if reaped > 0 {
                    tracing::debug!(reaped, "reaper sweep");
                }
            }
        })
    }
}

fn check_identity(me: &Identity, claimed: Option<&str>) -> CoreResult<()> {
    match claimed {
        Some(claimed) if claimed != me.id => Err(CoreError::IdentityMismatch(claimed.to_owned())),
        _ => Ok(()),
    }
}
