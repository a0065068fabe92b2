use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::identity::{Identity, IdentityId};

pub type RoomId = String;

/// The room every connection is subscribed to.
pub const GLOBAL_ROOM: &str = "global";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub room_id: RoomId,
    pub seq: u64,
    pub sender_id: IdentityId,
    pub sender_name: String,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Append-only log of one room. Sequence numbers start at 1 and never skip.
#[derive(Default)]
struct RoomLog {
    messages: Vec<Arc<Message>>,
}

impl RoomLog {
    fn next_seq(&self) -> u64 {
        self.messages.last().map_or(1, |m| m.seq + 1)
    }

    fn append(&mut self, room_id: &str, sender: &Identity, content: String) -> Arc<Message> {
        let mut created_at = OffsetDateTime::now_utc();
        if let Some(last) = self.messages.last() {
            // Wall clocks step backwards; commit order must not.
            created_at = created_at.max(last.created_at);
        }

        let message = Arc::new(Message {
            id: Uuid::now_v7(),
            room_id: room_id.to_owned(),
            seq: self.next_seq(),
            sender_id: sender.id.clone(),
            sender_name: sender.display_name.clone(),
            content,
            created_at,
        });
        self.messages.push(Arc::clone(&message));
        message
    }

    fn page(&self, limit: usize, before_seq: Option<u64>) -> Vec<Arc<Message>> {
        let end = match before_seq {
            Some(before) => self.messages.partition_point(|m| m.seq < before),
            None => self.messages.len(),
        };
        let start = end.saturating_sub(limit);
        self.messages[start..end].to_vec()
    }
}

/// Per-room message logs. Each room is its own serialization point.
pub struct MessageBroker {
    rooms: DashMap<RoomId, Arc<Mutex<RoomLog>>>,
    max_len: usize,
}

impl MessageBroker {
    pub fn new(max_len: usize) -> Self {
        let rooms = DashMap::new();
        rooms.insert(GLOBAL_ROOM.to_owned(), Arc::default());
        Self { rooms, max_len }
    }

    /// Make sure a room exists. Returns `true` if it was just created.
    pub fn open_room(&self, room_id: &str) -> CoreResult<bool> {
        validate_room_id(room_id)?;
        if self.rooms.contains_key(room_id) {
            return Ok(false);
        }
        let mut created = false;
        self.rooms.entry(room_id.to_owned()).or_insert_with(|| {
            created = true;
            Arc::default()
        });
        Ok(created)
    }

    pub fn has_room(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn rooms(&self) -> Vec<RoomId> {
        let mut ids: Vec<RoomId> = self.rooms.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    fn room(&self, room_id: &str) -> CoreResult<Arc<Mutex<RoomLog>>> {
        self.rooms
            .get(room_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| CoreError::RoomNotFound(room_id.to_owned()))
    }

    /// Validate and commit a message, assigning the room's next sequence number.
    pub fn send(&self, room_id: &str, sender: &Identity, content: &str) -> CoreResult<Arc<Message>> {
        self.send_with(room_id, sender, content, |_| {})
    }

    /// Like [`send`](Self::send), but `publish` runs while the room is still
    /// locked so fan-out happens in sequence order.
    pub fn send_with(
        &self,
        room_id: &str,
        sender: &Identity,
        content: &str,
        publish: impl FnOnce(&Arc<Message>),
    ) -> CoreResult<Arc<Message>> {
        if content.trim().is_empty() {
            return Err(CoreError::invalid("message content is empty"));
        }
        let len = content.chars().count();
        if len > self.max_len {
            return Err(CoreError::ContentTooLong {
                limit: self.max_len,
                actual: len,
            });
        }

        let room = self.room(room_id)?;
        let mut log = room.lock();
        let message = log.append(room_id, sender, content.to_owned());
        publish(&message);
        Ok(message)
    }

    /// Most recent first, strictly below `before_seq` when given.
    pub fn history(
        &self,
        room_id: &str,
        limit: usize,
        before_seq: Option<u64>,
    ) -> CoreResult<impl Iterator<Item = Arc<Message>> + use<>> {
        let room = self.room(room_id)?;
        let page = room.lock().page(limit, before_seq);
        Ok(page.into_iter().rev())
    }

    /// Every message of every room, ordered by room then sequence.
    pub fn all_messages(&self) -> Vec<Arc<Message>> {
        let rooms: Vec<(RoomId, Arc<Mutex<RoomLog>>)> = self
            .rooms
            .iter()
            .map(|r| (r.key().clone(), Arc::clone(r.value())))
            .collect();

        let mut all = Vec::new();
        for (_, room) in rooms {
            all.extend(room.lock().messages.iter().cloned());
        }
        all.sort_by(|a, b| a.room_id.cmp(&b.room_id).then(a.seq.cmp(&b.seq)));
        all
    }

    pub fn message_count(&self) -> usize {
        self.rooms.iter().map(|r| r.value().lock().messages.len()).sum()
    }

    /// Rebuild room logs from journaled messages.
    pub fn restore(&self, messages: impl IntoIterator<Item = Message>) {
        let mut by_room: std::collections::BTreeMap<RoomId, Vec<Message>> = Default::default();
        for message in messages {
            by_room.entry(message.room_id.clone()).or_default().push(message);
        }

        for (room_id, mut messages) in by_room {
            messages.sort_by_key(|m| m.seq);
            let room = Arc::clone(self.rooms.entry(room_id).or_default().value());
            let mut log = room.lock();
            for message in messages {
                if message.seq >= log.next_seq() {
                    log.messages.push(Arc::new(message));
                }
            }
        }
    }
}

pub(crate) fn validate_room_id(room_id: &str) -> CoreResult<()> {
    if room_id.is_empty() || room_id.len() > 64 {
        return Err(CoreError::invalid("room id must be 1..=64 bytes"));
    }
    if !room_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.'))
    {
        return Err(CoreError::invalid(format!("room id {room_id:?} has invalid characters")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn broker() -> MessageBroker {
        MessageBroker::new(20)
    }

    fn ann() -> Identity {
        Identity::new("ann", "Ann")
    }

    #[test]
    fn global_room_always_exists() {
        let broker = broker();
        assert!(broker.has_room(GLOBAL_ROOM));
        let msg = broker.send(GLOBAL_ROOM, &ann(), "hello").unwrap();
        assert_eq!(msg.seq, 1);
        assert_eq!(msg.sender_name, "Ann");
    }

    #[test]
    fn rejects_empty_and_oversized_content() {
        let broker = broker();
        assert!(matches!(
            broker.send(GLOBAL_ROOM, &ann(), "   "),
            Err(CoreError::Validation(_))
        ));
        assert_eq!(
            broker.send(GLOBAL_ROOM, &ann(), &"x".repeat(21)).unwrap_err(),
            CoreError::ContentTooLong { limit: 20, actual: 21 }
        );
        // Limit counts characters, not bytes.
        assert!(broker.send(GLOBAL_ROOM, &ann(), &"é".repeat(20)).is_ok());
    }

    #[test]
    fn content_is_kept_as_sent() {
        let broker = broker();
        let msg = broker.send(GLOBAL_ROOM, &ann(), "  hi  ").unwrap();
        assert_eq!(msg.content, "  hi  ");
        let page: Vec<Arc<Message>> = broker.history(GLOBAL_ROOM, 1, None).unwrap().collect();
        assert_eq!(page[0].content, "  hi  ");
    }

    #[test]
    fn unknown_room_is_not_found() {
        let broker = broker();
        assert_eq!(
            broker.send("nope", &ann(), "hi").unwrap_err(),
            CoreError::RoomNotFound("nope".into())
        );
        assert!(broker.history("nope", 10, None).is_err());
    }

    #[test]
    fn open_room_validates_ids() {
        let broker = broker();
        assert!(broker.open_room("event-42").unwrap());
        assert!(!broker.open_room("event-42").unwrap());
        assert!(broker.open_room("").is_err());
        assert!(broker.open_room("has space").is_err());
    }

    #[test]
    fn rooms_number_independently() {
        let broker = broker();
        broker.open_room("a").unwrap();
        broker.send("a", &ann(), "one").unwrap();
        broker.send(GLOBAL_ROOM, &ann(), "one").unwrap();
        let second = broker.send("a", &ann(), "two").unwrap();
        assert_eq!(second.seq, 2);
        assert_eq!(broker.message_count(), 3);
    }

    #[test]
    fn history_pages_backwards() {
        let broker = broker();
        for i in 1..=5 {
            broker.send(GLOBAL_ROOM, &ann(), &format!("m{i}")).unwrap();
        }

        let seqs = |it: Vec<Arc<Message>>| it.iter().map(|m| m.seq).collect::<Vec<_>>();

        let first: Vec<_> = broker.history(GLOBAL_ROOM, 2, None).unwrap().collect();
        assert_eq!(seqs(first), vec![5, 4]);

        let next: Vec<_> = broker.history(GLOBAL_ROOM, 2, Some(4)).unwrap().collect();
        assert_eq!(seqs(next), vec![3, 2]);

        let again: Vec<_> = broker.history(GLOBAL_ROOM, 2, Some(4)).unwrap().collect();
        assert_eq!(seqs(again), vec![3, 2]);

        let tail: Vec<_> = broker.history(GLOBAL_ROOM, 10, Some(2)).unwrap().collect();
        assert_eq!(seqs(tail), vec![1]);
    }

    #[test]
    fn created_at_follows_sequence() {
        let broker = broker();
        let a = broker.send(GLOBAL_ROOM, &ann(), "hi").unwrap();
        let b = broker.send(GLOBAL_ROOM, &Identity::new("bo", "Bo"), "hey").unwrap();
        assert!(a.seq < b.seq);
        assert!(a.created_at <= b.created_at);
    }

    #[test]
    fn concurrent_senders_get_gap_free_sequence() {
        let broker = Arc::new(MessageBroker::new(100));
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let broker = Arc::clone(&broker);
                std::thread::spawn(move || {
                    let who = Identity::new(format!("u{n}"), format!("U{n}"));
                    for i in 0..50 {
                        broker.send(GLOBAL_ROOM, &who, &format!("{n}/{i}")).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let all: Vec<_> = broker.history(GLOBAL_ROOM, 1000, None).unwrap().collect();
        assert_eq!(all.len(), 400);
        let seqs: HashSet<u64> = all.iter().map(|m| m.seq).collect();
        assert_eq!(seqs.len(), 400);
        assert_eq!(*seqs.iter().max().unwrap(), 400);
        assert!(all.windows(2).all(|w| w[0].seq == w[1].seq + 1));
    }

    #[test]
    fn restore_keeps_sequence_going() {
        let broker = broker();
        let source = MessageBroker::new(20);
        source.open_room("r").unwrap();
        source.send("r", &ann(), "a").unwrap();
        source.send("r", &ann(), "b").unwrap();

        broker.restore(source.all_messages().iter().map(|m| (**m).clone()));
        let next = broker.send("r", &ann(), "c").unwrap();
        assert_eq!(next.seq, 3);
    }
}
