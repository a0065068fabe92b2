//! sqlite journal of committed state. The in-memory stores stay authoritative;
//! the journal only lets a restarted process pick up where it left off.

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::identity::Identity;
use crate::polls::{Poll, PollSnapshot};
use crate::rooms::Message;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    avatar_ref TEXT,
    last_active_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    room_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    sender_id TEXT NOT NULL,
    sender_name TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (room_id, seq)
);
CREATE TABLE IF NOT EXISTS polls (
    id TEXT PRIMARY KEY,
    seq INTEGER NOT NULL,
    version INTEGER NOT NULL,
    body TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0
);
";

/// Everything read back from the journal at boot.
#[derive(Debug, Default)]
pub struct Restored {
    pub identities: Vec<(Identity, OffsetDateTime)>,
    pub messages: Vec<Message>,
    pub polls: Vec<PollSnapshot>,
}

#[derive(Clone, Debug, Default)]
pub struct Journal {
    pool: Option<SqlitePool>,
}

impl Journal {
    /// A journal that remembers nothing.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // Each connection to an in-memory database is its own database.
        let max_connections = if url.contains(":memory:") { 1 } else { 16 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool: Some(pool) })
    }

    pub fn is_enabled(&self) -> bool {
        self.pool.is_some()
    }

    pub async fn record_identity(&self, identity: &Identity, last_active_at: OffsetDateTime) {
        let Some(pool) = &self.pool else { return };
        let result = sqlx::query(
            "INSERT INTO identities (id,display_name,avatar_ref,last_active_at) VALUES (?,?,?,?)
             ON CONFLICT(id) DO UPDATE SET
                display_name=excluded.display_name,
                avatar_ref=excluded.avatar_ref,
                last_active_at=excluded.last_active_at",
        )
        .bind(&identity.id)
        .bind(&identity.display_name)
        .bind(&identity.avatar_ref)
        .bind(timestamp(last_active_at))
        .execute(pool)
        .await;
        if let Err(e) = result {
            tracing::error!(identity_id = %identity.id, error = %e, "failed to journal identity");
        }
    }

    pub async fn record_message(&self, message: &Message) {
        let Some(pool) = &self.pool else { return };
        let result = sqlx::query(
            "INSERT OR IGNORE INTO messages (id,room_id,seq,sender_id,sender_name,content,created_at)
             VALUES (?,?,?,?,?,?,?)",
        )
        .bind(message.id.to_string())
        .bind(&message.room_id)
        .bind(message.seq as i64)
        .bind(&message.sender_id)
        .bind(&message.sender_name)
        .bind(&message.content)
        .bind(timestamp(message.created_at))
        .execute(pool)
        .await;
        if let Err(e) = result {
            tracing::error!(message_id = %message.id, error = %e, "failed to journal message");
        }
    }

    /// Upsert a poll. A write older than what is stored, or any write to a
    /// deleted poll, is ignored.
    pub async fn record_poll(&self, snapshot: &PollSnapshot) {
        let Some(pool) = &self.pool else { return };
        let body = match serde_json::to_string(&snapshot.poll) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(poll_id = %snapshot.poll.id, error = %e, "failed to encode poll");
                return;
            }
        };
        let result = sqlx::query(
            "INSERT INTO polls (id,seq,version,body) VALUES (?,?,?,?)
             ON CONFLICT(id) DO UPDATE SET version=excluded.version, body=excluded.body
             WHERE excluded.version > polls.version AND polls.deleted = 0",
        )
        .bind(snapshot.poll.id.to_string())
        .bind(snapshot.seq as i64)
        .bind(snapshot.version as i64)
        .bind(body)
        .execute(pool)
        .await;
        if let Err(e) = result {
            tracing::error!(poll_id = %snapshot.poll.id, error = %e, "failed to journal poll");
        }
    }

    /// Tombstone a deleted poll one version past its last snapshot, so vote
    /// writes still in flight for it cannot bring the row back.
    pub async fn remove_poll(&self, last: &PollSnapshot) {
        let Some(pool) = &self.pool else { return };
        let poll_id = last.poll.id;
        let result = sqlx::query(
            "INSERT INTO polls (id,seq,version,body,deleted) VALUES (?,?,?,'null',1)
             ON CONFLICT(id) DO UPDATE SET
                deleted=1,
                body=excluded.body,
                version=MAX(polls.version, excluded.version)",
        )
        .bind(poll_id.to_string())
        .bind(last.seq as i64)
        .bind(last.version as i64 + 1)
        .execute(pool)
        .await;
        if let Err(e) = result {
            tracing::error!(%poll_id, error = %e, "failed to tombstone journaled poll");
        }
    }

    pub async fn load(&self) -> Result<Restored, sqlx::Error> {
        let Some(pool) = &self.pool else {
            return Ok(Restored::default());
        };

        let identities: Vec<(String, String, Option<String>, String)> =
            sqlx::query_as("SELECT id,display_name,avatar_ref,last_active_at FROM identities")
                .fetch_all(pool)
                .await?;
        let messages: Vec<(String, String, i64, String, String, String, String)> = sqlx::query_as(
            "SELECT id,room_id,seq,sender_id,sender_name,content,created_at FROM messages
             ORDER BY room_id, seq",
        )
        .fetch_all(pool)
        .await?;
        let polls: Vec<(i64, i64, String)> =
            sqlx::query_as("SELECT seq,version,body FROM polls WHERE deleted = 0 ORDER BY seq")
                .fetch_all(pool)
                .await?;

        let mut restored = Restored::default();
        for (id, display_name, avatar_ref, last_active_at) in identities {
            let identity = Identity {
                id,
                display_name,
                avatar_ref,
            };
            restored.identities.push((identity, parse_timestamp(&last_active_at)?));
        }
        for (id, room_id, seq, sender_id, sender_name, content, created_at) in messages {
            restored.messages.push(Message {
                id: Uuid::parse_str(&id).map_err(decode_error)?,
                room_id,
                seq: seq as u64,
                sender_id,
                sender_name,
                content,
                created_at: parse_timestamp(&created_at)?,
            });
        }
        for (seq, version, body) in polls {
            let poll: Poll = serde_json::from_str(&body).map_err(decode_error)?;
            restored.polls.push(PollSnapshot {
                poll,
                seq: seq as u64,
                version: version as u64,
            });
        }

        tracing::info!(
            identities = restored.identities.len(),
            messages = restored.messages.len(),
            polls = restored.polls.len(),
            "journal loaded"
        );
        Ok(restored)
    }
}

fn timestamp(at: OffsetDateTime) -> String {
    // Rfc3339 only fails for years outside 0..=9999.
    at.format(&Rfc3339).unwrap_or_else(|_| at.unix_timestamp().to_string())
}

fn parse_timestamp(raw: &str) -> Result<OffsetDateTime, sqlx::Error> {
    OffsetDateTime::parse(raw, &Rfc3339).map_err(decode_error)
}

fn decode_error(e: impl std::error::Error + Send + Sync + 'static) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::polls::{NewPoll, PollEngine};
    use crate::rooms::{GLOBAL_ROOM, MessageBroker};

    async fn journal() -> Journal {
        Journal::connect("sqlite::memory:").await.unwrap()
    }

    fn new_poll() -> NewPoll {
        NewPoll {
            room_id: GLOBAL_ROOM.into(),
            question: "Lunch?".into(),
            description: Some("today".into()),
            options: vec!["yes".into(), "no".into()],
            allow_multiple_votes: false,
        }
    }

    #[tokio::test]
    async fn disabled_journal_loads_nothing() {
        let journal = Journal::disabled();
        journal.record_identity(&Identity::new("a", "A"), OffsetDateTime::now_utc()).await;
        let restored = journal.load().await.unwrap();
        assert!(restored.identities.is_empty());
        assert!(!journal.is_enabled());
    }

    #[tokio::test]
    async fn messages_round_trip() {
        let journal = journal().await;
        let broker = MessageBroker::new(100);
        let who = Identity::new("ann", "Ann");
        let first = broker.send(GLOBAL_ROOM, &who, "hi").unwrap();
        let second = broker.send(GLOBAL_ROOM, &who, "hey").unwrap();
        journal.record_message(&second).await;
        journal.record_message(&first).await;
        // Duplicates are ignored.
        journal.record_message(&first).await;

        let restored = journal.load().await.unwrap();
        let seqs: Vec<u64> = restored.messages.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(restored.messages[0], *first);
    }

    #[tokio::test]
    async fn stale_poll_versions_are_ignored() {
        let journal = journal().await;
        let engine = PollEngine::new();
        let created = engine.create(new_poll(), "host").unwrap();
        let option = created.poll.options[0].id;
        let voted = engine.vote(created.poll.id, "A", option).unwrap();

        journal.record_poll(&voted).await;
        journal.record_poll(&created).await;

        let restored = journal.load().await.unwrap();
        assert_eq!(restored.polls.len(), 1);
        assert_eq!(restored.polls[0].version, 2);
        assert_eq!(restored.polls[0].poll, voted.poll);

        let deleted = engine.delete(created.poll.id, "host").unwrap();
        journal.remove_poll(&deleted).await;
        assert!(journal.load().await.unwrap().polls.is_empty());
    }

    #[tokio::test]
    async fn late_vote_write_does_not_resurrect_a_deleted_poll() {
        let journal = journal().await;
        let engine = PollEngine::new();
        let created = engine.create(new_poll(), "host").unwrap();
        journal.record_poll(&created).await;

        // The vote commits in memory but its journal write is still pending
        // while the owner deletes the poll.
        let voted = engine.vote(created.poll.id, "A", created.poll.options[1].id).unwrap();
        let deleted = engine.delete(created.poll.id, "host").unwrap();
        journal.remove_poll(&deleted).await;
        journal.record_poll(&voted).await;
        journal.record_poll(&created).await;

        assert!(engine.is_empty());
        assert!(journal.load().await.unwrap().polls.is_empty());
    }

    #[tokio::test]
    async fn tombstone_written_before_the_create_still_wins() {
        let journal = journal().await;
        let engine = PollEngine::new();
        let created = engine.create(new_poll(), "host").unwrap();
        let deleted = engine.delete(created.poll.id, "host").unwrap();

        journal.remove_poll(&deleted).await;
        journal.record_poll(&created).await;
        assert!(journal.load().await.unwrap().polls.is_empty());
    }

    #[tokio::test]
    async fn identities_upsert() {
        let journal = journal().await;
        let mut who = Identity::new("ann", "Ann");
        journal.record_identity(&who, OffsetDateTime::now_utc()).await;
        who.display_name = "Annie".into();
        journal.record_identity(&who, OffsetDateTime::now_utc()).await;

        let restored = journal.load().await.unwrap();
        assert_eq!(restored.identities.len(), 1);
        assert_eq!(restored.identities[0].0.display_name, "Annie");
    }
}
