use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::polls::{PollEngine, PollSnapshot, PollStatus, percentage};
use crate::presence::{PresenceRegistry, PresenceStatus, UserPresence};
use crate::rooms::{Message, MessageBroker};

use super::csv::{CsvWriter, number};

pub const USERS_HEADER: &[&str] = &["id", "display_name", "avatar_ref", "status", "last_active_at"];
pub const MESSAGES_HEADER: &[&str] = &[
    "id",
    "room_id",
    "seq",
    "sender_id",
    "sender_name",
    "content",
    "created_at",
];
pub const POLLS_HEADER: &[&str] = &[
    "poll_id",
    "room_id",
    "question",
    "status",
    "created_by",
    "allow_multiple_votes",
    "created_at",
    "closed_at",
    "option_id",
    "option_text",
    "votes",
    "percentage",
];

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceStats {
    pub total: usize,
    pub active: usize,
    pub offline: usize,
    pub online_percentage: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollStats {
    pub total: usize,
    pub active: usize,
    pub total_votes: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Stats {
    pub presence: PresenceStats,
    pub polls: PollStats,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FullExport {
    #[serde(with = "time::serde::rfc3339")]
    pub exported_at: OffsetDateTime,
    pub stats: Stats,
    pub users: Vec<UserPresence>,
    pub messages: Vec<Arc<Message>>,
    pub polls: Vec<PollSnapshot>,
}

/// Read-only views over the live stores. Every read clones entries one lock
/// at a time; nothing here blocks writers for the length of an export.
pub struct ExportService {
    presence: Arc<PresenceRegistry>,
    broker: Arc<MessageBroker>,
    polls: Arc<PollEngine>,
}

impl ExportService {
    pub fn new(
        presence: Arc<PresenceRegistry>,
        broker: Arc<MessageBroker>,
        polls: Arc<PollEngine>,
    ) -> Self {
        Self {
            presence,
            broker,
            polls,
        }
    }

    pub fn presence_stats(&self) -> PresenceStats {
        presence_stats(&self.presence.users())
    }

    pub fn poll_stats(&self) -> PollStats {
        poll_stats(&self.polls.list())
    }

    pub fn stats(&self) -> Stats {
        Stats {
            presence: self.presence_stats(),
            polls: self.poll_stats(),
        }
    }

    pub fn users_csv(&self) -> String {
        let mut csv = CsvWriter::with_header(USERS_HEADER);
        for user in self.presence.users() {
            csv.row(&[
                user.id.as_str(),
                user.display_name.as_str(),
                user.avatar_ref.as_deref().unwrap_or_default(),
                user.status.as_str(),
                &timestamp(user.last_active_at),
            ]);
        }
        csv.finish()
    }

    pub fn messages_csv(&self) -> String {
        let mut csv = CsvWriter::with_header(MESSAGES_HEADER);
        for message in self.broker.all_messages() {
            csv.row(&[
                message.id.to_string().as_str(),
                &message.room_id,
                &message.seq.to_string(),
                &message.sender_id,
                &message.sender_name,
                &message.content,
                &timestamp(message.created_at),
            ]);
        }
        csv.finish()
    }

    /// One row per option, polls in listing order.
    pub fn polls_csv(&self) -> String {
        let mut csv = CsvWriter::with_header(POLLS_HEADER);
        for snapshot in self.polls.list() {
            let poll = &snapshot.poll;
            let total = poll.total_votes();
            let poll_id = poll.id.to_string();
            let created_at = timestamp(poll.created_at);
            let closed_at = poll.closed_at.map(timestamp).unwrap_or_default();
            for option in &poll.options {
                csv.row(&[
                    poll_id.as_str(),
                    &poll.room_id,
                    &poll.question,
                    poll.status.as_str(),
                    &poll.created_by,
                    if poll.allow_multiple_votes { "true" } else { "false" },
                    &created_at,
                    &closed_at,
                    &option.id.to_string(),
                    &option.text,
                    &option.votes.to_string(),
                    &number(percentage(option.votes, total)),
                ]);
            }
        }
        csv.finish()
    }

    pub fn full(&self) -> FullExport {
        let users = self.presence.users();
        let polls = self.polls.list();
        FullExport {
            exported_at: OffsetDateTime::now_utc(),
            stats: Stats {
                presence: presence_stats(&users),
                polls: poll_stats(&polls),
            },
            users,
            messages: self.broker.all_messages(),
            polls,
        }
    }
}

fn presence_stats(users: &[UserPresence]) -> PresenceStats {
    let total = users.len();
    let offline = users
        .iter()
        .filter(|u| u.status == PresenceStatus::Offline)
        .count();
    let active = total - offline;
    let online_percentage = if total == 0 {
        0.0
    } else {
        (active as f64 / total as f64 * 10_000.0).round() / 100.0
    };
    PresenceStats {
        total,
        active,
        offline,
        online_percentage,
    }
}

fn poll_stats(polls: &[PollSnapshot]) -> PollStats {
    PollStats {
        total: polls.len(),
        active: polls
            .iter()
            .filter(|p| p.poll.status == PollStatus::Active)
            .count(),
        total_votes: polls.iter().map(|p| u64::from(p.poll.total_votes())).sum(),
    }
}

fn timestamp(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_default()
}
