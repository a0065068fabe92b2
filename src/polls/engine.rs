use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

use super::poll::{NewPoll, Poll, PollTally};

/// A copy of a poll taken under its lock, tagged with its position and version.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollSnapshot {
    #[serde(flatten)]
    pub poll: Poll,
    /// Engine-wide creation order; breaks listing ties.
    #[serde(skip)]
    pub seq: u64,
    /// Bumped on every committed mutation.
    #[serde(skip)]
    pub version: u64,
}

impl PollSnapshot {
    pub fn tally(&self) -> PollTally {
        self.poll.tally()
    }
}

struct PollEntry {
    poll: Poll,
    seq: u64,
    version: u64,
    // Set under the lock before removal so in-flight writers see it.
    deleted: bool,
}

impl PollEntry {
    fn snapshot(&self) -> PollSnapshot {
        PollSnapshot {
            poll: self.poll.clone(),
            seq: self.seq,
            version: self.version,
        }
    }
}

/// Arena of polls. Each poll has its own lock; different polls never contend.
#[derive(Default)]
pub struct PollEngine {
    polls: DashMap<Uuid, Arc<Mutex<PollEntry>>>,
    next_seq: AtomicU64,
}

impl PollEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, poll_id: Uuid) -> CoreResult<Arc<Mutex<PollEntry>>> {
        self.polls
            .get(&poll_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or(CoreError::PollNotFound(poll_id))
    }

    /// Run `f` on the live poll under its lock; bump the version when it succeeds
    /// and hand the new snapshot to `publish` before the lock is released.
    fn mutate(
        &self,
        poll_id: Uuid,
        f: impl FnOnce(&mut Poll) -> CoreResult<()>,
        publish: impl FnOnce(&PollSnapshot),
    ) -> CoreResult<PollSnapshot> {
        let entry = self.entry(poll_id)?;
        let mut entry = entry.lock();
        if entry.deleted {
            return Err(CoreError::PollNotFound(poll_id));
        }
        f(&mut entry.poll)?;
        entry.version += 1;
        let snapshot = entry.snapshot();
        publish(&snapshot);
        Ok(snapshot)
    }

    pub fn create(&self, request: NewPoll, creator: &str) -> CoreResult<PollSnapshot> {
        let poll = Poll::from_request(request, creator)?;
        let entry = PollEntry {
            poll,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed) + 1,
            version: 1,
            deleted: false,
        };
        let snapshot = entry.snapshot();
        self.polls.insert(snapshot.poll.id, Arc::new(Mutex::new(entry)));
        Ok(snapshot)
    }

    pub fn vote(&self, poll_id: Uuid, voter: &str, option_id: Uuid) -> CoreResult<PollSnapshot> {
        self.vote_with(poll_id, voter, option_id, |_| {})
    }

    /// Vote, publishing the result in version order.
    pub fn vote_with(
        &self,
        poll_id: Uuid,
        voter: &str,
        option_id: Uuid,
        publish: impl FnOnce(&PollSnapshot),
    ) -> CoreResult<PollSnapshot> {
        self.mutate(poll_id, |poll| poll.apply_vote(voter, option_id), publish)
    }

    pub fn close(&self, poll_id: Uuid, requester: &str) -> CoreResult<PollSnapshot> {
        self.close_with(poll_id, requester, |_| {})
    }

    pub fn close_with(
        &self,
        poll_id: Uuid,
        requester: &str,
        publish: impl FnOnce(&PollSnapshot),
    ) -> CoreResult<PollSnapshot> {
        self.mutate(poll_id, |poll| poll.close(requester), publish)
    }

    /// Remove a poll. Returns its last snapshot.
    pub fn delete(&self, poll_id: Uuid, requester: &str) -> CoreResult<PollSnapshot> {
        self.delete_with(poll_id, requester, |_| {})
    }

    pub fn delete_with(
        &self,
        poll_id: Uuid,
        requester: &str,
        publish: impl FnOnce(&PollSnapshot),
    ) -> CoreResult<PollSnapshot> {
        let entry = self.entry(poll_id)?;
        let snapshot = {
            let mut entry = entry.lock();
            if entry.deleted {
                return Err(CoreError::PollNotFound(poll_id));
            }
            if entry.poll.created_by != requester {
                return Err(CoreError::NotOwner("delete"));
            }
            entry.deleted = true;
            let snapshot = entry.snapshot();
            publish(&snapshot);
            snapshot
        };
        self.polls.remove(&poll_id);
        Ok(snapshot)
    }

    pub fn get(&self, poll_id: Uuid) -> CoreResult<PollSnapshot> {
        let entry = self.entry(poll_id)?;
        let entry = entry.lock();
        if entry.deleted {
            return Err(CoreError::PollNotFound(poll_id));
        }
        Ok(entry.snapshot())
    }

    /// Every poll: active before closed, then newest first.
    pub fn list(&self) -> Vec<PollSnapshot> {
        let entries: Vec<Arc<Mutex<PollEntry>>> =
            self.polls.iter().map(|e| Arc::clone(e.value())).collect();

        let mut polls: Vec<PollSnapshot> = entries
            .iter()
            .filter_map(|entry| {
                let entry = entry.lock();
                (!entry.deleted).then(|| entry.snapshot())
            })
            .collect();
        polls.sort_by(|a, b| {
            b.poll
                .is_active()
                .cmp(&a.poll.is_active())
                .then_with(|| b.poll.created_at.cmp(&a.poll.created_at))
                .then_with(|| b.seq.cmp(&a.seq))
        });
        polls
    }

    pub fn len(&self) -> usize {
        self.polls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.polls.is_empty()
    }

    /// Reinstate journaled polls, keeping their order and versions.
    pub fn restore(&self, snapshots: impl IntoIterator<Item = PollSnapshot>) {
        for snapshot in snapshots {
            self.next_seq.fetch_max(snapshot.seq, Ordering::Relaxed);
            let entry = PollEntry {
                poll: snapshot.poll,
                seq: snapshot.seq,
                version: snapshot.version,
                deleted: false,
            };
            self.polls.insert(entry.poll.id, Arc::new(Mutex::new(entry)));
        }
    }
}
