//! Who is connected right now.
//!
//! One record per identity regardless of how many sockets it holds open. The
//! registry never fails: unknown identities get a record on first touch.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::identity::{ConnectionId, Identity, IdentityId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Away => "away",
            Self::Offline => "offline",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub identity_id: IdentityId,
    pub connection_id: Option<ConnectionId>,
    pub status: PresenceStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub last_active_at: OffsetDateTime,
}

/// Identity joined with its presence, as shown in user listings and exports.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresence {
    pub id: IdentityId,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub status: PresenceStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub last_active_at: OffsetDateTime,
}

/// Result of a registry operation: the record afterwards and the status before.
#[derive(Clone, Debug)]
pub struct Transition {
    pub record: PresenceRecord,
    pub previous: Option<PresenceStatus>,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.previous != Some(self.record.status)
    }
}

struct Entry {
    identity: Identity,
    record: PresenceRecord,
    // Registration order; the last one is the most recently active.
    connections: Vec<ConnectionId>,
}

impl Entry {
    fn new(identity: Identity, now: OffsetDateTime) -> Self {
        let record = PresenceRecord {
            identity_id: identity.id.clone(),
            connection_id: None,
            status: PresenceStatus::Offline,
            last_active_at: now,
        };
        Self {
            identity,
            record,
            connections: Vec::new(),
        }
    }
}

#[derive(Default)]
pub struct PresenceRegistry {
    entries: DashMap<IdentityId, Entry>,
    owners: DashMap<ConnectionId, IdentityId>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, identity: &Identity, connection_id: ConnectionId) -> Transition {
        let now = OffsetDateTime::now_utc();
        let mut entry = self
            .entries
            .entry(identity.id.clone())
            .or_insert_with(|| Entry::new(identity.clone(), now));
        let previous = entry.record.status;

        // Newer identity details win; the collaborator owns them.
        entry.identity = identity.clone();
        entry.connections.retain(|c| *c != connection_id);
        entry.connections.push(connection_id);
        entry.record.connection_id = Some(connection_id);
        entry.record.status = PresenceStatus::Online;
        entry.record.last_active_at = now;
        self.owners.insert(connection_id, identity.id.clone());

        Transition {
            record: entry.record.clone(),
            previous: Some(previous),
        }
    }

    pub fn heartbeat(&self, identity_id: &str) -> Transition {
        let now = OffsetDateTime::now_utc();
        let mut created = false;
        let mut entry = self
            .entries
            .entry(identity_id.to_owned())
            .or_insert_with(|| {
                created = true;
                Entry::new(Identity::unknown(identity_id), now)
            });
        let previous = entry.record.status;

        entry.record.last_active_at = now;
        if previous == PresenceStatus::Offline {
            entry.record.status = PresenceStatus::Online;
        }

        Transition {
            record: entry.record.clone(),
            previous: (!created).then_some(previous),
        }
    }

    /// Explicit status from the client. `Offline` is only ever derived from connections.
    pub fn set_status(&self, identity_id: &str, status: PresenceStatus) -> Transition {
        let now = OffsetDateTime::now_utc();
        let mut entry = self
            .entries
            .entry(identity_id.to_owned())
            .or_insert_with(|| Entry::new(Identity::unknown(identity_id), now));
        let previous = entry.record.status;

        entry.record.last_active_at = now;
        if status != PresenceStatus::Offline {
            entry.record.status = status;
        }

        Transition {
            record: entry.record.clone(),
            previous: Some(previous),
        }
    }

    /// Heartbeat on behalf of one connection. Unlike [`heartbeat`](Self::heartbeat)
    /// this never creates or revives a record: once the connection has been
    /// released it returns `None` and leaves the identity alone.
    pub fn touch(&self, connection_id: ConnectionId) -> Option<Transition> {
        self.with_connection(connection_id, |record| {
            record.last_active_at = OffsetDateTime::now_utc();
            if record.status == PresenceStatus::Offline {
                record.status = PresenceStatus::Online;
            }
        })
    }

    /// [`set_status`](Self::set_status) for a connection that is still registered.
    pub fn set_connection_status(
        &self,
        connection_id: ConnectionId,
        status: PresenceStatus,
    ) -> Option<Transition> {
        self.with_connection(connection_id, |record| {
            record.last_active_at = OffsetDateTime::now_utc();
            if status != PresenceStatus::Offline {
                record.status = status;
            }
        })
    }

    fn with_connection(
        &self,
        connection_id: ConnectionId,
        update: impl FnOnce(&mut PresenceRecord),
    ) -> Option<Transition> {
        let identity_id = self.owners.get(&connection_id)?.value().clone();
        let mut entry = self.entries.get_mut(&identity_id)?;
        // `release` edits the connection list under this same entry lock.
        if !entry.connections.contains(&connection_id) {
            return None;
        }
        let previous = entry.record.status;
        update(&mut entry.record);
        if entry.record.connection_id.is_none() {
            entry.record.connection_id = Some(connection_id);
        }
        Some(Transition {
            record: entry.record.clone(),
            previous: Some(previous),
        })
    }

    /// Drop one connection. Returns `None` for a connection we never saw.
    pub fn release(&self, connection_id: ConnectionId) -> Option<Transition> {
        let (_, identity_id) = self.owners.remove(&connection_id)?;
        let mut entry = self.entries.get_mut(&identity_id)?;
        let previous = entry.record.status;

        entry.connections.retain(|c| *c != connection_id);
        match entry.connections.last().copied() {
            Some(remaining) => {
                if entry.record.connection_id == Some(connection_id) {
                    entry.record.connection_id = Some(remaining);
                }
            }
            None => {
                entry.record.connection_id = None;
                entry.record.status = PresenceStatus::Offline;
            }
        }

        Some(Transition {
            record: entry.record.clone(),
            previous: Some(previous),
        })
    }

    pub fn get(&self, identity_id: &str) -> Option<PresenceRecord> {
        self.entries.get(identity_id).map(|e| e.record.clone())
    }

    pub fn identity(&self, identity_id: &str) -> Option<Identity> {
        self.entries.get(identity_id).map(|e| e.identity.clone())
    }

    /// Everyone not offline, as of this call.
    pub fn list_active(&self) -> impl Iterator<Item = PresenceRecord> + use<> {
        let active: Vec<PresenceRecord> = self
            .entries
            .iter()
            .filter(|e| e.record.status != PresenceStatus::Offline)
            .map(|e| e.record.clone())
            .collect();
        active.into_iter()
    }

    pub fn users(&self) -> Vec<UserPresence> {
        let mut users: Vec<UserPresence> = self
            .entries
            .iter()
            .map(|e| UserPresence {
                id: e.identity.id.clone(),
                display_name: e.identity.display_name.clone(),
                avatar_ref: e.identity.avatar_ref.clone(),
                status: e.record.status,
                last_active_at: e.record.last_active_at,
            })
            .collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        users
    }

    /// Seed identities known from the journal; they start offline.
    pub fn restore(&self, identities: impl IntoIterator<Item = (Identity, OffsetDateTime)>) {
        for (identity, last_active_at) in identities {
            self.entries
                .entry(identity.id.clone())
                .or_insert_with(|| Entry::new(identity, last_active_at));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Identity {
        Identity::new("alice", "Alice")
    }

    #[test]
    fn register_marks_online() {
        let registry = PresenceRegistry::new();
        let conn = ConnectionId::new();
        let t = registry.register(&alice(), conn);

        assert!(t.changed());
        assert_eq!(t.record.status, PresenceStatus::Online);
        assert_eq!(t.record.connection_id, Some(conn));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn register_is_idempotent_per_connection() {
        let registry = PresenceRegistry::new();
        let conn = ConnectionId::new();
        registry.register(&alice(), conn);
        let again = registry.register(&alice(), conn);

        assert!(!again.changed());
        // A single release still takes the identity offline.
        let released = registry.release(conn).unwrap();
        assert_eq!(released.record.status, PresenceStatus::Offline);
    }

    #[test]
    fn second_connection_keeps_identity_online() {
        let registry = PresenceRegistry::new();
        let first = ConnectionId::new();
        let second = ConnectionId::new();
        registry.register(&alice(), first);
        registry.register(&alice(), second);

        let t = registry.release(second).unwrap();
        assert!(!t.changed());
        assert_eq!(t.record.status, PresenceStatus::Online);
        assert_eq!(t.record.connection_id, Some(first));

        let t = registry.release(first).unwrap();
        assert!(t.changed());
        assert_eq!(t.record.status, PresenceStatus::Offline);
        assert_eq!(t.record.connection_id, None);
    }

    #[test]
    fn release_unknown_connection_is_none() {
        let registry = PresenceRegistry::new();
        assert!(registry.release(ConnectionId::new()).is_none());
    }

    #[test]
    fn heartbeat_creates_unknown_identity() {
        let registry = PresenceRegistry::new();
        let t = registry.heartbeat("ghost");
        assert_eq!(t.record.status, PresenceStatus::Online);
        assert!(t.previous.is_none());
        assert_eq!(registry.identity("ghost").unwrap().display_name, "ghost");
    }

    #[test]
    fn heartbeat_does_not_override_away() {
        let registry = PresenceRegistry::new();
        registry.register(&alice(), ConnectionId::new());
        registry.set_status("alice", PresenceStatus::Away);

        let t = registry.heartbeat("alice");
        assert!(!t.changed());
        assert_eq!(t.record.status, PresenceStatus::Away);
    }

    #[test]
    fn touch_after_release_leaves_identity_offline() {
        let registry = PresenceRegistry::new();
        let conn = ConnectionId::new();
        registry.register(&alice(), conn);
        registry.release(conn);

        assert!(registry.touch(conn).is_none());
        assert!(registry.set_connection_status(conn, PresenceStatus::Away).is_none());
        let record = registry.get("alice").unwrap();
        assert_eq!(record.status, PresenceStatus::Offline);
        assert_eq!(record.connection_id, None);
        assert_eq!(registry.list_active().count(), 0);
    }

    #[test]
    fn touch_refreshes_a_live_connection() {
        let registry = PresenceRegistry::new();
        let conn = ConnectionId::new();
        let registered = registry.register(&alice(), conn);
        registry.set_connection_status(conn, PresenceStatus::Away).unwrap();

        let t = registry.touch(conn).unwrap();
        assert!(!t.changed());
        assert_eq!(t.record.status, PresenceStatus::Away);
        assert_eq!(t.record.connection_id, Some(conn));
        assert!(t.record.last_active_at >= registered.record.last_active_at);
        assert!(registry.touch(ConnectionId::new()).is_none());
    }

    #[test]
    fn list_active_is_a_snapshot() {
        let registry = PresenceRegistry::new();
        let conn = ConnectionId::new();
        registry.register(&alice(), conn);
        registry.register(&Identity::new("bob", "Bob"), ConnectionId::new());

        let active = registry.list_active();
        registry.release(conn);

        assert_eq!(active.count(), 2);
        assert_eq!(registry.list_active().count(), 1);
    }

    #[test]
    fn restored_identities_start_offline() {
        let registry = PresenceRegistry::new();
        registry.restore([(alice(), OffsetDateTime::UNIX_EPOCH)]);
        assert_eq!(registry.get("alice").unwrap().status, PresenceStatus::Offline);
        assert_eq!(registry.list_active().count(), 0);
        assert_eq!(registry.users()[0].display_name, "Alice");
    }
}
