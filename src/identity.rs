use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type IdentityId = String;

/// User reference handed to us by the user-management side. Never mutated here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: IdentityId,
    pub display_name: String,
    #[serde(default)]
    pub avatar_ref: Option<String>,
}

impl Identity {
    pub fn new(id: impl Into<IdentityId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            avatar_ref: None,
        }
    }

    /// Placeholder for an id we have never seen a full record for.
    pub fn unknown(id: &str) -> Self {
        Self::new(id, id)
    }
}

/// One physical client connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0.simple())
    }
}
