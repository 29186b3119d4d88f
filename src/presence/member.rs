use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type RoomId = String;

/// Identity of one live transport session. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

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
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Elder,
    Family,
    #[default]
    #[serde(other)]
    Unknown,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Elder => "elder",
            Role::Family => "family",
            Role::Unknown => "unknown",
        }
    }
}

/// A connection as seen by the other members of its room.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub id: ConnectionId,
    pub role: Role,
    pub device_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_mode: Option<String>,

    #[serde(skip)]
    pub push_token: Option<String>,
    /// Account bound to this device, if it told us.
    #[serde(skip)]
    pub user_id: Option<i64>,
}

impl Member {
    pub fn new(id: ConnectionId, role: Role, device_name: impl Into<String>) -> Self {
        Self {
            id,
            role,
            device_name: device_name.into(),
            device_mode: None,
            push_token: None,
            user_id: None,
        }
    }

    pub fn with_push_token(mut self, token: impl Into<String>) -> Self {
        self.push_token = Some(token.into());
        self
    }
}
