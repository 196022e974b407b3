//! Authenticated actor identity, resolved by the external session service.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Platform role attached to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Mentor,
    Trader,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Mentor => "mentor",
            Role::Trader => "trader",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "mentor" => Ok(Role::Mentor),
            "trader" => Ok(Role::Trader),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Resolved identity of the caller behind a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub id: String,
    pub display_name: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, role: Role) -> Self {
        Actor {
            id: id.into(),
            display_name: display_name.into(),
            role,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self.role, Role::Admin)
    }

    pub fn is_mentor(&self) -> bool {
        matches!(self.role, Role::Mentor)
    }
}
