//! Chat user ↔ role mapping, upserted on first contact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::primitives::ChatUserId;

/// Authorization role of a chat user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Member,
}

impl UserRole {
    /// Database/text representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Member => "member",
        }
    }

    /// Parses the database/text representation, defaulting to member.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        if s == "admin" { Self::Admin } else { Self::Member }
    }
}

/// A known chat user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub chat_user_id: ChatUserId,
    pub display_name: String,
    pub role: UserRole,
    /// Per-user override of the default requests-per-minute limit.
    pub rate_limit_per_minute: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
