use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Message identifier as handed out by the row store.
///
/// Hosted backends use either bigint or uuid primary keys, so the id is kept
/// opaque. Numeric ids are normalized to their decimal string on decode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Placeholder id for a message that has not been confirmed yet.
    pub fn temporary(unix_millis: i64) -> Self {
        Self(format!("temp-{}", unix_millis))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with("temp-")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Number(i64),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Text(s) => Self(s),
            RawId::Number(n) => Self(n.to_string()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// A `messages` row exactly as persisted. `content` may carry an encoded
/// attachment URL and is decoded by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    #[serde(default)]
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for the `messages` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
}

/// The two participants of a one-to-one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerPair {
    pub self_id: Uuid,
    pub peer_id: Uuid,
}

impl PeerPair {
    pub fn new(self_id: Uuid, peer_id: Uuid) -> Self {
        Self { self_id, peer_id }
    }

    /// True when `{sender, receiver}` equals `{self, peer}` in either order.
    pub fn contains(&self, sender_id: Uuid, receiver_id: Uuid) -> bool {
        (sender_id == self.self_id && receiver_id == self.peer_id)
            || (sender_id == self.peer_id && receiver_id == self.self_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
}

/// How long before expiry a session is renewed.
pub const REFRESH_MARGIN_SECS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub user: AuthUser,
}

impl Session {
    pub fn user_id(&self) -> Uuid {
        self.user.id
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Expired, or close enough to it that the next request might not make it.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.is_expired(now + Duration::seconds(REFRESH_MARGIN_SECS))
    }
}

/// Row in the `users` table written by the sign-up flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blog {
    pub id: MessageId,
    pub title: String,
    #[serde(default)]
    pub summary: Option<String>,
    pub content: String,
    #[serde(default)]
    pub image_url: Option<String>,
    pub author_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBlog {
    pub title: String,
    pub summary: Option<String>,
    pub content: String,
    pub image_url: Option<String>,
    pub author_id: Uuid,
}
