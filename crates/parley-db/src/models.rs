//! Row types as SQLite returns them. Ids and timestamps stay as text here
//! and are parsed on the way out.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use parley_types::models::{Blog, MessageId, Profile, StoredMessage};

pub struct AuthUserRow {
    pub id: String,
    pub email: String,
    pub password: String,
}

impl AuthUserRow {
    pub fn user_id(&self) -> Result<Uuid> {
        parse_uuid(&self.id)
    }
}

pub struct ProfileRow {
    pub id: String,
    pub username: Option<String>,
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl ProfileRow {
    pub fn into_profile(self) -> Result<Profile> {
        Ok(Profile {
            id: parse_uuid(&self.id)?,
            username: self.username,
            full_name: self.full_name,
            avatar_url: self.avatar_url,
        })
    }
}

pub struct MessageRow {
    pub id: i64,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: Option<String>,
    pub created_at: String,
}

impl MessageRow {
    pub fn into_stored(self) -> Result<StoredMessage> {
        Ok(StoredMessage {
            id: MessageId::new(self.id.to_string()),
            sender_id: parse_uuid(&self.sender_id)?,
            receiver_id: parse_uuid(&self.receiver_id)?,
            content: self.content,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

pub struct BlogRow {
    pub id: i64,
    pub title: String,
    pub summary: Option<String>,
    pub content: String,
    pub image_url: Option<String>,
    pub author_id: String,
    pub created_at: String,
}

impl BlogRow {
    pub fn into_blog(self) -> Result<Blog> {
        Ok(Blog {
            id: MessageId::new(self.id.to_string()),
            title: self.title,
            summary: self.summary,
            content: self.content,
            image_url: self.image_url,
            author_id: parse_uuid(&self.author_id)?,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("invalid uuid in row: {}", raw))
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid timestamp in row: {}", raw))?
        .with_timezone(&Utc))
}
