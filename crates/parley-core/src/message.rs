use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use parley_types::models::{MessageId, StoredMessage};

use crate::attachment::decode_content;
use crate::render::AttachmentKind;

/// A message as the conversation view holds it: content already split from
/// the attachment URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub attachment_url: Option<String>,
    pub is_attachment: bool,
    /// Shown locally, not yet confirmed by the store.
    pub is_optimistic: bool,
}

impl Message {
    /// Placeholder for an outgoing message. `content` is the persisted form
    /// and is decoded the same way a stored row would be.
    pub fn optimistic(
        id: MessageId,
        sender_id: Uuid,
        receiver_id: Uuid,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> Self {
        let decoded = decode_content(content);
        Self {
            id,
            sender_id,
            receiver_id,
            is_attachment: decoded.is_attachment(),
            content: decoded.text,
            attachment_url: decoded.attachment_url,
            created_at,
            is_optimistic: true,
        }
    }

    pub fn is_from(&self, user_id: Uuid) -> bool {
        self.sender_id == user_id
    }

    pub fn attachment_kind(&self) -> Option<AttachmentKind> {
        self.attachment_url.as_deref().map(AttachmentKind::classify)
    }
}

impl From<StoredMessage> for Message {
    fn from(row: StoredMessage) -> Self {
        let decoded = decode_content(row.content.as_deref().unwrap_or_default());
        Self {
            id: row.id,
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            is_attachment: decoded.is_attachment(),
            content: decoded.text,
            attachment_url: decoded.attachment_url,
            created_at: row.created_at,
            is_optimistic: false,
        }
    }
}
