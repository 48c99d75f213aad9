use std::collections::HashSet;

use parley_types::models::MessageId;

use crate::message::Message;

/// Ordered local copy of one conversation, unique by message id.
///
/// Every merge is keyed by id, so delivering the same row any number of times
/// through any channel leaves exactly one entry. Entries are never re-sorted;
/// only optimistic placeholders are ever removed.
#[derive(Debug, Clone, Default)]
pub struct ConversationBuffer {
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
}

impl ConversationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole buffer, keeping the first copy of any repeated id.
    pub fn replace(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.clear();
        self.merge(messages);
    }

    /// Append messages whose id is not yet present, in the given order.
    /// Returns how many were appended.
    pub fn merge(&mut self, messages: impl IntoIterator<Item = Message>) -> usize {
        let mut added = 0;
        for message in messages {
            if self.push_if_absent(message) {
                added += 1;
            }
        }
        added
    }

    pub fn push_if_absent(&mut self, message: Message) -> bool {
        if !self.ids.insert(message.id.clone()) {
            return false;
        }
        self.messages.push(message);
        true
    }

    /// Swap the placeholder `temp_id` for its confirmed row.
    ///
    /// If the placeholder is gone the row is merged like any other delivery;
    /// if the row already arrived through another channel the placeholder is
    /// dropped instead.
    pub fn confirm(&mut self, temp_id: &MessageId, confirmed: Message) {
        if self.ids.contains(&confirmed.id) {
            self.remove(temp_id);
            return;
        }

        match self.position(temp_id) {
            Some(idx) => {
                self.ids.remove(temp_id);
                self.ids.insert(confirmed.id.clone());
                self.messages[idx] = confirmed;
            }
            None => {
                self.push_if_absent(confirmed);
            }
        }
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<Message> {
        let idx = self.position(id)?;
        self.ids.remove(id);
        Some(self.messages.remove(idx))
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.position(id).map(|idx| &self.messages[idx])
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        if !self.ids.contains(id) {
            return None;
        }
        self.messages.iter().position(|m| &m.id == id)
    }
}
