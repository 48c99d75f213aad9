//! Keeps the local copy of one conversation in step with the store.
//!
//! Two producers feed the buffer while a peer is selected: a poll task that
//! re-runs the conversation query on a fixed period, and the change-feed
//! subscription. Both deliveries go through the same id-keyed merge on the
//! owner's task, so duplicates and arbitrary interleavings are harmless.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use parley_types::models::{MessageId, NewMessage, PeerPair, Profile, StoredMessage};

use crate::attachment::encode_content;
use crate::backend::{Backend, BackendResult, Subscription, TaskGuard, UploadOptions};
use crate::buffer::ConversationBuffer;
use crate::compose::{AttachmentDraft, ComposeBox, check_size, object_name, owner_path, random_stem};
use crate::config::{SyncConfig, UploadFailurePolicy};
use crate::error::SendError;
use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No peer selected.
    Idle,
    /// Peer selected, initial fetch in flight.
    Loading,
    /// Initial fetch done; polling and subscribed.
    Live,
}

/// One delivery from a producer.
#[derive(Debug, Clone)]
pub enum Update {
    /// Result of the initial fetch. `None` when it failed.
    Initial(Option<Vec<StoredMessage>>),
    /// Result of one poll tick.
    Poll(Vec<StoredMessage>),
    /// One row from the change feed.
    Push(StoredMessage),
}

/// What applying an update changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Applied {
    pub appended: usize,
    pub replaced: bool,
}

impl Applied {
    pub fn changed(&self) -> bool {
        self.appended > 0 || self.replaced
    }
}

/// An outgoing message between its optimistic append and the durable insert.
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub temp_id: MessageId,
    pair: PeerPair,
    row: NewMessage,
}

/// Poll task and subscription for the selected peer. Dropping this value
/// releases both.
struct ActiveConversation {
    peer: Profile,
    pair: PeerPair,
    updates: mpsc::UnboundedReceiver<Update>,
    feed: Option<Subscription>,
    _poller: TaskGuard,
}

pub struct Synchronizer {
    backend: Arc<dyn Backend>,
    self_id: Uuid,
    config: SyncConfig,
    state: SyncState,
    buffer: ConversationBuffer,
    active: Option<ActiveConversation>,
}

impl Synchronizer {
    pub fn new(backend: Arc<dyn Backend>, self_id: Uuid, config: SyncConfig) -> Self {
        Self {
            backend,
            self_id,
            config,
            state: SyncState::Idle,
            buffer: ConversationBuffer::new(),
            active: None,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn self_id(&self) -> Uuid {
        self.self_id
    }

    pub fn peer(&self) -> Option<&Profile> {
        self.active.as_ref().map(|a| &a.peer)
    }

    pub fn buffer(&self) -> &ConversationBuffer {
        &self.buffer
    }

    pub fn messages(&self) -> &[Message] {
        self.buffer.as_slice()
    }

    /// Whether the change feed is currently attached.
    pub fn is_subscribed(&self) -> bool {
        self.active.as_ref().is_some_and(|a| a.feed.is_some())
    }

    /// Switch the conversation to `peer`.
    ///
    /// The previous poll task and subscription are released before anything
    /// for the new peer starts, and the buffer is emptied so no message from
    /// the old conversation can show up in the new one.
    pub async fn select_peer(&mut self, peer: Profile) {
        self.teardown();

        let pair = PeerPair::new(self.self_id, peer.id);
        let (tx, rx) = mpsc::unbounded_channel();
        let poller = TaskGuard::spawn(run_poller(
            self.backend.clone(),
            pair,
            self.config.poll_interval,
            tx,
        ));
        self.state = SyncState::Loading;

        let feed = match self.backend.subscribe_messages(pair).await {
            Ok(sub) => Some(sub),
            Err(e) => {
                warn!("Change feed unavailable for {:?}, relying on polling: {}", pair, e);
                None
            }
        };

        info!("Conversation with {} opened", peer.id);
        self.active = Some(ActiveConversation {
            peer,
            pair,
            updates: rx,
            feed,
            _poller: poller,
        });
    }

    /// Close the conversation and return to idle.
    pub fn deselect(&mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(active) = self.active.take() {
            debug!("Closing conversation with {}", active.peer.id);
        }
        self.buffer.clear();
        self.state = SyncState::Idle;
    }

    /// Wait for the next delivery from either producer and merge it.
    /// Returns `None` when no conversation is open.
    pub async fn next_update(&mut self) -> Option<Applied> {
        loop {
            let active = self.active.as_mut()?;

            enum Next {
                Update(Option<Update>),
                Push(Option<StoredMessage>),
            }

            let next = tokio::select! {
                update = active.updates.recv() => Next::Update(update),
                row = next_row(&mut active.feed) => Next::Push(row),
            };

            match next {
                Next::Update(Some(update)) => return Some(self.apply(update)),
                Next::Push(Some(row)) => return Some(self.apply(Update::Push(row))),
                Next::Push(None) => {
                    warn!("Change feed closed, relying on polling");
                    active.feed = None;
                }
                Next::Update(None) => {
                    error!("Poll task for {:?} stopped", active.pair);
                    return None;
                }
            }
        }
    }

    /// Merge one delivery into the buffer.
    pub fn apply(&mut self, update: Update) -> Applied {
        let Some(pair) = self.active.as_ref().map(|a| a.pair) else {
            return Applied::default();
        };

        let mut applied = Applied::default();
        match update {
            Update::Initial(rows) => {
                if let Some(rows) = rows {
                    self.buffer.replace(decode_pair(rows, pair));
                    applied.replaced = true;
                }
                self.state = SyncState::Live;
            }
            Update::Poll(rows) => {
                applied.appended = self.buffer.merge(decode_pair(rows, pair));
            }
            Update::Push(row) => {
                if pair.contains(row.sender_id, row.receiver_id)
                    && self.buffer.push_if_absent(Message::from(row))
                {
                    applied.appended = 1;
                }
            }
        }

        if applied.changed() {
            debug!("Merged update: {:?}, buffer now {}", applied, self.buffer.len());
        }
        applied
    }

    /// Send whatever is in `compose` to the selected peer.
    ///
    /// `Ok(None)` means there was nothing to send (blank input or no peer);
    /// no network call is made in that case.
    pub async fn send(&mut self, compose: &mut ComposeBox) -> Result<Option<Message>, SendError> {
        match self.begin_send(compose).await? {
            Some(pending) => self.finish_send(pending).await.map(Some),
            None => Ok(None),
        }
    }

    /// Validate, upload any attachment, and append the optimistic message.
    /// The compose box is cleared once the placeholder is in the buffer.
    pub async fn begin_send(
        &mut self,
        compose: &mut ComposeBox,
    ) -> Result<Option<PendingSend>, SendError> {
        let Some(pair) = self.active.as_ref().map(|a| a.pair) else {
            return Ok(None);
        };
        if compose.is_blank() {
            return Ok(None);
        }

        let text = compose.text().trim().to_string();
        let mut attachment_url = None;

        if let Some(draft) = compose.attachment() {
            check_size(draft.size(), self.config.max_attachment_bytes)?;

            match self.upload(draft).await {
                Ok(url) => attachment_url = Some(url),
                Err(e) => match self.config.upload_failure {
                    UploadFailurePolicy::SendTextOnly if !text.is_empty() => {
                        warn!("Attachment upload failed, sending text only: {}", e);
                    }
                    _ => {
                        error!("Attachment upload failed: {}", e);
                        return Err(SendError::Upload(e));
                    }
                },
            }
        }

        let content = encode_content(&text, attachment_url.as_deref());
        let temp_id = self.next_temp_id();
        self.buffer.push_if_absent(Message::optimistic(
            temp_id.clone(),
            self.self_id,
            pair.peer_id,
            &content,
            Utc::now(),
        ));
        compose.clear();

        Ok(Some(PendingSend {
            temp_id,
            pair,
            row: NewMessage {
                sender_id: self.self_id,
                receiver_id: pair.peer_id,
                content,
            },
        }))
    }

    /// Durably insert a pending message and settle its placeholder.
    ///
    /// On success the placeholder is replaced by the stored row. On failure
    /// exactly that placeholder is removed; nothing is retried.
    pub async fn finish_send(&mut self, pending: PendingSend) -> Result<Message, SendError> {
        let still_open = |s: &Self| s.active.as_ref().is_some_and(|a| a.pair == pending.pair);

        match self.backend.insert_message(pending.row).await {
            Ok(row) => {
                let confirmed = Message::from(row);
                if still_open(self) {
                    self.buffer.confirm(&pending.temp_id, confirmed.clone());
                }
                debug!("Message {} confirmed as {}", pending.temp_id, confirmed.id);
                Ok(confirmed)
            }
            Err(e) => {
                if still_open(self) {
                    self.buffer.remove(&pending.temp_id);
                }
                error!("Error sending message: {}", e);
                Err(SendError::Insert(e))
            }
        }
    }

    async fn upload(&self, draft: &AttachmentDraft) -> BackendResult<String> {
        let path = owner_path(self.self_id, &object_name(&random_stem(), draft.extension()));
        let options = UploadOptions {
            content_type: draft.content_type().map(str::to_string),
            owner: Some(self.self_id),
            ..UploadOptions::default()
        };

        self.backend
            .upload(&self.config.bucket, &path, draft.bytes.clone(), options)
            .await?;

        Ok(self.backend.public_url(&self.config.bucket, &path))
    }

    fn next_temp_id(&self) -> MessageId {
        let mut millis = Utc::now().timestamp_millis();
        loop {
            let id = MessageId::temporary(millis);
            if !self.buffer.contains(&id) {
                return id;
            }
            millis += 1;
        }
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn decode_pair(rows: Vec<StoredMessage>, pair: PeerPair) -> impl Iterator<Item = Message> {
    rows.into_iter()
        .filter(move |row| pair.contains(row.sender_id, row.receiver_id))
        .map(Message::from)
}

async fn next_row(feed: &mut Option<Subscription>) -> Option<StoredMessage> {
    match feed {
        Some(sub) => sub.next().await,
        None => std::future::pending().await,
    }
}

/// Initial fetch, then one query per tick until aborted. Failed ticks are
/// logged and skipped; the period never changes.
async fn run_poller(
    backend: Arc<dyn Backend>,
    pair: PeerPair,
    period: std::time::Duration,
    tx: mpsc::UnboundedSender<Update>,
) {
    let initial = match backend.list_conversation(pair).await {
        Ok(rows) => Some(rows),
        Err(e) => {
            warn!("Error fetching messages: {}", e);
            None
        }
    };
    if tx.send(Update::Initial(initial)).is_err() {
        return;
    }

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match backend.list_conversation(pair).await {
            Ok(rows) => {
                if tx.send(Update::Poll(rows)).is_err() {
                    return;
                }
            }
            Err(e) => warn!("Error polling messages: {}", e),
        }
    }
}
