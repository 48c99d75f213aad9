use std::future::Future;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use parley_types::api::{SignUpOutcome, SignUpRequest};
use parley_types::events::AuthEvent;
use parley_types::models::{
    Blog, NewBlog, NewMessage, PeerPair, Profile, Session, StoredMessage, UserRecord,
};

use crate::error::{AuthError, BackendError};

pub type BackendResult<T> = Result<T, BackendError>;

/// Issues, refreshes and clears the user's session.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// The session restored from storage or established earlier, if any.
    async fn current_session(&self) -> BackendResult<Option<Session>>;

    async fn sign_in_with_password(&self, email: &str, password: &str)
        -> Result<Session, AuthError>;

    async fn sign_up(&self, request: SignUpRequest) -> Result<SignUpOutcome, AuthError>;

    async fn refresh_session(&self) -> Result<Session, AuthError>;

    async fn sign_out(&self) -> BackendResult<()>;

    /// Session-changed events. Each call returns an independent receiver.
    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;
}

/// Row storage for profiles, messages, users and blogs.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Every profile except `user_id`'s, in storage order.
    async fn list_profiles_except(&self, user_id: Uuid) -> BackendResult<Vec<Profile>>;

    /// Both directions of the conversation, oldest first.
    async fn list_conversation(&self, pair: PeerPair) -> BackendResult<Vec<StoredMessage>>;

    /// Insert and return the stored row with its real id and timestamp.
    async fn insert_message(&self, message: NewMessage) -> BackendResult<StoredMessage>;

    /// Insert or merge by `id`.
    async fn upsert_user(&self, user: UserRecord) -> BackendResult<()>;

    async fn insert_blog(&self, blog: NewBlog) -> BackendResult<Blog>;
}

/// Push notification of inserted `messages` rows.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe_messages(&self, pair: PeerPair) -> BackendResult<Subscription>;
}

#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
    pub upsert: bool,
    /// Recorded as object metadata so storage policies can scope by owner.
    pub owner: Option<Uuid>,
}

/// Binary blob storage with public retrieval URLs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Bytes,
        options: UploadOptions,
    ) -> BackendResult<()>;

    fn public_url(&self, bucket: &str, path: &str) -> String;
}

/// All four services behind one handle.
pub trait Backend: AuthProvider + RelationalStore + ChangeFeed + ObjectStore {}

impl<T> Backend for T where T: AuthProvider + RelationalStore + ChangeFeed + ObjectStore {}

/// Background task that is aborted when the guard is dropped.
#[derive(Debug)]
pub struct TaskGuard(JoinHandle<()>);

impl TaskGuard {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self(tokio::spawn(future))
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A live change-feed subscription. Dropping it releases the underlying
/// connection; there is no separate unsubscribe call.
pub struct Subscription {
    rows: mpsc::UnboundedReceiver<StoredMessage>,
    task: Option<TaskGuard>,
    on_release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(rows: mpsc::UnboundedReceiver<StoredMessage>) -> Self {
        Self {
            rows,
            task: None,
            on_release: None,
        }
    }

    /// Tie a producer task to this subscription's lifetime.
    pub fn with_task(mut self, task: TaskGuard) -> Self {
        self.task = Some(task);
        self
    }

    /// Run `f` exactly once when the subscription is dropped.
    pub fn on_release(mut self, f: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_release = Some(Box::new(f));
        self
    }

    /// Next inserted row, or `None` once the producer has gone away.
    pub async fn next(&mut self) -> Option<StoredMessage> {
        self.rows.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.take();
        if let Some(release) = self.on_release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("task", &self.task)
            .finish_non_exhaustive()
    }
}
