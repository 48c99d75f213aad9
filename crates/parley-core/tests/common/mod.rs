#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use parley_core::backend::{
    AuthProvider, BackendResult, ChangeFeed, ObjectStore, RelationalStore, Subscription,
    TaskGuard, UploadOptions,
};
use parley_core::error::{AuthError, BackendError};
use parley_types::api::{SignUpOutcome, SignUpRequest};
use parley_types::events::AuthEvent;
use parley_types::models::{
    AuthUser, Blog, MessageId, NewBlog, NewMessage, PeerPair, Profile, Session, StoredMessage,
    UserRecord,
};

/// In-memory backend with failure switches and call counters.
pub struct MemoryBackend {
    pub profiles: Mutex<Vec<Profile>>,
    pub messages: Mutex<Vec<StoredMessage>>,
    pub users: Mutex<Vec<UserRecord>>,
    pub blogs: Mutex<Vec<Blog>>,
    pub uploads: Mutex<Vec<(String, String, usize)>>,
    pub session: Mutex<Option<Session>>,
    pub accounts: Mutex<HashMap<String, (String, Uuid)>>,

    pub fail_list: AtomicBool,
    pub fail_insert: AtomicBool,
    pub fail_upload: AtomicBool,
    pub fail_profiles: AtomicBool,
    pub fail_subscribe: AtomicBool,
    pub fail_signup: AtomicBool,
    pub confirm_email: AtomicBool,

    pub list_calls: Mutex<HashMap<(Uuid, Uuid), usize>>,
    pub insert_calls: AtomicUsize,
    pub live_subscriptions: Arc<AtomicUsize>,
    pub subscribe_calls: AtomicUsize,

    next_id: AtomicI64,
    feed: broadcast::Sender<StoredMessage>,
    auth_events: broadcast::Sender<AuthEvent>,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        let (feed, _) = broadcast::channel(256);
        let (auth_events, _) = broadcast::channel(16);
        Arc::new(Self {
            profiles: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            users: Mutex::new(Vec::new()),
            blogs: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            session: Mutex::new(None),
            accounts: Mutex::new(HashMap::new()),
            fail_list: AtomicBool::new(false),
            fail_insert: AtomicBool::new(false),
            fail_upload: AtomicBool::new(false),
            fail_profiles: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            fail_signup: AtomicBool::new(false),
            confirm_email: AtomicBool::new(false),
            list_calls: Mutex::new(HashMap::new()),
            insert_calls: AtomicUsize::new(0),
            live_subscriptions: Arc::new(AtomicUsize::new(0)),
            subscribe_calls: AtomicUsize::new(0),
            next_id: AtomicI64::new(1),
            feed,
            auth_events,
        })
    }

    pub fn add_profile(&self, username: &str) -> Profile {
        let profile = Profile {
            id: Uuid::new_v4(),
            username: Some(username.to_string()),
            full_name: None,
            avatar_url: None,
        };
        self.profiles.lock().unwrap().push(profile.clone());
        profile
    }

    pub fn add_account(&self, email: &str, password: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.accounts
            .lock()
            .unwrap()
            .insert(email.to_string(), (password.to_string(), id));
        id
    }

    pub fn session_for(user_id: Uuid) -> Session {
        Session {
            access_token: format!("token-{}", Uuid::new_v4()),
            refresh_token: "refresh".into(),
            expires_at: None,
            user: AuthUser { id: user_id, email: None },
        }
    }

    /// Store a row as if another client had inserted it, without notifying
    /// the change feed.
    pub fn store_silently(&self, sender_id: Uuid, receiver_id: Uuid, content: &str) -> StoredMessage {
        let row = StoredMessage {
            id: MessageId::new(self.next_id.fetch_add(1, Ordering::SeqCst).to_string()),
            sender_id,
            receiver_id,
            content: Some(content.to_string()),
            created_at: Utc::now(),
        };
        self.messages.lock().unwrap().push(row.clone());
        row
    }

    /// Store a row and publish it on the change feed.
    pub fn store(&self, sender_id: Uuid, receiver_id: Uuid, content: &str) -> StoredMessage {
        let row = self.store_silently(sender_id, receiver_id, content);
        let _ = self.feed.send(row.clone());
        row
    }

    pub fn list_count(&self, pair: PeerPair) -> usize {
        *self
            .list_calls
            .lock()
            .unwrap()
            .get(&key(pair))
            .unwrap_or(&0)
    }

    pub fn emit(&self, event: AuthEvent) {
        let _ = self.auth_events.send(event);
    }
}

fn key(pair: PeerPair) -> (Uuid, Uuid) {
    if pair.self_id < pair.peer_id {
        (pair.self_id, pair.peer_id)
    } else {
        (pair.peer_id, pair.self_id)
    }
}

fn injected(what: &str) -> BackendError {
    BackendError::Other(anyhow!("injected {} failure", what))
}

#[async_trait]
impl AuthProvider for MemoryBackend {
    async fn current_session(&self) -> BackendResult<Option<Session>> {
        Ok(self.session.lock().unwrap().clone())
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let user_id = match self.accounts.lock().unwrap().get(email) {
            Some((stored, id)) if stored == password => *id,
            _ => return Err(AuthError::InvalidCredentials),
        };
        let session = Self::session_for(user_id);
        *self.session.lock().unwrap() = Some(session.clone());
        self.emit(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn sign_up(&self, request: SignUpRequest) -> Result<SignUpOutcome, AuthError> {
        if self.fail_signup.load(Ordering::SeqCst) {
            return Err(AuthError::Backend(injected("signup")));
        }
        let id = self.add_account(&request.email, &request.password);
        if self.confirm_email.load(Ordering::SeqCst) {
            return Ok(SignUpOutcome::ConfirmationRequired(AuthUser {
                id,
                email: Some(request.email),
            }));
        }
        let session = Self::session_for(id);
        *self.session.lock().unwrap() = Some(session.clone());
        Ok(SignUpOutcome::Session(session))
    }

    async fn refresh_session(&self) -> Result<Session, AuthError> {
        let mut guard = self.session.lock().unwrap();
        let current = guard.as_ref().ok_or(BackendError::NotAuthenticated)?;
        let session = Self::session_for(current.user.id);
        *guard = Some(session.clone());
        self.emit(AuthEvent::TokenRefreshed(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> BackendResult<()> {
        self.session.lock().unwrap().take();
        self.emit(AuthEvent::SignedOut);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.auth_events.subscribe()
    }
}

#[async_trait]
impl RelationalStore for MemoryBackend {
    async fn list_profiles_except(&self, user_id: Uuid) -> BackendResult<Vec<Profile>> {
        if self.fail_profiles.load(Ordering::SeqCst) {
            return Err(injected("profiles"));
        }
        Ok(self
            .profiles
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.id != user_id)
            .cloned()
            .collect())
    }

    async fn list_conversation(&self, pair: PeerPair) -> BackendResult<Vec<StoredMessage>> {
        *self.list_calls.lock().unwrap().entry(key(pair)).or_default() += 1;
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(injected("list"));
        }
        let mut rows: Vec<_> = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| pair.contains(m.sender_id, m.receiver_id))
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.created_at);
        Ok(rows)
    }

    async fn insert_message(&self, message: NewMessage) -> BackendResult<StoredMessage> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(injected("insert"));
        }
        Ok(self.store(message.sender_id, message.receiver_id, &message.content))
    }

    async fn upsert_user(&self, user: UserRecord) -> BackendResult<()> {
        let mut users = self.users.lock().unwrap();
        users.retain(|u| u.id != user.id);
        users.push(user);
        Ok(())
    }

    async fn insert_blog(&self, blog: NewBlog) -> BackendResult<Blog> {
        let row = Blog {
            id: MessageId::new(self.next_id.fetch_add(1, Ordering::SeqCst).to_string()),
            title: blog.title,
            summary: blog.summary,
            content: blog.content,
            image_url: blog.image_url,
            author_id: blog.author_id,
            created_at: Utc::now(),
        };
        self.blogs.lock().unwrap().push(row.clone());
        Ok(row)
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn subscribe_messages(&self, pair: PeerPair) -> BackendResult<Subscription> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(injected("subscribe"));
        }

        let mut feed = self.feed.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = TaskGuard::spawn(async move {
            while let Ok(row) = feed.recv().await {
                if pair.contains(row.sender_id, row.receiver_id) && tx.send(row).is_err() {
                    break;
                }
            }
        });

        let live = self.live_subscriptions.clone();
        live.fetch_add(1, Ordering::SeqCst);
        Ok(Subscription::new(rx)
            .with_task(task)
            .on_release(move || {
                live.fetch_sub(1, Ordering::SeqCst);
            }))
    }
}

#[async_trait]
impl ObjectStore for MemoryBackend {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Bytes,
        _options: UploadOptions,
    ) -> BackendResult<()> {
        if self.fail_upload.load(Ordering::SeqCst) {
            return Err(injected("upload"));
        }
        self.uploads
            .lock()
            .unwrap()
            .push((bucket.to_string(), path.to_string(), bytes.len()));
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("https://store/{}/{}", bucket, path)
    }
}

/// Short poll period so tests observe several ticks quickly.
pub const FAST_POLL: Duration = Duration::from_millis(20);
