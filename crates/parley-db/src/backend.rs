use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration, Utc};
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_core::backend::{
    AuthProvider, BackendResult, ChangeFeed, ObjectStore, RelationalStore, Subscription,
    TaskGuard, UploadOptions,
};
use parley_core::error::{AuthError, BackendError};
use parley_types::api::{SignUpOutcome, SignUpRequest};
use parley_types::events::AuthEvent;
use parley_types::models::{
    AuthUser, Blog, NewBlog, NewMessage, PeerPair, Profile, Session, StoredMessage, UserRecord,
};

use crate::Database;
use crate::auth;
use crate::models::ProfileRow;
use crate::storage::ObjectStorage;

/// Inserts buffered per change-feed subscriber before it starts lagging.
const FEED_CAPACITY: usize = 256;

/// Everything in one process: SQLite for rows, a directory for objects,
/// locally signed JWTs for sessions, and an in-process change feed.
pub struct LocalBackend {
    db: Arc<Database>,
    storage: ObjectStorage,
    jwt_secret: String,
    session: RwLock<Option<Session>>,
    refresh_lock: Mutex<()>,
    auth_events: broadcast::Sender<AuthEvent>,
    inserts: broadcast::Sender<StoredMessage>,
}

impl LocalBackend {
    pub fn new(db: Database, storage: ObjectStorage, jwt_secret: impl Into<String>) -> Self {
        let (auth_events, _) = broadcast::channel(16);
        let (inserts, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            db: Arc::new(db),
            storage,
            jwt_secret: jwt_secret.into(),
            session: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            auth_events,
            inserts,
        }
    }

    pub async fn open(
        db_path: PathBuf,
        storage_dir: PathBuf,
        jwt_secret: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let db = Database::open(&db_path)?;
        let storage = ObjectStorage::new(storage_dir).await?;
        Ok(Self::new(db, storage, jwt_secret))
    }

    fn current(&self) -> Option<Session> {
        self.session.read().ok().and_then(|s| s.clone())
    }

    fn set_session(&self, session: Option<Session>) {
        if let Ok(mut slot) = self.session.write() {
            *slot = session;
        }
    }

    fn emit(&self, event: AuthEvent) {
        // No listeners is fine.
        let _ = self.auth_events.send(event);
    }

    /// Mint an access token and a fresh refresh token for `user`.
    fn issue_session(&self, user_id: Uuid, email: &str) -> anyhow::Result<Session> {
        let ttl = Duration::seconds(auth::ACCESS_TOKEN_TTL_SECS);
        let access_token = auth::create_token(&self.jwt_secret, user_id, email, ttl)?;
        let refresh_token = auth::new_refresh_token();
        self.db
            .store_refresh_token(&refresh_token, &user_id.to_string())?;

        Ok(Session {
            access_token,
            refresh_token,
            expires_at: Some(Utc::now() + ttl),
            user: AuthUser {
                id: user_id,
                email: Some(email.to_string()),
            },
        })
    }

    /// The held session, renewed first when it is about to expire.
    async fn fresh_session(&self) -> BackendResult<Session> {
        let session = self.current().ok_or(BackendError::NotAuthenticated)?;
        if !session.needs_refresh(Utc::now()) {
            return Ok(session);
        }

        // Refresh tokens are single use; only one caller may spend it.
        let _refreshing = self.refresh_lock.lock().await;
        let session = self.current().ok_or(BackendError::NotAuthenticated)?;
        if !session.needs_refresh(Utc::now()) {
            return Ok(session);
        }
        Ok(self.refresh_session().await?)
    }

    /// The signed-in user, checked against the access token.
    async fn require_user(&self) -> BackendResult<Uuid> {
        let session = self.fresh_session().await?;
        match auth::decode_token(&self.jwt_secret, &session.access_token) {
            Ok(claims) => Ok(claims.sub),
            Err(e) => {
                debug!("Rejected access token: {}", e);
                Err(BackendError::NotAuthenticated)
            }
        }
    }
}

fn forbidden(message: &str) -> BackendError {
    BackendError::Status {
        status: 403,
        message: message.to_string(),
    }
}

#[async_trait]
impl AuthProvider for LocalBackend {
    async fn current_session(&self) -> BackendResult<Option<Session>> {
        if self.current().is_none() {
            return Ok(None);
        }
        match self.fresh_session().await {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!("Stored session expired and could not be refreshed: {}", e);
                self.set_session(None);
                Ok(None)
            }
        }
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let user = self
            .db
            .get_auth_user_by_email(email)
            .map_err(BackendError::from)?
            .ok_or(AuthError::InvalidCredentials)?;

        if !auth::verify_password(password, &user.password) {
            return Err(AuthError::InvalidCredentials);
        }

        let user_id = user.user_id().map_err(BackendError::from)?;
        let session = self
            .issue_session(user_id, &user.email)
            .map_err(BackendError::from)?;

        info!("User {} signed in", user_id);
        self.set_session(Some(session.clone()));
        self.emit(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn sign_up(&self, request: SignUpRequest) -> Result<SignUpOutcome, AuthError> {
        if self
            .db
            .get_auth_user_by_email(&request.email)
            .map_err(BackendError::from)?
            .is_some()
        {
            return Err(AuthError::Backend(BackendError::Status {
                status: 422,
                message: "User already registered".into(),
            }));
        }

        let hash = auth::hash_password(&request.password).map_err(BackendError::from)?;
        let user_id = Uuid::new_v4();
        let id = user_id.to_string();
        self.db
            .create_auth_user(&id, &request.email, &hash)
            .map_err(BackendError::from)?;

        let username = request
            .email
            .split('@')
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let full_name = Some(request.data.full_name).filter(|s| !s.trim().is_empty());
        self.db
            .upsert_profile(&ProfileRow {
                id,
                username,
                full_name,
                avatar_url: None,
            })
            .map_err(BackendError::from)?;

        let session = self
            .issue_session(user_id, &request.email)
            .map_err(BackendError::from)?;

        info!("User {} registered", user_id);
        self.set_session(Some(session.clone()));
        self.emit(AuthEvent::SignedIn(session.clone()));
        Ok(SignUpOutcome::Session(session))
    }

    async fn refresh_session(&self) -> Result<Session, AuthError> {
        let current = self.current().ok_or(BackendError::NotAuthenticated)?;
        let user_id = self
            .db
            .take_refresh_token(&current.refresh_token)
            .map_err(BackendError::from)?
            .ok_or(BackendError::NotAuthenticated)?;
        let user = self
            .db
            .get_auth_user_by_id(&user_id)
            .map_err(BackendError::from)?
            .ok_or(BackendError::NotAuthenticated)?;

        let session = self
            .issue_session(user.user_id().map_err(BackendError::from)?, &user.email)
            .map_err(BackendError::from)?;

        debug!("Session refreshed for {}", user_id);
        self.set_session(Some(session.clone()));
        self.emit(AuthEvent::TokenRefreshed(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> BackendResult<()> {
        if let Some(session) = self.current() {
            self.db.revoke_refresh_tokens(&session.user_id().to_string())?;
            info!("User {} signed out", session.user_id());
        }
        self.set_session(None);
        self.emit(AuthEvent::SignedOut);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.auth_events.subscribe()
    }
}

#[async_trait]
impl RelationalStore for LocalBackend {
    async fn list_profiles_except(&self, user_id: Uuid) -> BackendResult<Vec<Profile>> {
        let rows = self.db.list_profiles_except(&user_id.to_string())?;
        let profiles = rows
            .into_iter()
            .map(ProfileRow::into_profile)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(profiles)
    }

    async fn list_conversation(&self, pair: PeerPair) -> BackendResult<Vec<StoredMessage>> {
        let rows = self
            .db
            .list_conversation(&pair.self_id.to_string(), &pair.peer_id.to_string())?;
        let messages = rows
            .into_iter()
            .map(|row| row.into_stored())
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(messages)
    }

    async fn insert_message(&self, message: NewMessage) -> BackendResult<StoredMessage> {
        let user_id = self.require_user().await?;
        if message.sender_id != user_id {
            return Err(forbidden("sender must be the signed-in user"));
        }

        let row = self
            .db
            .insert_message(
                &message.sender_id.to_string(),
                &message.receiver_id.to_string(),
                &message.content,
            )?
            .into_stored()?;

        debug!("Message {} stored", row.id);
        // No subscribers is fine.
        let _ = self.inserts.send(row.clone());
        Ok(row)
    }

    async fn upsert_user(&self, user: UserRecord) -> BackendResult<()> {
        if self.require_user().await? != user.id {
            return Err(forbidden("users row must belong to the signed-in user"));
        }
        self.db
            .upsert_user(&user.id.to_string(), &user.name, &user.email, &user.role)?;
        Ok(())
    }

    async fn insert_blog(&self, blog: NewBlog) -> BackendResult<Blog> {
        if self.require_user().await? != blog.author_id {
            return Err(forbidden("author must be the signed-in user"));
        }
        let row = self.db.insert_blog(
            &blog.title,
            blog.summary.as_deref(),
            &blog.content,
            blog.image_url.as_deref(),
            &blog.author_id.to_string(),
        )?;
        Ok(row.into_blog()?)
    }
}

#[async_trait]
impl ChangeFeed for LocalBackend {
    async fn subscribe_messages(&self, pair: PeerPair) -> BackendResult<Subscription> {
        let mut inserts = self.inserts.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();

        let task = TaskGuard::spawn(async move {
            loop {
                match inserts.recv().await {
                    Ok(row) => {
                        if !pair.contains(row.sender_id, row.receiver_id) {
                            continue;
                        }
                        if tx.send(row).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Change feed for {:?} lagged by {} rows", pair, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        debug!("Subscribed to inserts for {:?}", pair);
        Ok(Subscription::new(rx).with_task(task))
    }
}

#[async_trait]
impl ObjectStore for LocalBackend {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Bytes,
        options: UploadOptions,
    ) -> BackendResult<()> {
        let user_id = self.require_user().await?;
        if options.owner.is_some_and(|owner| owner != user_id) {
            return Err(forbidden("object owner must be the signed-in user"));
        }
        self.storage.put(bucket, path, &bytes, options.upsert).await?;
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        self.storage.public_url(bucket, path)
    }
}
