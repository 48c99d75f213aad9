use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, header};
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_core::backend::{
    AuthProvider, BackendResult, ChangeFeed, ObjectStore, RelationalStore, Subscription,
    UploadOptions,
};
use parley_core::error::{AuthError, BackendError};
use parley_types::api::{
    ErrorBody, PasswordGrantRequest, RefreshGrantRequest, SignUpOutcome, SignUpRequest,
    SignUpResponse, TokenResponse,
};
use parley_types::events::AuthEvent;
use parley_types::models::{
    Blog, NewBlog, NewMessage, PeerPair, Profile, Session, StoredMessage, UserRecord,
};

use crate::config::RemoteConfig;
use crate::{realtime, rest};

/// Hosted backend over HTTP and a realtime websocket.
pub struct RemoteBackend {
    http: Client,
    config: RemoteConfig,
    session: RwLock<Option<Session>>,
    refresh_lock: Mutex<()>,
    auth_events: broadcast::Sender<AuthEvent>,
}

impl RemoteBackend {
    pub fn new(config: RemoteConfig) -> Self {
        let (auth_events, _) = broadcast::channel(16);
        Self {
            http: Client::new(),
            config,
            session: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            auth_events,
        }
    }

    /// Start from a session saved elsewhere. It is refreshed on first use if
    /// it has expired.
    pub fn with_session(self, session: Session) -> Self {
        self.set_session(Some(session));
        self
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
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
        let _ = self.auth_events.send(event);
    }

    /// The held session, renewed first when it is about to expire.
    async fn fresh_session(&self) -> Result<Option<Session>, AuthError> {
        let Some(session) = self.current() else {
            return Ok(None);
        };
        if !session.needs_refresh(Utc::now()) {
            return Ok(Some(session));
        }

        // Refresh tokens are single use; only one caller may spend it.
        let _refreshing = self.refresh_lock.lock().await;
        match self.current() {
            Some(session) if session.needs_refresh(Utc::now()) => {
                self.refresh_session().await.map(Some)
            }
            session => Ok(session),
        }
    }

    /// Request with the anon key, authorized as the signed-in user when
    /// there is one.
    async fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let session = match self.fresh_session().await {
            Ok(session) => session,
            Err(e) => {
                warn!("Could not renew the session, sending the old token: {}", e);
                self.current()
            }
        };
        let bearer = session
            .map(|s| s.access_token)
            .unwrap_or_else(|| self.config.anon_key().to_string());
        self.http
            .request(method, self.config.endpoint(path))
            .header("apikey", self.config.anon_key())
            .bearer_auth(bearer)
    }

    async fn send(&self, request: RequestBuilder) -> BackendResult<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| BackendError::Transport(Box::new(e)))?;
        check(response).await
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> BackendResult<T> {
        let response = self.send(request).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| BackendError::Transport(Box::new(e)))?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// POST to a table and return the single representation row.
    async fn insert_returning<B, T>(&self, table: &str, row: &B) -> BackendResult<T>
    where
        B: serde::Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let rows: Vec<T> = self
            .send_json(
                self.request(Method::POST, &format!("rest/v1/{}", table))
                    .await
                    .header("Prefer", "return=representation")
                    .json(row),
            )
            .await?;
        rows.into_iter().next().ok_or_else(|| {
            BackendError::Other(anyhow::anyhow!("insert into {} returned no row", table))
        })
    }

    async fn token_grant<B>(&self, grant_type: &str, body: &B) -> BackendResult<Session>
    where
        B: serde::Serialize + ?Sized,
    {
        let token: TokenResponse = self
            .send_json(
                self.http
                    .post(self.config.endpoint("auth/v1/token"))
                    .query(&[("grant_type", grant_type)])
                    .header("apikey", self.config.anon_key())
                    .json(body),
            )
            .await?;
        Ok(token.into_session(Utc::now()))
    }

    fn adopt(&self, session: &Session, event: AuthEvent) {
        self.set_session(Some(session.clone()));
        self.emit(event);
    }
}

/// Turn non-2xx responses into `BackendError::Status`, keeping whatever
/// message the body carried.
async fn check(response: Response) -> BackendResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .ok()
        .and_then(|body| body.describe().map(str::to_string))
        .unwrap_or(text);
    Err(BackendError::Status {
        status: status.as_u16(),
        message,
    })
}

fn is_rejected_credentials(e: &BackendError) -> bool {
    matches!(
        e,
        BackendError::Status { status, .. }
            if *status == StatusCode::BAD_REQUEST.as_u16() || *status == StatusCode::UNAUTHORIZED.as_u16()
    )
}

#[async_trait]
impl AuthProvider for RemoteBackend {
    async fn current_session(&self) -> BackendResult<Option<Session>> {
        match self.fresh_session().await {
            Ok(session) => Ok(session),
            Err(e) => {
                warn!("Saved session expired and could not be refreshed: {}", e);
                self.set_session(None);
                Ok(None)
            }
        }
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let request = PasswordGrantRequest {
            email: email.to_string(),
            password: password.to_string(),
        };
        let session = match self.token_grant("password", &request).await {
            Ok(session) => session,
            Err(e) if is_rejected_credentials(&e) => {
                debug!("Password grant rejected: {}", e);
                return Err(AuthError::InvalidCredentials);
            }
            Err(e) => return Err(e.into()),
        };

        info!("Signed in as {}", session.user_id());
        self.adopt(&session, AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn sign_up(&self, request: SignUpRequest) -> Result<SignUpOutcome, AuthError> {
        let response: SignUpResponse = self
            .send_json(
                self.http
                    .post(self.config.endpoint("auth/v1/signup"))
                    .header("apikey", self.config.anon_key())
                    .json(&request),
            )
            .await?;

        Ok(match response {
            SignUpResponse::Session(token) => {
                let session = token.into_session(Utc::now());
                self.adopt(&session, AuthEvent::SignedIn(session.clone()));
                SignUpOutcome::Session(session)
            }
            SignUpResponse::User(user) => SignUpOutcome::ConfirmationRequired(user),
        })
    }

    async fn refresh_session(&self) -> Result<Session, AuthError> {
        let current = self.current().ok_or(BackendError::NotAuthenticated)?;
        let request = RefreshGrantRequest {
            refresh_token: current.refresh_token,
        };
        let session = self.token_grant("refresh_token", &request).await?;
        debug!("Session refreshed for {}", session.user_id());
        self.adopt(&session, AuthEvent::TokenRefreshed(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> BackendResult<()> {
        if self.current().is_some() {
            let result = self.send(self.request(Method::POST, "auth/v1/logout").await).await;
            if let Err(e) = result {
                // The local session goes regardless; the token just lives
                // out its expiry server-side.
                warn!("Logout request failed: {}", e);
            }
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
impl RelationalStore for RemoteBackend {
    async fn list_profiles_except(&self, user_id: Uuid) -> BackendResult<Vec<Profile>> {
        self.send_json(
            self.request(Method::GET, "rest/v1/profiles")
                .await
                .query(&rest::profiles_except_query(user_id)),
        )
        .await
    }

    async fn list_conversation(&self, pair: PeerPair) -> BackendResult<Vec<StoredMessage>> {
        self.send_json(
            self.request(Method::GET, "rest/v1/messages")
                .await
                .query(&rest::conversation_query(pair)),
        )
        .await
    }

    async fn insert_message(&self, message: NewMessage) -> BackendResult<StoredMessage> {
        self.insert_returning("messages", &message).await
    }

    async fn upsert_user(&self, user: UserRecord) -> BackendResult<()> {
        self.send(
            self.request(Method::POST, "rest/v1/users")
                .await
                .header("Prefer", "resolution=merge-duplicates")
                .json(&[user]),
        )
        .await?;
        Ok(())
    }

    async fn insert_blog(&self, blog: NewBlog) -> BackendResult<Blog> {
        self.insert_returning("blogs", &blog).await
    }
}

#[async_trait]
impl ChangeFeed for RemoteBackend {
    async fn subscribe_messages(&self, pair: PeerPair) -> BackendResult<Subscription> {
        let session = self
            .fresh_session()
            .await?
            .ok_or(BackendError::NotAuthenticated)?;
        realtime::subscribe(&self.config, &session.access_token, pair).await
    }
}

#[async_trait]
impl ObjectStore for RemoteBackend {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Bytes,
        options: UploadOptions,
    ) -> BackendResult<()> {
        let content_type = options
            .content_type
            .as_deref()
            .unwrap_or("application/octet-stream");
        let mut request = self
            .request(Method::POST, &format!("storage/v1/object/{}/{}", bucket, path))
            .await
            .header(header::CONTENT_TYPE, content_type)
            .header("x-upsert", if options.upsert { "true" } else { "false" });
        if let Some(cache) = &options.cache_control {
            request = request.header(header::CACHE_CONTROL, format!("max-age={}", cache));
        }

        let size = bytes.len();
        self.send(request.body(bytes)).await?;
        debug!("Uploaded {}/{} ({} bytes)", bucket, path, size);
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        self.config.public_object_url(bucket, path)
    }
}
