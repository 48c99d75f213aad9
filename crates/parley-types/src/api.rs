use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{AuthUser, Session};

// -- JWT Claims --

/// Access-token claims. The embedded backend signs these; the hosted backend
/// issues tokens with a superset of the same fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    #[serde(default)]
    pub email: Option<String>,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Serialize, Deserialize)]
pub struct PasswordGrantRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshGrantRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Seconds until `access_token` expires
    pub expires_in: i64,
    pub user: AuthUser,
}

impl TokenResponse {
    pub fn into_session(self, now: DateTime<Utc>) -> Session {
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: Some(now + Duration::seconds(self.expires_in)),
            user: self.user,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignUpMetadata {
    pub full_name: String,
    pub role: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SignUpRequest {
    pub email: String,
    pub password: String,
    pub data: SignUpMetadata,
}

/// Sign-up answers with a full session when the account is usable right away,
/// or with the bare user when the address still needs confirming.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignUpResponse {
    Session(TokenResponse),
    User(AuthUser),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignUpOutcome {
    Session(Session),
    ConfirmationRequired(AuthUser),
}

// -- Errors --

/// Error body returned by the hosted backend's auth and rest endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default, alias = "error_description", alias = "msg")]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ErrorBody {
    pub fn describe(&self) -> Option<&str> {
        self.message.as_deref().or(self.error.as_deref())
    }
}
