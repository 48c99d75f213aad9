use serde::{Deserialize, Serialize};

use crate::models::Session;

/// Session-changed notifications emitted by an auth provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AuthEvent {
    /// A session was established by sign-in or sign-up
    SignedIn(Session),

    /// The access token was replaced
    TokenRefreshed(Session),

    /// The session was cleared
    SignedOut,
}

impl AuthEvent {
    /// The session the client should hold after this event.
    pub fn session(&self) -> Option<&Session> {
        match self {
            Self::SignedIn(session) | Self::TokenRefreshed(session) => Some(session),
            Self::SignedOut => None,
        }
    }
}
