use std::time::Duration;

use thiserror::Error;

/// Failure talking to one of the backend services.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("backend returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("no active session")]
    NotAuthenticated,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid email or password")]
    InvalidCredentials,

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl From<AuthError> for BackendError {
    /// Rejected credentials mean there is no usable session.
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Backend(e) => e,
            AuthError::InvalidCredentials => Self::NotAuthenticated,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ComposeError {
    #[error("file size exceeds the limit of {}. Your file is {}", mib(.limit), mib(.size))]
    TooLarge { size: u64, limit: u64 },
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("file size exceeds the limit of {}. Your file is {}", mib(.limit), mib(.size))]
    AttachmentTooLarge { size: u64, limit: u64 },

    #[error("error uploading file: {0}")]
    Upload(#[source] BackendError),

    #[error("error sending message: {0}")]
    Insert(#[source] BackendError),
}

impl From<ComposeError> for SendError {
    fn from(e: ComposeError) -> Self {
        match e {
            ComposeError::TooLarge { size, limit } => Self::AttachmentTooLarge { size, limit },
        }
    }
}

#[derive(Debug, Error)]
pub enum SignupError {
    #[error("passwords don't match")]
    PasswordMismatch,

    #[error("please enter a valid email address")]
    InvalidEmail,

    #[error("please agree to the Terms of Service and Privacy Policy")]
    TermsNotAccepted,

    #[error("please wait {} seconds before trying again", .remaining.as_secs())]
    CoolingDown { remaining: Duration },

    #[error("sign-up failed: {0}")]
    Auth(#[source] AuthError),

    #[error("user registration failed: {0}")]
    Profile(#[source] BackendError),
}

#[derive(Debug, Error)]
pub enum BlogError {
    #[error("title and content are required")]
    MissingFields,

    #[error("image upload failed: {0}")]
    Upload(#[source] BackendError),

    #[error("error creating blog: {0}")]
    Insert(#[source] BackendError),
}

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("hand-off storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt hand-off entry: {0}")]
    Json(#[from] serde_json::Error),
}

fn mib(bytes: &u64) -> String {
    format!("{:.2}MB", *bytes as f64 / (1024.0 * 1024.0))
}
