use std::str::FromStr;
use std::time::Duration;

/// Fixed poll period while a conversation is live.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Largest attachment accepted for upload (8 MiB, inclusive).
pub const MAX_ATTACHMENT_BYTES: u64 = 8 * 1024 * 1024;

/// Object-store bucket holding chat attachments and blog images.
pub const DEFAULT_BUCKET: &str = "chat-media";

/// What to do with the typed text when the attachment upload fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UploadFailurePolicy {
    /// Fail the whole send, text included.
    #[default]
    Abort,
    /// Send the text alone when there is any.
    SendTextOnly,
}

impl FromStr for UploadFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "text" | "text-only" | "send-text-only" => Ok(Self::SendTextOnly),
            other => Err(format!("unknown upload failure policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub poll_interval: Duration,
    pub max_attachment_bytes: u64,
    pub bucket: String,
    pub upload_failure: UploadFailurePolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_attachment_bytes: MAX_ATTACHMENT_BYTES,
            bucket: DEFAULT_BUCKET.to_string(),
            upload_failure: UploadFailurePolicy::default(),
        }
    }
}
