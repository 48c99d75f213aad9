//! Text and attachment URL share the single `content` column.
//!
//! Stored form: `"<text> [ATTACHMENT]<url>"`, or just `<text>` without an
//! attachment. A row is an attachment message iff the delimiter occurs in it.

/// Marker separating the text from the attachment URL.
pub const ATTACHMENT_DELIMITER: &str = "[ATTACHMENT]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedContent {
    pub text: String,
    pub attachment_url: Option<String>,
}

impl DecodedContent {
    pub fn is_attachment(&self) -> bool {
        self.attachment_url.is_some()
    }
}

/// Build the persisted `content` value.
pub fn encode_content(text: &str, attachment_url: Option<&str>) -> String {
    match attachment_url {
        Some(url) => format!("{} {}{}", text, ATTACHMENT_DELIMITER, url),
        None => text.to_string(),
    }
}

/// Split stored content on the first delimiter and trim both halves.
/// Content without the delimiter is returned untouched.
pub fn decode_content(raw: &str) -> DecodedContent {
    match raw.split_once(ATTACHMENT_DELIMITER) {
        Some((text, url)) => DecodedContent {
            text: text.trim().to_string(),
            attachment_url: Some(url.trim().to_string()),
        },
        None => DecodedContent {
            text: raw.to_string(),
            attachment_url: None,
        },
    }
}

pub fn is_attachment(raw: &str) -> bool {
    raw.contains(ATTACHMENT_DELIMITER)
}
