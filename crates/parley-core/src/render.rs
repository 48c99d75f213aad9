//! Display-time transforms. Nothing here is persisted.

use std::sync::LazyLock;

use chrono::{DateTime, Local, Utc};
use regex::Regex;

use parley_types::models::Profile;

static URL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s]+").expect("static pattern"));

static IMAGE_EXTENSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.(jpeg|jpg|gif|png)$").expect("static pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    Text(&'a str),
    Link(&'a str),
}

/// Split message text into plain runs and bare `http(s)://` links.
pub fn linkify(text: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut last = 0;

    for m in URL_PATTERN.find_iter(text) {
        if m.start() > last {
            segments.push(Segment::Text(&text[last..m.start()]));
        }
        segments.push(Segment::Link(m.as_str()));
        last = m.end();
    }

    if last < text.len() {
        segments.push(Segment::Text(&text[last..]));
    }

    segments
}

/// How an attachment URL is shown: inline preview or download link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Image,
    File,
}

impl AttachmentKind {
    pub fn classify(url: &str) -> Self {
        if IMAGE_EXTENSION.is_match(url) {
            Self::Image
        } else {
            Self::File
        }
    }
}

/// `username`, else `full_name`, else "User".
pub fn display_name(profile: &Profile) -> &str {
    profile
        .username
        .as_deref()
        .filter(|s| !s.is_empty())
        .or(profile.full_name.as_deref().filter(|s| !s.is_empty()))
        .unwrap_or("User")
}

/// Letter shown in place of a missing avatar.
pub fn avatar_initial(profile: &Profile) -> char {
    display_name(profile)
        .chars()
        .next()
        .map(|c| c.to_uppercase().next().unwrap_or(c))
        .unwrap_or('U')
}

/// Secondary line under the name, shown only when both names are set.
pub fn secondary_name(profile: &Profile) -> Option<&str> {
    match (&profile.username, &profile.full_name) {
        (Some(u), Some(f)) if !u.is_empty() && !f.is_empty() => Some(f.as_str()),
        _ => None,
    }
}

/// Local wall-clock `HH:MM`.
pub fn format_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%H:%M").to_string()
}
