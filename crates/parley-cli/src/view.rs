//! Plain-text rendering for the terminal.

use uuid::Uuid;

use parley_core::Message;
use parley_core::render::{AttachmentKind, Segment, display_name, format_time, linkify, secondary_name};
use parley_types::models::Profile;

/// Text with links wrapped in angle brackets so terminals pick them up.
pub fn linked_text(text: &str) -> String {
    linkify(text)
        .into_iter()
        .map(|segment| match segment {
            Segment::Text(t) => t.to_string(),
            Segment::Link(url) => format!("<{}>", url),
        })
        .collect()
}

pub fn message_line(message: &Message, self_id: Uuid, peer: &Profile) -> String {
    let who = if message.is_from(self_id) {
        "you"
    } else {
        display_name(peer)
    };

    let mut line = format!("[{}] {}:", format_time(message.created_at), who);
    if !message.content.is_empty() {
        line.push(' ');
        line.push_str(&linked_text(&message.content));
    }
    if let Some(url) = &message.attachment_url {
        let label = match AttachmentKind::classify(url) {
            AttachmentKind::Image => "image",
            AttachmentKind::File => "file",
        };
        line.push_str(&format!(" [{}: {}]", label, url));
    }
    if message.is_optimistic {
        line.push_str(" (sending)");
    }
    line
}

pub fn profile_line(profile: &Profile) -> String {
    match (profile.username.as_deref(), secondary_name(profile)) {
        (Some(username), Some(full_name)) => format!("@{} ({})", username, full_name),
        (Some(username), None) if !username.is_empty() => format!("@{}", username),
        _ => format!("{} (no username)", display_name(profile)),
    }
}
