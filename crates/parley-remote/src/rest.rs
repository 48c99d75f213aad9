//! Query-string filters for the PostgREST-style table API.

use uuid::Uuid;

use parley_types::models::PeerPair;

/// `or` filter selecting both directions of a conversation.
pub fn conversation_filter(pair: PeerPair) -> String {
    format!(
        "(and(sender_id.eq.{a},receiver_id.eq.{b}),and(sender_id.eq.{b},receiver_id.eq.{a}))",
        a = pair.self_id,
        b = pair.peer_id
    )
}

/// Query pairs for [`conversation_filter`], oldest first.
pub fn conversation_query(pair: PeerPair) -> Vec<(&'static str, String)> {
    vec![
        ("select", "*".to_string()),
        ("or", conversation_filter(pair)),
        ("order", "created_at.asc".to_string()),
    ]
}

pub fn profiles_except_query(user_id: Uuid) -> Vec<(&'static str, String)> {
    vec![
        ("select", "*".to_string()),
        ("id", format!("neq.{}", user_id)),
    ]
}

/// Single-column filter for the realtime feed. The feed cannot express the
/// pair, so this narrows to rows sent by either side and the receiver is
/// checked on delivery.
pub fn realtime_filter(pair: PeerPair) -> String {
    format!("sender_id=in.({},{})", pair.self_id, pair.peer_id)
}
