//! Change feed over the realtime websocket.
//!
//! The socket speaks Phoenix channel frames: join a topic with a
//! `postgres_changes` config, send a heartbeat every 25 seconds, receive
//! `postgres_changes` events, and `phx_leave` on the way out.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, trace, warn};

use parley_core::backend::{BackendResult, Subscription, TaskGuard};
use parley_core::error::BackendError;
use parley_types::models::{PeerPair, StoredMessage};

use crate::config::RemoteConfig;
use crate::rest::realtime_filter;

/// The server drops sockets that stay silent for longer than this.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// How long to wait for the join to be acknowledged.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

const PHOENIX_TOPIC: &str = "phoenix";
const JOIN_REF: &str = "1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

impl Frame {
    pub fn join(topic: &str, pair: PeerPair, access_token: &str) -> Self {
        Self {
            topic: topic.to_string(),
            event: "phx_join".into(),
            payload: json!({
                "config": {
                    "broadcast": { "self": false },
                    "presence": { "key": "" },
                    "postgres_changes": [{
                        "event": "INSERT",
                        "schema": "public",
                        "table": "messages",
                        "filter": realtime_filter(pair),
                    }],
                },
                "access_token": access_token,
            }),
            reference: Some(JOIN_REF.into()),
        }
    }

    pub fn heartbeat(reference: u64) -> Self {
        Self {
            topic: PHOENIX_TOPIC.into(),
            event: "heartbeat".into(),
            payload: json!({}),
            reference: Some(reference.to_string()),
        }
    }

    pub fn leave(topic: &str, reference: u64) -> Self {
        Self {
            topic: topic.to_string(),
            event: "phx_leave".into(),
            payload: json!({}),
            reference: Some(reference.to_string()),
        }
    }

    fn to_message(&self) -> Message {
        // Frames only hold JSON values, which always serialize.
        Message::Text(serde_json::to_string(self).unwrap_or_default().into())
    }

    /// Status of a `phx_reply`, if this is one.
    pub fn reply_status(&self) -> Option<&str> {
        if self.event != "phx_reply" {
            return None;
        }
        self.payload.get("status").and_then(Value::as_str)
    }

    /// The inserted row carried by a `postgres_changes` event.
    pub fn inserted_row(&self) -> Option<Result<StoredMessage, serde_json::Error>> {
        if self.event != "postgres_changes" {
            return None;
        }
        let data = self.payload.get("data")?;
        if data.get("type").and_then(Value::as_str) != Some("INSERT") {
            return None;
        }
        let record = data.get("record")?;
        Some(serde_json::from_value(record.clone()))
    }
}

fn topic_for(pair: PeerPair) -> String {
    format!("realtime:messages:{}:{}", pair.self_id, pair.peer_id)
}

fn transport<E>(e: E) -> BackendError
where
    E: std::error::Error + Send + Sync + 'static,
{
    BackendError::Transport(Box::new(e))
}

/// Wait for the server's reply to our join.
async fn await_join<S>(stream: &mut S, topic: &str) -> BackendResult<()>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(msg) = stream.next().await {
        let Message::Text(text) = msg.map_err(transport)? else {
            continue;
        };
        let frame: Frame = serde_json::from_str(&text)?;
        if frame.topic != topic || frame.reference.as_deref() != Some(JOIN_REF) {
            continue;
        }
        return match frame.reply_status() {
            Some("ok") => Ok(()),
            status => Err(BackendError::Status {
                status: 400,
                message: format!(
                    "join rejected ({}): {}",
                    status.unwrap_or("no status"),
                    frame.payload
                ),
            }),
        };
    }
    Err(BackendError::Other(anyhow::anyhow!("socket closed before join reply")))
}

/// Open a socket, join the pair's topic and forward inserted rows.
///
/// Connection and join failures are returned so the caller can fall back to
/// polling. Dropping the returned subscription stops the forwarder and
/// leaves the channel with `phx_leave`.
pub async fn subscribe(
    config: &RemoteConfig,
    access_token: &str,
    pair: PeerPair,
) -> BackendResult<Subscription> {
    let (ws, _) = tokio_tungstenite::connect_async(config.realtime_url().as_str())
        .await
        .map_err(transport)?;
    let (mut sink, mut stream) = ws.split();

    let topic = topic_for(pair);
    sink.send(Frame::join(&topic, pair, access_token).to_message())
        .await
        .map_err(transport)?;

    tokio::time::timeout(JOIN_TIMEOUT, await_join(&mut stream, &topic))
        .await
        .map_err(|_| BackendError::Other(anyhow::anyhow!("timed out joining {}", topic)))??;

    info!("Joined {}", topic);

    let sink = Arc::new(Mutex::new(sink));
    let next_ref = Arc::new(AtomicU64::new(2));
    let (tx, rx) = mpsc::unbounded_channel();

    let task = {
        let sink = sink.clone();
        let next_ref = next_ref.clone();
        let topic = topic.clone();
        TaskGuard::spawn(async move {
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            heartbeat.tick().await;

            loop {
                tokio::select! {
                    _ = heartbeat.tick() => {
                        let reference = next_ref.fetch_add(1, Ordering::Relaxed);
                        trace!("Heartbeat {}", reference);
                        let sent = sink.lock().await.send(Frame::heartbeat(reference).to_message()).await;
                        if sent.is_err() {
                            warn!("Realtime socket closed while sending heartbeat");
                            break;
                        }
                    }
                    msg = stream.next() => {
                        let text = match msg {
                            Some(Ok(Message::Text(text))) => text,
                            Some(Ok(Message::Close(_))) | None => {
                                warn!("Realtime socket for {} closed", topic);
                                break;
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                error!("Realtime socket error: {}", e);
                                break;
                            }
                        };
                        let frame: Frame = match serde_json::from_str(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!("Ignoring malformed frame: {}", e);
                                continue;
                            }
                        };
                        match frame.inserted_row() {
                            Some(Ok(row)) => {
                                if !pair.contains(row.sender_id, row.receiver_id) {
                                    continue;
                                }
                                if tx.send(row).is_err() {
                                    break;
                                }
                            }
                            Some(Err(e)) => warn!("Ignoring undecodable row: {}", e),
                            None => {
                                if frame.event == "phx_error" || frame.event == "phx_close" {
                                    warn!("Channel {} ended: {}", topic, frame.event);
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        })
    };

    // The forwarder is aborted first; the leave goes out on its own short task.
    let leave = move || {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        runtime.spawn(async move {
            debug!("Leaving {}", topic);
            let reference = next_ref.fetch_add(1, Ordering::Relaxed);
            let mut sink = sink.lock().await;
            let _ = sink.send(Frame::leave(&topic, reference).to_message()).await;
            let _ = sink.close().await;
        });
    };

    Ok(Subscription::new(rx).with_task(task).on_release(leave))
}
