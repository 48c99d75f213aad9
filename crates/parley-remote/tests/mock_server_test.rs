use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes as BodyBytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use bytes::Bytes;
use chrono::Utc;
use serde_json::{Value, json};
use uuid::Uuid;

use parley_core::backend::{
    AuthProvider, ChangeFeed, ObjectStore, RelationalStore, UploadOptions,
};
use parley_core::error::{AuthError, BackendError};
use parley_remote::{RemoteBackend, RemoteConfig};
use parley_types::api::{SignUpMetadata, SignUpOutcome, SignUpRequest};
use parley_types::events::AuthEvent;
use parley_types::models::{AuthUser, NewMessage, PeerPair, Session, UserRecord};

const ANON: &str = "anon-key";

#[derive(Default)]
struct Mock {
    user_id: Uuid,
    peer_id: Uuid,
    next_id: AtomicI64,
    queries: Mutex<Vec<HashMap<String, String>>>,
    bearers: Mutex<Vec<String>>,
    inserted: Mutex<Vec<Value>>,
    users: Mutex<Vec<Value>>,
    uploads: Mutex<Vec<(String, String, String, String, usize)>>,
    joins: Mutex<Vec<Value>>,
    left: AtomicBool,
    closed: AtomicBool,
}

fn token(user_id: Uuid, access: &str, refresh: &str) -> Value {
    json!({
        "access_token": access,
        "refresh_token": refresh,
        "expires_in": 3600,
        "token_type": "bearer",
        "user": { "id": user_id, "email": "ann@example.com" }
    })
}

fn record_bearer(state: &Mock, headers: &HeaderMap) {
    if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        state.bearers.lock().unwrap().push(value.to_string());
    }
}

async fn token_grant(
    State(state): State<Arc<Mock>>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Response {
    match query.get("grant_type").map(String::as_str) {
        Some("password")
            if body["email"] == "ann@example.com" && body["password"] == "secret" =>
        {
            Json(token(state.user_id, "access-1", "refresh-1")).into_response()
        }
        Some("refresh_token") if body["refresh_token"] == "refresh-1" => {
            Json(token(state.user_id, "access-2", "refresh-2")).into_response()
        }
        _ => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "invalid_grant",
                "error_description": "Invalid login credentials"
            })),
        )
            .into_response(),
    }
}

async fn signup(State(state): State<Arc<Mock>>, Json(body): Json<Value>) -> Response {
    let email = body["email"].as_str().unwrap_or_default();
    if email.starts_with("confirm") {
        return Json(json!({ "id": Uuid::new_v4(), "email": email })).into_response();
    }
    assert_eq!(body["data"]["role"], "student");
    Json(token(state.user_id, "access-1", "refresh-1")).into_response()
}

async fn logout(State(state): State<Arc<Mock>>, headers: HeaderMap) -> StatusCode {
    record_bearer(&state, &headers);
    StatusCode::NO_CONTENT
}

async fn list_profiles(
    State(state): State<Arc<Mock>>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    state.queries.lock().unwrap().push(query);
    Json(json!([
        { "id": state.peer_id, "username": "bob", "full_name": "Bob", "avatar_url": null }
    ]))
}

async fn list_messages(
    State(state): State<Arc<Mock>>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    state.queries.lock().unwrap().push(query);
    Json(Value::Array(state.inserted.lock().unwrap().clone()))
}

async fn insert_message(
    State(state): State<Arc<Mock>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    record_bearer(&state, &headers);
    if headers.get("prefer").and_then(|v| v.to_str().ok()) != Some("return=representation") {
        return StatusCode::NO_CONTENT.into_response();
    }
    let row = json!({
        "id": state.next_id.fetch_add(1, Ordering::SeqCst) + 1,
        "sender_id": body["sender_id"],
        "receiver_id": body["receiver_id"],
        "content": body["content"],
        "created_at": "2024-05-01T12:00:00.000000+00:00"
    });
    state.inserted.lock().unwrap().push(row.clone());
    (StatusCode::CREATED, Json(json!([row]))).into_response()
}

async fn upsert_users(
    State(state): State<Arc<Mock>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    assert_eq!(
        headers.get("prefer").and_then(|v| v.to_str().ok()),
        Some("resolution=merge-duplicates")
    );
    state.users.lock().unwrap().push(body);
    StatusCode::CREATED
}

async fn upload(
    State(state): State<Arc<Mock>>,
    Path((bucket, path)): Path<(String, String)>,
    headers: HeaderMap,
    body: BodyBytes,
) -> Response {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    if bucket == "full" {
        return (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(json!({ "error": "Payload too large", "message": "The object exceeded the maximum allowed size" })),
        )
            .into_response();
    }
    state.uploads.lock().unwrap().push((
        bucket,
        path,
        header("content-type"),
        header("x-upsert"),
        body.len(),
    ));
    Json(json!({ "Key": "ok" })).into_response()
}

async fn realtime(ws: WebSocketUpgrade, State(state): State<Arc<Mock>>) -> Response {
    ws.on_upgrade(move |socket| realtime_socket(socket, state))
}

async fn realtime_socket(mut socket: WebSocket, state: Arc<Mock>) {
    while let Some(Ok(msg)) = socket.recv().await {
        let Message::Text(text) = msg else { continue };
        let frame: Value = serde_json::from_str(text.as_str()).unwrap();
        match frame["event"].as_str() {
            Some("phx_join") => {
                state.joins.lock().unwrap().push(frame.clone());
                let topic = frame["topic"].clone();
                let reply = json!({
                    "topic": topic,
                    "event": "phx_reply",
                    "payload": { "status": "ok", "response": { "postgres_changes": [] } },
                    "ref": frame["ref"]
                });
                socket.send(Message::Text(reply.to_string().into())).await.unwrap();

                let change = |sender: Uuid, receiver: Uuid, id: i64| {
                    json!({
                        "topic": topic,
                        "event": "postgres_changes",
                        "payload": {
                            "data": {
                                "type": "INSERT",
                                "table": "messages",
                                "schema": "public",
                                "record": {
                                    "id": id,
                                    "sender_id": sender,
                                    "receiver_id": receiver,
                                    "content": "hi [ATTACHMENT]https://x/y.png",
                                    "created_at": "2024-05-01T12:00:00Z"
                                }
                            },
                            "ids": [1]
                        },
                        "ref": null
                    })
                };
                // A row for someone else first, then one for the pair.
                let stranger = change(state.peer_id, Uuid::new_v4(), 90);
                let ours = change(state.peer_id, state.user_id, 91);
                for frame in [stranger, ours] {
                    socket.send(Message::Text(frame.to_string().into())).await.unwrap();
                }
            }
            Some("phx_leave") => state.left.store(true, Ordering::SeqCst),
            _ => {}
        }
    }
    state.closed.store(true, Ordering::SeqCst);
}

async fn spawn_mock() -> (Arc<Mock>, RemoteBackend) {
    let state = Arc::new(Mock {
        user_id: Uuid::new_v4(),
        peer_id: Uuid::new_v4(),
        ..Mock::default()
    });

    let app = Router::new()
        .route("/auth/v1/token", post(token_grant))
        .route("/auth/v1/signup", post(signup))
        .route("/auth/v1/logout", post(logout))
        .route("/rest/v1/profiles", get(list_profiles))
        .route("/rest/v1/messages", get(list_messages).post(insert_message))
        .route("/rest/v1/users", post(upsert_users))
        .route("/storage/v1/object/{bucket}/{*path}", post(upload))
        .route("/realtime/v1/websocket", get(realtime))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let config = RemoteConfig::new(&format!("http://{}", addr), ANON).unwrap();
    (state, RemoteBackend::new(config))
}

#[tokio::test]
async fn test_password_sign_in_and_refresh() {
    let (state, backend) = spawn_mock().await;
    let mut events = backend.subscribe();

    assert!(backend.current_session().await.unwrap().is_none());
    assert!(matches!(
        backend.sign_in_with_password("ann@example.com", "nope").await,
        Err(AuthError::InvalidCredentials)
    ));

    let session = backend
        .sign_in_with_password("ann@example.com", "secret")
        .await
        .unwrap();
    assert_eq!(session.user_id(), state.user_id);
    assert_eq!(session.access_token, "access-1");
    assert!(session.expires_at.is_some());
    assert!(matches!(events.recv().await.unwrap(), AuthEvent::SignedIn(_)));

    let refreshed = backend.refresh_session().await.unwrap();
    assert_eq!(refreshed.access_token, "access-2");
    assert!(matches!(
        events.recv().await.unwrap(),
        AuthEvent::TokenRefreshed(_)
    ));
    assert_eq!(
        backend.current_session().await.unwrap().map(|s| s.access_token),
        Some("access-2".to_string())
    );

    backend.sign_out().await.unwrap();
    assert!(matches!(events.recv().await.unwrap(), AuthEvent::SignedOut));
    assert!(backend.current_session().await.unwrap().is_none());
    assert_eq!(
        state.bearers.lock().unwrap().last().map(String::as_str),
        Some("Bearer access-2")
    );
}

#[tokio::test]
async fn test_stale_session_is_renewed_before_use() {
    let (state, backend) = spawn_mock().await;
    let backend = backend.with_session(Session {
        access_token: "stale".into(),
        refresh_token: "refresh-1".into(),
        expires_at: Some(Utc::now() - chrono::Duration::seconds(60)),
        user: AuthUser {
            id: state.user_id,
            email: Some("ann@example.com".into()),
        },
    });
    let mut events = backend.subscribe();

    backend
        .insert_message(NewMessage {
            sender_id: state.user_id,
            receiver_id: state.peer_id,
            content: "after lunch".into(),
        })
        .await
        .unwrap();
    assert_eq!(
        state.bearers.lock().unwrap().clone(),
        vec!["Bearer access-2".to_string()]
    );
    assert!(matches!(
        events.recv().await.unwrap(),
        AuthEvent::TokenRefreshed(_)
    ));

    // The renewed token is reused; refresh-1 is not spent twice.
    let pair = PeerPair::new(state.user_id, state.peer_id);
    let sub = backend.subscribe_messages(pair).await.unwrap();
    assert_eq!(state.joins.lock().unwrap()[0]["payload"]["access_token"], "access-2");
    drop(sub);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_sign_up_outcomes() {
    let (_state, backend) = spawn_mock().await;
    let request = |email: &str| SignUpRequest {
        email: email.into(),
        password: "hunter22".into(),
        data: SignUpMetadata {
            full_name: "Ann".into(),
            role: "student".into(),
        },
    };

    assert!(matches!(
        backend.sign_up(request("confirm@example.com")).await.unwrap(),
        SignUpOutcome::ConfirmationRequired(_)
    ));
    assert!(backend.current_session().await.unwrap().is_none());

    assert!(matches!(
        backend.sign_up(request("ann@example.com")).await.unwrap(),
        SignUpOutcome::Session(_)
    ));
    assert!(backend.current_session().await.unwrap().is_some());
}

#[tokio::test]
async fn test_rest_queries_and_insert() {
    let (state, backend) = spawn_mock().await;
    backend
        .sign_in_with_password("ann@example.com", "secret")
        .await
        .unwrap();
    let pair = PeerPair::new(state.user_id, state.peer_id);

    let profiles = backend.list_profiles_except(state.user_id).await.unwrap();
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0].username.as_deref(), Some("bob"));

    let row = backend
        .insert_message(NewMessage {
            sender_id: state.user_id,
            receiver_id: state.peer_id,
            content: "hello".into(),
        })
        .await
        .unwrap();
    assert_eq!(row.id.as_str(), "1");
    assert_eq!(row.content.as_deref(), Some("hello"));
    assert_eq!(
        state.bearers.lock().unwrap().last().map(String::as_str),
        Some("Bearer access-1")
    );

    let listed = backend.list_conversation(pair).await.unwrap();
    assert_eq!(listed, vec![row]);

    let queries = state.queries.lock().unwrap().clone();
    assert_eq!(queries[0]["id"], format!("neq.{}", state.user_id));
    assert_eq!(queries[1]["order"], "created_at.asc");
    assert!(queries[1]["or"].contains(&format!("sender_id.eq.{}", state.peer_id)));

    backend
        .upsert_user(UserRecord {
            id: state.user_id,
            name: "Ann".into(),
            email: "ann@example.com".into(),
            role: "student".into(),
        })
        .await
        .unwrap();
    assert_eq!(state.users.lock().unwrap()[0][0]["role"], "student");
}

#[tokio::test]
async fn test_storage_upload_and_error_body() {
    let (state, backend) = spawn_mock().await;
    let path = format!("{}/abc.png", state.user_id);
    let options = UploadOptions {
        content_type: Some("image/png".into()),
        ..UploadOptions::default()
    };

    backend
        .upload("chat-media", &path, Bytes::from_static(b"png!"), options.clone())
        .await
        .unwrap();
    let uploads = state.uploads.lock().unwrap().clone();
    assert_eq!(
        uploads,
        vec![(
            "chat-media".to_string(),
            path.clone(),
            "image/png".to_string(),
            "false".to_string(),
            4
        )]
    );

    let url = backend.public_url("chat-media", &path);
    assert!(url.ends_with(&format!("/storage/v1/object/public/chat-media/{}", path)));

    match backend
        .upload("full", "x.bin", Bytes::from_static(b"x"), options)
        .await
    {
        Err(BackendError::Status { status, message }) => {
            assert_eq!(status, 413);
            assert_eq!(message, "The object exceeded the maximum allowed size");
        }
        other => panic!("expected a status error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_realtime_forwards_pair_rows_and_leaves() {
    let (state, backend) = spawn_mock().await;
    let pair = PeerPair::new(state.user_id, state.peer_id);

    assert!(matches!(
        backend.subscribe_messages(pair).await,
        Err(BackendError::NotAuthenticated)
    ));

    backend
        .sign_in_with_password("ann@example.com", "secret")
        .await
        .unwrap();
    let mut sub = backend.subscribe_messages(pair).await.unwrap();

    let row = tokio::time::timeout(Duration::from_secs(5), sub.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.id.as_str(), "91");
    assert_eq!(row.receiver_id, state.user_id);

    let join = state.joins.lock().unwrap()[0].clone();
    assert_eq!(join["payload"]["access_token"], "access-1");
    assert_eq!(
        join["payload"]["config"]["postgres_changes"][0]["table"],
        "messages"
    );

    drop(sub);
    tokio::time::timeout(Duration::from_secs(5), async {
        while !state.closed.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("socket was never closed");
    assert!(state.left.load(Ordering::SeqCst));
}
