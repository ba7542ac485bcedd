use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{self, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use fogwatch_client::auth::{Authenticator, Credentials};
use fogwatch_client::backend::rest::{RestBackend, RestError};
use fogwatch_client::backend::{Backend, ChangeKind, SessionFilter, Table, TableChange};
use fogwatch_core::{NewFoggingLog, SensorId};
use jiff::civil::date;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const ANON_KEY: &str = "anon-key";

#[derive(Debug, Clone)]
struct Captured {
    method: Method,
    path: String,
    query: String,
    apikey: Option<String>,
    authorization: Option<String>,
    prefer: Option<String>,
    body: String,
}

type Log = Arc<Mutex<Vec<Captured>>>;

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

fn sensor_json(id: &str) -> Value {
    json!({
        "id": id,
        "name": "North Gate",
        "location": "University Ave",
        "status": "active",
        "mosquito_level": "high",
        "last_updated": "2024-06-01T08:00:00+00:00",
        "last_fogged": null,
        "coordinates": { "lat": 14.65, "lng": 121.06 }
    })
}

async fn fake_backend(
    State(log): State<Log>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    let query = uri.query().unwrap_or_default().to_owned();
    log.lock().unwrap().push(Captured {
        method: method.clone(),
        path: uri.path().to_owned(),
        query: query.clone(),
        apikey: header(&headers, "apikey"),
        authorization: header(&headers, "authorization"),
        prefer: header(&headers, "prefer"),
        body: body.clone(),
    });

    match (method, uri.path()) {
        (Method::GET, "/rest/v1/sensors") => axum::Json(json!([sensor_json("s1")])).into_response(),
        (Method::GET, "/rest/v1/detections") => axum::Json(json!([{
            "id": "d1",
            "sensor_id": "s1",
            "image_url": "https://img/d1.jpg",
            "confidence": 0.82,
            "timestamp": "2024-06-01T08:05:00+00:00",
            "sensor": sensor_json("s1"),
        }]))
        .into_response(),
        (Method::GET, "/rest/v1/user_sessions") => axum::Json(json!([])).into_response(),
        (Method::POST, "/rest/v1/fogging_logs") => StatusCode::CREATED.into_response(),
        (Method::PATCH, "/rest/v1/sensors") if query.contains("id=eq.s1") => {
            axum::Json(json!([sensor_json("s1")])).into_response()
        }
        (Method::PATCH, "/rest/v1/sensors") => axum::Json(json!([])).into_response(),
        (Method::POST, "/auth/v1/token") if body.contains("hunter2") => axum::Json(json!({
            "access_token": "user-token",
            "refresh_token": "refresh",
            "expires_in": 3600,
            "token_type": "bearer",
            "user": { "id": "c0ffee", "email": "ops@up.edu.ph" }
        }))
        .into_response(),
        (Method::POST, "/auth/v1/token")
            if query.contains("grant_type=refresh_token") && body.contains("\"refresh\"") =>
        {
            axum::Json(json!({
                "access_token": "refreshed-token",
                "refresh_token": "refresh-2",
                "expires_in": 3600,
                "token_type": "bearer",
                "user": { "id": "c0ffee", "email": "ops@up.edu.ph" }
            }))
            .into_response()
        }
        (Method::POST, "/auth/v1/token") => (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({
                "error": "invalid_grant",
                "error_description": "Invalid login credentials"
            })),
        )
            .into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn spawn_backend() -> (RestBackend, Log) {
    let log = Log::default();
    let app = Router::new()
        .fallback(fake_backend)
        .with_state(Arc::clone(&log));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    let backend = RestBackend::new(&format!("http://{addr}/"), ANON_KEY).unwrap();
    (backend, log)
}

fn requests(log: &Log) -> Vec<Captured> {
    log.lock().unwrap().clone()
}

#[tokio::test]
async fn rest_list_requests_carry_order_and_headers() -> Result<(), RestError> {
    let (backend, log) = spawn_backend().await;

    let sensors = backend.list_sensors(&Credentials::anonymous()).await?;
    assert_eq!(sensors[0].id, "s1");

    let detections = backend.list_detections(&Credentials::bearer("user-token")).await?;
    assert_eq!(
        detections[0].sensor.as_ref().map(|s| s.id.as_str()),
        Some("s1")
    );

    let captured = requests(&log);
    assert!(captured[0].query.contains("order=last_updated.desc"));
    assert!(captured[0].query.contains("select=*"));
    assert_eq!(captured[0].apikey.as_deref(), Some(ANON_KEY));
    assert_eq!(captured[0].authorization.as_deref(), Some("Bearer anon-key"));

    assert!(captured[1].query.contains("order=timestamp.desc"));
    assert!(captured[1].query.contains("sensor%3Asensor_id"));
    assert_eq!(captured[1].authorization.as_deref(), Some("Bearer user-token"));

    Ok(())
}

#[tokio::test]
async fn rest_session_filters_become_query_operators() -> Result<(), RestError> {
    let (backend, log) = spawn_backend().await;

    let filter = SessionFilter {
        active: Some(true),
        email: Some("ops".to_owned()),
        from: Some("2024-06-01T00:00:00Z".parse().unwrap()),
        to: None,
    };
    backend
        .list_sessions(&Credentials::anonymous(), &filter)
        .await?;

    let query = &requests(&log)[0].query;
    assert!(query.contains("is_active=eq.true"), "{query}");
    assert!(query.contains("email=ilike.*ops*"), "{query}");
    assert!(query.contains("login_time=gte.2024-06-01T00%3A00%3A00Z"), "{query}");
    assert!(query.contains("order=login_time.desc"), "{query}");

    Ok(())
}

#[tokio::test]
async fn rest_record_fogging_inserts_then_patches() {
    let (backend, log) = spawn_backend().await;
    let mut changes = backend.subscribe();
    let creds = Credentials::bearer("user-token");

    let entry = NewFoggingLog::new(SensorId::from("s1"), date(2024, 6, 2), Some("canal"));
    backend.record_fogging(&creds, &entry).await.unwrap();

    let captured = requests(&log);
    assert_eq!(captured[0].method, Method::POST);
    assert_eq!(captured[0].path, "/rest/v1/fogging_logs");
    assert_eq!(captured[0].prefer.as_deref(), Some("return=minimal"));
    let inserted: Value = serde_json::from_str(&captured[0].body).unwrap();
    assert_eq!(
        inserted,
        json!([{ "sensor_id": "s1", "date": "2024-06-02", "notes": "canal" }])
    );

    assert_eq!(captured[1].method, Method::PATCH);
    assert_eq!(captured[1].query, "id=eq.s1");
    let patch: Value = serde_json::from_str(&captured[1].body).unwrap();
    assert_eq!(patch, json!({ "mosquito_level": "low", "last_fogged": "2024-06-02" }));

    assert_eq!(changes.recv().await.unwrap().table, Table::FoggingLogs);
    assert_eq!(changes.recv().await.unwrap().table, Table::Sensors);
}

#[tokio::test]
async fn rest_fogging_unknown_sensor_keeps_log() {
    let (backend, log) = spawn_backend().await;

    let entry = NewFoggingLog::new(SensorId::from("nope"), date(2024, 6, 2), None);
    let err = backend
        .record_fogging(&Credentials::anonymous(), &entry)
        .await
        .unwrap_err();

    assert!(err.to_string().starts_with("fogging log saved but sensor update failed"));
    assert_eq!(requests(&log).len(), 2);
}

#[tokio::test]
async fn rest_sign_in_parses_session_and_errors() {
    let (backend, _) = spawn_backend().await;

    let session = backend.sign_in("ops@up.edu.ph", "hunter2").await.unwrap();
    assert_eq!(session.user.id.as_str(), "c0ffee");
    assert_eq!(&*session.user.email, "ops@up.edu.ph");
    assert_eq!(session.credentials().access_token(), Some("user-token"));
    assert!(session.expires_at.is_some());

    let err = backend.sign_in("ops@up.edu.ph", "wrong").await.unwrap_err();
    match err {
        RestError::Api { status, message } => {
            assert_eq!(status, 400);
            assert_eq!(message, "Invalid login credentials");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn rest_refresh_exchanges_refresh_token() {
    let (backend, log) = spawn_backend().await;
    let session = backend.sign_in("ops@up.edu.ph", "hunter2").await.unwrap();

    let fresh = backend.refresh(&session).await.unwrap();
    assert_eq!(&*fresh.access_token, "refreshed-token");
    assert_eq!(fresh.refresh_token.as_deref(), Some("refresh-2"));
    assert_eq!(fresh.user, session.user);

    let captured = requests(&log);
    assert_eq!(captured[1].path, "/auth/v1/token");
    assert_eq!(captured[1].query, "grant_type=refresh_token");
    let body: Value = serde_json::from_str(&captured[1].body).unwrap();
    assert_eq!(body, json!({ "refresh_token": "refresh" }));

    let without_token = fogwatch_client::auth::AuthSession {
        refresh_token: None,
        ..fresh
    };
    assert!(matches!(
        backend.refresh(&without_token).await,
        Err(RestError::MissingRefreshToken)
    ));
}

#[tokio::test]
async fn rest_email_filter_escapes_wildcards() -> Result<(), RestError> {
    let (backend, log) = spawn_backend().await;

    let filter = SessionFilter {
        email: Some("field_ops".to_owned()),
        ..Default::default()
    };
    backend.list_sessions(&Credentials::anonymous(), &filter).await?;

    let query = &requests(&log)[0].query;
    assert!(query.contains("email=ilike.*field%5C_ops*"), "{query}");

    Ok(())
}

type Joins = mpsc::UnboundedSender<(HashMap<String, String>, Value)>;

async fn fake_realtime(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(joins): State<Joins>,
) -> Response {
    ws.on_upgrade(move |socket| realtime_session(socket, params, joins))
}

/// Acknowledges the channel join, then pushes one session insert.
async fn realtime_session(mut socket: WebSocket, params: HashMap<String, String>, joins: Joins) {
    while let Some(Ok(message)) = socket.recv().await {
        let ws::Message::Text(text) = message else {
            continue;
        };
        let message: Value = serde_json::from_str(text.as_str()).unwrap();
        if message["event"] != "phx_join" {
            continue;
        }

        let topic = message["topic"].clone();
        let reply = json!({
            "topic": topic,
            "event": "phx_reply",
            "payload": { "status": "ok", "response": { "postgres_changes": [] } },
            "ref": message["ref"],
        });
        let change = json!({
            "topic": topic,
            "event": "postgres_changes",
            "payload": {
                "data": { "type": "INSERT", "table": "user_sessions", "schema": "public" },
                "ids": [1]
            },
            "ref": null,
        });
        socket.send(ws::Message::Text(reply.to_string().into())).await.unwrap();
        socket.send(ws::Message::Text(change.to_string().into())).await.unwrap();
        let _ = joins.send((params.clone(), message));
    }
}

#[tokio::test]
async fn rest_listen_relays_realtime_session_changes() {
    let (joins_tx, mut joins) = mpsc::unbounded_channel();
    let app = Router::new()
        .route("/realtime/v1/websocket", get(fake_realtime))
        .with_state(joins_tx);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    let backend = RestBackend::new(&format!("http://{addr}"), ANON_KEY).unwrap();
    let mut changes = backend.subscribe();
    let cancel = CancellationToken::new();
    let task = backend
        .listen(Arc::new(Credentials::bearer("user-token")), cancel.clone())
        .unwrap();

    let change = tokio::time::timeout(Duration::from_secs(5), changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        change,
        TableChange {
            table: Table::UserSessions,
            kind: ChangeKind::Insert,
        }
    );

    let (params, join) = joins.recv().await.unwrap();
    assert_eq!(params["apikey"], ANON_KEY);
    assert_eq!(params["vsn"], "1.0.0");
    assert_eq!(join["payload"]["access_token"], "user-token");
    assert_eq!(
        join["payload"]["config"]["postgres_changes"],
        json!([{ "event": "*", "schema": "public", "table": "user_sessions" }])
    );

    cancel.cancel();
    task.await.unwrap();
}
