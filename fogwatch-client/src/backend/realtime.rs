//! Change feed of the hosted backend's realtime service.
//!
//! The service speaks the Phoenix channel protocol over a websocket at
//! `/realtime/v1/websocket`. The listener joins a single channel subscribed to
//! `postgres_changes` on the watched tables, keeps it alive with heartbeats and
//! turns every change event into a [`TableChange`] on the backend's broadcast
//! channel. Lost connections are re-established until cancelled.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ChangeKind, Table, TableChange};
use crate::auth::CredentialSource;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const CHANNEL_TOPIC: &str = "realtime:fogwatch";
const PROTOCOL_VERSION: &str = "1.0.0";

#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("subscription rejected: {0}")]
    Rejected(String),
    #[error("connection closed by server")]
    Closed,
}

#[derive(Serialize)]
struct Outgoing<'a> {
    topic: &'a str,
    event: &'a str,
    payload: Value,
    #[serde(rename = "ref")]
    reference: String,
}

#[derive(Debug, Deserialize)]
struct Incoming {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
}

/// Websocket endpoint for `base_url`, with the project key in the query.
pub fn websocket_url(base_url: &str, anon_key: &str) -> String {
    let base_url = base_url.trim_end_matches('/');
    let base_url = match base_url.split_once("://") {
        Some(("https", rest)) => format!("wss://{rest}"),
        Some(("http", rest)) => format!("ws://{rest}"),
        _ => base_url.to_owned(),
    };

    format!("{base_url}/realtime/v1/websocket?apikey={anon_key}&vsn={PROTOCOL_VERSION}")
}

/// Payload of the channel join: one `postgres_changes` binding per table plus
/// the access token row-level security is evaluated against.
fn join_payload(tables: &[Table], access_token: &str) -> Value {
    let bindings: Vec<Value> = tables
        .iter()
        .map(|table| json!({ "event": "*", "schema": "public", "table": table.as_str() }))
        .collect();

    json!({
        "config": {
            "broadcast": { "self": false },
            "presence": { "key": "" },
            "postgres_changes": bindings,
        },
        "access_token": access_token,
    })
}

/// Reads a `postgres_changes` event. Other events and unknown tables yield
/// `None`.
fn parse_change(message: &Incoming) -> Option<TableChange> {
    if message.event != "postgres_changes" {
        return None;
    }

    let data = message.payload.get("data")?;
    let table = Table::from_name(data.get("table")?.as_str()?)?;
    let kind = match data.get("type")?.as_str()? {
        "INSERT" => ChangeKind::Insert,
        "UPDATE" => ChangeKind::Update,
        "DELETE" => ChangeKind::Delete,
        _ => return None,
    };

    Some(TableChange { table, kind })
}

/// Relays realtime change events into a broadcast channel.
pub struct RealtimeListener {
    url: String,
    anon_key: String,
    tables: Vec<Table>,
    changes: broadcast::Sender<TableChange>,
    credentials: Arc<dyn CredentialSource>,
}

impl RealtimeListener {
    pub fn new(
        base_url: &str,
        anon_key: &str,
        tables: Vec<Table>,
        changes: broadcast::Sender<TableChange>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            url: websocket_url(base_url, anon_key),
            anon_key: anon_key.to_owned(),
            tables,
            changes,
            credentials,
        }
    }

    /// Runs the listener until `cancel` fires, reconnecting after failures.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(tables = ?self.tables, "listening for realtime changes");
            let mut reconnect = false;

            loop {
                match self.connect(&cancel, reconnect).await {
                    Ok(()) => break,
                    Err(e) => warn!(error = %e, "realtime connection lost"),
                }
                reconnect = true;

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }

            info!("stopped listening for realtime changes");
        })
    }

    async fn access_token(&self) -> String {
        let credentials = self.credentials.credentials().await;
        credentials
            .access_token()
            .unwrap_or(&self.anon_key)
            .to_owned()
    }

    fn notify(&self, change: TableChange) {
        let _ = self.changes.send(change);
    }

    /// One connection's lifetime. Returns `Ok` only when cancelled.
    async fn connect(&self, cancel: &CancellationToken, reconnect: bool) -> Result<(), RealtimeError> {
        let (socket, _) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        let (mut sink, mut stream) = socket.split();

        let mut next_ref = 0u64;
        let mut reference = || {
            next_ref += 1;
            next_ref.to_string()
        };

        let mut token = self.access_token().await;
        let join_ref = reference();
        let join = Outgoing {
            topic: CHANNEL_TOPIC,
            event: "phx_join",
            payload: join_payload(&self.tables, &token),
            reference: join_ref.clone(),
        };
        sink.send(Message::Text(serde_json::to_string(&join)?.into()))
            .await?;

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    let beat = Outgoing {
                        topic: "phoenix",
                        event: "heartbeat",
                        payload: json!({}),
                        reference: reference(),
                    };
                    sink.send(Message::Text(serde_json::to_string(&beat)?.into())).await?;

                    let fresh = self.access_token().await;
                    if fresh != token {
                        debug!("pushing refreshed access token to realtime channel");
                        let update = Outgoing {
                            topic: CHANNEL_TOPIC,
                            event: "access_token",
                            payload: json!({ "access_token": fresh }),
                            reference: reference(),
                        };
                        sink.send(Message::Text(serde_json::to_string(&update)?.into())).await?;
                        token = fresh;
                    }
                }
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(message) = serde_json::from_str::<Incoming>(&text) else {
                            debug!("ignoring malformed realtime message");
                            continue;
                        };
                        self.handle(&message, &join_ref, reconnect)?;
                    }
                    Some(Ok(Message::Ping(data))) => sink.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(_))) | None => return Err(RealtimeError::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
            }
        }
    }

    fn handle(&self, message: &Incoming, join_ref: &str, reconnect: bool) -> Result<(), RealtimeError> {
        if message.topic != CHANNEL_TOPIC {
            return Ok(());
        }

        match message.event.as_str() {
            "phx_reply" if message.reference.as_deref() == Some(join_ref) => {
                let status = message.payload.get("status").and_then(Value::as_str);
                if status != Some("ok") {
                    let reason = message
                        .payload
                        .get("response")
                        .map(Value::to_string)
                        .unwrap_or_default();
                    return Err(RealtimeError::Rejected(reason));
                }

                info!("subscribed to realtime changes");
                if reconnect {
                    // Changes made while disconnected were never delivered.
                    for &table in &self.tables {
                        self.notify(TableChange {
                            table,
                            kind: ChangeKind::Update,
                        });
                    }
                }
            }
            "phx_error" | "phx_close" => return Err(RealtimeError::Closed),
            _ => {
                if let Some(change) = parse_change(message) {
                    debug!(table = %change.table, kind = ?change.kind, "realtime change");
                    self.notify(change);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incoming(event: &str, payload: Value) -> Incoming {
        Incoming {
            topic: CHANNEL_TOPIC.to_owned(),
            event: event.to_owned(),
            payload,
            reference: None,
        }
    }

    #[test]
    fn websocket_url_switches_scheme() {
        assert_eq!(
            websocket_url("https://abc.supabase.co/", "key"),
            "wss://abc.supabase.co/realtime/v1/websocket?apikey=key&vsn=1.0.0"
        );
        assert_eq!(
            websocket_url("http://127.0.0.1:54321", "key"),
            "ws://127.0.0.1:54321/realtime/v1/websocket?apikey=key&vsn=1.0.0"
        );
    }

    #[test]
    fn change_events_map_to_tables() {
        let message = incoming(
            "postgres_changes",
            json!({ "data": { "type": "UPDATE", "table": "user_sessions", "schema": "public" } }),
        );

        assert_eq!(
            parse_change(&message),
            Some(TableChange {
                table: Table::UserSessions,
                kind: ChangeKind::Update,
            })
        );
    }

    #[test]
    fn unrelated_events_are_ignored() {
        let unknown_table = incoming(
            "postgres_changes",
            json!({ "data": { "type": "INSERT", "table": "profiles" } }),
        );
        assert_eq!(parse_change(&unknown_table), None);
        assert_eq!(parse_change(&incoming("presence_state", json!({}))), None);
    }

    #[test]
    fn join_binds_every_table() {
        let payload = join_payload(&[Table::UserSessions], "token");

        assert_eq!(payload["access_token"], "token");
        assert_eq!(
            payload["config"]["postgres_changes"],
            json!([{ "event": "*", "schema": "public", "table": "user_sessions" }])
        );
    }
}
