//! Live subscription over the realtime websocket.
//!
//! The session speaks the phoenix-channel framing the cloud store exposes:
//! a topic join, periodic heartbeats, and `INSERT` envelopes carrying the
//! inserted event row. Events arrive in ingestion order, which is not
//! necessarily id order — the daemon handles gaps.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use metarelay_core::{CloudError, Event, EventSubscription};

const EVENTS_TOPIC: &str = "realtime:public:events";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const SUBSCRIPTION_BUFFER: usize = 256;

pub(crate) fn websocket_url(base_url: &str, api_key: &str) -> String {
    let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base_url.to_string()
    };
    format!("{ws_base}/realtime/v1/websocket?apikey={api_key}&vsn=1.0.0")
}

/// Opens the websocket, joins the events topic, and feeds matching rows
/// into the returned subscription until the socket closes.
pub(crate) async fn open_subscription(
    base_url: &str,
    api_key: &str,
    repo: &str,
) -> Result<EventSubscription, CloudError> {
    let url = websocket_url(base_url, api_key);
    let (stream, _response) = connect_async(&url)
        .await
        .map_err(|error| CloudError::Transient(format!("websocket connect failed: {error}")))?;
    let (mut sink, mut source) = stream.split();

    let join = json!({
        "topic": EVENTS_TOPIC,
        "event": "phx_join",
        "payload": {},
        "ref": "1",
    });
    sink.send(WsMessage::text(join.to_string()))
        .await
        .map_err(|error| CloudError::Transient(format!("websocket join failed: {error}")))?;

    let (sender, subscription) = EventSubscription::channel(SUBSCRIPTION_BUFFER);
    let repo = repo.to_string();

    tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut heartbeat_ref = 1_u64;

        loop {
            tokio::select! {
                _ = sender.closed() => break,
                _ = heartbeat.tick() => {
                    heartbeat_ref += 1;
                    let frame = json!({
                        "topic": "phoenix",
                        "event": "heartbeat",
                        "payload": {},
                        "ref": heartbeat_ref.to_string(),
                    });
                    if sink.send(WsMessage::text(frame.to_string())).await.is_err() {
                        break;
                    }
                }
                message = source.next() => {
                    let Some(Ok(message)) = message else { break };
                    let WsMessage::Text(text) = message else { continue };
                    let Some(event) = decode_insert(&text) else { continue };
                    if event.repo != repo {
                        continue;
                    }
                    if sender.send(event).await.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(%repo, "realtime session ended");
    });

    Ok(subscription)
}

/// Extracts the inserted event row from an envelope, if it is one.
pub(crate) fn decode_insert(text: &str) -> Option<Event> {
    let envelope: Value = serde_json::from_str(text).ok()?;
    if envelope.get("event").and_then(Value::as_str) != Some("INSERT") {
        return None;
    }
    let payload = envelope.get("payload")?;
    let record = payload
        .get("record")
        .filter(|value| !value.is_null())
        .or_else(|| payload.get("new"))?;
    match serde_json::from_value::<Event>(record.clone()) {
        Ok(event) => Some(event),
        Err(error) => {
            tracing::warn!(%error, "dropping undecodable realtime insert");
            None
        }
    }
}
