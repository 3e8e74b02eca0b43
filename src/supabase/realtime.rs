use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use super::SupabaseClient;
use crate::errors::{AppError, AppResult};
use crate::models::Table;
use crate::store::{ChangeFeed, Record, Subscription};

const PROTOCOL_VERSION: &str = "1.0.0";
const JOIN_TIMEOUT: StdDuration = StdDuration::from_secs(10);
const EVENT_BUFFER: usize = 64;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One Phoenix channel frame.
#[derive(Debug, Serialize, Deserialize)]
struct PhoenixMessage {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(default, rename = "ref")]
    reference: Option<String>,
}

struct RefCounter(AtomicU64);

impl RefCounter {
    fn next(&self) -> String {
        (self.0.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

impl SupabaseClient {
    fn realtime_url(&self) -> AppResult<Url> {
        let mut url = self.endpoint(&["realtime", "v1", "websocket"])?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => {
                return Err(AppError::Config(format!(
                    "unsupported SUPABASE_URL scheme: {other}"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| AppError::Config("unable to derive realtime URL".into()))?;
        url.query_pairs_mut()
            .append_pair("apikey", self.settings.anon_key.expose_secret())
            .append_pair("vsn", PROTOCOL_VERSION);
        Ok(url)
    }
}

#[async_trait]
impl ChangeFeed for SupabaseClient {
    async fn subscribe_inserts(&self, table: Table, owner_id: &str) -> AppResult<Subscription> {
        let url = self.realtime_url()?;
        let (mut socket, _) = connect_async(url.as_str()).await.map_err(socket_error)?;

        let refs = RefCounter(AtomicU64::new(0));
        let topic = format!("realtime:{table}-inserts");
        let join_ref = refs.next();
        let join = PhoenixMessage {
            topic: topic.clone(),
            event: "phx_join".into(),
            payload: join_payload(table, owner_id, self.bearer().expose_secret()),
            reference: Some(join_ref.clone()),
        };
        send_frame(&mut socket, &join).await?;
        timeout(JOIN_TIMEOUT, await_join_reply(&mut socket, &topic, &join_ref))
            .await
            .map_err(|_| AppError::Realtime("timed out joining channel".into()))??;
        info!(target: "realtime", %topic, owner = owner_id, "subscribed to inserts");

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (close_tx, close_rx) = oneshot::channel();
        let heartbeat = StdDuration::from_secs(self.settings.heartbeat_secs);
        tokio::spawn(pump(socket, topic, refs, heartbeat, events_tx, close_rx));
        Ok(Subscription::new(events_rx, close_tx))
    }
}

fn join_payload(table: Table, owner_id: &str, access_token: &str) -> Value {
    json!({
        "config": {
            "broadcast": { "ack": false, "self": false },
            "presence": { "key": "" },
            "postgres_changes": [{
                "event": "INSERT",
                "schema": "public",
                "table": table.as_str(),
                "filter": format!("user_id=eq.{owner_id}"),
            }],
        },
        "access_token": access_token,
    })
}

async fn send_frame(socket: &mut Socket, frame: &PhoenixMessage) -> AppResult<()> {
    let text = serde_json::to_string(frame)?;
    socket
        .send(Message::Text(text))
        .await
        .map_err(socket_error)
}

async fn await_join_reply(socket: &mut Socket, topic: &str, join_ref: &str) -> AppResult<()> {
    while let Some(frame) = socket.next().await {
        let text = match frame.map_err(socket_error)? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(message) = serde_json::from_str::<PhoenixMessage>(&text) else {
            continue;
        };
        if message.topic != topic
            || message.event != "phx_reply"
            || message.reference.as_deref() != Some(join_ref)
        {
            continue;
        }
        return match message.payload.get("status").and_then(Value::as_str) {
            Some("ok") => Ok(()),
            _ => Err(AppError::Realtime(reply_reason(&message.payload))),
        };
    }
    Err(AppError::Realtime("socket closed before join reply".into()))
}

fn reply_reason(payload: &Value) -> String {
    payload
        .pointer("/response/reason")
        .or_else(|| payload.pointer("/response/message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("join rejected: {payload}"))
}

/// Owns the socket until the subscription closes or the server goes away.
async fn pump(
    socket: Socket,
    topic: String,
    refs: RefCounter,
    heartbeat: StdDuration,
    events: mpsc::Sender<Record>,
    mut close: oneshot::Receiver<()>,
) {
    let (mut sink, mut stream) = socket.split();
    let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut close => {
                let leave = PhoenixMessage {
                    topic: topic.clone(),
                    event: "phx_leave".into(),
                    payload: json!({}),
                    reference: Some(refs.next()),
                };
                if let Ok(text) = serde_json::to_string(&leave) {
                    let _ = sink.send(Message::Text(text)).await;
                }
                debug!(target: "realtime", %topic, "left channel");
                break;
            }
            _ = ticker.tick() => {
                let beat = PhoenixMessage {
                    topic: "phoenix".into(),
                    event: "heartbeat".into(),
                    payload: json!({}),
                    reference: Some(refs.next()),
                };
                let sent = match serde_json::to_string(&beat) {
                    Ok(text) => sink.send(Message::Text(text)).await,
                    Err(_) => continue,
                };
                if let Err(err) = sent {
                    warn!(target: "realtime", ?err, "heartbeat failed; closing subscription");
                    break;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(record) = insert_record(&text, &topic) {
                        if events.send(record).await.is_err() {
                            break;
                        }
                    } else if is_channel_closed(&text, &topic) {
                        warn!(target: "realtime", %topic, "channel closed by server");
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(target: "realtime", %topic, "socket closed by server");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(target: "realtime", ?err, "socket error; closing subscription");
                    break;
                }
            },
        }
    }
    let _ = sink.close().await;
}

/// Extracts the inserted row from a `postgres_changes` frame.
fn insert_record(text: &str, topic: &str) -> Option<Record> {
    let message = match serde_json::from_str::<PhoenixMessage>(text) {
        Ok(message) => message,
        Err(err) => {
            warn!(target: "realtime", ?err, "unreadable realtime frame");
            return None;
        }
    };
    if message.topic != topic || message.event != "postgres_changes" {
        trace!(target: "realtime", event = %message.event, "ignoring frame");
        return None;
    }
    let data = message.payload.get("data")?;
    if data.get("type").and_then(Value::as_str) != Some("INSERT") {
        return None;
    }
    data.get("record").and_then(Value::as_object).cloned()
}

fn is_channel_closed(text: &str, topic: &str) -> bool {
    serde_json::from_str::<PhoenixMessage>(text)
        .map(|message| {
            message.topic == topic && matches!(message.event.as_str(), "phx_close" | "phx_error")
        })
        .unwrap_or(false)
}

fn socket_error(err: tokio_tungstenite::tungstenite::Error) -> AppError {
    AppError::Realtime(err.to_string())
}
