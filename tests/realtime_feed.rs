use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use lead_desk::{
    AppError, MemoryStore, Principal, RecentLeadsFeed, RecordId, RemoteStore, SecretVault,
    SessionContext, SessionProvider, SupabaseClient,
};

const WAIT: Duration = Duration::from_secs(5);

/// Accepts one socket, answers the join with `status`, pushes `events`, then
/// returns every frame received afterwards until the client hangs up.
async fn phoenix_server(status: &'static str, events: Vec<Value>) -> (String, JoinHandle<(Value, Vec<Value>)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut socket = accept_async(stream).await.expect("handshake");

        let join = loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => break serde_json::from_str::<Value>(&text).expect("json"),
                Some(Ok(_)) => continue,
                other => panic!("no join frame: {other:?}"),
            }
        };
        let reply = json!({
            "topic": join["topic"],
            "event": "phx_reply",
            "ref": join["ref"],
            "payload": if status == "ok" {
                json!({ "status": "ok", "response": { "postgres_changes": [] } })
            } else {
                json!({ "status": "error", "response": { "reason": "Unauthorized" } })
            },
        });
        socket.send(Message::Text(reply.to_string())).await.expect("reply");
        for event in events {
            socket.send(Message::Text(event.to_string())).await.expect("event");
        }

        let mut received = Vec::new();
        while let Some(Ok(frame)) = socket.next().await {
            match frame {
                Message::Text(text) => {
                    received.push(serde_json::from_str::<Value>(&text).expect("json"))
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        (join, received)
    });
    (format!("http://{addr}"), handle)
}

fn insert_event(id: &str, name: &str) -> Value {
    json!({
        "topic": "realtime:leads-inserts",
        "event": "postgres_changes",
        "ref": null,
        "payload": {
            "ids": [1],
            "data": {
                "schema": "public",
                "table": "leads",
                "type": "INSERT",
                "commit_timestamp": "2024-03-10T12:00:00Z",
                "record": {
                    "id": id, "name": name, "email": "live@example.com", "status": "new",
                    "source": "web", "created_at": "2024-03-10T12:00:00Z", "user_id": "user-1"
                }
            }
        }
    })
}

async fn signed_in(memory: Arc<MemoryStore>, context: SessionContext) -> SessionProvider {
    memory.register_user(
        Principal {
            id: RecordId::new("user-1"),
            email: "ada@example.com".into(),
            company_name: None,
            ape_code: None,
        },
        "hunter2",
    );
    let provider = SessionProvider::with_context(memory, SecretVault::in_memory(), context);
    provider
        .sign_in("ada@example.com", &SecretString::from("hunter2".to_string()))
        .await
        .expect("sign in");
    provider
}

#[tokio::test]
async fn feed_receives_inserts_and_leaves_on_sign_out() {
    let (base_url, server) = phoenix_server(
        "ok",
        vec![
            insert_event("live-1", "Live Ada"),
            insert_event("live-1", "Live Ada again"),
        ],
    )
    .await;

    let memory = Arc::new(MemoryStore::new());
    let context = SessionContext::new();
    let provider = signed_in(memory.clone(), context.clone()).await;
    let realtime = Arc::new(
        SupabaseClient::new(&base_url, SecretString::from("anon".to_string()), 30, context)
            .expect("client"),
    );
    let store = RemoteStore::new(memory, realtime);

    let mut feed = RecentLeadsFeed::mount(store, provider.context(), 7)
        .await
        .expect("mount");
    let mut arrivals = feed.arrivals();
    timeout(WAIT, arrivals.wait_for(|count| *count >= 1))
        .await
        .expect("arrival in time")
        .expect("feed alive");
    assert_eq!(feed.count(), 1);
    assert_eq!(feed.leads()[0].name, "Live Ada");

    provider.sign_out().await.expect("sign out");
    timeout(WAIT, feed.stopped()).await.expect("feed stopped");
    assert!(!feed.is_live());

    let (join, received) = timeout(WAIT, server).await.expect("server done").expect("server task");
    assert_eq!(join["event"], "phx_join");
    assert_eq!(join["topic"], "realtime:leads-inserts");
    assert_eq!(
        join["payload"]["config"]["postgres_changes"][0]["filter"],
        "user_id=eq.user-1"
    );
    assert!(received.iter().any(|frame| frame["event"] == "phx_leave"));
    assert_eq!(feed.count(), 1);
}

#[tokio::test]
async fn rejected_join_is_a_realtime_error() {
    let (base_url, server) = phoenix_server("error", Vec::new()).await;

    let memory = Arc::new(MemoryStore::new());
    let context = SessionContext::new();
    let provider = signed_in(memory.clone(), context.clone()).await;
    let realtime = Arc::new(
        SupabaseClient::new(&base_url, SecretString::from("anon".to_string()), 30, context)
            .expect("client"),
    );

    let result = RecentLeadsFeed::mount(RemoteStore::new(memory, realtime), provider.context(), 7).await;
    match result {
        Err(AppError::Realtime(reason)) => assert_eq!(reason, "Unauthorized"),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("join should have been rejected"),
    }
    drop(server);
}
