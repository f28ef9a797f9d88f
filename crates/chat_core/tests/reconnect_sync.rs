use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chat_core::{ChatClient, ClientError, ClientSettings, ConnectionState, SyncError};
use chat_shared::{
    domain::{Cid, ConnectionId},
    protocol::{
        ChannelSnapshot, Event, EventType, Message, QueryChannelsRequest, QueryChannelsResponse,
        SyncRequest, SyncResponse, User,
    },
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpListener,
    sync::{broadcast, Notify},
};

#[derive(Clone, Default)]
struct Backend {
    connections: Arc<AtomicU32>,
    kick: Arc<Notify>,
    missed: Arc<Mutex<Vec<Event>>>,
    sync_requests: Arc<Mutex<Vec<SyncRequest>>>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(backend): State<Backend>,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let user_id = query.get("user_id").cloned().unwrap_or_default();
    ws.on_upgrade(move |socket| ws_connection(backend, socket, user_id))
}

async fn ws_connection(backend: Backend, socket: WebSocket, user_id: String) {
    let n = backend.connections.fetch_add(1, Ordering::SeqCst) + 1;
    let (mut sender, mut receiver) = socket.split();

    let mut hello = Event::new(EventType::HealthCheck);
    hello.connection_id = Some(ConnectionId::new(format!("conn-{n}")));
    hello.me = Some(User::new(user_id));
    let Ok(text) = serde_json::to_string(&hello) else {
        return;
    };
    if sender.send(WsMessage::Text(text)).await.is_err() {
        return;
    }

    tokio::select! {
        _ = backend.kick.notified() => {
            let _ = sender.send(WsMessage::Close(None)).await;
        }
        _ = async { while let Some(Ok(_msg)) = receiver.next().await {} } => {}
    }
}

async fn handle_sync(
    State(backend): State<Backend>,
    Json(request): Json<SyncRequest>,
) -> Json<SyncResponse> {
    backend
        .sync_requests
        .lock()
        .expect("sync requests lock")
        .push(request);
    let events = backend.missed.lock().expect("missed lock").clone();
    Json(SyncResponse {
        events,
        inaccessible_cids: Vec::new(),
    })
}

async fn handle_channels(Json(request): Json<QueryChannelsRequest>) -> Json<QueryChannelsResponse> {
    let channels = request.filter_conditions["cid"]["$in"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|raw| raw.as_str())
        .filter_map(|raw| raw.parse::<Cid>().ok())
        .map(ChannelSnapshot::empty)
        .collect();
    Json(QueryChannelsResponse { channels })
}

async fn spawn_backend(backend: Backend) -> Result<String> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = Router::new()
        .route("/connect", get(ws_handler))
        .route("/sync", post(handle_sync))
        .route("/channels", post(handle_channels))
        .with_state(backend);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{addr}"))
}

fn settings(base_url: &str) -> ClientSettings {
    ClientSettings {
        base_url: base_url.to_string(),
        api_key: "test-key".to_string(),
        user_id: Some("alice".to_string()),
        token: Some("test-token".to_string()),
        backoff_base_ms: 20,
        backoff_max_ms: 200,
        ..ClientSettings::default()
    }
}

fn missed_message(cid: &Cid, id: &str, at: DateTime<Utc>) -> Event {
    let mut message = Message::new(id, at);
    message.user = Some(User::new("bob"));
    Event::new(EventType::MessageNew)
        .at(at)
        .with_cid(cid.clone())
        .with_message(message)
}

async fn wait_for(events: &mut broadcast::Receiver<Event>, kind: EventType) -> Result<Event> {
    let wait = async {
        loop {
            let event = events.recv().await?;
            if event.kind == kind {
                return Ok::<_, anyhow::Error>(event);
            }
        }
    };
    match tokio::time::timeout(Duration::from_secs(10), wait).await {
        Ok(result) => result,
        Err(_) => bail!("timed out waiting for {kind}"),
    }
}

#[tokio::test]
async fn reconnect_replays_missed_window_for_watched_channels() -> Result<()> {
    let backend = Backend::default();
    let base_url = spawn_backend(backend.clone()).await?;
    let client = ChatClient::from_settings(settings(&base_url))?;
    let a = Cid::new("messaging", "a");
    let b = Cid::new("messaging", "b");

    assert_eq!(client.connect().await?, ConnectionId::new("conn-1"));
    client.watch_channel(a.clone()).await?;
    client.watch_channel(b.clone()).await?;

    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    let Some(t0) = client.store().lock().await.sync_cursor() else {
        bail!("disconnect did not record a sync cursor");
    };

    *backend.missed.lock().expect("missed lock") = vec![
        missed_message(&a, "m1", t0 + chrono::Duration::seconds(1)),
        missed_message(&a, "m2", t0 + chrono::Duration::seconds(2)),
        missed_message(&a, "m3", t0 + chrono::Duration::seconds(3)),
        Event::new(EventType::ChannelHidden).with_cid(b.clone()),
    ];

    let mut events = client.subscribe_events();
    assert_eq!(client.connect().await?, ConnectionId::new("conn-2"));
    wait_for(&mut events, EventType::ConnectionRecovered).await?;

    let requests = backend
        .sync_requests
        .lock()
        .expect("sync requests lock")
        .clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].channel_cids, vec![a.clone(), b.clone()]);
    assert_eq!(requests[0].last_sync_at, t0);

    {
        let store = client.store().lock().await;
        let channel_a = store.channel(&a).expect("a watched");
        let ids: Vec<&str> = channel_a.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
        assert!(store.channel(&b).expect("b watched").is_hidden());
        assert_eq!(store.sync_cursor(), None);
    }

    client.dispose().await;
    assert!(client.watched_channels().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn server_dropped_socket_recovers_without_caller() -> Result<()> {
    let backend = Backend::default();
    let base_url = spawn_backend(backend.clone()).await?;
    let client = ChatClient::from_settings(settings(&base_url))?;
    let a = Cid::new("messaging", "a");

    client.connect().await?;
    client.watch_channel(a.clone()).await?;
    *backend.missed.lock().expect("missed lock") =
        vec![missed_message(&a, "late", Utc::now())];

    let mut events = client.subscribe_events();
    backend.kick.notify_one();

    let offline = wait_for(&mut events, EventType::ConnectionChanged).await?;
    assert_eq!(offline.online, Some(false));
    let online = wait_for(&mut events, EventType::ConnectionChanged).await?;
    assert_eq!(online.online, Some(true));
    wait_for(&mut events, EventType::ConnectionRecovered).await?;

    assert_eq!(client.connection_id(), Some(ConnectionId::new("conn-2")));
    assert_eq!(client.stats().await.consecutive_failures, 0);
    let store = client.store().lock().await;
    assert!(store.channel(&a).expect("a watched").contains_message(&"late".into()));
    drop(store);

    client.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn sync_with_no_channels_is_rejected() -> Result<()> {
    let backend = Backend::default();
    let base_url = spawn_backend(backend.clone()).await?;
    let client = ChatClient::from_settings(settings(&base_url))?;

    let err = client
        .sync(&[], Some(Utc::now()))
        .await
        .expect_err("empty cid list must fail");
    assert!(matches!(err, ClientError::Sync(SyncError::EmptyChannelList)));
    assert!(backend
        .sync_requests
        .lock()
        .expect("sync requests lock")
        .is_empty());
    Ok(())
}
