use std::sync::Mutex as StdMutex;

use chat_shared::protocol::{
    ChannelSnapshot, Event, EventType, Message, QueryChannelsResponse, SyncResponse, User,
};
use tokio::sync::broadcast;
use url::Url;

use super::*;
use crate::{
    config::ClientSettings,
    connection::ConnectionSettings,
    error::{ClientError, ClientResult},
    store::ChatStore,
    token::{StaticTokenProvider, TokenManager},
    transport::{Connector, SocketHandle},
};

struct OfflineConnector;

#[async_trait]
impl Connector for OfflineConnector {
    async fn connect(&self, _url: Url) -> ClientResult<SocketHandle> {
        Err(ClientError::Transport("offline".to_string()))
    }
}

#[derive(Default)]
struct FakeApi {
    sync_result: StdMutex<Option<ClientResult<SyncResponse>>>,
    snapshots: StdMutex<Vec<ChannelSnapshot>>,
    sync_calls: StdMutex<Vec<SyncRequest>>,
    query_calls: StdMutex<Vec<QueryChannelsRequest>>,
}

impl FakeApi {
    fn answer_sync(&self, result: ClientResult<SyncResponse>) {
        *self.sync_result.lock().expect("sync lock") = Some(result);
    }

    fn sync_calls(&self) -> Vec<SyncRequest> {
        self.sync_calls.lock().expect("sync lock").clone()
    }

    fn query_calls(&self) -> Vec<QueryChannelsRequest> {
        self.query_calls.lock().expect("query lock").clone()
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn sync(&self, request: SyncRequest) -> ClientResult<SyncResponse> {
        self.sync_calls.lock().expect("sync lock").push(request);
        self.sync_result
            .lock()
            .expect("sync lock")
            .take()
            .unwrap_or_else(|| Ok(SyncResponse::default()))
    }

    async fn query_channels(
        &self,
        request: QueryChannelsRequest,
    ) -> ClientResult<QueryChannelsResponse> {
        self.query_calls.lock().expect("query lock").push(request);
        Ok(QueryChannelsResponse {
            channels: self.snapshots.lock().expect("snapshot lock").clone(),
        })
    }
}

struct Fixture {
    api: Arc<FakeApi>,
    dispatcher: Arc<EventDispatcher>,
    coordinator: SyncCoordinator,
    a: Cid,
    b: Cid,
}

impl Fixture {
    fn new() -> Self {
        let store = Arc::new(Mutex::new(ChatStore::new(10)));
        let dispatcher = Arc::new(EventDispatcher::new(store));
        let settings =
            ConnectionSettings::from_client(&ClientSettings::default()).expect("settings");
        let connection = Connection::new(
            settings,
            Arc::new(OfflineConnector),
            Arc::new(TokenManager::new(Arc::new(StaticTokenProvider::new("t")))),
            dispatcher.clone(),
        );
        let api = Arc::new(FakeApi::default());
        let coordinator = SyncCoordinator::new(
            api.clone(),
            dispatcher.clone(),
            connection,
            chrono::Duration::days(30),
        );
        Self {
            api,
            dispatcher,
            coordinator,
            a: Cid::new("messaging", "a"),
            b: Cid::new("messaging", "b"),
        }
    }

    async fn watch_both(&self) {
        let mut store = self.dispatcher.store().lock().await;
        store.watch(ChannelSnapshot::empty(self.a.clone()));
        store.watch(ChannelSnapshot::empty(self.b.clone()));
    }

    async fn record_cursor(&self, at: DateTime<Utc>) {
        self.dispatcher
            .store()
            .lock()
            .await
            .record_sync_cursor(at);
    }

    async fn cursor(&self) -> Option<DateTime<Utc>> {
        self.dispatcher.store().lock().await.sync_cursor()
    }
}

fn message_new(cid: &Cid, id: &str, at: DateTime<Utc>) -> Event {
    let mut message = Message::new(id, at);
    message.user = Some(User::new("bob"));
    Event::new(EventType::MessageNew)
        .at(at)
        .with_cid(cid.clone())
        .with_message(message)
}

fn drain(events: &mut broadcast::Receiver<Event>) -> Vec<EventType> {
    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind);
    }
    kinds
}

#[tokio::test]
async fn empty_channel_list_fails_before_any_request() {
    let fixture = Fixture::new();
    let err = fixture
        .coordinator
        .sync(&[], Some(Utc::now()))
        .await
        .expect_err("empty cids");
    assert!(matches!(err, ClientError::Sync(SyncError::EmptyChannelList)));
    assert!(fixture.api.sync_calls().is_empty());
}

#[tokio::test]
async fn missing_cursor_fails_before_any_request() {
    let fixture = Fixture::new();
    let err = fixture
        .coordinator
        .sync(&[fixture.a.clone()], None)
        .await
        .expect_err("no cursor");
    assert!(matches!(err, ClientError::Sync(SyncError::MissingCursor)));
    assert!(fixture.api.sync_calls().is_empty());
}

#[tokio::test]
async fn recovery_replays_missed_window_in_order() {
    let fixture = Fixture::new();
    fixture.watch_both().await;
    let t0 = Utc::now() - chrono::Duration::minutes(10);
    fixture.record_cursor(t0).await;

    let minute = chrono::Duration::minutes(1);
    fixture.api.answer_sync(Ok(SyncResponse {
        events: vec![
            message_new(&fixture.a, "m1", t0 + minute),
            message_new(&fixture.a, "m2", t0 + minute * 2),
            message_new(&fixture.a, "m3", t0 + minute * 3),
            Event::new(EventType::ChannelHidden)
                .at(t0 + minute * 4)
                .with_cid(fixture.b.clone()),
        ],
        inaccessible_cids: Vec::new(),
    }));
    let mut events = fixture.dispatcher.subscribe_events();

    fixture.coordinator.recover(0).await;

    let calls = fixture.api.sync_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].channel_cids, vec![fixture.a.clone(), fixture.b.clone()]);
    assert_eq!(calls[0].last_sync_at, t0);

    {
        let store = fixture.dispatcher.store().lock().await;
        let a = store.channel(&fixture.a).expect("a watched");
        let ids: Vec<&str> = a.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
        assert!(store.channel(&fixture.b).expect("b watched").is_hidden());
    }
    assert_eq!(fixture.cursor().await, None);
    assert!(fixture.api.query_calls().is_empty());
    assert_eq!(
        drain(&mut events),
        vec![
            EventType::MessageNew,
            EventType::MessageNew,
            EventType::MessageNew,
            EventType::ChannelHidden,
            EventType::ConnectionRecovered,
        ]
    );
}

#[tokio::test]
async fn gap_beyond_limit_requeries_instead_of_syncing() {
    let fixture = Fixture::new();
    fixture.watch_both().await;
    fixture
        .record_cursor(Utc::now() - chrono::Duration::days(45))
        .await;
    let mut snapshot = ChannelSnapshot::empty(fixture.a.clone());
    snapshot.messages = vec![Message::new("fresh", Utc::now())];
    fixture.api.snapshots.lock().expect("snapshot lock").push(snapshot);

    let path = fixture.coordinator.recover_watched().await.expect("recover");
    assert_eq!(path, RecoveryPath::Requery);
    assert!(fixture.api.sync_calls().is_empty());

    let queries = fixture.api.query_calls();
    assert_eq!(queries.len(), 1);
    assert_eq!(
        queries[0].filter_conditions,
        json!({"cid": {"$in": ["messaging:a", "messaging:b"]}})
    );
    assert!(queries[0].watch && queries[0].state && queries[0].presence);

    let store = fixture.dispatcher.store().lock().await;
    let a = store.channel(&fixture.a).expect("a watched");
    assert_eq!(a.messages().len(), 1);
    assert!(a.is_up_to_date());
}

#[tokio::test]
async fn first_connect_without_cursor_requeries() {
    let fixture = Fixture::new();
    fixture.watch_both().await;
    let path = fixture.coordinator.recover_watched().await.expect("recover");
    assert_eq!(path, RecoveryPath::Requery);
    assert!(fixture.api.sync_calls().is_empty());
}

#[tokio::test]
async fn failed_sync_falls_back_to_requery() {
    let fixture = Fixture::new();
    fixture.watch_both().await;
    fixture
        .record_cursor(Utc::now() - chrono::Duration::minutes(5))
        .await;
    fixture
        .api
        .answer_sync(Err(ClientError::Transport("reset".to_string())));

    let path = fixture.coordinator.recover_watched().await.expect("recover");
    assert_eq!(path, RecoveryPath::Requery);
    assert_eq!(fixture.api.sync_calls().len(), 1);
    assert_eq!(fixture.api.query_calls().len(), 1);
}

#[tokio::test]
async fn nothing_watched_skips_requests_but_still_signals_recovery() {
    let fixture = Fixture::new();
    let mut events = fixture.dispatcher.subscribe_events();
    fixture.coordinator.recover(0).await;
    assert!(fixture.api.sync_calls().is_empty());
    assert!(fixture.api.query_calls().is_empty());
    assert_eq!(drain(&mut events), vec![EventType::ConnectionRecovered]);
}

#[tokio::test]
async fn superseded_generation_applies_events_without_side_effects() {
    let fixture = Fixture::new();
    fixture.watch_both().await;
    let t0 = Utc::now() - chrono::Duration::minutes(2);
    fixture.record_cursor(t0).await;
    fixture.api.answer_sync(Ok(SyncResponse {
        events: vec![message_new(&fixture.a, "m1", t0)],
        inaccessible_cids: Vec::new(),
    }));
    let mut events = fixture.dispatcher.subscribe_events();

    fixture.coordinator.recover(7).await;

    assert_eq!(drain(&mut events), vec![EventType::MessageNew]);
    assert_eq!(fixture.cursor().await, Some(t0));
}

#[tokio::test]
async fn inaccessible_channels_are_dropped() {
    let fixture = Fixture::new();
    fixture.watch_both().await;
    fixture.api.answer_sync(Ok(SyncResponse {
        events: Vec::new(),
        inaccessible_cids: vec![fixture.b.clone()],
    }));

    let report = fixture
        .coordinator
        .sync(
            &[fixture.a.clone(), fixture.b.clone()],
            Some(Utc::now()),
        )
        .await
        .expect("sync");
    assert_eq!(report.received, 0);
    assert_eq!(report.inaccessible, vec![fixture.b.clone()]);

    let store = fixture.dispatcher.store().lock().await;
    assert!(store.is_watching(&fixture.a));
    assert!(!store.is_watching(&fixture.b));
}
