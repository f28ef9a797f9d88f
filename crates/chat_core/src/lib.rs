use std::sync::{Arc, Mutex as StdMutex, Weak};

use chat_shared::{
    domain::{Cid, ConnectionId},
    error::ApiError,
    protocol::{Event, EventType},
};
use chrono::{DateTime, Utc};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tracing::info;

pub mod api;
pub mod backoff;
pub mod channel_state;
pub mod client_state;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod store;
pub mod sync;
pub mod token;
pub mod transport;

pub use api::{ChatApi, HttpChatApi};
pub use config::{load_settings, ClientSettings};
pub use connection::{Connection, ConnectionSettings, ConnectionState, ConnectionStats};
pub use dispatcher::{EventDispatcher, Subscription};
pub use error::{ClientError, ClientResult, SyncError};
pub use store::{Applied, ChatStore};
pub use sync::{RecoveryPath, SyncCoordinator, SyncReport};
pub use token::{StaticTokenProvider, TokenManager, TokenProvider};
pub use transport::{Connector, WsConnector};

use connection::RecoveryHandler;

/// Owns one logical session and the state it keeps current.
pub struct ChatClient {
    settings: ClientSettings,
    store: Arc<Mutex<ChatStore>>,
    dispatcher: Arc<EventDispatcher>,
    connection: Arc<Connection>,
    sync: Arc<SyncCoordinator>,
    typing_sweep: StdMutex<Option<JoinHandle<()>>>,
}

impl ChatClient {
    pub fn new(settings: ClientSettings, provider: Arc<dyn TokenProvider>) -> ClientResult<Self> {
        let tokens = Arc::new(TokenManager::new(provider));
        let rest_url = settings.rest_url()?;
        let api_key = settings.api_key.clone();
        let api_tokens = Arc::clone(&tokens);
        Self::build(settings, tokens, Arc::new(WsConnector), move |connection| {
            Arc::new(HttpChatApi::new(
                rest_url,
                api_key,
                api_tokens,
                connection.watch_connection_id(),
            ))
        })
    }

    /// Uses the static `token` from the settings as the credential.
    pub fn from_settings(settings: ClientSettings) -> ClientResult<Self> {
        let token = settings
            .token
            .clone()
            .ok_or_else(|| ClientError::Config("no token configured".to_string()))?;
        Self::new(settings, Arc::new(StaticTokenProvider::new(token)))
    }

    pub fn new_with_dependencies(
        settings: ClientSettings,
        provider: Arc<dyn TokenProvider>,
        connector: Arc<dyn Connector>,
        api: Arc<dyn ChatApi>,
    ) -> ClientResult<Self> {
        let tokens = Arc::new(TokenManager::new(provider));
        Self::build(settings, tokens, connector, move |_| api)
    }

    fn build(
        settings: ClientSettings,
        tokens: Arc<TokenManager>,
        connector: Arc<dyn Connector>,
        make_api: impl FnOnce(&Arc<Connection>) -> Arc<dyn ChatApi>,
    ) -> ClientResult<Self> {
        let connection_settings = ConnectionSettings::from_client(&settings)?;
        let store = Arc::new(Mutex::new(ChatStore::new(settings.latest_reactions_limit)));
        let dispatcher = Arc::new(EventDispatcher::new(Arc::clone(&store)));
        let connection = Connection::new(
            connection_settings,
            connector,
            tokens,
            Arc::clone(&dispatcher),
        );
        let api = make_api(&connection);
        let sync = Arc::new(SyncCoordinator::new(
            api,
            Arc::clone(&dispatcher),
            Arc::clone(&connection),
            settings.max_sync_gap(),
        ));
        let weak: Weak<SyncCoordinator> = Arc::downgrade(&sync);
        let handler: Weak<dyn RecoveryHandler> = weak;
        connection.set_recovery_handler(handler);

        Ok(Self {
            settings,
            store,
            dispatcher,
            connection,
            sync,
            typing_sweep: StdMutex::new(None),
        })
    }

    pub fn store(&self) -> &Arc<Mutex<ChatStore>> {
        &self.store
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection.connection_id()
    }

    pub async fn stats(&self) -> ConnectionStats {
        self.connection.stats().await
    }

    /// Opens the session and starts expiring stale typing indicators.
    pub async fn connect(&self) -> ClientResult<ConnectionId> {
        self.start_typing_sweep();
        self.connection.connect().await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Fetches the channel's current state and starts receiving its events.
    pub async fn watch_channel(&self, cid: Cid) -> ClientResult<()> {
        let refreshed = self.sync.requery(std::slice::from_ref(&cid)).await?;
        if refreshed == 0 {
            return Err(ApiError::new(16, format!("channel {cid} not found")).into());
        }
        info!(%cid, "state: channel watched");
        Ok(())
    }

    /// Drops the local state for `cid`. Returns false if it was not watched.
    pub async fn stop_watching(&self, cid: &Cid) -> bool {
        self.store.lock().await.unwatch(cid)
    }

    pub async fn watched_channels(&self) -> Vec<Cid> {
        self.store.lock().await.watched_cids()
    }

    pub async fn sync(
        &self,
        cids: &[Cid],
        last_sync_at: Option<DateTime<Utc>>,
    ) -> ClientResult<SyncReport> {
        self.sync.sync(cids, last_sync_at).await
    }

    pub fn on<F>(&self, filter: Option<EventType>, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.dispatcher.on(filter, callback)
    }

    pub fn on_channel<F>(&self, cid: Cid, filter: Option<EventType>, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.dispatcher.on_channel(cid, filter, callback)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.dispatcher.subscribe_events()
    }

    pub async fn set_network_online(&self, online: bool) {
        self.connection.set_network_online(online).await;
    }

    /// Closes the session and tears down every cached channel and user.
    pub async fn dispose(&self) {
        self.connection.disconnect().await;
        if let Some(task) = self.typing_sweep_slot().take() {
            task.abort();
        }
        self.store.lock().await.clear();
        info!("state: client disposed");
    }

    fn start_typing_sweep(&self) {
        let mut slot = self.typing_sweep_slot();
        if slot.is_none() {
            *slot = Some(self.dispatcher.spawn_typing_sweep(
                self.settings.typing_sweep_interval(),
                self.settings.typing_timeout(),
            ));
        }
    }

    fn typing_sweep_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.typing_sweep
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        if let Some(task) = self.typing_sweep_slot().take() {
            task.abort();
        }
    }
}
