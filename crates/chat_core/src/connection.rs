//! One logical realtime session that stays eventually healthy.
//!
//! Every socket gets a fresh `generation`. Tasks spawned for a socket carry
//! the generation they were created under and exit as soon as it is no longer
//! current, so timers never stack across reconnects and a late callback from
//! a superseded socket is a no-op.
//!
//! A transport error, a close frame, monitor-detected silence and the host
//! going offline all end in [`Connection::connection_lost`]. The cause is
//! logged and otherwise dropped.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex as StdMutex, Weak,
};

use async_trait::async_trait;
use chat_shared::{
    domain::{ConnectionId, UserId},
    error::ErrorEnvelope,
    protocol::{Event, EventType, HealthCheckFrame},
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::{
    sync::{mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
    time::{self, Duration, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    backoff::BackoffPolicy,
    config::ClientSettings,
    dispatcher::EventDispatcher,
    error::{ClientError, ClientResult},
    token::TokenManager,
    transport::{Connector, Frame, FrameStream},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub generation: u64,
    pub last_event_at: Option<DateTime<Utc>>,
    pub connection_id: Option<ConnectionId>,
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub url: Url,
    pub api_key: String,
    pub user_id: Option<UserId>,
    pub health_check_interval: Duration,
    pub monitor_interval: Duration,
    pub silence_threshold: Duration,
    pub connect_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl ConnectionSettings {
    pub fn from_client(settings: &ClientSettings) -> ClientResult<Self> {
        Ok(Self {
            url: settings.websocket_url()?,
            api_key: settings.api_key.clone(),
            user_id: settings.user_id.clone().map(UserId::from),
            health_check_interval: settings.health_check_interval(),
            monitor_interval: settings.monitor_interval(),
            silence_threshold: settings.silence_threshold(),
            connect_timeout: settings.connect_timeout(),
            backoff: settings.backoff(),
        })
    }
}

/// Invoked once a reconnect has produced a healthy socket.
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    async fn recover(&self, generation: u64);
}

#[derive(Default)]
struct Inner {
    stats: ConnectionStats,
    last_frame_at: Option<Instant>,
    outbound: Option<mpsc::Sender<String>>,
    tasks: Vec<(u64, JoinHandle<()>)>,
    reconnect_task: Option<JoinHandle<()>>,
    ever_healthy: bool,
    last_error: Option<ClientError>,
}

type FirstHealth = oneshot::Sender<ClientResult<ConnectionId>>;

pub struct Connection {
    settings: ConnectionSettings,
    connector: Arc<dyn Connector>,
    tokens: Arc<TokenManager>,
    dispatcher: Arc<EventDispatcher>,
    generation: AtomicU64,
    reconnecting: AtomicBool,
    explicitly_closed: AtomicBool,
    state: watch::Sender<ConnectionState>,
    connection_id: watch::Sender<Option<ConnectionId>>,
    network_online: watch::Sender<bool>,
    inner: Mutex<Inner>,
    recovery: StdMutex<Option<Weak<dyn RecoveryHandler>>>,
}

impl Connection {
    pub fn new(
        settings: ConnectionSettings,
        connector: Arc<dyn Connector>,
        tokens: Arc<TokenManager>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            connector,
            tokens,
            dispatcher,
            generation: AtomicU64::new(0),
            reconnecting: AtomicBool::new(false),
            explicitly_closed: AtomicBool::new(false),
            state: watch::Sender::new(ConnectionState::Disconnected),
            connection_id: watch::Sender::new(None),
            network_online: watch::Sender::new(true),
            inner: Mutex::new(Inner::default()),
            recovery: StdMutex::new(None),
        })
    }

    pub fn set_recovery_handler(&self, handler: Weak<dyn RecoveryHandler>) {
        let mut slot = self
            .recovery
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(handler);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id.borrow().clone()
    }

    pub fn watch_connection_id(&self) -> watch::Receiver<Option<ConnectionId>> {
        self.connection_id.subscribe()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation && !self.explicitly_closed.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> ConnectionStats {
        let mut stats = self.inner.lock().await.stats.clone();
        stats.generation = self.generation();
        stats
    }

    pub async fn last_error(&self) -> Option<ClientError> {
        self.inner.lock().await.last_error.clone()
    }

    /// Resolves on the first health-check frame of a session. Calling it
    /// while connected, or while an attempt is in flight, joins that session.
    pub async fn connect(self: &Arc<Self>) -> ClientResult<ConnectionId> {
        self.explicitly_closed.store(false, Ordering::SeqCst);
        let claimed = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return self.wait_until_healthy().await;
        }

        self.inner.lock().await.last_error = None;
        info!(url = %self.settings.url, "ws: connecting");
        match self.open_socket().await {
            Ok(connection_id) => Ok(connection_id),
            Err(ClientError::Superseded) => Err(ClientError::Disconnected),
            Err(err) if err.is_retryable() || err.is_token_expired() => {
                warn!(error = %err, "ws: initial connect failed, retrying in background");
                self.record_failure().await;
                if err.is_token_expired() {
                    if let Err(refresh_err) = self.tokens.refresh().await {
                        self.surface(refresh_err.clone()).await;
                        return Err(refresh_err);
                    }
                }
                self.ensure_reconnecting().await;
                self.wait_until_healthy().await
            }
            Err(err) => {
                self.surface(err.clone()).await;
                Err(err)
            }
        }
    }

    /// Terminal until the next `connect()`. Safe to call repeatedly.
    pub async fn disconnect(self: &Arc<Self>) {
        self.explicitly_closed.store(true, Ordering::SeqCst);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let last_event_at = {
            let mut inner = self.inner.lock().await;
            for (_, task) in inner.tasks.drain(..) {
                task.abort();
            }
            if let Some(task) = inner.reconnect_task.take() {
                task.abort();
            }
            inner.outbound = None;
            inner.stats.connection_id = None;
            inner.stats.last_event_at
        };
        self.reconnecting.store(false, Ordering::SeqCst);
        self.connection_id.send_replace(None);

        let previous = self.state.send_replace(ConnectionState::Disconnected);
        if previous == ConnectionState::Disconnected {
            return;
        }
        self.record_sync_cursor(last_event_at).await;
        info!(generation, "ws: disconnected");
        if previous == ConnectionState::Healthy {
            self.emit_connection_changed(false).await;
        }
    }

    /// Host connectivity signal. Going offline parks reconnection; coming
    /// back online skips the remaining backoff.
    pub async fn set_network_online(self: &Arc<Self>, online: bool) {
        let changed = self.network_online.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if !changed {
            return;
        }
        info!(online, "ws: network connectivity changed");
        if self.explicitly_closed.load(Ordering::SeqCst) {
            return;
        }
        match (online, self.state()) {
            (false, ConnectionState::Healthy) => {
                self.connection_lost(self.generation(), "network offline".to_string());
            }
            (true, ConnectionState::Unhealthy) => self.ensure_reconnecting().await,
            _ => {}
        }
    }

    /// Sends a raw text frame on the current socket.
    pub async fn send_text(&self, text: String) -> ClientResult<()> {
        let outbound = self.inner.lock().await.outbound.clone();
        match outbound {
            Some(outbound) => outbound
                .send(text)
                .await
                .map_err(|_| ClientError::Transport("socket writer closed".to_string())),
            None => Err(ClientError::Disconnected),
        }
    }

    async fn wait_until_healthy(&self) -> ClientResult<ConnectionId> {
        let timeout = self.settings.connect_timeout;
        let mut state = self.state.subscribe();
        let wait = async {
            loop {
                let current = *state.borrow_and_update();
                match current {
                    ConnectionState::Healthy => {
                        if let Some(connection_id) = self.connection_id() {
                            return Ok(connection_id);
                        }
                    }
                    ConnectionState::Disconnected => {
                        return Err(self
                            .last_error()
                            .await
                            .unwrap_or(ClientError::Disconnected));
                    }
                    ConnectionState::Connecting | ConnectionState::Unhealthy => {}
                }
                if state.changed().await.is_err() {
                    return Err(ClientError::Disconnected);
                }
            }
        };
        match time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(timeout)),
        }
    }

    fn connect_url(&self, token: &str) -> Url {
        let mut url = self.settings.url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("api_key", &self.settings.api_key);
            if let Some(user_id) = &self.settings.user_id {
                query.append_pair("user_id", user_id.as_str());
            }
            query.append_pair("client_request_id", &Uuid::new_v4().to_string());
            query.append_pair("authorization", token);
            query.append_pair("stream-auth-type", "jwt");
        }
        url
    }

    /// Opens a socket under a new generation and waits for its first
    /// health check.
    async fn open_socket(self: &Arc<Self>) -> ClientResult<ConnectionId> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let timeout = self.settings.connect_timeout;
        let token = self.tokens.token().await?;
        let url = self.connect_url(&token);
        debug!(generation, "ws: opening socket");

        let handle = time::timeout(timeout, self.connector.connect(url))
            .await
            .map_err(|_| ClientError::Timeout(timeout))??;
        if !self.is_current(generation) {
            return Err(ClientError::Superseded);
        }

        let (first_tx, first_rx) = oneshot::channel();
        let reader = tokio::spawn(Arc::clone(self).read_frames(generation, handle.frames, first_tx));
        {
            let mut inner = self.inner.lock().await;
            inner.tasks.push((generation, reader));
            inner.last_frame_at = Some(Instant::now());
        }

        let first = match time::timeout(timeout, first_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Transport(
                "socket closed before first health check".to_string(),
            )),
            Err(_) => Err(ClientError::Timeout(timeout)),
        };
        let connection_id = match first {
            Ok(connection_id) if self.is_current(generation) => connection_id,
            Ok(_) => return Err(ClientError::Superseded),
            Err(err) => {
                self.abort_tasks(generation).await;
                return Err(err);
            }
        };

        self.mark_healthy(generation, connection_id.clone(), handle.outbound)
            .await;
        Ok(connection_id)
    }

    async fn mark_healthy(
        self: &Arc<Self>,
        generation: u64,
        connection_id: ConnectionId,
        outbound: mpsc::Sender<String>,
    ) {
        let recovered = {
            let mut inner = self.inner.lock().await;
            inner.stats.connection_id = Some(connection_id.clone());
            inner.stats.consecutive_failures = 0;
            inner.last_error = None;
            inner.last_frame_at = Some(Instant::now());
            inner.outbound = Some(outbound.clone());
            let emitter = tokio::spawn(Arc::clone(self).emit_health_checks(
                generation,
                connection_id.clone(),
                outbound,
            ));
            let monitor = tokio::spawn(Arc::clone(self).monitor_silence(generation));
            inner.tasks.push((generation, emitter));
            inner.tasks.push((generation, monitor));
            std::mem::replace(&mut inner.ever_healthy, true)
        };
        self.connection_id.send_replace(Some(connection_id.clone()));
        let previous = self.state.send_replace(ConnectionState::Healthy);
        info!(generation, %connection_id, recovered, "ws: connection healthy");
        if previous != ConnectionState::Healthy {
            self.emit_connection_changed(true).await;
        }
        if recovered {
            self.spawn_recovery(generation);
        }
    }

    fn spawn_recovery(&self, generation: u64) {
        let handler = self
            .recovery
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .and_then(Weak::upgrade);
        if let Some(handler) = handler {
            tokio::spawn(async move { handler.recover(generation).await });
        }
    }

    async fn read_frames(
        self: Arc<Self>,
        generation: u64,
        mut frames: FrameStream,
        first_tx: FirstHealth,
    ) {
        let mut first = Some(first_tx);
        let cause = loop {
            let Some(next) = frames.next().await else {
                break "stream ended".to_string();
            };
            if !self.is_current(generation) {
                return;
            }
            match next {
                Ok(Frame::Text(text)) => {
                    {
                        let mut inner = self.inner.lock().await;
                        inner.last_frame_at = Some(Instant::now());
                        inner.stats.last_event_at = Some(Utc::now());
                    }
                    self.handle_text(generation, &text, &mut first).await;
                }
                Ok(Frame::Closed { code, reason }) => {
                    break format!("closed by server (code {code:?}): {reason}");
                }
                Err(err) => break err.to_string(),
            }
        };

        match first.take() {
            Some(first) => {
                let _ = first.send(Err(ClientError::Transport(cause)));
            }
            None => self.connection_lost(generation, cause),
        }
    }

    async fn handle_text(&self, generation: u64, text: &str, first: &mut Option<FirstHealth>) {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                warn!(generation, error = %err, "ws: dropping undecodable frame");
                return;
            }
        };

        if value.get("error").is_some() {
            let err = match serde_json::from_value::<ErrorEnvelope>(value) {
                Ok(envelope) => ClientError::from(envelope.error),
                Err(err) => ClientError::Protocol(format!("malformed error frame: {err}")),
            };
            match first.take() {
                Some(first) => {
                    let _ = first.send(Err(err));
                }
                None => warn!(generation, error = %err, "ws: server reported error"),
            }
            return;
        }

        let event: Event = match serde_json::from_value(value) {
            Ok(event) => event,
            Err(err) => {
                warn!(generation, error = %err, "ws: dropping malformed event");
                return;
            }
        };

        let connection_id = (event.kind == EventType::HealthCheck)
            .then(|| event.connection_id.clone())
            .flatten();
        self.dispatcher.dispatch(event).await;

        if let Some(connection_id) = connection_id {
            if let Some(first) = first.take() {
                let _ = first.send(Ok(connection_id));
            }
        }
    }

    async fn emit_health_checks(
        self: Arc<Self>,
        generation: u64,
        connection_id: ConnectionId,
        outbound: mpsc::Sender<String>,
    ) {
        let every = self.settings.health_check_interval;
        let mut ticker = time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let frame = HealthCheckFrame::new(connection_id.as_str());
        loop {
            ticker.tick().await;
            if !self.is_current(generation) {
                return;
            }
            let payload = match serde_json::to_string(&frame) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(error = %err, "ws: failed to encode health check");
                    continue;
                }
            };
            if outbound.send(payload).await.is_err() {
                self.connection_lost(generation, "socket writer closed".to_string());
                return;
            }
        }
    }

    async fn monitor_silence(self: Arc<Self>, generation: u64) {
        let threshold = self.settings.silence_threshold;
        let mut ticker = time::interval(self.settings.monitor_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !self.is_current(generation) {
                return;
            }
            let last_frame_at = self.inner.lock().await.last_frame_at;
            let silent_for = last_frame_at
                .map(|at| Instant::now().saturating_duration_since(at))
                .unwrap_or_default();
            if silent_for > threshold {
                self.connection_lost(
                    generation,
                    format!("no frames for {}ms", silent_for.as_millis()),
                );
                return;
            }
        }
    }

    /// Normalized loss signal. Handling runs in its own task so the caller
    /// (often one of the tasks being torn down) is never aborted mid-way.
    fn connection_lost(self: &Arc<Self>, generation: u64, cause: String) {
        let connection = Arc::clone(self);
        tokio::spawn(async move { connection.handle_loss(generation, cause).await });
    }

    async fn handle_loss(self: Arc<Self>, generation: u64, cause: String) {
        if self.explicitly_closed.load(Ordering::SeqCst) {
            return;
        }
        if self
            .generation
            .compare_exchange(generation, generation + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(generation, "ws: ignoring loss from superseded socket");
            return;
        }

        let (last_event_at, consecutive_failures) = {
            let mut inner = self.inner.lock().await;
            inner.tasks.retain(|(task_generation, task)| {
                if *task_generation <= generation {
                    task.abort();
                    false
                } else {
                    true
                }
            });
            inner.outbound = None;
            inner.stats.connection_id = None;
            inner.stats.consecutive_failures += 1;
            inner.stats.total_failures += 1;
            (inner.stats.last_event_at, inner.stats.consecutive_failures)
        };
        self.connection_id.send_replace(None);
        let previous = self.state.send_replace(ConnectionState::Unhealthy);
        warn!(generation, consecutive_failures, %cause, "ws: connection lost");

        self.record_sync_cursor(last_event_at).await;
        if previous == ConnectionState::Healthy {
            self.emit_connection_changed(false).await;
        }
        self.ensure_reconnecting().await;
    }

    /// Starts the reconnect loop unless one is already running.
    async fn ensure_reconnecting(self: &Arc<Self>) {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let connection = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                connection.reconnect_loop().await;
                connection.reconnecting.store(false, Ordering::SeqCst);
                // A loss that landed while the loop was finishing found the
                // guard still held.
                let lost_again = connection.state() == ConnectionState::Unhealthy
                    && !connection.explicitly_closed.load(Ordering::SeqCst);
                if !lost_again
                    || connection
                        .reconnecting
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_err()
                {
                    return;
                }
            }
        });
        self.inner.lock().await.reconnect_task = Some(task);
    }

    async fn reconnect_loop(self: &Arc<Self>) {
        let mut network = self.network_online.subscribe();
        let mut skip_delay = false;
        let mut refreshed_in_streak = false;
        loop {
            if self.explicitly_closed.load(Ordering::SeqCst) {
                return;
            }
            if !*network.borrow_and_update() {
                debug!("ws: offline, waiting for connectivity");
                while !*network.borrow_and_update() {
                    if network.changed().await.is_err() {
                        return;
                    }
                }
                skip_delay = true;
                continue;
            }

            if !skip_delay {
                let failures = self.inner.lock().await.stats.consecutive_failures;
                let delay = self.settings.backoff.delay(failures);
                info!(
                    delay_ms = delay.as_millis() as u64,
                    consecutive_failures = failures,
                    "ws: reconnecting"
                );
                tokio::select! {
                    _ = time::sleep(delay) => {}
                    changed = network.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        skip_delay = true;
                        continue;
                    }
                }
            }
            skip_delay = false;
            if self.explicitly_closed.load(Ordering::SeqCst) {
                return;
            }

            let was_healthy = self.inner.lock().await.ever_healthy;
            self.state.send_replace(ConnectionState::Connecting);
            match self.open_socket().await {
                Ok(_) => return,
                Err(ClientError::Superseded) => return,
                Err(err) if err.is_token_expired() => {
                    info!(refreshed_in_streak, "ws: credential expired, refreshing before retry");
                    self.record_failure().await;
                    self.park(was_healthy);
                    if let Err(refresh_err) = self.tokens.refresh().await {
                        self.surface(refresh_err).await;
                        return;
                    }
                    // Only the first refresh in a failure streak retries at once.
                    skip_delay = !refreshed_in_streak;
                    refreshed_in_streak = true;
                }
                Err(err) if err.is_retryable() => {
                    warn!(error = %err, "ws: reconnect attempt failed");
                    self.record_failure().await;
                    self.park(was_healthy);
                }
                Err(err) => {
                    self.surface(err).await;
                    return;
                }
            }
        }
    }

    fn park(&self, was_healthy: bool) {
        let parked = if was_healthy {
            ConnectionState::Unhealthy
        } else {
            ConnectionState::Connecting
        };
        if !self.explicitly_closed.load(Ordering::SeqCst) {
            self.state.send_replace(parked);
        }
    }

    async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.stats.consecutive_failures += 1;
        inner.stats.total_failures += 1;
    }

    /// No automatic remedy is left; park in `Disconnected` with the cause.
    async fn surface(&self, err: ClientError) {
        warn!(error = %err, "ws: giving up, error surfaced to caller");
        self.inner.lock().await.last_error = Some(err);
        if !self.explicitly_closed.load(Ordering::SeqCst) {
            self.state.send_replace(ConnectionState::Disconnected);
        }
    }

    async fn abort_tasks(&self, generation: u64) {
        let mut inner = self.inner.lock().await;
        inner.tasks.retain(|(task_generation, task)| {
            if *task_generation == generation {
                task.abort();
                false
            } else {
                true
            }
        });
    }

    async fn record_sync_cursor(&self, last_event_at: Option<DateTime<Utc>>) {
        let at = last_event_at.unwrap_or_else(Utc::now);
        self.dispatcher.store().lock().await.record_sync_cursor(at);
    }

    async fn emit_connection_changed(&self, online: bool) {
        let event = Event::new(EventType::ConnectionChanged).with_online(online);
        self.dispatcher.dispatch(event).await;
    }

    pub(crate) async fn emit_recovered(&self) {
        self.dispatcher
            .dispatch(Event::new(EventType::ConnectionRecovered))
            .await;
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
