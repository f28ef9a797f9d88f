//! Catch-up after a gap in the realtime stream.
//!
//! The missed window is fetched with one `sync` call and replayed through the
//! same [`EventDispatcher::dispatch`] routine live frames use. When no usable
//! cursor exists, or the sync call itself fails, every watched channel is
//! re-queried instead and its state replaced by the fresh snapshot.

use std::sync::Arc;

use async_trait::async_trait;
use chat_shared::{
    domain::Cid,
    protocol::{QueryChannelsRequest, SortOption, SyncRequest},
};
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    api::ChatApi,
    connection::{Connection, RecoveryHandler},
    dispatcher::EventDispatcher,
    error::{ClientResult, SyncError},
};

const QUERY_PAGE: usize = 30;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub received: usize,
    pub changed: usize,
    pub inaccessible: Vec<Cid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPath {
    Nothing,
    Sync,
    Requery,
}

pub struct SyncCoordinator {
    api: Arc<dyn ChatApi>,
    dispatcher: Arc<EventDispatcher>,
    connection: Arc<Connection>,
    max_sync_gap: chrono::Duration,
    running: Mutex<()>,
}

impl SyncCoordinator {
    pub fn new(
        api: Arc<dyn ChatApi>,
        dispatcher: Arc<EventDispatcher>,
        connection: Arc<Connection>,
        max_sync_gap: chrono::Duration,
    ) -> Self {
        Self {
            api,
            dispatcher,
            connection,
            max_sync_gap,
            running: Mutex::new(()),
        }
    }

    /// Fetches the events `cids` missed since `last_sync_at` and replays them
    /// in the order the server returned them.
    pub async fn sync(
        &self,
        cids: &[Cid],
        last_sync_at: Option<DateTime<Utc>>,
    ) -> ClientResult<SyncReport> {
        if cids.is_empty() {
            return Err(SyncError::EmptyChannelList.into());
        }
        let last_sync_at = last_sync_at.ok_or(SyncError::MissingCursor)?;

        let request = SyncRequest {
            channel_cids: cids.to_vec(),
            last_sync_at,
            watch: true,
            with_inaccessible_cids: true,
        };
        let response = self.api.sync(request).await?;
        let received = response.events.len();
        debug!(channels = cids.len(), received, %last_sync_at, "sync: replaying missed events");
        let changed = self.dispatcher.dispatch_all(response.events).await;

        if !response.inaccessible_cids.is_empty() {
            let mut store = self.dispatcher.store().lock().await;
            for cid in &response.inaccessible_cids {
                if store.unwatch(cid) {
                    info!(%cid, "sync: channel no longer accessible, dropped");
                }
            }
        }

        Ok(SyncReport {
            received,
            changed,
            inaccessible: response.inaccessible_cids,
        })
    }

    /// Replaces the state of `cids` with fresh snapshots, watching them again.
    pub async fn requery(&self, cids: &[Cid]) -> ClientResult<usize> {
        let mut refreshed = 0;
        for page in cids.chunks(QUERY_PAGE) {
            let request = QueryChannelsRequest {
                filter_conditions: json!({ "cid": { "$in": page } }),
                sort: vec![SortOption {
                    field: "last_message_at".to_string(),
                    direction: -1,
                }],
                state: true,
                watch: true,
                presence: true,
                limit: page.len() as u32,
                message_limit: None,
            };
            let response = self.api.query_channels(request).await?;
            let mut store = self.dispatcher.store().lock().await;
            for snapshot in response.channels {
                store.watch(snapshot);
                refreshed += 1;
            }
        }
        Ok(refreshed)
    }

    /// Brings every watched channel up to date after the stream resumed.
    pub async fn recover_watched(&self) -> ClientResult<RecoveryPath> {
        let _guard = self.running.lock().await;
        let (cids, cursor) = {
            let store = self.dispatcher.store().lock().await;
            (store.watched_cids(), store.sync_cursor())
        };
        if cids.is_empty() {
            return Ok(RecoveryPath::Nothing);
        }

        let usable = cursor.filter(|at| Utc::now() - *at <= self.max_sync_gap);
        if usable.is_some() {
            match self.sync(&cids, usable).await {
                Ok(report) => {
                    info!(
                        channels = cids.len(),
                        received = report.received,
                        changed = report.changed,
                        "sync: caught up"
                    );
                    return Ok(RecoveryPath::Sync);
                }
                Err(err) => warn!(error = %err, "sync: catch-up failed, re-querying channels"),
            }
        } else {
            debug!(?cursor, "sync: no usable cursor, re-querying channels");
        }

        let refreshed = self.requery(&cids).await?;
        info!(channels = cids.len(), refreshed, "sync: channels re-queried");
        Ok(RecoveryPath::Requery)
    }
}

#[async_trait]
impl RecoveryHandler for SyncCoordinator {
    async fn recover(&self, generation: u64) {
        let result = self.recover_watched().await;
        if !self.connection.is_current(generation) {
            debug!(generation, "sync: recovery finished on a superseded socket");
            return;
        }
        match result {
            Ok(path) => {
                self.dispatcher.store().lock().await.clear_sync_cursor();
                debug!(generation, ?path, "sync: recovery complete");
                self.connection.emit_recovered().await;
            }
            Err(err) => warn!(generation, error = %err, "sync: recovery failed, cursor kept"),
        }
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
