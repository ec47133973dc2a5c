use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use crate::core::query::Query;
use crate::core::sync_engine::{SyncEngine, SyncEngineCallback};
use crate::core::view_snapshot::{OnlineState, ViewSnapshot};
use crate::error::{SyncError, SyncResult};

/// Application-facing observer of a single query.
pub trait QueryEventListener: Send + Sync {
    fn on_view_snapshot(&self, snapshot: ViewSnapshot);

    /// The listen failed permanently; the listener is dropped afterwards.
    fn on_error(&self, error: SyncError);

    fn on_online_state_change(&self, _online_state: OnlineState) {}
}

#[derive(Default)]
struct QueryListenersInfo {
    listeners: Vec<Arc<dyn QueryEventListener>>,
    view_snapshot: Option<ViewSnapshot>,
}

struct EventManagerState {
    queries: HashMap<Query, QueryListenersInfo>,
    online_state: OnlineState,
}

/// Multiplexes application listeners over the sync engine's per-query views:
/// the first listener for a query starts the listen, the last one stopping
/// ends it, and late joiners replay the latest snapshot.
pub struct EventManager {
    sync_engine: SyncEngine,
    state: StdMutex<EventManagerState>,
}

impl EventManager {
    /// Builds the event manager and installs it as the engine's callback.
    pub fn new(sync_engine: SyncEngine) -> Arc<Self> {
        let manager = Arc::new(Self {
            sync_engine: sync_engine.clone(),
            state: StdMutex::new(EventManagerState {
                queries: HashMap::new(),
                online_state: OnlineState::Unknown,
            }),
        });
        sync_engine.set_callback(manager.clone());
        manager
    }

    pub async fn add_query_listener(
        &self,
        query: Query,
        listener: Arc<dyn QueryEventListener>,
    ) -> SyncResult<()> {
        let is_first = {
            let mut state = self.state.lock().unwrap();
            listener.on_online_state_change(state.online_state);
            let info = state.queries.entry(query.clone()).or_default();
            info.listeners.push(listener.clone());
            if info.listeners.len() == 1 {
                true
            } else {
                if let Some(snapshot) = &info.view_snapshot {
                    listener.on_view_snapshot(snapshot.clone());
                }
                false
            }
        };

        if is_first {
            if let Err(error) = self.sync_engine.listen(query.clone()).await {
                let mut state = self.state.lock().unwrap();
                state.queries.remove(&query);
                return Err(error);
            }
        }
        Ok(())
    }

    pub async fn remove_query_listener(
        &self,
        query: &Query,
        listener: &Arc<dyn QueryEventListener>,
    ) -> SyncResult<()> {
        let was_last = {
            let mut state = self.state.lock().unwrap();
            match state.queries.get_mut(query) {
                Some(info) => {
                    info.listeners
                        .retain(|existing| !Arc::ptr_eq(existing, listener));
                    if info.listeners.is_empty() {
                        state.queries.remove(query);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if was_last {
            self.sync_engine.stop_listening(query).await?;
        }
        Ok(())
    }

    pub fn online_state(&self) -> OnlineState {
        self.state.lock().unwrap().online_state
    }
}

impl SyncEngineCallback for EventManager {
    fn on_view_snapshots(&self, snapshots: Vec<ViewSnapshot>) {
        let mut state = self.state.lock().unwrap();
        for snapshot in snapshots {
            if let Some(info) = state.queries.get_mut(snapshot.query()) {
                for listener in &info.listeners {
                    listener.on_view_snapshot(snapshot.clone());
                }
                info.view_snapshot = Some(snapshot);
            }
        }
    }

    fn on_error(&self, query: &Query, error: SyncError) {
        let mut state = self.state.lock().unwrap();
        if let Some(info) = state.queries.remove(query) {
            for listener in info.listeners {
                listener.on_error(error.clone());
            }
        }
    }

    fn handle_online_state_change(&self, online_state: OnlineState) {
        let mut state = self.state.lock().unwrap();
        state.online_state = online_state;
        for info in state.queries.values() {
            for listener in &info.listeners {
                listener.on_online_state_change(online_state);
            }
        }
    }
}
