use super::stream::{AlertSink, SessionStatus, StreamSession};
use crate::config::FeedwatchConfig;
use crate::connection::ErrorSink;
use crate::error::{RegistryError, Result};
use crate::events::{EventBus, EventFilter, EventReceiver, FeedEvent};
use crate::media::MediaSource;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Owns every monitored session, keyed by feed id.
///
/// Passed explicitly to whatever serves status or frames; there is no
/// process-wide session table.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<u32, Arc<StreamSession>>>,
    event_bus: EventBus,
}

impl SessionRegistry {
    pub fn new(event_bus: EventBus) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            event_bus,
        }
    }

    /// Build one session per configured feed, all sharing `source` and the sinks
    pub fn from_config(
        config: &FeedwatchConfig,
        source: Arc<dyn MediaSource>,
        alert_sink: Option<Arc<dyn AlertSink>>,
        error_sink: Option<Arc<dyn ErrorSink>>,
    ) -> Result<Self> {
        let registry = Self::new(EventBus::new(config.system.event_bus_capacity));

        for feed in &config.feeds {
            let mut builder = StreamSession::builder()
                .feed(feed.clone())
                .connection(config.connection.clone())
                .diagnostics(config.diagnostics.clone())
                .source(Arc::clone(&source))
                .event_bus(registry.event_bus.clone());
            if let Some(sink) = &alert_sink {
                builder = builder.alert_sink(Arc::clone(sink));
            }
            if let Some(sink) = &error_sink {
                builder = builder.error_sink(Arc::clone(sink));
            }

            registry.register(builder.build()?)?;
        }

        info!("Session registry created with {} feeds", registry.len());
        Ok(registry)
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.event_bus.subscribe()
    }

    /// Subscribe to the events matching `filter` only
    pub fn subscribe_filtered<S: Into<String>>(&self, filter: EventFilter, name: S) -> EventReceiver {
        EventReceiver::new(self.event_bus.subscribe(), filter, name.into())
    }

    pub fn register(&self, session: StreamSession) -> std::result::Result<Arc<StreamSession>, RegistryError> {
        let mut sessions = self.sessions.write();
        let id = session.id();
        if sessions.contains_key(&id) {
            return Err(RegistryError::DuplicateFeed(id));
        }

        let session = Arc::new(session);
        sessions.insert(id, Arc::clone(&session));
        debug!("Registered camera {} ({})", id, session.name());
        Ok(session)
    }

    /// Remove a session, stopping it first
    pub async fn remove(&self, id: u32) -> std::result::Result<(), RegistryError> {
        let session = self
            .sessions
            .write()
            .remove(&id)
            .ok_or(RegistryError::UnknownFeed(id))?;

        session.stop().await;
        info!("Removed camera {}", id);
        Ok(())
    }

    pub fn get(&self, id: u32) -> Option<Arc<StreamSession>> {
        self.sessions.read().get(&id).cloned()
    }

    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.sessions.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Status of every session, ordered by feed id
    pub fn statuses(&self) -> Vec<SessionStatus> {
        let mut statuses: Vec<SessionStatus> =
            self.snapshot().iter().map(|session| session.status()).collect();
        statuses.sort_by_key(|status| status.id);
        statuses
    }

    pub async fn start_all(&self) {
        let sessions = self.snapshot();
        info!("Starting {} sessions", sessions.len());
        join_all(sessions.iter().map(|session| session.start())).await;
    }

    /// Stop every session concurrently; each stop is bounded by its join timeout
    pub async fn stop_all(&self) {
        let sessions = self.snapshot();
        info!("Stopping {} sessions", sessions.len());
        join_all(sessions.iter().map(|session| session.stop())).await;
    }

    fn snapshot(&self) -> Vec<Arc<StreamSession>> {
        self.sessions.read().values().cloned().collect()
    }
}
