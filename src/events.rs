use crate::connection::ConnectionState;
use crate::diagnostics::AlertSet;
use crate::error::EventBusError;
use serde::Serialize;
use std::time::SystemTime;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Events published by monitored feeds
#[derive(Debug, Clone, Serialize)]
pub enum FeedEvent {
    /// Connection state of a feed changed
    StateChanged {
        feed_id: u32,
        from: ConnectionState,
        to: ConnectionState,
        timestamp: SystemTime,
    },
    /// The analyzer produced a non-empty alert set
    AlertRaised {
        feed_id: u32,
        kinds: AlertSet,
        message: String,
        timestamp: SystemTime,
    },
    /// Open, read or decode failure on a feed
    ConnectionError {
        feed_id: u32,
        kind: &'static str,
        message: String,
        timestamp: SystemTime,
    },
}

impl FeedEvent {
    pub fn feed_id(&self) -> u32 {
        match self {
            FeedEvent::StateChanged { feed_id, .. }
            | FeedEvent::AlertRaised { feed_id, .. }
            | FeedEvent::ConnectionError { feed_id, .. } => *feed_id,
        }
    }

    pub fn timestamp(&self) -> SystemTime {
        match self {
            FeedEvent::StateChanged { timestamp, .. }
            | FeedEvent::AlertRaised { timestamp, .. }
            | FeedEvent::ConnectionError { timestamp, .. } => *timestamp,
        }
    }

    /// Get a human-readable description of the event
    pub fn description(&self) -> String {
        match self {
            FeedEvent::StateChanged {
                feed_id, from, to, ..
            } => format!("Feed {} state {:?} -> {:?}", feed_id, from, to),
            FeedEvent::AlertRaised { message, .. } => message.clone(),
            FeedEvent::ConnectionError {
                feed_id,
                kind,
                message,
                ..
            } => format!("Feed {} {} error: {}", feed_id, kind, message),
        }
    }

    /// Get the event type as a string for filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            FeedEvent::StateChanged { .. } => "state_changed",
            FeedEvent::AlertRaised { .. } => "alert_raised",
            FeedEvent::ConnectionError { .. } => "connection_error",
        }
    }
}

/// Broadcast bus shared by the sessions of one registry
pub struct EventBus {
    sender: broadcast::Sender<FeedEvent>,
}

impl EventBus {
    /// Create a new event bus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers.
    ///
    /// Publishing never blocks; with no subscribers the event is dropped and
    /// an error is returned, which callers are free to ignore.
    pub fn publish(&self, event: FeedEvent) -> Result<usize, EventBusError> {
        match &event {
            FeedEvent::StateChanged {
                feed_id,
                to: ConnectionState::Connected,
                ..
            } => info!("Feed {} connected", feed_id),
            FeedEvent::StateChanged {
                feed_id,
                to: ConnectionState::Lost,
                ..
            } => warn!("Feed {} lost", feed_id),
            _ => debug!("Event: {}", event.description()),
        }

        self.sender
            .send(event)
            .map_err(|e| EventBusError::PublishFailed {
                details: e.to_string(),
            })
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

/// Event filter for selective event handling
#[derive(Debug, Clone)]
pub enum EventFilter {
    All,
    EventTypes(Vec<&'static str>),
    Feeds(Vec<u32>),
}

impl EventFilter {
    pub fn matches(&self, event: &FeedEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::EventTypes(types) => types.contains(&event.event_type()),
            EventFilter::Feeds(feeds) => feeds.contains(&event.feed_id()),
        }
    }
}

/// Event receiver that skips events not matching its filter
pub struct EventReceiver {
    receiver: broadcast::Receiver<FeedEvent>,
    filter: EventFilter,
    name: String,
}

impl EventReceiver {
    pub fn new(
        receiver: broadcast::Receiver<FeedEvent>,
        filter: EventFilter,
        name: String,
    ) -> Self {
        Self {
            receiver,
            filter,
            name,
        }
    }

    /// Receive the next filtered event
    pub async fn recv(&mut self) -> Result<FeedEvent, EventBusError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        return Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Receiver '{}' lagged behind by {} events", self.name, n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed for receiver '{}'", self.name);
                    return Err(EventBusError::ChannelClosed);
                }
            }
        }
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<Option<FeedEvent>, EventBusError> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        return Ok(Some(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!("Receiver '{}' lagged behind by {} events", self.name, n);
                }
                Err(broadcast::error::TryRecvError::Closed) => {
                    return Err(EventBusError::ChannelClosed);
                }
            }
        }
    }
}
