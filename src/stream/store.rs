//! Consumer-visible reactive state.
//!
//! The snapshot lives inside a `watch` channel: every mutation goes through
//! `send_modify`, so readers either borrow the latest value or await the next
//! change. Subscription bookkeeping lives in the registry; only the
//! connection manager and the router write to this store.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use super::connection::ConnectionState;
use super::envelope::{
    MarketAlert, MarketEvent, PatternDetected, PriceUpdate, Recommendation, VolumeSurge,
};
use crate::config::BufferCapacity;

/// Fixed-capacity list, newest entry first. Oldest entries fall off the end.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    #[serde(skip)]
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.capacity == 0 {
            return;
        }
        self.items.push_front(item);
        self.items.truncate(self.capacity);
    }

    pub fn newest(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub is_connected: bool,
    pub is_connecting: bool,
    pub last_error: Option<String>,
    pub reconnect_attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReactiveState {
    pub connection: ConnectionStatus,
    /// Replaced wholesale per route on every update
    pub recommendations_by_route: HashMap<String, Vec<Recommendation>>,
    pub latest_price_by_item: HashMap<i64, PriceUpdate>,
    pub recent_events: RingBuffer<MarketEvent>,
    pub recent_patterns: RingBuffer<PatternDetected>,
    pub recent_surges: RingBuffer<VolumeSurge>,
    pub active_alerts: Vec<MarketAlert>,
    pub last_message_at: Option<DateTime<Utc>>,
}

impl ReactiveState {
    pub fn new(buffers: BufferCapacity) -> Self {
        Self {
            connection: ConnectionStatus::default(),
            recommendations_by_route: HashMap::new(),
            latest_price_by_item: HashMap::new(),
            recent_events: RingBuffer::new(buffers.events),
            recent_patterns: RingBuffer::new(buffers.patterns),
            recent_surges: RingBuffer::new(buffers.surges),
            active_alerts: Vec::new(),
            last_message_at: None,
        }
    }
}

/// How a connection update treats `last_error`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LastError {
    Keep,
    Clear,
    Set(String),
}

pub struct StateStore {
    tx: watch::Sender<ReactiveState>,
}

impl StateStore {
    pub fn new(buffers: BufferCapacity) -> Self {
        let (tx, _) = watch::channel(ReactiveState::new(buffers));
        Self { tx }
    }

    pub fn watch(&self) -> watch::Receiver<ReactiveState> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> ReactiveState {
        self.tx.borrow().clone()
    }

    pub fn modify(&self, f: impl FnOnce(&mut ReactiveState)) {
        self.tx.send_modify(f);
    }

    pub fn publish_connection(&self, state: ConnectionState, attempt: u32, error: LastError) {
        self.tx.send_modify(|s| {
            s.connection.state = state;
            s.connection.is_connected = state == ConnectionState::Connected;
            s.connection.is_connecting = state == ConnectionState::Connecting;
            s.connection.reconnect_attempt = attempt;
            match error {
                LastError::Keep => {}
                LastError::Clear => s.connection.last_error = None,
                LastError::Set(message) => s.connection.last_error = Some(message),
            }
        });
    }

    /// Transient fault that leaves the connection state alone
    pub fn set_error(&self, message: String) {
        self.tx.send_modify(|s| s.connection.last_error = Some(message));
    }

    pub fn clear_messages(&self) {
        self.tx.send_modify(|s| {
            s.recent_events.clear();
            s.recent_patterns.clear();
            s.recent_surges.clear();
        });
    }

    pub fn clear_alerts(&self) {
        self.tx.send_modify(|s| s.active_alerts.clear());
    }
}
