//! Shared feed client.
//!
//! One instance per process, handed to every consumer as `Arc<StreamClient>`.
//! Consumers only ever call the action surface below and read the reactive
//! snapshot; the socket, the subscription bookkeeping and the reconnect timer
//! stay private.
//!
//! Every action returns a plain `bool`. Faults surface through
//! `ReactiveState.connection` instead of errors, so callers never have to
//! handle transport failures themselves.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, trace, warn};

use super::connection::{
    AfterClose, ConnectionManager, ConnectionState, StateTransition, ABNORMAL_CLOSURE,
    NORMAL_CLOSURE,
};
use super::envelope::{decode, Decoded, Outbound};
use super::metrics::ClientMetrics;
use super::registry::{SubscribeOutcome, SubscriptionRegistry, UnsubscribeOutcome};
use super::router;
use super::store::{ReactiveState, StateStore};
use super::topic::SubscriptionKey;
use super::transport::{Connector, Link, Outgoing, TransportEvent};
use crate::config::{ResubscribePolicy, StreamConfig};

pub struct StreamClient {
    config: StreamConfig,
    connector: Arc<dyn Connector>,
    manager: ConnectionManager,
    registry: Mutex<SubscriptionRegistry>,
    store: Arc<StateStore>,
    metrics: Arc<ClientMetrics>,
}

impl StreamClient {
    pub fn new(config: StreamConfig, connector: Arc<dyn Connector>) -> Arc<Self> {
        let store = Arc::new(StateStore::new(config.buffers));
        let metrics = Arc::new(ClientMetrics::new());
        let manager = ConnectionManager::new(&config, store.clone(), metrics.clone());
        let registry = Mutex::new(SubscriptionRegistry::new(config.rate_limit()));

        Arc::new(Self {
            config,
            connector,
            manager,
            registry,
            store,
            metrics,
        })
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start connecting. Idempotent: returns false when an attempt is already
    /// in flight or the link is open. Must be called inside a tokio runtime.
    pub fn connect(self: &Arc<Self>) -> bool {
        match self.manager.begin_connect() {
            Some(generation) => {
                self.spawn_session(generation);
                true
            }
            None => false,
        }
    }

    /// Normal closure. Cancels any pending reconnect.
    pub fn close(&self) {
        self.manager.close();
        self.registry.lock().detach_all();
    }

    /// Close and forget every subscription.
    pub fn shutdown(&self) {
        self.close();
        self.registry.lock().clear();
        info!(metrics = %self.metrics.summary(), "feed client shut down");
    }

    // -------------------------------------------------------------------------
    // Action surface
    // -------------------------------------------------------------------------

    pub fn subscribe_to_item(&self, item_id: i64) -> bool {
        self.subscribe(&SubscriptionKey::item(item_id))
    }

    pub fn unsubscribe_from_item(&self, item_id: i64) -> bool {
        self.unsubscribe(&SubscriptionKey::item(item_id))
    }

    pub fn subscribe_to_route(&self, route_type: &str) -> bool {
        self.subscribe(&SubscriptionKey::route(route_type))
    }

    pub fn unsubscribe_from_route(&self, route_type: &str) -> bool {
        self.unsubscribe(&SubscriptionKey::route(route_type))
    }

    pub fn subscribe(&self, key: &SubscriptionKey) -> bool {
        let outcome = {
            let mut registry = self.registry.lock();
            let connected = self.manager.is_connected();
            registry.subscribe(key, Instant::now(), connected, |k| {
                self.send_frame(&k.subscribe_frame())
            })
        };

        match outcome {
            SubscribeOutcome::Created => debug!(subscription = %key, "subscribed"),
            SubscribeOutcome::Shared { ref_count } => {
                trace!(subscription = %key, ref_count, "subscription shared")
            }
            SubscribeOutcome::Reattached { ref_count } => {
                debug!(subscription = %key, ref_count, "subscription re-sent after reconnect")
            }
            SubscribeOutcome::NotConnected => {
                self.metrics.record_subscribe_rejection();
                debug!(subscription = %key, "subscribe rejected, not connected");
            }
            SubscribeOutcome::RateLimited { retry_in } => {
                self.metrics.record_subscribe_rejection();
                debug!(
                    subscription = %key,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "subscribe rate limited"
                );
            }
            SubscribeOutcome::SendFailed => {
                self.metrics.record_subscribe_rejection();
                warn!(subscription = %key, "subscribe frame could not be sent");
            }
        }
        outcome.is_accepted()
    }

    /// Release one reference. Always true: once this returns the caller no
    /// longer holds the key, even if the unsubscribe frame was lost.
    pub fn unsubscribe(&self, key: &SubscriptionKey) -> bool {
        let outcome = {
            let mut registry = self.registry.lock();
            let connected = self.manager.is_connected();
            registry.unsubscribe(key, connected, |k| self.send_frame(&k.unsubscribe_frame()))
        };

        match outcome {
            UnsubscribeOutcome::NotSubscribed => {
                trace!(subscription = %key, "unsubscribe for absent key")
            }
            UnsubscribeOutcome::Released { ref_count } => {
                trace!(subscription = %key, ref_count, "subscription released")
            }
            UnsubscribeOutcome::Removed { frame_sent } => {
                debug!(subscription = %key, frame_sent, "unsubscribed")
            }
            UnsubscribeOutcome::FrameLost => {
                warn!(subscription = %key, "released locally, unsubscribe frame lost")
            }
        }
        true
    }

    /// Subscribe now, unsubscribe when the lease is dropped.
    pub fn lease(self: &Arc<Self>, key: SubscriptionKey) -> Option<TopicLease> {
        if !self.subscribe(&key) {
            return None;
        }
        Some(TopicLease {
            client: Arc::downgrade(self),
            key,
        })
    }

    pub fn get_current_recommendations(&self, route_type: &str) -> bool {
        self.send_frame(&Outbound::GetCurrentRecommendations {
            route_type: route_type.to_string(),
        })
    }

    pub fn get_market_alerts(&self) -> bool {
        self.send_frame(&Outbound::GetMarketAlerts)
    }

    pub fn clear_messages(&self) -> bool {
        self.store.clear_messages();
        true
    }

    pub fn clear_alerts(&self) -> bool {
        self.store.clear_alerts();
        true
    }

    // -------------------------------------------------------------------------
    // Observation
    // -------------------------------------------------------------------------

    pub fn snapshot(&self) -> ReactiveState {
        self.store.snapshot()
    }

    pub fn watch(&self) -> watch::Receiver<ReactiveState> {
        self.store.watch()
    }

    pub fn transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.manager.subscribe_transitions()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.manager.attempts()
    }

    pub fn ref_count(&self, key: &SubscriptionKey) -> u32 {
        self.registry.lock().ref_count(key)
    }

    pub fn active_subscriptions(&self) -> Vec<SubscriptionKey> {
        self.registry.lock().keys()
    }

    pub fn metrics(&self) -> &ClientMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    // -------------------------------------------------------------------------
    // Session
    // -------------------------------------------------------------------------

    fn send_frame(&self, frame: &Outbound) -> bool {
        match frame.encode() {
            Ok(text) => self.manager.send(text),
            Err(e) => {
                warn!(error = %e, "dropping unencodable request");
                false
            }
        }
    }

    fn spawn_session(self: &Arc<Self>, generation: u64) {
        let weak = Arc::downgrade(self);
        let connector = self.connector.clone();
        let endpoint = self.config.endpoint.clone();

        let session = tokio::spawn(async move {
            let result = connector.connect(&endpoint).await;

            let Some(client) = weak.upgrade() else {
                return;
            };
            let Link { outbound, mut inbound } = match result {
                Ok(link) => link,
                Err(e) => {
                    let reason = format!("{:#}", e);
                    warn!(error = %reason, "feed connect failed");
                    client.handle_closed(generation, ABNORMAL_CLOSURE, &reason);
                    return;
                }
            };

            if !client.manager.on_open(generation, outbound.clone()) {
                let _ = outbound.send(Outgoing::Close {
                    code: NORMAL_CLOSURE,
                    reason: "superseded".to_string(),
                });
                return;
            }
            // The manager owns the writer from here on
            drop(outbound);
            client.after_open();
            drop(client);

            while let Some(event) = inbound.recv().await {
                let Some(client) = weak.upgrade() else {
                    return;
                };
                if !client.manager.is_current(generation) {
                    return;
                }
                match event {
                    TransportEvent::Text(text) => client.handle_frame(&text),
                    TransportEvent::Error(message) => {
                        warn!(error = %message, "feed transport error");
                        client.store.set_error(message);
                    }
                    TransportEvent::Closed { code, reason } => {
                        client.handle_closed(generation, code, &reason);
                        return;
                    }
                }
            }

            if let Some(client) = weak.upgrade() {
                client.handle_closed(generation, ABNORMAL_CLOSURE, "stream ended");
            }
        });

        self.manager.attach_session(generation, session);
    }

    fn after_open(&self) {
        if self.config.resubscribe != ResubscribePolicy::Replay {
            return;
        }
        let replayed = self
            .registry
            .lock()
            .replay(Instant::now(), |key| self.send_frame(&key.subscribe_frame()));
        if replayed > 0 {
            info!(replayed, "replayed subscriptions after connect");
        }
    }

    fn handle_frame(&self, text: &str) {
        self.metrics.record_frame_received();

        match decode(text) {
            Ok(Decoded::Envelope(envelope)) => {
                if tracing::enabled!(tracing::Level::TRACE) {
                    trace!(kind = envelope.kind(), "routing envelope");
                }
                self.store.modify(|state| router::route(state, envelope));
            }
            Ok(Decoded::Unknown(tag)) => {
                self.metrics.record_unknown_envelope();
                debug!(tag = %tag, "ignoring unknown envelope type");
            }
            Err(e) => {
                self.metrics.record_decode_failure();
                let raw: String = text.chars().take(200).collect();
                warn!(error = %e, raw = %raw, "dropping malformed frame");
                self.store.set_error(e.to_string());
            }
        }
    }

    fn handle_closed(self: &Arc<Self>, generation: u64, code: u16, reason: &str) {
        let Some(next) = self.manager.on_closed(generation, code, reason) else {
            return;
        };

        let detached = self.registry.lock().detach_all();
        if detached > 0 {
            debug!(detached, "subscriptions detached from closed link");
        }

        if let AfterClose::Retry { delay, .. } = next {
            self.schedule_retry(generation, delay);
        }
    }

    fn schedule_retry(self: &Arc<Self>, generation: u64, delay: Duration) {
        let weak = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            sleep(delay).await;
            let Some(client) = weak.upgrade() else {
                return;
            };
            if let Some(next) = client.manager.begin_retry(generation) {
                client.spawn_session(next);
            }
        });
        self.manager.attach_retry_timer(generation, timer);
    }
}

/// RAII subscription. Dropping it releases one reference.
pub struct TopicLease {
    client: Weak<StreamClient>,
    key: SubscriptionKey,
}

impl TopicLease {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }
}

impl Drop for TopicLease {
    fn drop(&mut self) {
        if let Some(client) = self.client.upgrade() {
            client.unsubscribe(&self.key);
        }
    }
}
