//! Connection state machine.
//!
//! Owns the single physical link to the feed and every decision about it:
//! - Idempotent connect guarded by an in-flight flag
//! - Bounded exponential backoff after abnormal closure
//! - Terminal `Failed` state once the attempt budget is spent
//! - Generation counter so callbacks from a torn-down link are ignored
//!
//! The manager does no I/O. The client drives it from transport callbacks
//! and it publishes every transition to the state store and a broadcast
//! channel, in order, while holding its lock.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::metrics::ClientMetrics;
use super::store::{LastError, StateStore};
use super::transport::Outgoing;
use crate::config::StreamConfig;

/// WebSocket close code for an intentional shutdown
pub const NORMAL_CLOSURE: u16 = 1000;
/// Reported when a link ends without a close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;

const TRANSITION_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Reconnecting => write!(f, "RECONNECTING"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Reason for state transition (for logging)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    ConnectRequested,
    Opened,
    ConnectFailed,
    AbnormalClose,
    NormalClose,
    RetryTimerFired,
    AttemptsExhausted,
    CloseRequested,
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectRequested => write!(f, "connect_requested"),
            Self::Opened => write!(f, "opened"),
            Self::ConnectFailed => write!(f, "connect_failed"),
            Self::AbnormalClose => write!(f, "abnormal_close"),
            Self::NormalClose => write!(f, "normal_close"),
            Self::RetryTimerFired => write!(f, "retry_timer"),
            Self::AttemptsExhausted => write!(f, "attempts_exhausted"),
            Self::CloseRequested => write!(f, "close_requested"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub reason: TransitionReason,
    /// Reconnect attempt counter after the transition
    pub attempt: u32,
}

/// `min(base * 2^(attempt-1), max)` with attempt starting at 1
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }
}

/// What the client must do after a link went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterClose {
    /// Normal closure, stay disconnected
    Idle,
    Retry { attempt: u32, delay: Duration },
    Exhausted,
}

struct Inner {
    state: ConnectionState,
    attempts: u32,
    in_flight: bool,
    generation: u64,
    link: Option<mpsc::UnboundedSender<Outgoing>>,
    retry_timer: Option<JoinHandle<()>>,
    session: Option<JoinHandle<()>>,
}

pub struct ConnectionManager {
    inner: Mutex<Inner>,
    backoff: Backoff,
    max_attempts: u32,
    store: Arc<StateStore>,
    metrics: Arc<ClientMetrics>,
    transitions: broadcast::Sender<StateTransition>,
}

impl ConnectionManager {
    pub fn new(config: &StreamConfig, store: Arc<StateStore>, metrics: Arc<ClientMetrics>) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                attempts: 0,
                in_flight: false,
                generation: 0,
                link: None,
                retry_timer: None,
                session: None,
            }),
            backoff: Backoff::new(config.base_delay(), config.max_delay()),
            max_attempts: config.max_attempts,
            store,
            metrics,
            transitions,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn attempts(&self) -> u32 {
        self.inner.lock().attempts
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.inner.lock().generation == generation
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    /// Caller-initiated connect. Returns the generation of the new attempt,
    /// or `None` when an attempt is in flight or the link is already open.
    pub fn begin_connect(&self) -> Option<u64> {
        let mut inner = self.inner.lock();
        if inner.in_flight || inner.state == ConnectionState::Connected {
            debug!(state = %inner.state, "connect ignored, link busy");
            return None;
        }
        if let Some(timer) = inner.retry_timer.take() {
            timer.abort();
        }
        if matches!(
            inner.state,
            ConnectionState::Disconnected | ConnectionState::Failed
        ) {
            inner.attempts = 0;
        }
        Some(self.start_attempt(&mut inner, TransitionReason::ConnectRequested))
    }

    /// Retry timer fired. Only proceeds if nothing replaced the scheduled retry.
    pub fn begin_retry(&self, generation: u64) -> Option<u64> {
        let mut inner = self.inner.lock();
        if inner.generation != generation
            || inner.state != ConnectionState::Reconnecting
            || inner.in_flight
            || inner.link.is_some()
        {
            return None;
        }
        inner.retry_timer = None;
        Some(self.start_attempt(&mut inner, TransitionReason::RetryTimerFired))
    }

    fn start_attempt(&self, inner: &mut Inner, reason: TransitionReason) -> u64 {
        inner.in_flight = true;
        inner.generation += 1;
        self.metrics.record_connect_attempt();
        self.transition(inner, ConnectionState::Connecting, reason, LastError::Keep);
        inner.generation
    }

    /// Link established. Returns false if the attempt was superseded, in
    /// which case the caller must close the link it holds.
    pub fn on_open(&self, generation: u64, link: mpsc::UnboundedSender<Outgoing>) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation || !inner.in_flight {
            return false;
        }
        inner.in_flight = false;
        inner.attempts = 0;
        inner.link = Some(link);
        self.metrics.record_connect_success();
        self.transition(
            &mut inner,
            ConnectionState::Connected,
            TransitionReason::Opened,
            LastError::Clear,
        );
        true
    }

    /// Link closed or could not be opened. `None` means the callback is stale.
    pub fn on_closed(&self, generation: u64, code: u16, reason: &str) -> Option<AfterClose> {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return None;
        }
        let was_open = inner.link.take().is_some();
        inner.in_flight = false;
        inner.session = None;

        if code == NORMAL_CLOSURE && was_open {
            self.transition(
                &mut inner,
                ConnectionState::Disconnected,
                TransitionReason::NormalClose,
                LastError::Keep,
            );
            return Some(AfterClose::Idle);
        }

        let cause = if was_open {
            TransitionReason::AbnormalClose
        } else {
            TransitionReason::ConnectFailed
        };
        let message = if reason.is_empty() {
            format!("connection closed (code {})", code)
        } else {
            format!("connection closed (code {}): {}", code, reason)
        };

        if inner.attempts < self.max_attempts {
            inner.attempts += 1;
            let attempt = inner.attempts;
            let delay = self.backoff.delay_for(attempt);
            self.metrics.record_reconnect_scheduled();
            self.transition(
                &mut inner,
                ConnectionState::Reconnecting,
                cause,
                LastError::Set(message),
            );
            info!(
                attempt,
                max = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "reconnect scheduled"
            );
            return Some(AfterClose::Retry { attempt, delay });
        }

        warn!(attempts = inner.attempts, "reconnect attempts exhausted, giving up");
        self.transition(
            &mut inner,
            ConnectionState::Failed,
            TransitionReason::AttemptsExhausted,
            LastError::Set(format!(
                "connection failed after {} reconnect attempts; call connect() to retry",
                self.max_attempts
            )),
        );
        Some(AfterClose::Exhausted)
    }

    /// Keep the retry timer so `close()` can cancel it.
    pub fn attach_retry_timer(&self, generation: u64, timer: JoinHandle<()>) {
        let mut inner = self.inner.lock();
        if inner.generation == generation && inner.state == ConnectionState::Reconnecting {
            inner.retry_timer = Some(timer);
        } else {
            timer.abort();
        }
    }

    pub fn attach_session(&self, generation: u64, session: JoinHandle<()>) {
        let mut inner = self.inner.lock();
        if inner.generation == generation {
            inner.session = Some(session);
        } else {
            session.abort();
        }
    }

    /// Explicit normal close. Cancels any pending retry and ignores every
    /// callback from the current link from here on.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.in_flight = false;
        if let Some(timer) = inner.retry_timer.take() {
            timer.abort();
        }
        if let Some(link) = inner.link.take() {
            let _ = link.send(Outgoing::Close {
                code: NORMAL_CLOSURE,
                reason: "client closing".to_string(),
            });
        }
        if let Some(session) = inner.session.take() {
            session.abort();
        }
        if inner.state != ConnectionState::Disconnected {
            self.transition(
                &mut inner,
                ConnectionState::Disconnected,
                TransitionReason::CloseRequested,
                LastError::Clear,
            );
        }
    }

    /// Synchronous send. Fails immediately unless connected; nothing is queued.
    pub fn send(&self, frame: String) -> bool {
        let inner = self.inner.lock();
        if inner.state != ConnectionState::Connected {
            return false;
        }
        let Some(link) = inner.link.as_ref() else {
            return false;
        };
        if link.send(Outgoing::Text(frame)).is_err() {
            return false;
        }
        self.metrics.record_frame_sent();
        true
    }

    fn transition(
        &self,
        inner: &mut Inner,
        to: ConnectionState,
        reason: TransitionReason,
        error: LastError,
    ) {
        let from = inner.state;
        inner.state = to;
        self.store.publish_connection(to, inner.attempts, error);

        info!(
            from = %from,
            to = %to,
            reason = %reason,
            attempt = inner.attempts,
            "connection_transition"
        );

        // No receivers is fine
        let _ = self.transitions.send(StateTransition {
            from,
            to,
            reason,
            attempt: inner.attempts,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferCapacity;

    fn manager(max_attempts: u32) -> ConnectionManager {
        let config = StreamConfig {
            max_attempts,
            ..StreamConfig::default()
        };
        let store = Arc::new(StateStore::new(BufferCapacity::default()));
        ConnectionManager::new(&config, store, Arc::new(ClientMetrics::new()))
    }

    #[test]
    fn test_backoff_schedule() {
        let backoff = Backoff::new(Duration::from_millis(3000), Duration::from_secs(30));
        let delays: Vec<u64> = (1..=6).map(|a| backoff.delay_for(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![3000, 6000, 12000, 24000, 30000, 30000]);
        // Absurd attempt numbers saturate instead of overflowing
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_connect_is_guarded_while_in_flight() {
        let mgr = manager(5);
        let generation = mgr.begin_connect().unwrap();
        assert_eq!(mgr.state(), ConnectionState::Connecting);
        assert_eq!(mgr.begin_connect(), None);

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(mgr.on_open(generation, tx));
        assert_eq!(mgr.state(), ConnectionState::Connected);
        assert_eq!(mgr.begin_connect(), None);
    }

    #[test]
    fn test_send_requires_connected() {
        let mgr = manager(5);
        assert!(!mgr.send("{}".to_string()));

        let generation = mgr.begin_connect().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        mgr.on_open(generation, tx);
        assert!(mgr.send("{\"type\":\"get_market_alerts\"}".to_string()));
        assert!(matches!(rx.try_recv(), Ok(Outgoing::Text(_))));
    }

    #[test]
    fn test_normal_close_goes_idle() {
        let mgr = manager(5);
        let generation = mgr.begin_connect().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        mgr.on_open(generation, tx);

        assert_eq!(mgr.on_closed(generation, NORMAL_CLOSURE, ""), Some(AfterClose::Idle));
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_abnormal_close_counts_attempts_until_failed() {
        let mgr = manager(2);
        let mut generation = mgr.begin_connect().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        mgr.on_open(generation, tx);

        assert_eq!(
            mgr.on_closed(generation, ABNORMAL_CLOSURE, "reset"),
            Some(AfterClose::Retry { attempt: 1, delay: Duration::from_secs(3) })
        );
        generation = mgr.begin_retry(generation).unwrap();
        assert_eq!(
            mgr.on_closed(generation, ABNORMAL_CLOSURE, ""),
            Some(AfterClose::Retry { attempt: 2, delay: Duration::from_secs(6) })
        );
        generation = mgr.begin_retry(generation).unwrap();
        assert_eq!(mgr.on_closed(generation, ABNORMAL_CLOSURE, ""), Some(AfterClose::Exhausted));
        assert_eq!(mgr.state(), ConnectionState::Failed);
        assert_eq!(mgr.begin_retry(generation), None);

        // Manual connect resets the budget
        assert!(mgr.begin_connect().is_some());
        assert_eq!(mgr.attempts(), 0);
    }

    #[test]
    fn test_close_invalidates_pending_callbacks() {
        let mgr = manager(5);
        let generation = mgr.begin_connect().unwrap();
        mgr.close();
        assert_eq!(mgr.state(), ConnectionState::Disconnected);

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(!mgr.on_open(generation, tx));
        assert_eq!(mgr.on_closed(generation, ABNORMAL_CLOSURE, ""), None);
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_transitions_are_broadcast_in_order() {
        let mgr = manager(5);
        let mut rx = mgr.subscribe_transitions();
        let generation = mgr.begin_connect().unwrap();
        let (tx, _link) = mpsc::unbounded_channel();
        mgr.on_open(generation, tx);
        mgr.close();

        let seen: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).map(|t| t.to).collect();
        assert_eq!(
            seen,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected
            ]
        );
    }
}
