//! Streaming client configuration.
//!
//! Defaults match the production feed; every tunable can be overridden from
//! the environment so the monitor binary and embedding services share one
//! source of truth.

use std::time::Duration;

use tracing::warn;

/// Default feed endpoint used when `FEED_WS_URL` is not set.
pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8000/ws/market";

/// What happens to active subscriptions after the connection is re-established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResubscribePolicy {
    /// Nothing is replayed. Consumers re-issue their subscribe calls when they
    /// observe the client becoming connected again.
    #[default]
    Manual,
    /// Every detached subscription is re-sent once the connection opens.
    Replay,
}

impl ResubscribePolicy {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "manual" => Some(Self::Manual),
            "replay" | "auto" => Some(Self::Replay),
            _ => None,
        }
    }
}

/// Per-kind ring buffer sizes for the reactive store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCapacity {
    pub events: usize,
    pub patterns: usize,
    pub surges: usize,
}

impl Default for BufferCapacity {
    fn default() -> Self {
        Self {
            events: 100,
            patterns: 50,
            surges: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// WebSocket endpoint of the market feed
    pub endpoint: String,

    // Backoff: base * 2^(attempt-1), capped
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,

    /// Minimum spacing between identical subscribe frames
    pub rate_limit_ms: u64,

    pub buffers: BufferCapacity,
    pub resubscribe: ResubscribePolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            base_delay_ms: 3_000,
            max_delay_ms: 30_000,
            max_attempts: 5,
            rate_limit_ms: 1_000,
            buffers: BufferCapacity::default(),
            resubscribe: ResubscribePolicy::Manual,
        }
    }
}

impl StreamConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Load from environment with defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("FEED_WS_URL") {
            if !v.trim().is_empty() {
                config.endpoint = v.trim().to_string();
            }
        }
        if let Ok(v) = std::env::var("FEED_BACKOFF_BASE_MS") {
            config.base_delay_ms = v.parse().unwrap_or(config.base_delay_ms);
        }
        if let Ok(v) = std::env::var("FEED_BACKOFF_MAX_MS") {
            config.max_delay_ms = v.parse().unwrap_or(config.max_delay_ms);
        }
        if let Ok(v) = std::env::var("FEED_MAX_RECONNECT_ATTEMPTS") {
            config.max_attempts = v.parse().unwrap_or(config.max_attempts);
        }
        if let Ok(v) = std::env::var("FEED_SUBSCRIBE_RATE_LIMIT_MS") {
            config.rate_limit_ms = v.parse().unwrap_or(config.rate_limit_ms);
        }
        if let Ok(v) = std::env::var("FEED_EVENT_BUFFER") {
            config.buffers.events = v.parse().unwrap_or(config.buffers.events);
        }
        if let Ok(v) = std::env::var("FEED_PATTERN_BUFFER") {
            config.buffers.patterns = v.parse().unwrap_or(config.buffers.patterns);
        }
        if let Ok(v) = std::env::var("FEED_SURGE_BUFFER") {
            config.buffers.surges = v.parse().unwrap_or(config.buffers.surges);
        }
        if let Ok(v) = std::env::var("FEED_RESUBSCRIBE") {
            match ResubscribePolicy::parse(&v) {
                Some(policy) => config.resubscribe = policy,
                None => warn!(value = %v, "unrecognised FEED_RESUBSCRIBE, keeping manual"),
            }
        }

        config
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn rate_limit(&self) -> Duration {
        Duration::from_millis(self.rate_limit_ms)
    }
}
