//! Reactive streaming client
//!
//! One persistent WebSocket to the market feed, shared by many consumers:
//! - Reference-counted, rate-limited topic subscriptions
//! - Bounded exponential-backoff reconnection
//! - Typed envelope routing into bounded in-memory caches

pub mod client;
pub mod connection;
pub mod envelope;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod store;
pub mod topic;
pub mod transport;

pub use client::{StreamClient, TopicLease};
pub use connection::{ConnectionState, StateTransition, TransitionReason};
pub use envelope::{Decoded, Envelope, Outbound};
pub use metrics::ClientMetrics;
pub use store::{ConnectionStatus, ReactiveState, RingBuffer};
pub use topic::SubscriptionKey;
pub use transport::{Connector, Link, Outgoing, TransportEvent, WsConnector};
