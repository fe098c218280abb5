//! Market feed streaming client
//!
//! Shared connection, subscription and cache layer behind the trading
//! dashboard's live views.

pub mod config;
pub mod stream;

pub use config::{BufferCapacity, ResubscribePolicy, StreamConfig};
pub use stream::{
    ConnectionState, ReactiveState, StreamClient, SubscriptionKey, TopicLease, WsConnector,
};
