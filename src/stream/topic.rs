//! Subscription keys.
//!
//! The server names subscriptions `<kind>_<id>` (`item_4151`, `route_flipping`),
//! which is also the `Display` form used in unsubscribe frames.

use std::fmt;
use std::str::FromStr;

use super::envelope::Outbound;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubscriptionKey {
    Item(i64),
    Route(String),
}

impl SubscriptionKey {
    pub fn item(item_id: i64) -> Self {
        Self::Item(item_id)
    }

    pub fn route(route_type: impl Into<String>) -> Self {
        Self::Route(route_type.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Item(_) => "item",
            Self::Route(_) => "route",
        }
    }

    /// Frame asking the server to start pushing this topic
    pub fn subscribe_frame(&self) -> Outbound {
        match self {
            Self::Item(item_id) => Outbound::SubscribeToItem { item_id: *item_id },
            Self::Route(route_type) => Outbound::SubscribeToRoute {
                route_type: route_type.clone(),
            },
        }
    }

    pub fn unsubscribe_frame(&self) -> Outbound {
        Outbound::Unsubscribe {
            subscription: self.to_string(),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Item(id) => write!(f, "item_{}", id),
            Self::Route(name) => write!(f, "route_{}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseKeyError(String);

impl fmt::Display for ParseKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid subscription key '{}' (expected item_<id> or route_<name>)",
            self.0
        )
    }
}

impl std::error::Error for ParseKeyError {}

impl FromStr for SubscriptionKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseKeyError(s.to_string());
        let (kind, id) = s.trim().split_once('_').ok_or_else(err)?;
        if id.is_empty() {
            return Err(err());
        }
        match kind {
            "item" => id.parse::<i64>().map(Self::Item).map_err(|_| err()),
            "route" => Ok(Self::Route(id.to_string())),
            _ => Err(err()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_matches_server_naming() {
        assert_eq!(SubscriptionKey::item(100).to_string(), "item_100");
        assert_eq!(SubscriptionKey::route("high_volume").to_string(), "route_high_volume");
    }

    #[test]
    fn test_parse() {
        assert_eq!("item_100".parse(), Ok(SubscriptionKey::item(100)));
        // Route names may themselves contain underscores
        assert_eq!(
            "route_high_volume".parse(),
            Ok(SubscriptionKey::route("high_volume"))
        );
        assert!("item_abc".parse::<SubscriptionKey>().is_err());
        assert!("route_".parse::<SubscriptionKey>().is_err());
        assert!("wallet_1".parse::<SubscriptionKey>().is_err());
        assert!("item100".parse::<SubscriptionKey>().is_err());
    }

    #[test]
    fn test_unsubscribe_frame_uses_display_form() {
        assert_eq!(
            SubscriptionKey::item(7).unsubscribe_frame(),
            Outbound::Unsubscribe {
                subscription: "item_7".to_string()
            }
        );
    }
}
