//! Envelope dispatch.
//!
//! One bounded mutation of [`ReactiveState`] per envelope kind. Runs only on
//! the session task, so envelopes apply strictly in arrival order.

use chrono::Utc;
use tracing::{debug, warn};

use super::envelope::Envelope;
use super::store::ReactiveState;

pub fn route(state: &mut ReactiveState, envelope: Envelope) {
    state.last_message_at = Some(Utc::now());

    match envelope {
        Envelope::MarketEvent(event) => state.recent_events.push(event),
        Envelope::RecommendationUpdate(set) | Envelope::CurrentRecommendations(set) => {
            state
                .recommendations_by_route
                .insert(set.route_type, set.recommendations);
        }
        Envelope::PriceUpdate(update) => {
            state.latest_price_by_item.insert(update.item_id, update);
        }
        Envelope::PatternDetected(pattern) => state.recent_patterns.push(pattern),
        Envelope::VolumeSurge(surge) => state.recent_surges.push(surge),
        Envelope::MarketAlerts(alerts) => state.active_alerts = alerts.alerts,
        Envelope::Error(err) => {
            warn!(message = %err.message, "feed reported error");
            state.connection.last_error = Some(err.message);
        }
        Envelope::ConnectionEstablished(hello) => {
            debug!(client_id = ?hello.client_id, "feed session established");
        }
        Envelope::SubscriptionConfirmed(ack) => {
            debug!(subscription = %ack.subscription, "subscription confirmed");
        }
        Envelope::UnsubscriptionConfirmed(ack) => {
            debug!(subscription = %ack.subscription, "unsubscription confirmed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferCapacity;
    use crate::stream::connection::ConnectionState;
    use crate::stream::envelope::{
        FeedError, MarketAlert, MarketAlerts, MarketEvent, PatternDetected, PriceUpdate,
        Recommendation, RecommendationSet, SubscriptionAck, VolumeSurge,
    };

    fn state() -> ReactiveState {
        ReactiveState::new(BufferCapacity::default())
    }

    fn price(item_id: i64, high: i64, low: i64) -> Envelope {
        Envelope::PriceUpdate(PriceUpdate {
            item_id,
            high_price: Some(high),
            low_price: Some(low),
            high_volume: None,
            low_volume: None,
            timestamp: None,
        })
    }

    fn recommendations(route: &str, ids: &[i64]) -> RecommendationSet {
        RecommendationSet {
            route_type: route.to_string(),
            recommendations: ids
                .iter()
                .map(|&item_id| Recommendation {
                    item_id,
                    item_name: None,
                    buy_price: None,
                    sell_price: None,
                    expected_profit: None,
                    confidence: Some(0.7),
                    reasoning: Some("spread widening".to_string()),
                })
                .collect(),
            timestamp: None,
        }
    }

    #[test]
    fn test_price_update_overwrites() {
        let mut s = state();
        route(&mut s, price(100, 500, 480));
        route(&mut s, price(100, 510, 490));

        assert_eq!(s.latest_price_by_item.len(), 1);
        let latest = &s.latest_price_by_item[&100];
        assert_eq!(latest.high_price, Some(510));
        assert_eq!(latest.low_price, Some(490));
    }

    #[test]
    fn test_recommendations_replaced_wholesale() {
        let mut s = state();
        route(&mut s, Envelope::RecommendationUpdate(recommendations("flipping", &[1, 2, 3])));
        route(&mut s, Envelope::CurrentRecommendations(recommendations("flipping", &[9])));
        route(&mut s, Envelope::RecommendationUpdate(recommendations("high_volume", &[4])));

        let flipping: Vec<_> = s.recommendations_by_route["flipping"]
            .iter()
            .map(|r| r.item_id)
            .collect();
        assert_eq!(flipping, vec![9]);
        assert_eq!(s.recommendations_by_route["high_volume"].len(), 1);
    }

    #[test]
    fn test_ring_buffers_bounded_newest_first() {
        let mut s = state();
        for i in 0..250 {
            route(
                &mut s,
                Envelope::MarketEvent(MarketEvent {
                    event_type: "trade".to_string(),
                    item_id: Some(i),
                    message: None,
                    data: serde_json::Value::Null,
                    timestamp: None,
                }),
            );
            route(
                &mut s,
                Envelope::PatternDetected(PatternDetected {
                    item_id: i,
                    pattern_name: None,
                    confidence: 0.5,
                    predicted_target: None,
                    reasoning: None,
                    timestamp: None,
                }),
            );
            route(
                &mut s,
                Envelope::VolumeSurge(VolumeSurge {
                    item_id: i,
                    surge_factor: 2.0,
                    volume: None,
                    timestamp: None,
                }),
            );
        }

        assert_eq!(s.recent_events.len(), 100);
        assert_eq!(s.recent_patterns.len(), 50);
        assert_eq!(s.recent_surges.len(), 50);

        let event_ids: Vec<_> = s.recent_events.iter().filter_map(|e| e.item_id).collect();
        let expected: Vec<_> = (150..250).rev().collect();
        assert_eq!(event_ids, expected);
        assert_eq!(s.recent_surges.newest().map(|e| e.item_id), Some(249));
        assert_eq!(s.recent_patterns.iter().last().map(|p| p.item_id), Some(200));
    }

    #[test]
    fn test_alerts_replaced_wholesale() {
        let mut s = state();
        let alert = |message: &str| MarketAlert {
            item_id: None,
            alert_type: None,
            severity: None,
            message: message.to_string(),
        };
        route(
            &mut s,
            Envelope::MarketAlerts(MarketAlerts {
                alerts: vec![alert("a"), alert("b")],
                timestamp: None,
            }),
        );
        route(
            &mut s,
            Envelope::MarketAlerts(MarketAlerts {
                alerts: vec![alert("c")],
                timestamp: None,
            }),
        );
        assert_eq!(s.active_alerts, vec![alert("c")]);
    }

    #[test]
    fn test_error_sets_last_error_only() {
        let mut s = state();
        s.connection.state = ConnectionState::Connected;
        s.connection.is_connected = true;
        route(
            &mut s,
            Envelope::Error(FeedError {
                message: "unknown item".to_string(),
                timestamp: None,
            }),
        );
        assert_eq!(s.connection.last_error.as_deref(), Some("unknown item"));
        assert_eq!(s.connection.state, ConnectionState::Connected);
        assert!(s.connection.is_connected);
    }

    #[test]
    fn test_acks_do_not_touch_caches() {
        let mut s = state();
        route(
            &mut s,
            Envelope::SubscriptionConfirmed(SubscriptionAck {
                subscription: "item_1".to_string(),
                timestamp: None,
            }),
        );
        assert!(s.latest_price_by_item.is_empty());
        assert!(s.recent_events.is_empty());
        assert!(s.last_message_at.is_some());
    }
}
