//! Feed wire envelope.
//!
//! One JSON object per text frame, discriminated by its `type` field.
//! Inbound frames decode into [`Envelope`]; outbound requests serialize from
//! [`Outbound`]. Tags this client does not know are reported as
//! [`Decoded::Unknown`] so newer servers never break older clients.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Every inbound discriminant [`Envelope`] understands.
pub const INBOUND_TYPES: &[&str] = &[
    "connection_established",
    "subscription_confirmed",
    "unsubscription_confirmed",
    "market_event",
    "recommendation_update",
    "price_update",
    "pattern_detected",
    "volume_surge",
    "current_recommendations",
    "market_alerts",
    "error",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    ConnectionEstablished(ConnectionEstablished),
    SubscriptionConfirmed(SubscriptionAck),
    UnsubscriptionConfirmed(SubscriptionAck),
    MarketEvent(MarketEvent),
    RecommendationUpdate(RecommendationSet),
    PriceUpdate(PriceUpdate),
    PatternDetected(PatternDetected),
    VolumeSurge(VolumeSurge),
    CurrentRecommendations(RecommendationSet),
    MarketAlerts(MarketAlerts),
    Error(FeedError),
}

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished(_) => "connection_established",
            Self::SubscriptionConfirmed(_) => "subscription_confirmed",
            Self::UnsubscriptionConfirmed(_) => "unsubscription_confirmed",
            Self::MarketEvent(_) => "market_event",
            Self::RecommendationUpdate(_) => "recommendation_update",
            Self::PriceUpdate(_) => "price_update",
            Self::PatternDetected(_) => "pattern_detected",
            Self::VolumeSurge(_) => "volume_surge",
            Self::CurrentRecommendations(_) => "current_recommendations",
            Self::MarketAlerts(_) => "market_alerts",
            Self::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEstablished {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Server acknowledgement of a subscribe/unsubscribe request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionAck {
    pub subscription: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketEvent {
    pub event_type: String,
    #[serde(default)]
    pub item_id: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A single flip suggestion produced by the recommendation engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub item_id: i64,
    #[serde(default)]
    pub item_name: Option<String>,
    #[serde(default)]
    pub buy_price: Option<i64>,
    #[serde(default)]
    pub sell_price: Option<i64>,
    #[serde(default)]
    pub expected_profit: Option<i64>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

/// Payload of both `recommendation_update` and `current_recommendations`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationSet {
    pub route_type: String,
    #[serde(default)]
    pub recommendations: Vec<Recommendation>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub item_id: i64,
    #[serde(default)]
    pub high_price: Option<i64>,
    #[serde(default)]
    pub low_price: Option<i64>,
    #[serde(default)]
    pub high_volume: Option<i64>,
    #[serde(default)]
    pub low_volume: Option<i64>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternDetected {
    pub item_id: i64,
    #[serde(default)]
    pub pattern_name: Option<String>,
    pub confidence: f64,
    #[serde(default)]
    pub predicted_target: Option<f64>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeSurge {
    pub item_id: i64,
    pub surge_factor: f64,
    #[serde(default)]
    pub volume: Option<i64>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketAlert {
    #[serde(default)]
    pub item_id: Option<i64>,
    #[serde(default)]
    pub alert_type: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketAlerts {
    #[serde(default)]
    pub alerts: Vec<MarketAlert>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedError {
    pub message: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Epoch values above this are milliseconds, below it seconds (year 5138 in seconds)
const EPOCH_MS_THRESHOLD: i64 = 100_000_000_000;

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Accepts RFC 3339, naive ISO 8601 (read as UTC) and epoch seconds or
/// milliseconds. Any other shape decodes as `None` and the frame still routes.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    Ok(match raw {
        Value::String(text) => parse_timestamp_str(text.trim()),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(from_epoch),
        _ => None,
    })
}

fn parse_timestamp_str(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
        .or_else(|| text.parse::<i64>().ok().and_then(from_epoch))
}

fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value.abs() >= EPOCH_MS_THRESHOLD {
        Utc.timestamp_millis_opt(value).single()
    } else {
        Utc.timestamp_opt(value, 0).single()
    }
}

/// Client → server requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    SubscribeToItem { item_id: i64 },
    SubscribeToRoute { route_type: String },
    Unsubscribe { subscription: String },
    GetCurrentRecommendations { route_type: String },
    GetMarketAlerts,
}

impl Outbound {
    pub fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(CodecError::Encode)
    }
}

/// Result of decoding one inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Envelope(Envelope),
    /// Well-formed frame with a discriminant this client does not handle
    Unknown(String),
}

#[derive(Debug)]
pub enum CodecError {
    /// Frame is not a JSON object
    Json(serde_json::Error),
    MissingType,
    /// Known discriminant, payload does not match its shape
    Payload {
        tag: String,
        source: serde_json::Error,
    },
    Encode(serde_json::Error),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(e) => write!(f, "malformed frame: {}", e),
            Self::MissingType => write!(f, "malformed frame: missing string 'type' field"),
            Self::Payload { tag, source } => write!(f, "malformed {} payload: {}", tag, source),
            Self::Encode(e) => write!(f, "failed to encode request: {}", e),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json(e) | Self::Encode(e) => Some(e),
            Self::Payload { source, .. } => Some(source),
            Self::MissingType => None,
        }
    }
}

pub fn decode(text: &str) -> Result<Decoded, CodecError> {
    let value: Value = serde_json::from_str(text).map_err(CodecError::Json)?;
    let tag = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingType)?
        .to_string();

    if !INBOUND_TYPES.contains(&tag.as_str()) {
        return Ok(Decoded::Unknown(tag));
    }

    serde_json::from_value(value)
        .map(Decoded::Envelope)
        .map_err(|source| CodecError::Payload { tag, source })
}
