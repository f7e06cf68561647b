//! CEX.IO wire-format types for the WebSocket push protocol.
//!
//! Every frame is a JSON object with a type tag `e`, an optional `auth`
//! record and an optional `data` payload whose shape depends on the tag.
//! The payload is kept as raw JSON on the [`Envelope`] and parsed into
//! [`Payload`] only for the market-data tags, so order-management replies
//! (which may carry arrays) still pass through intact.

use serde::{Deserialize, Deserializer, Serialize};

use cx_core::types::{Pair, PairError, Ticker};

// ── Type tags ──────────────────────────────────────────────────────────

pub const TAG_AUTH: &str = "auth";
pub const TAG_PING: &str = "ping";
pub const TAG_PONG: &str = "pong";
pub const TAG_CONNECTED: &str = "connected";
pub const TAG_DISCONNECTING: &str = "disconnecting";
pub const TAG_BOOK_SUBSCRIBE: &str = "order-book-subscribe";
pub const TAG_BOOK_UNSUBSCRIBE: &str = "order-book-unsubscribe";
pub const TAG_MD_UPDATE: &str = "md_update";
pub const TAG_TICKER: &str = "ticker";

/// Tags answered by the trading API rather than the market-data feed.
pub const ORDER_TAGS: &[&str] = &[
    "place-order",
    "cancel-order",
    "cancel-replace-order",
    "get-order",
    "open-orders",
    "archived-orders",
    "order",
    "tx",
    "get-balance",
    "balance",
    "obalance",
];

/// Top-level frame in either direction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Type tag.
    pub e: String,
    /// Signed handshake fields, only on `auth` requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthFields>,
    /// Tag-dependent payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Client-chosen request id echoed by the exchange.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oid: Option<String>,
    /// Status of a reply: `"ok"` or `"error"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<String>,
    /// Server time in epoch milliseconds (pings carry it).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
    /// Reason attached to `disconnecting` notices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Envelope {
    /// Envelope with only a tag set.
    pub fn tagged(tag: &str) -> Self {
        Self {
            e: tag.to_string(),
            ..Self::default()
        }
    }

    /// `true` for tags routed to the order-management consumer.
    pub fn is_order_management(&self) -> bool {
        ORDER_TAGS.contains(&self.e.as_str())
    }
}

/// `auth` record of the handshake request.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthFields {
    pub key: String,
    pub signature: String,
    /// Unix seconds the signature was computed over.
    pub timestamp: i64,
}

impl std::fmt::Debug for AuthFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthFields")
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

/// Instrument as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PairField {
    /// `"BTC:USD"`, used by book snapshots and deltas.
    Canonical(String),
    /// `["BTC", "USD"]`, used by tickers and requests.
    Symbols([String; 2]),
}

impl PairField {
    /// Normalize to the canonical key.
    pub fn to_pair(&self) -> Result<Pair, PairError> {
        match self {
            PairField::Canonical(s) => Pair::parse(s),
            PairField::Symbols([base, quote]) => Pair::new(base, quote),
        }
    }
}

impl From<&Pair> for PairField {
    fn from(pair: &Pair) -> Self {
        PairField::Symbols(pair.symbols())
    }
}

/// Market-data payload. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Payload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pair: Option<PairField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
    /// `[price, qty]` pairs. Snapshot levels or bid deltas.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub bids: Vec<(f32, f32)>,
    /// `[price, qty]` pairs. Snapshot levels or ask deltas.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub asks: Vec<(f32, f32)>,
    #[serde(deserialize_with = "decimal", skip_serializing_if = "Option::is_none")]
    pub low: Option<f32>,
    #[serde(deserialize_with = "decimal", skip_serializing_if = "Option::is_none")]
    pub high: Option<f32>,
    #[serde(deserialize_with = "decimal", skip_serializing_if = "Option::is_none")]
    pub last: Option<f32>,
    #[serde(deserialize_with = "decimal", skip_serializing_if = "Option::is_none")]
    pub volume: Option<f32>,
    #[serde(
        rename = "volume30d",
        deserialize_with = "decimal",
        skip_serializing_if = "Option::is_none"
    )]
    pub volume_30d: Option<f32>,
    #[serde(deserialize_with = "decimal", skip_serializing_if = "Option::is_none")]
    pub bid: Option<f32>,
    #[serde(deserialize_with = "decimal", skip_serializing_if = "Option::is_none")]
    pub ask: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Exchange event time, epoch milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
}

impl Payload {
    /// Ticker scalars carried by this payload. Missing fields read as 0.
    pub fn ticker(&self) -> Ticker {
        Ticker {
            low: self.low.unwrap_or_default(),
            high: self.high.unwrap_or_default(),
            last: self.last.unwrap_or_default(),
            volume: self.volume.unwrap_or_default(),
            bid: self.bid.unwrap_or_default(),
            ask: self.ask.unwrap_or_default(),
        }
    }
}

/// Decimal that may arrive as a JSON string (`"1234.5"`) or a number.
fn decimal<'de, D>(deserializer: D) -> Result<Option<f32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(f64),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(n)) => Ok(Some(n as f32)),
        Some(Raw::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(Raw::Text(s)) => s
            .trim()
            .parse::<f32>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid decimal {s:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_snapshot_payload() {
        let json = r#"{
            "timestamp": 1690000000,
            "bids": [[29310.5, 0.25], [29310.25, 1.0]],
            "asks": [[29311.0, 0.5]],
            "pair": "BTC:USD",
            "id": 67809
        }"#;
        let p: Payload = serde_json::from_str(json).unwrap();
        assert_eq!(p.id, Some(67809));
        assert_eq!(p.pair.unwrap().to_pair().unwrap().as_str(), "BTC:USD");
        assert_eq!(p.bids, vec![(29310.5, 0.25), (29310.25, 1.0)]);
        assert_eq!(p.asks.len(), 1);
    }

    #[test]
    fn test_parse_ticker_payload_strings() {
        let json = r#"{
            "low": "28900.1", "high": "29500", "last": "29311.2",
            "volume": "153.2", "volume30d": "4100.7",
            "bid": 29310.5, "ask": 29311.0,
            "pair": ["BTC", "USD"]
        }"#;
        let p: Payload = serde_json::from_str(json).unwrap();
        let t = p.ticker();
        assert_eq!(t.low, 28900.1);
        assert_eq!(t.high, 29500.0);
        assert_eq!(t.bid, 29310.5);
        assert_eq!(p.volume_30d, Some(4100.7));
        assert_eq!(
            p.pair.unwrap(),
            PairField::Symbols(["BTC".to_string(), "USD".to_string()])
        );
    }

    #[test]
    fn test_invalid_decimal_is_error() {
        assert!(serde_json::from_str::<Payload>(r#"{"low": "abc"}"#).is_err());
    }

    #[test]
    fn test_empty_decimal_is_none() {
        let p: Payload = serde_json::from_str(r#"{"last": ""}"#).unwrap();
        assert_eq!(p.last, None);
    }

    #[test]
    fn test_envelope_keeps_unknown_payload_shape() {
        let json = r#"{"e":"open-orders","data":[{"id":"1"}],"oid":"7","ok":"ok"}"#;
        let env: Envelope = serde_json::from_str(json).unwrap();
        assert!(env.is_order_management());
        assert!(env.data.unwrap().is_array());
    }

    #[test]
    fn test_envelope_skips_absent_fields() {
        let out = serde_json::to_string(&Envelope::tagged("pong")).unwrap();
        assert_eq!(out, r#"{"e":"pong"}"#);
    }

    #[test]
    fn test_auth_fields_debug_hides_signature() {
        let a = AuthFields {
            key: "k".into(),
            signature: "deadbeef".into(),
            timestamp: 1,
        };
        assert!(!format!("{a:?}").contains("deadbeef"));
    }
}
