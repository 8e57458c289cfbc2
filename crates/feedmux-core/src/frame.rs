//! Subscription keys and the wire frames exchanged with the streaming service.
//!
//! Outbound control frames:
//! ```text
//! {"method":"subscribe","subscription":{"type":"l2Book","coin":"BTC"}}
//! ```
//! Inbound data frames:
//! ```text
//! {"channel":"l2Book","data":{"coin":"BTC","levels":[...]}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named category of streaming data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    OrderBook,
    Trades,
    UserEvents,
    AllMids,
}

impl Channel {
    /// The channel tag used on the wire.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::OrderBook => "l2Book",
            Self::Trades => "trades",
            Self::UserEvents => "userEvents",
            Self::AllMids => "allMids",
        }
    }

    /// Parse a wire channel tag. Returns `None` for protocol or unknown channels.
    pub fn from_wire(tag: &str) -> Option<Self> {
        match tag {
            "l2Book" => Some(Self::OrderBook),
            "trades" => Some(Self::Trades),
            "userEvents" => Some(Self::UserEvents),
            "allMids" => Some(Self::AllMids),
            _ => None,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Identity of one logical stream: a channel plus its scoping parameter.
///
/// Serializes to the `subscription` object of a control frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SubscriptionKey {
    /// Order-book updates for one market.
    #[serde(rename = "l2Book")]
    OrderBook { coin: String },
    /// Trade prints for one market.
    #[serde(rename = "trades")]
    Trades { coin: String },
    /// Account updates for one address.
    #[serde(rename = "userEvents")]
    UserEvents { user: String },
    /// Global mid-price feed; there is exactly one.
    #[serde(rename = "allMids")]
    AllMids,
}

impl SubscriptionKey {
    pub fn order_book(coin: impl Into<String>) -> Self {
        Self::OrderBook { coin: coin.into() }
    }

    pub fn trades(coin: impl Into<String>) -> Self {
        Self::Trades { coin: coin.into() }
    }

    /// Addresses are compared case-insensitively, so they are stored lower-cased.
    pub fn user_events(user: impl AsRef<str>) -> Self {
        Self::UserEvents {
            user: user.as_ref().to_ascii_lowercase(),
        }
    }

    pub fn channel(&self) -> Channel {
        match self {
            Self::OrderBook { .. } => Channel::OrderBook,
            Self::Trades { .. } => Channel::Trades,
            Self::UserEvents { .. } => Channel::UserEvents,
            Self::AllMids => Channel::AllMids,
        }
    }

    /// The scoping parameter, if the channel has one.
    pub fn param(&self) -> Option<&str> {
        match self {
            Self::OrderBook { coin } | Self::Trades { coin } => Some(coin),
            Self::UserEvents { user } => Some(user),
            Self::AllMids => None,
        }
    }

    /// Build a key from a channel and its parameter. `AllMids` ignores the parameter.
    pub fn from_parts(channel: Channel, param: Option<&str>) -> Option<Self> {
        match (channel, param) {
            (Channel::OrderBook, Some(p)) => Some(Self::order_book(p)),
            (Channel::Trades, Some(p)) => Some(Self::trades(p)),
            (Channel::UserEvents, Some(p)) => Some(Self::user_events(p)),
            (Channel::AllMids, _) => Some(Self::AllMids),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.param() {
            Some(p) => write!(f, "{}:{}", self.channel(), p),
            None => write!(f, "{}", self.channel()),
        }
    }
}

/// Control action carried by an outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMethod {
    Subscribe,
    Unsubscribe,
}

/// An outbound subscribe/unsubscribe frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFrame {
    pub method: ControlMethod,
    pub subscription: SubscriptionKey,
}

impl ControlFrame {
    pub fn subscribe(key: SubscriptionKey) -> Self {
        Self {
            method: ControlMethod::Subscribe,
            subscription: key,
        }
    }

    pub fn unsubscribe(key: SubscriptionKey) -> Self {
        Self {
            method: ControlMethod::Unsubscribe,
            subscription: key,
        }
    }
}

/// Keep-alive frame text.
pub const PING_FRAME: &str = r#"{"method":"ping"}"#;

/// A decoded inbound data frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundFrame {
    pub channel: String,
    #[serde(default)]
    pub data: Value,
}

impl InboundFrame {
    /// Derive the subscription key owning this frame from its channel tag
    /// and the scoping value embedded in the payload.
    ///
    /// Returns `None` for protocol acknowledgements, unknown channels and
    /// payloads missing their scoping value.
    pub fn key(&self) -> Option<SubscriptionKey> {
        let channel = Channel::from_wire(&self.channel)?;
        let param = match channel {
            Channel::OrderBook => self.data.get("coin").and_then(Value::as_str),
            Channel::Trades => self
                .data
                .as_array()
                .and_then(|trades| trades.first())
                .and_then(|t| t.get("coin"))
                .and_then(Value::as_str),
            Channel::UserEvents => self.data.get("user").and_then(Value::as_str),
            Channel::AllMids => None,
        };
        SubscriptionKey::from_parts(channel, param)
    }

    /// `true` for frames the server sends about the protocol itself rather than data.
    pub fn is_protocol_ack(&self) -> bool {
        matches!(self.channel.as_str(), "subscriptionResponse" | "pong" | "error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn control_frame_wire_shape() {
        let frame = ControlFrame::subscribe(SubscriptionKey::order_book("BTC"));
        let v = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            v,
            json!({"method": "subscribe", "subscription": {"type": "l2Book", "coin": "BTC"}})
        );

        let frame = ControlFrame::unsubscribe(SubscriptionKey::AllMids);
        let v = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            v,
            json!({"method": "unsubscribe", "subscription": {"type": "allMids"}})
        );
    }

    #[test]
    fn user_address_is_lowercased() {
        let a = SubscriptionKey::user_events("0xABCdef");
        let b = SubscriptionKey::user_events("0xabcDEF");
        assert_eq!(a, b);
        assert_eq!(a.param(), Some("0xabcdef"));
    }

    #[test]
    fn inbound_key_order_book() {
        let f: InboundFrame =
            serde_json::from_value(json!({"channel": "l2Book", "data": {"coin": "ETH", "levels": []}}))
                .unwrap();
        assert_eq!(f.key(), Some(SubscriptionKey::order_book("ETH")));
    }

    #[test]
    fn inbound_key_trades_uses_first_print() {
        let f: InboundFrame = serde_json::from_value(json!({
            "channel": "trades",
            "data": [{"coin": "SOL", "px": "150.1"}, {"coin": "SOL", "px": "150.2"}]
        }))
        .unwrap();
        assert_eq!(f.key(), Some(SubscriptionKey::trades("SOL")));

        let empty: InboundFrame =
            serde_json::from_value(json!({"channel": "trades", "data": []})).unwrap();
        assert_eq!(empty.key(), None);
    }

    #[test]
    fn inbound_key_user_and_mids() {
        let f: InboundFrame = serde_json::from_value(
            json!({"channel": "userEvents", "data": {"user": "0xAbC", "fills": []}}),
        )
        .unwrap();
        assert_eq!(f.key(), Some(SubscriptionKey::user_events("0xabc")));

        let mids: InboundFrame =
            serde_json::from_value(json!({"channel": "allMids", "data": {"mids": {}}})).unwrap();
        assert_eq!(mids.key(), Some(SubscriptionKey::AllMids));
    }

    #[test]
    fn unknown_channel_has_no_key() {
        let f: InboundFrame =
            serde_json::from_value(json!({"channel": "candle", "data": {}})).unwrap();
        assert_eq!(f.key(), None);
        assert!(!f.is_protocol_ack());

        let ack: InboundFrame =
            serde_json::from_value(json!({"channel": "subscriptionResponse", "data": {}})).unwrap();
        assert!(ack.is_protocol_ack());
    }

    #[test]
    fn key_display() {
        assert_eq!(SubscriptionKey::trades("BTC").to_string(), "trades:BTC");
        assert_eq!(SubscriptionKey::AllMids.to_string(), "allMids");
    }
}
