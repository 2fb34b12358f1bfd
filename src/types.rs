use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Opaque ID types for type safety
pub type OrderId = String;
pub type ClientId = String;

/// Stock exchanges reachable through the broker
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Exchange {
    Stuttgart,
    Frankfurt,
}

impl Exchange {
    pub const ALL: [Exchange; 2] = [Exchange::Stuttgart, Exchange::Frankfurt];

    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Stuttgart => "Stuttgart",
            Exchange::Frankfurt => "Frankfurt",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Buy,
    Sell,
}

/// Status of an order.
///
/// Travels as a single letter (`S`, `E`, `P`); parsing ignores case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderStatusType {
    Success,
    Error,
    /// Default for new orders
    #[default]
    Pending,
}

impl OrderStatusType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatusType::Success => "S",
            OrderStatusType::Error => "E",
            OrderStatusType::Pending => "P",
        }
    }

    /// Success and Error are final; nothing moves an order out of them
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatusType::Pending)
    }
}

impl fmt::Display for OrderStatusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatusType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            s if s.eq_ignore_ascii_case("S") => Ok(OrderStatusType::Success),
            s if s.eq_ignore_ascii_case("E") => Ok(OrderStatusType::Error),
            s if s.eq_ignore_ascii_case("P") => Ok(OrderStatusType::Pending),
            other => Err(format!("unknown order status '{}'", other)),
        }
    }
}

impl Serialize for OrderStatusType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for OrderStatusType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Order as entered by a WebSocket client, before the server stamps it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub exchange: Exchange,
    pub amount: u32,
    /// Limit price per share
    pub price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: OrderId,
    pub client_id: ClientId,
    pub symbol: String,
    pub exchange: Exchange,
    pub amount: u32,
    pub price: f64,
    #[serde(default)]
    pub status: OrderStatusType,
    pub created_at: String, // RFC 3339
}

/// Envelope carried over the broker for both directions: orders out, status back
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderWrapper {
    pub order_type: OrderType,
    pub order: Order,
}
