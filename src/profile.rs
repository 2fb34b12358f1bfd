//! Client roles and the destinations each one produces to or consumes from

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::broker::Destination;
use crate::config::env_trimmed;
use crate::types::{ClientId, Exchange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Client1,
    Client2,
}

impl Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Client1 => "client1",
            Profile::Client2 => "client2",
        }
    }

    /// HTTP port used unless overridden, so both roles fit on one host
    pub fn default_port(&self) -> u16 {
        match self {
            Profile::Client1 => 8081,
            Profile::Client2 => 8082,
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "client1" => Ok(Profile::Client1),
            "client2" => Ok(Profile::Client2),
            other => Err(format!(
                "unknown profile '{}', expected client1 or client2",
                other
            )),
        }
    }
}

/// Destination names on the broker
#[derive(Debug, Clone, PartialEq)]
pub struct DestinationConfig {
    /// Topic carrying stock price updates for everyone
    pub stock_updates: String,
    /// Order queues are `{orders_prefix}.{Exchange}`
    pub orders_prefix: String,
    /// Status queues are `{status_prefix}.{Exchange}.{client_id}`
    pub status_prefix: String,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            stock_updates: "stocks.updates.all".to_string(),
            orders_prefix: "stocks.orders".to_string(),
            status_prefix: "stocks.orderStatus".to_string(),
        }
    }
}

impl DestinationConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let read = |name: &str, fallback: String| env_trimmed(name).unwrap_or(fallback);

        Self {
            stock_updates: read("JMS_STOCK_UPDATES", defaults.stock_updates),
            orders_prefix: read("JMS_ORDERS_PREFIX", defaults.orders_prefix),
            status_prefix: read("JMS_STATUS_PREFIX", defaults.status_prefix),
        }
    }
}

/// What a profile sends where and listens to
#[derive(Debug, Clone, PartialEq)]
pub struct RoleBindings {
    pub profile: Profile,
    pub client_id: ClientId,
    pub stock_updates: Destination,
    orders_prefix: String,
    status_prefix: String,
}

impl RoleBindings {
    pub fn for_profile(profile: Profile, destinations: &DestinationConfig) -> Self {
        Self {
            profile,
            client_id: profile.as_str().to_string(),
            stock_updates: Destination::topic(destinations.stock_updates.clone()),
            orders_prefix: destinations.orders_prefix.clone(),
            status_prefix: destinations.status_prefix.clone(),
        }
    }

    /// Queue the exchange reads orders from
    pub fn order_destination(&self, exchange: Exchange) -> Destination {
        Destination::queue(format!("{}.{}", self.orders_prefix, exchange))
    }

    /// Queue the exchange answers this client on
    pub fn status_destination(&self, exchange: Exchange) -> Destination {
        Destination::queue(format!(
            "{}.{}.{}",
            self.status_prefix, exchange, self.client_id
        ))
    }

    pub fn consumed(&self) -> Vec<Destination> {
        let mut destinations = vec![self.stock_updates.clone()];
        destinations.extend(Exchange::ALL.iter().map(|e| self.status_destination(*e)));
        destinations
    }

    pub fn produced(&self) -> Vec<Destination> {
        Exchange::ALL
            .iter()
            .map(|e| self.order_destination(*e))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::DestinationKind;

    #[test]
    fn test_profile_parse() {
        assert_eq!("client1".parse::<Profile>(), Ok(Profile::Client1));
        assert_eq!(" Client2 ".parse::<Profile>(), Ok(Profile::Client2));
        assert!("client3".parse::<Profile>().is_err());
        assert!("".parse::<Profile>().is_err());
    }

    #[test]
    fn test_default_ports_differ() {
        assert_ne!(
            Profile::Client1.default_port(),
            Profile::Client2.default_port()
        );
    }

    #[test]
    fn test_client2_bindings() {
        let bindings = RoleBindings::for_profile(Profile::Client2, &DestinationConfig::default());

        assert_eq!(bindings.client_id, "client2");
        assert_eq!(
            bindings.status_destination(Exchange::Stuttgart),
            Destination::queue("stocks.orderStatus.Stuttgart.client2")
        );
        assert_eq!(
            bindings.order_destination(Exchange::Stuttgart),
            Destination::queue("stocks.orders.Stuttgart")
        );
        assert_eq!(bindings.stock_updates.kind, DestinationKind::Topic);
    }

    #[test]
    fn test_roles_never_share_status_queues() {
        let config = DestinationConfig::default();
        let one = RoleBindings::for_profile(Profile::Client1, &config);
        let two = RoleBindings::for_profile(Profile::Client2, &config);

        for exchange in Exchange::ALL {
            assert_ne!(
                one.status_destination(exchange),
                two.status_destination(exchange)
            );
            assert_eq!(
                one.order_destination(exchange),
                two.order_destination(exchange)
            );
        }
        assert_eq!(one.stock_updates, two.stock_updates);
    }

    #[test]
    fn test_consumed_and_produced() {
        let bindings = RoleBindings::for_profile(Profile::Client1, &DestinationConfig::default());
        assert_eq!(bindings.consumed().len(), 3);
        assert_eq!(bindings.produced().len(), 2);
        assert!(bindings
            .produced()
            .iter()
            .all(|d| d.kind == DestinationKind::Queue));
    }
}
