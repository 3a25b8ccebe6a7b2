//! Exchange bindings - what a tap queue is bound to.

use std::fmt;
use std::str::FromStr;

use crate::ConfigError;

/// Binding key used when a binding is given without one.
///
/// `#` matches every routing key on a topic exchange; fanout and headers
/// exchanges ignore the key altogether.
pub const DEFAULT_BINDING_KEY: &str = "#";

/// A single bind directive: route messages from `exchange` whose routing key
/// matches `binding_key` into the tap queue.
///
/// The binding key is passed to the broker verbatim. Wildcards (`*`, `#`)
/// are evaluated by the broker, never locally.
///
/// # Example
///
/// ```rust
/// use amqptap_types::ExchangeBinding;
///
/// let binding = ExchangeBinding::new("orders", "order.created");
/// assert_eq!(binding.to_string(), "orders:order.created");
///
/// // A bare exchange name taps everything
/// let all: ExchangeBinding = "amq.topic".parse().unwrap();
/// assert_eq!(all.binding_key(), "#");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExchangeBinding {
    exchange: String,
    #[cfg_attr(feature = "serde", serde(default = "default_binding_key"))]
    binding_key: String,
}

#[cfg(feature = "serde")]
fn default_binding_key() -> String {
    DEFAULT_BINDING_KEY.to_string()
}

impl ExchangeBinding {
    /// Create a binding for an exchange and binding key.
    pub fn new(exchange: impl Into<String>, binding_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            binding_key: binding_key.into(),
        }
    }

    /// Bind to every message of an exchange (`#`).
    pub fn all(exchange: impl Into<String>) -> Self {
        Self::new(exchange, DEFAULT_BINDING_KEY)
    }

    /// The exchange name.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// The binding key (broker topic syntax).
    pub fn binding_key(&self) -> &str {
        &self.binding_key
    }
}

impl fmt::Display for ExchangeBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.binding_key)
    }
}

impl FromStr for ExchangeBinding {
    type Err = ConfigError;

    /// Parse `exchange[:binding_key]`, splitting at the first `:`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (exchange, key) = match s.split_once(':') {
            Some((exchange, key)) => (exchange, key),
            None => (s, DEFAULT_BINDING_KEY),
        };

        if exchange.is_empty() {
            return Err(ConfigError::EmptyExchange(s.to_string()));
        }

        Ok(Self::new(exchange, key))
    }
}

/// Parse a comma separated list of `exchange[:binding_key]` items.
///
/// Empty items (e.g. from a trailing comma) are skipped.
pub fn parse_bindings(s: &str) -> Result<Vec<ExchangeBinding>, ConfigError> {
    s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::parse)
        .collect()
}
