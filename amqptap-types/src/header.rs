//! Header values carried in a message envelope.

use std::collections::BTreeMap;
use std::fmt;

/// Headers of a tapped message, keyed by header name.
pub type Headers = BTreeMap<String, HeaderValue>;

/// A broker-independent header value.
///
/// AMQP field tables are richer than JSON; this enum keeps the distinctions
/// a human debugging traffic cares about (signedness, bytes vs text) without
/// tying the data model to a specific client library.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
pub enum HeaderValue {
    /// Boolean flag.
    Bool(bool),
    /// Any signed integer width.
    Int(i64),
    /// Any unsigned integer width.
    UInt(u64),
    /// Any floating point width.
    Float(f64),
    /// Fixed point decimal: `value / 10^scale`.
    Decimal {
        /// Number of decimal digits.
        scale: u8,
        /// Unscaled value.
        value: u32,
    },
    /// UTF-8 text.
    String(String),
    /// Raw bytes, including long strings that are not valid UTF-8.
    Bytes(Vec<u8>),
    /// Ordered list of values.
    Array(Vec<HeaderValue>),
    /// Nested table.
    Table(Headers),
    /// AMQP timestamp, seconds since the Unix epoch.
    Timestamp(u64),
    /// Explicit "no value".
    Void,
}

impl HeaderValue {
    /// Text view of the value, if it is a string (or UTF-8 bytes).
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(s) => Some(s),
            HeaderValue::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Integer view of the value, if it fits in an `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(i) => Some(*i),
            HeaderValue::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(s: &str) -> Self {
        HeaderValue::String(s.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(s: String) -> Self {
        HeaderValue::String(s)
    }
}

impl From<bool> for HeaderValue {
    fn from(b: bool) -> Self {
        HeaderValue::Bool(b)
    }
}

impl From<i64> for HeaderValue {
    fn from(i: i64) -> Self {
        HeaderValue::Int(i)
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Bool(b) => write!(f, "{b}"),
            HeaderValue::Int(i) => write!(f, "{i}"),
            HeaderValue::UInt(u) => write!(f, "{u}"),
            HeaderValue::Float(x) => write!(f, "{x}"),
            HeaderValue::Decimal { scale, value } => {
                let value = u64::from(*value);
                match 10u64.checked_pow(u32::from(*scale)) {
                    Some(1) => write!(f, "{value}"),
                    Some(divisor) => write!(
                        f,
                        "{}.{:0width$}",
                        value / divisor,
                        value % divisor,
                        width = usize::from(*scale)
                    ),
                    None => write!(f, "{value}e-{scale}"),
                }
            }
            HeaderValue::String(s) => write!(f, "{s}"),
            HeaderValue::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) => write!(f, "{s}"),
                Err(_) => write!(f, "<{} bytes>", b.len()),
            },
            HeaderValue::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            HeaderValue::Table(table) => {
                f.write_str("{")?;
                for (i, (key, value)) in table.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                f.write_str("}")
            }
            HeaderValue::Timestamp(ts) => write!(f, "@{ts}"),
            HeaderValue::Void => f.write_str("null"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_decimal() {
        let v = HeaderValue::Decimal { scale: 2, value: 1234 };
        assert_eq!(v.to_string(), "12.34");
        let v = HeaderValue::Decimal { scale: 3, value: 5 };
        assert_eq!(v.to_string(), "0.005");
    }

    #[test]
    fn display_nested() {
        let mut table = Headers::new();
        table.insert("retries".into(), HeaderValue::Int(3));
        let v = HeaderValue::Array(vec![HeaderValue::from("a"), HeaderValue::Table(table)]);
        assert_eq!(v.to_string(), "[a, {retries: 3}]");
    }

    #[test]
    fn bytes_as_str_only_when_utf8() {
        assert_eq!(HeaderValue::Bytes(b"ok".to_vec()).as_str(), Some("ok"));
        assert_eq!(HeaderValue::Bytes(vec![0xff, 0xfe]).as_str(), None);
        assert_eq!(HeaderValue::Bytes(vec![0xff]).to_string(), "<1 bytes>");
    }

    #[test]
    fn unsigned_fits_i64() {
        assert_eq!(HeaderValue::UInt(7).as_i64(), Some(7));
        assert_eq!(HeaderValue::UInt(u64::MAX).as_i64(), None);
    }
}
