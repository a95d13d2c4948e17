use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::{Hash32, Value};

/// The parameter set of a task instance.
///
/// Keys are kept sorted, so two sets built from the same pairs in a different
/// order serialize to the same bytes and get the same [`fingerprint`].
///
/// Values are compared by their CBOR encoding: `1` and `1.0` are different
/// parameters, and they display differently too (`x=1`, `x=1.0`). Text that
/// would read as another value is quoted (`x="1"`), so distinct scalar
/// parameter sets never share a label.
///
/// [`fingerprint`]: Params::fingerprint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, Value>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter, replacing any previous value under the same key.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Reads a numeric parameter as `f64`, accepting integers too.
    pub fn float(&self, key: &str) -> Option<f64> {
        match self.0.get(key)? {
            Value::Float(value) => Some(*value),
            Value::Integer(value) => Some(i128::from(*value) as f64),
            _ => None,
        }
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            Value::Integer(value) => i64::try_from(*value).ok(),
            _ => None,
        }
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.0.get(key)?.as_text()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Canonical fingerprint of this parameter set.
    pub fn fingerprint(&self) -> Hash32 {
        let mut hasher = blake3::Hasher::new();
        // writing into a hasher cannot fail, and `Value` always serializes
        ciborium::into_writer(&self.0, &mut hasher).expect("parameters are always serializable");
        hasher.finalize().into()
    }

    /// True when every pair of `filter` is present in `self` with an equal value.
    pub fn matches(&self, filter: &Params) -> bool {
        filter
            .0
            .iter()
            .all(|(key, value)| self.0.get(key) == Some(value))
    }
}

impl<K, V> FromIterator<(K, V)> for Params
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Params(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{key}=")?;
            write_value(f, value)?;
        }
        Ok(())
    }
}

pub(crate) fn write_value(f: &mut impl fmt::Write, value: &Value) -> fmt::Result {
    match value {
        Value::Integer(int) => write!(f, "{}", i128::from(*int)),
        Value::Float(float) => write!(f, "{float:?}"),
        Value::Text(text) if is_ambiguous(text) => write!(f, "{text:?}"),
        Value::Text(text) => f.write_str(text),
        Value::Bool(flag) => write!(f, "{flag}"),
        Value::Null => f.write_str("null"),
        Value::Array(items) => {
            f.write_char('[')?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_char(';')?;
                }
                write_value(f, item)?;
            }
            f.write_char(']')
        }
        other => write!(f, "{other:?}"),
    }
}

/// Text that would be mistaken for a number, a literal, or label syntax.
fn is_ambiguous(text: &str) -> bool {
    text.is_empty()
        || text.parse::<f64>().is_ok()
        || matches!(text, "true" | "false" | "null")
        || text.contains([',', '=', ';', '[', ']', '"'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_independent_fingerprint() {
        let a = Params::new().with("power", 2).with("seed", 7);
        let b = Params::new().with("seed", 7).with("power", 2);

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.to_string(), "power=2,seed=7");
    }

    #[test]
    fn test_int_and_float_differ() {
        let a = Params::new().with("x", 1);
        let b = Params::new().with("x", 1.0);

        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_labels_keep_value_kinds_apart() {
        let labels: Vec<String> = [
            Params::new().with("x", 1),
            Params::new().with("x", 1.0),
            Params::new().with("x", "1"),
            Params::new().with("x", true),
            Params::new().with("x", "true"),
        ]
        .iter()
        .map(ToString::to_string)
        .collect();

        assert_eq!(labels, ["x=1", "x=1.0", "x=\"1\"", "x=true", "x=\"true\""]);
        assert_eq!(Params::new().with("mode", "fast").to_string(), "mode=fast");
        assert_eq!(Params::new().with("t", 0.5).to_string(), "t=0.5");
    }

    #[test]
    fn test_empty_fingerprint_is_stable() {
        assert_eq!(Params::new().fingerprint(), Params::default().fingerprint());
        assert_eq!(Params::new().to_string(), "");
    }

    #[test]
    fn test_matches_subset() {
        let params = Params::new().with("power", 1).with("mode", "fast");

        assert!(params.matches(&Params::new()));
        assert!(params.matches(&Params::new().with("mode", "fast")));
        assert!(!params.matches(&Params::new().with("mode", "slow")));
        assert!(!params.matches(&Params::new().with("other", 1)));
    }

    #[test]
    fn test_numeric_accessors() {
        let params = Params::new().with("n", 3).with("t", 0.5).with("name", "a");

        assert_eq!(params.int("n"), Some(3));
        assert_eq!(params.float("n"), Some(3.0));
        assert_eq!(params.float("t"), Some(0.5));
        assert_eq!(params.int("t"), None);
        assert_eq!(params.text("name"), Some("a"));
    }
}
