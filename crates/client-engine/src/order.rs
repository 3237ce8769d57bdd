//! Work-unit descriptor handed out by the task server and checkpointed to
//! disk by the [`crate::store`] module.
//!
//! Grounded on `autogtp/Order.cpp`: the line-oriented save/load format is
//! carried over exactly (see [`Order::serialize`] / [`Order::deserialize`]),
//! including the special-cased `options` / `optionsSecond` keys whose values
//! may contain spaces.

use std::collections::BTreeMap;
use std::fmt;

/// Discriminant for the kind of work an [`Order`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OrderKind {
    /// Self-play: one network plays itself to generate training data.
    Production,
    /// Head-to-head match between two networks.
    Validation,
    /// Idle wait, no game played.
    Wait,
    /// A `Production` order resumed from a `storefile*.bin` checkpoint.
    RestoreSelfPlayed,
    /// A `Validation` order resumed from a `storefile*.bin` checkpoint.
    RestoreMatch,
    /// Sentinel: no order could be obtained.
    Error,
}

impl OrderKind {
    /// Numeric tag used by the on-disk format, matching the source enum's
    /// ordinal values exactly so existing `storefile*.bin` checkpoints
    /// (and any reader expecting that order) stay meaningful.
    pub fn as_tag(self) -> i32 {
        match self {
            OrderKind::Production => 0,
            OrderKind::Validation => 1,
            OrderKind::Wait => 2,
            OrderKind::RestoreSelfPlayed => 3,
            OrderKind::RestoreMatch => 4,
            OrderKind::Error => 5,
        }
    }

    /// Inverse of [`OrderKind::as_tag`].
    pub fn from_tag(tag: i32) -> Option<Self> {
        Some(match tag {
            0 => OrderKind::Production,
            1 => OrderKind::Validation,
            2 => OrderKind::Wait,
            3 => OrderKind::RestoreSelfPlayed,
            4 => OrderKind::RestoreMatch,
            5 => OrderKind::Error,
            _ => return None,
        })
    }
}

/// A server-issued work unit: a [`OrderKind`] plus a string→string parameter
/// map. Which keys are meaningful depends on the kind (SPEC_FULL.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Order {
    kind: OrderKind,
    params: BTreeMap<String, String>,
}

impl Default for OrderKind {
    fn default() -> Self {
        OrderKind::Error
    }
}

/// Parameter keys whose values may themselves contain whitespace and must be
/// read/written as "the rest of the line" rather than a single token.
const LONG_VALUE_KEYS: &[&str] = &["options", "optionsSecond"];

impl Order {
    /// The sentinel "no order" value: `Error` kind, no parameters.
    pub fn error() -> Self {
        Self {
            kind: OrderKind::Error,
            params: BTreeMap::new(),
        }
    }

    /// Builds an order of the given kind with the given parameters.
    pub fn new(kind: OrderKind, params: BTreeMap<String, String>) -> Self {
        Self { kind, params }
    }

    /// The order's kind.
    pub fn kind(&self) -> OrderKind {
        self.kind
    }

    /// Overwrites the order's kind in place (used when a Worker rewrites a
    /// completed order into its `Restore*` checkpoint form).
    pub fn set_kind(&mut self, kind: OrderKind) {
        self.kind = kind;
    }

    /// Reads a parameter by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Sets (or overwrites) a parameter.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params.insert(key.into(), value.into());
    }

    /// `true` unless this is the `Error` sentinel (kind `Error`, no
    /// parameters and no `rndSeed`).
    pub fn is_valid(&self) -> bool {
        !(self.kind == OrderKind::Error && self.get("rndSeed").is_none() && self.params.is_empty())
    }

    /// Serialises this order in the source's line-oriented text format:
    /// `kind\n`, `param_count\n`, then one `key value` line per parameter
    /// (long-value keys consume the rest of their line).
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.kind.as_tag().to_string());
        out.push('\n');
        out.push_str(&self.params.len().to_string());
        out.push('\n');
        for (key, value) in &self.params {
            out.push_str(key);
            out.push(' ');
            out.push_str(value);
            out.push('\n');
        }
        out
    }

    /// Inverse of [`Order::serialize`].
    pub fn deserialize(text: &str) -> Result<Self, OrderParseError> {
        let mut lines = text.lines();
        let tag: i32 = lines
            .next()
            .ok_or(OrderParseError::Truncated)?
            .trim()
            .parse()
            .map_err(|_| OrderParseError::BadKind)?;
        let kind = OrderKind::from_tag(tag).ok_or(OrderParseError::BadKind)?;
        let count: usize = lines
            .next()
            .ok_or(OrderParseError::Truncated)?
            .trim()
            .parse()
            .map_err(|_| OrderParseError::BadCount)?;

        let mut params = BTreeMap::new();
        for _ in 0..count {
            let line = lines.next().ok_or(OrderParseError::Truncated)?;
            let (key, value) = line
                .split_once(' ')
                .ok_or(OrderParseError::MalformedParam)?;
            if LONG_VALUE_KEYS.contains(&key) {
                params.insert(key.to_string(), value.to_string());
            } else {
                let value = value.split_whitespace().next().unwrap_or("");
                params.insert(key.to_string(), value.to_string());
            }
        }
        Ok(Self { kind, params })
    }
}

/// Errors from [`Order::deserialize`] — a corrupt or truncated
/// `storefile*.bin`.
#[derive(Debug, thiserror::Error)]
pub enum OrderParseError {
    /// File ended before the declared parameter count was satisfied.
    #[error("truncated order file")]
    Truncated,
    /// The kind line was not a recognised integer tag.
    #[error("unrecognised order kind")]
    BadKind,
    /// The parameter-count line was not a valid integer.
    #[error("bad parameter count")]
    BadCount,
    /// A parameter line had no `key value` separator.
    #[error("malformed parameter line")]
    MalformedParam,
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderKind::Production => "production",
            OrderKind::Validation => "validation",
            OrderKind::Wait => "wait",
            OrderKind::RestoreSelfPlayed => "restore-selfplayed",
            OrderKind::RestoreMatch => "restore-match",
            OrderKind::Error => "error",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_kind() {
        for kind in [
            OrderKind::Production,
            OrderKind::Validation,
            OrderKind::Wait,
            OrderKind::RestoreSelfPlayed,
            OrderKind::RestoreMatch,
            OrderKind::Error,
        ] {
            let mut order = Order::new(kind, BTreeMap::new());
            order.add("leelazVer", "0.17");
            order.add("rndSeed", "42");
            let text = order.serialize();
            let back = Order::deserialize(&text).unwrap();
            assert_eq!(order, back);
        }
    }

    #[test]
    fn round_trips_values_with_spaces() {
        let mut order = Order::new(OrderKind::Validation, BTreeMap::new());
        order.add("options", "-g -q -w networks/AA.gz");
        order.add("optionsSecond", "-g -q -w networks/BB.gz");
        let text = order.serialize();
        let back = Order::deserialize(&text).unwrap();
        assert_eq!(back.get("options"), Some("-g -q -w networks/AA.gz"));
        assert_eq!(
            back.get("optionsSecond"),
            Some("-g -q -w networks/BB.gz")
        );
    }

    #[test]
    fn error_sentinel_is_invalid() {
        assert!(!Order::error().is_valid());
        let mut order = Order::new(OrderKind::Error, BTreeMap::new());
        order.add("rndSeed", "1");
        assert!(order.is_valid());
    }
}
