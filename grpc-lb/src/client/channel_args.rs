use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

/// Per-address argument carrying the load-balance token handed out by the
/// balancer. Opaque to the load balancing core.
pub const LB_TOKEN_ARG: &str = "grpc.lb_token";

/// A single channel argument value.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl From<bool> for ArgValue {
    fn from(v: bool) -> Self {
        ArgValue::Bool(v)
    }
}

impl From<i64> for ArgValue {
    fn from(v: i64) -> Self {
        ArgValue::Int(v)
    }
}

impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        ArgValue::Str(v.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(v: String) -> Self {
        ArgValue::Str(v)
    }
}

impl Display for ArgValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Bool(v) => write!(f, "{v}"),
            ArgValue::Int(v) => write!(f, "{v}"),
            ArgValue::Str(v) => write!(f, "{v:?}"),
        }
    }
}

/// An immutable set of named arguments attached to a channel or an address.
///
/// Equality and ordering are structural, which lets `ChannelArgs` take part
/// in subchannel keys. Mutating operations return a new value and leave the
/// original untouched; clones share storage.
#[derive(Clone, Default, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelArgs {
    map: Arc<BTreeMap<String, ArgValue>>,
}

impl ChannelArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new `ChannelArgs` with `key` set to `value`, replacing any
    /// existing value.
    pub fn set(&self, key: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        let mut map = (*self.map).clone();
        map.insert(key.into(), value.into());
        ChannelArgs { map: Arc::new(map) }
    }

    /// Returns a new `ChannelArgs` without `key`.
    pub fn remove(&self, key: &str) -> Self {
        if !self.map.contains_key(key) {
            return self.clone();
        }
        let mut map = (*self.map).clone();
        map.remove(key);
        ChannelArgs { map: Arc::new(map) }
    }

    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.map.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.map.get(key) {
            Some(ArgValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.map.get(key) {
            Some(ArgValue::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.map.get(key) {
            Some(ArgValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Returns a new `ChannelArgs` containing all arguments from both. Values
    /// from `other` take precedence.
    pub fn union(&self, other: &ChannelArgs) -> Self {
        if other.is_empty() {
            return self.clone();
        }
        let mut map = (*self.map).clone();
        for (k, v) in other.map.iter() {
            map.insert(k.clone(), v.clone());
        }
        ChannelArgs { map: Arc::new(map) }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArgValue)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl Display for ChannelArgs {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.map.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{k}={v}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let args = ChannelArgs::new()
            .set("grpc.primary_user_agent", "test-agent")
            .set("grpc.max_reconnect_ms", 5000i64)
            .set("grpc.enable_retries", true);
        assert_eq!(args.get_str("grpc.primary_user_agent"), Some("test-agent"));
        assert_eq!(args.get_int("grpc.max_reconnect_ms"), Some(5000));
        assert_eq!(args.get_bool("grpc.enable_retries"), Some(true));
        assert_eq!(args.get_int("grpc.primary_user_agent"), None);
        assert_eq!(args.get("missing"), None);
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn test_set_does_not_modify_original() {
        let args = ChannelArgs::new().set("a", 1i64);
        let updated = args.set("a", 2i64);
        assert_eq!(args.get_int("a"), Some(1));
        assert_eq!(updated.get_int("a"), Some(2));
    }

    #[test]
    fn test_remove() {
        let args = ChannelArgs::new().set("a", 1i64).set("b", 2i64);
        let removed = args.remove("a");
        assert_eq!(removed.get("a"), None);
        assert_eq!(removed.get_int("b"), Some(2));
        assert_eq!(args.get_int("a"), Some(1));
        assert_eq!(args.remove("missing"), args);
    }

    #[test]
    fn test_union_prefers_other() {
        let a = ChannelArgs::new().set("x", 1i64).set("y", "keep");
        let b = ChannelArgs::new().set("x", 2i64).set("z", false);
        let merged = a.union(&b);
        assert_eq!(merged.get_int("x"), Some(2));
        assert_eq!(merged.get_str("y"), Some("keep"));
        assert_eq!(merged.get_bool("z"), Some(false));
    }

    #[test]
    fn test_structural_equality_and_ordering() {
        let a = ChannelArgs::new().set("x", 1i64).set("y", 2i64);
        let b = ChannelArgs::new().set("y", 2i64).set("x", 1i64);
        assert_eq!(a, b);
        let c = a.set("x", 3i64);
        assert_ne!(a, c);
        assert!(a < c);
        assert_eq!(ChannelArgs::new(), ChannelArgs::default());
    }

    #[test]
    fn test_display() {
        let args = ChannelArgs::new().set(LB_TOKEN_ARG, "token").set("a", 1i64);
        assert_eq!(args.to_string(), "{a=1, grpc.lb_token=\"token\"}");
    }
}
