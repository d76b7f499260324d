//! Cache Values
//!
//! Opaque payloads stored in every tier, plus the small amount of metadata the
//! tiers need to route them: a type tag for caching strategies, a flag that keeps
//! a value out of the local tier, and the marker left by value transforms.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Raw payload of a cache value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// UTF-8 text (the only payload `append` operates on)
    Text(String),
    /// Opaque serialized bytes
    Bytes(Bytes),
    /// Integer (counters)
    Integer(i64),
}

/// A value stored in the cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheValue {
    payload: Payload,
    /// Type identifier resolved by caching strategies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    type_tag: Option<String>,
    /// False for values that must never enter the local tier
    #[serde(default = "default_true")]
    local_cacheable: bool,
    /// Set by value transforms on values handed back to callers
    #[serde(skip)]
    proxied: bool,
}

fn default_true() -> bool {
    true
}

impl CacheValue {
    /// Create a value from a payload
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            type_tag: None,
            local_cacheable: true,
            proxied: false,
        }
    }

    /// Text value
    pub fn text(s: impl Into<String>) -> Self {
        Self::new(Payload::Text(s.into()))
    }

    /// Binary value
    pub fn bytes(b: impl Into<Bytes>) -> Self {
        Self::new(Payload::Bytes(b.into()))
    }

    /// Integer value
    pub fn integer(i: i64) -> Self {
        Self::new(Payload::Integer(i))
    }

    /// Attach a type tag
    pub fn with_type_tag(mut self, tag: impl Into<String>) -> Self {
        self.type_tag = Some(tag.into());
        self
    }

    /// Keep this value out of the local tier
    pub fn not_locally_cacheable(mut self) -> Self {
        self.local_cacheable = false;
        self
    }

    /// Mark the value as handed out through a transform
    pub fn into_proxy(mut self) -> Self {
        self.proxied = true;
        self
    }

    /// Get the payload
    #[inline]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Get the type tag
    #[inline]
    pub fn type_tag(&self) -> Option<&str> {
        self.type_tag.as_deref()
    }

    /// Whether the local tier may hold this value
    #[inline]
    pub fn is_locally_cacheable(&self) -> bool {
        self.local_cacheable
    }

    /// Whether the value came out of a transform
    #[inline]
    pub fn is_proxy(&self) -> bool {
        self.proxied
    }

    /// Text content, if this is a text value
    pub fn as_text(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Integer content, if this is an integer value
    pub fn as_integer(&self) -> Option<i64> {
        match &self.payload {
            Payload::Integer(i) => Some(*i),
            Payload::Text(s) => s.trim().parse().ok(),
            Payload::Bytes(_) => None,
        }
    }

    /// `self + "," + suffix` for non-blank text values; `None` for anything else.
    /// Metadata is kept.
    pub fn appended(&self, suffix: &str) -> Option<CacheValue> {
        match self.as_text() {
            Some(text) if !text.trim().is_empty() => Some(Self {
                payload: Payload::Text(format!("{},{}", text, suffix)),
                ..self.clone()
            }),
            _ => None,
        }
    }

    /// Approximate payload size in bytes
    pub fn size(&self) -> usize {
        match &self.payload {
            Payload::Text(s) => s.len(),
            Payload::Bytes(b) => b.len(),
            Payload::Integer(_) => std::mem::size_of::<i64>(),
        }
    }
}

impl std::fmt::Display for CacheValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.payload {
            Payload::Text(s) => write!(f, "{}", s),
            Payload::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Payload::Integer(i) => write!(f, "{}", i),
        }
    }
}

impl From<&str> for CacheValue {
    fn from(s: &str) -> Self {
        Self::text(s)
    }
}

impl From<String> for CacheValue {
    fn from(s: String) -> Self {
        Self::text(s)
    }
}

impl From<i64> for CacheValue {
    fn from(i: i64) -> Self {
        Self::integer(i)
    }
}

impl From<Bytes> for CacheValue {
    fn from(b: Bytes) -> Self {
        Self::bytes(b)
    }
}

impl From<Vec<u8>> for CacheValue {
    fn from(v: Vec<u8>) -> Self {
        Self::bytes(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_value() {
        let v = CacheValue::from("hello");
        assert_eq!(v.as_text(), Some("hello"));
        assert_eq!(v.size(), 5);
        assert!(v.is_locally_cacheable());
        assert!(!v.is_proxy());
    }

    #[test]
    fn test_integer_from_text() {
        assert_eq!(CacheValue::text(" 42 ").as_integer(), Some(42));
        assert_eq!(CacheValue::integer(-3).as_integer(), Some(-3));
        assert_eq!(CacheValue::bytes(vec![1u8, 2]).as_integer(), None);
    }

    #[test]
    fn test_flags() {
        let v = CacheValue::text("x")
            .with_type_tag("Session")
            .not_locally_cacheable();
        assert_eq!(v.type_tag(), Some("Session"));
        assert!(!v.is_locally_cacheable());
        assert!(v.clone().into_proxy().is_proxy());
    }

    #[test]
    fn test_appended() {
        let v = CacheValue::text("a").with_type_tag("Index");
        let appended = v.appended("b").unwrap();
        assert_eq!(appended.as_text(), Some("a,b"));
        assert_eq!(appended.type_tag(), Some("Index"));

        assert!(CacheValue::text("  ").appended("b").is_none());
        assert!(CacheValue::integer(1).appended("b").is_none());
    }

    #[test]
    fn test_proxy_marker_not_serialized() {
        let v = CacheValue::text("x").into_proxy();
        let json = serde_json::to_string(&v).unwrap();
        let back: CacheValue = serde_json::from_str(&json).unwrap();
        assert!(!back.is_proxy());
        assert_eq!(back.as_text(), Some("x"));
    }

    #[test]
    fn test_display() {
        assert_eq!(CacheValue::text("abc").to_string(), "abc");
        assert_eq!(CacheValue::bytes(vec![0u8; 4]).to_string(), "<4 bytes>");
        assert_eq!(CacheValue::integer(7).to_string(), "7");
    }
}
