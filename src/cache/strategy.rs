//! Caching Strategies and Value Transforms
//!
//! Strategies decide what the local tier may hold; transforms rewrite values on
//! their way out of the orchestrator. Both are injected by the composition root.

use std::collections::HashSet;

use super::value::CacheValue;

/// Decides whether a key/value pair may enter the local tier
pub trait CachingStrategy: Send + Sync {
    fn is_cacheable(&self, key: &str, value: &CacheValue) -> bool;
}

impl<F> CachingStrategy for F
where
    F: Fn(&str, &CacheValue) -> bool + Send + Sync,
{
    fn is_cacheable(&self, key: &str, value: &CacheValue) -> bool {
        self(key, value)
    }
}

/// Caches everything except empty keys and values flagged as not locally cacheable
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCachingStrategy;

impl CachingStrategy for DefaultCachingStrategy {
    fn is_cacheable(&self, key: &str, value: &CacheValue) -> bool {
        !key.is_empty() && value.is_locally_cacheable()
    }
}

/// Registry of type tags that never enter the local tier
#[derive(Debug, Default, Clone)]
pub struct ExcludedTypes {
    excluded: HashSet<String>,
}

impl ExcludedTypes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclude a type tag
    pub fn exclude(mut self, tag: impl Into<String>) -> Self {
        self.excluded.insert(tag.into());
        self
    }

    pub fn is_excluded(&self, tag: &str) -> bool {
        self.excluded.contains(tag)
    }
}

impl CachingStrategy for ExcludedTypes {
    fn is_cacheable(&self, key: &str, value: &CacheValue) -> bool {
        if !DefaultCachingStrategy.is_cacheable(key, value) {
            return false;
        }
        match value.type_tag() {
            Some(tag) => !self.is_excluded(tag),
            None => true,
        }
    }
}

/// Post-get hook applied to values returned by the orchestrator
pub trait ValueTransform: Send + Sync {
    fn transform(&self, value: CacheValue) -> CacheValue;
}

impl<F> ValueTransform for F
where
    F: Fn(CacheValue) -> CacheValue + Send + Sync,
{
    fn transform(&self, value: CacheValue) -> CacheValue {
        self(value)
    }
}

/// Returns values unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTransform;

impl ValueTransform for IdentityTransform {
    fn transform(&self, value: CacheValue) -> CacheValue {
        value
    }
}

/// Marks returned values as proxies.
///
/// The orchestrator refuses to write marked values back, so a caller cannot
/// round-trip a value it read without building a fresh one.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProxyTransform;

impl ValueTransform for ProxyTransform {
    fn transform(&self, value: CacheValue) -> CacheValue {
        value.into_proxy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_strategy() {
        let s = DefaultCachingStrategy;
        assert!(s.is_cacheable("k", &CacheValue::text("v")));
        assert!(!s.is_cacheable("", &CacheValue::text("v")));
        assert!(!s.is_cacheable("k", &CacheValue::text("v").not_locally_cacheable()));
    }

    #[test]
    fn test_excluded_types() {
        let s = ExcludedTypes::new().exclude("Session");
        assert!(!s.is_cacheable("k", &CacheValue::text("v").with_type_tag("Session")));
        assert!(s.is_cacheable("k", &CacheValue::text("v").with_type_tag("Profile")));
        assert!(s.is_cacheable("k", &CacheValue::text("v")));
    }

    #[test]
    fn test_closure_strategy() {
        let s = |key: &str, _v: &CacheValue| !key.starts_with("tmp:");
        assert!(s.is_cacheable("user:1", &CacheValue::text("v")));
        assert!(!s.is_cacheable("tmp:1", &CacheValue::text("v")));
    }

    #[test]
    fn test_transforms() {
        let v = CacheValue::text("v");
        assert!(!IdentityTransform.transform(v.clone()).is_proxy());
        assert!(ProxyTransform.transform(v).is_proxy());
    }
}
