//! Cache Listeners
//!
//! Fire-and-forget notifications invoked on the caller's path after each
//! operation. Listeners run synchronously, so a slow listener slows every cache
//! call it is attached to.

use std::sync::Arc;

use parking_lot::RwLock;

use super::value::CacheValue;

/// Receives notifications about cache operations
pub trait CacheListener: Send + Sync {
    /// A value was put (or added) under `key`
    fn on_put(&self, _key: &str, _value: &CacheValue) {}

    /// `key` was looked up
    fn on_get(&self, _key: &str) {}

    /// `suffix` was appended to `key`
    fn on_append(&self, _key: &str, _suffix: &str) {}

    /// `key` was removed
    fn on_remove(&self, _key: &str) {}
}

/// Optional listener slot shared by every tier implementation
#[derive(Default)]
pub(crate) struct ListenerSlot {
    inner: RwLock<Option<Arc<dyn CacheListener>>>,
}

impl ListenerSlot {
    pub(crate) fn get(&self) -> Option<Arc<dyn CacheListener>> {
        self.inner.read().clone()
    }

    pub(crate) fn set(&self, listener: Option<Arc<dyn CacheListener>>) {
        *self.inner.write() = listener;
    }

    pub(crate) fn put(&self, key: &str, value: &CacheValue) {
        if let Some(l) = self.get() {
            l.on_put(key, value);
        }
    }

    pub(crate) fn get_key(&self, key: &str) {
        if let Some(l) = self.get() {
            l.on_get(key);
        }
    }

    pub(crate) fn append(&self, key: &str, suffix: &str) {
        if let Some(l) = self.get() {
            l.on_append(key, suffix);
        }
    }

    pub(crate) fn remove(&self, key: &str) {
        if let Some(l) = self.get() {
            l.on_remove(key);
        }
    }

    /// Guard that fires `on_remove` when dropped
    pub(crate) fn remove_on_drop(&self, key: &str) -> RemoveNotice {
        RemoveNotice {
            listener: self.get(),
            key: key.to_string(),
        }
    }
}

/// Runs the remove notification when dropped, so the listener hears about the
/// remove even if a tier errors, panics, or the call is cancelled mid-flight.
pub(crate) struct RemoveNotice {
    listener: Option<Arc<dyn CacheListener>>,
    key: String,
}

impl Drop for RemoveNotice {
    fn drop(&mut self) {
        if let Some(l) = self.listener.take() {
            l.on_remove(&self.key);
        }
    }
}

/// Listener that records every notification (handy in tests and diagnostics)
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: parking_lot::Mutex<Vec<ListenerEvent>>,
}

/// A recorded notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Put(String, CacheValue),
    Get(String),
    Append(String, String),
    Remove(String),
}

impl RecordingListener {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// All events so far
    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock().clone()
    }

    /// Drop recorded events
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Count events matching a predicate
    pub fn count(&self, pred: impl Fn(&ListenerEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}

impl CacheListener for RecordingListener {
    fn on_put(&self, key: &str, value: &CacheValue) {
        self.events
            .lock()
            .push(ListenerEvent::Put(key.to_string(), value.clone()));
    }

    fn on_get(&self, key: &str) {
        self.events.lock().push(ListenerEvent::Get(key.to_string()));
    }

    fn on_append(&self, key: &str, suffix: &str) {
        self.events
            .lock()
            .push(ListenerEvent::Append(key.to_string(), suffix.to_string()));
    }

    fn on_remove(&self, key: &str) {
        self.events.lock().push(ListenerEvent::Remove(key.to_string()));
    }
}
