//! Subscription Registry
//!
//! Tracks which handles want which [`DataKey`]. Each handle holds at most
//! one key; the reverse index gives O(1) fan-out lookup by key.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::{debug, warn};

use rtd_core::{DataKey, SubscriberHandle};

/// Two-way index between handles and keys
pub struct SubscriptionRegistry {
    /// Next handle to mint
    next_handle: AtomicU64,
    /// Key -> subscribed handles
    subscriptions: DashMap<DataKey, HashSet<SubscriberHandle>>,
    /// Handle -> its single key
    handle_keys: DashMap<SubscriberHandle, DataKey>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            subscriptions: DashMap::new(),
            handle_keys: DashMap::new(),
        }
    }

    /// Mint a new unique handle
    pub fn new_handle(&self) -> SubscriberHandle {
        SubscriberHandle(self.next_handle.fetch_add(1, Ordering::SeqCst))
    }

    /// Register `handle` for `key`, replacing whatever it held before
    pub fn subscribe(&self, handle: SubscriberHandle, key: DataKey) {
        if let Some(previous) = self.handle_keys.insert(handle, key.clone()) {
            if previous != key {
                self.detach(handle, &previous);
            }
        }

        self.subscriptions
            .entry(key.clone())
            .or_default()
            .insert(handle);

        debug!("[Registry] {} subscribed to {}", handle, key);
    }

    /// Remove the handle's subscription
    ///
    /// Unknown handles are logged and otherwise ignored.
    pub fn unsubscribe(&self, handle: SubscriberHandle) -> Option<DataKey> {
        let Some((_, key)) = self.handle_keys.remove(&handle) else {
            warn!("[Registry] Unsubscribe for unknown {}", handle);
            return None;
        };

        self.detach(handle, &key);
        debug!("[Registry] {} unsubscribed from {}", handle, key);
        Some(key)
    }

    fn detach(&self, handle: SubscriberHandle, key: &DataKey) {
        if let Some(mut handles) = self.subscriptions.get_mut(key) {
            handles.remove(&handle);
            if handles.is_empty() {
                drop(handles);
                self.subscriptions.remove_if(key, |_, set| set.is_empty());
            }
        }
    }

    /// Handles subscribed to `key`, empty when none
    pub fn lookup(&self, key: &DataKey) -> Vec<SubscriberHandle> {
        self.subscriptions
            .get(key)
            .map(|handles| handles.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The key a handle is subscribed to
    pub fn subscription_of(&self, handle: SubscriberHandle) -> Option<DataKey> {
        self.handle_keys.get(&handle).map(|k| k.value().clone())
    }

    /// Whether any handle watches any key of this symbol
    pub fn has_symbol_subscribers(&self, symbol: &str) -> bool {
        self.subscriptions
            .iter()
            .any(|entry| entry.key().symbol() == symbol)
    }

    /// Number of subscribers for a key
    pub fn subscriber_count(&self, key: &DataKey) -> usize {
        self.subscriptions
            .get(key)
            .map(|handles| handles.len())
            .unwrap_or(0)
    }

    /// Number of distinct keys with at least one subscriber
    pub fn total_keys(&self) -> usize {
        self.subscriptions.len()
    }

    /// Number of live handles
    pub fn total_handles(&self) -> usize {
        self.handle_keys.len()
    }

    pub fn clear(&self) {
        self.subscriptions.clear();
        self.handle_keys.clear();
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("total_keys", &self.total_keys())
            .field("total_handles", &self.total_handles())
            .finish()
    }
}
