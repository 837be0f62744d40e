use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

/// Instance-owned, unbounded cache that coalesces concurrent misses.
///
/// Concurrent callers asking for the same key share one initialization. A
/// failed initialization leaves the slot empty and the next caller retries.
#[derive(Debug)]
pub struct CoalescingCache<K, V> {
    slots: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> Default for CoalescingCache<K, V> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> CoalescingCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &K) -> Arc<OnceCell<V>> {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    /// The value for `key`, running `init` if nobody has produced it yet.
    pub async fn get_or_try_init<E, F, Fut>(&self, key: &K, init: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let slot = self.slot(key);
        let value = slot.get_or_try_init(init).await?;
        Ok(value.clone())
    }

    /// The cached value for `key`, if initialized.
    pub fn get(&self, key: &K) -> Option<V> {
        let slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots.get(key).and_then(|slot| slot.get().cloned())
    }

    /// Store `value` under `key`, replacing any earlier value.
    pub fn insert(&self, key: K, value: V) {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots.insert(key, Arc::new(OnceCell::new_with(Some(value))));
    }
}
