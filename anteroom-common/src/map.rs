//  Copyright 2024 Anteroom Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use std::{collections::HashMap, sync::Arc};

use crate::{
    code::{Key, Value},
    error::Result,
    event::{EntryEvent, EventFilter},
};

/// Use the map's default expiry for the entry.
pub const EXPIRY_DEFAULT: i64 = 0;
/// The entry never expires.
pub const EXPIRY_NEVER: i64 = -1;

/// The map contract shared by the front and the back tier.
///
/// Every operation is fallible because the back tier is remote in general.
pub trait CacheMap<K, V>: Send + Sync
where
    K: Key,
    V: Value,
{
    fn get(&self, key: &K) -> Result<Option<V>>;

    /// Semantically equivalent to a per-key [`CacheMap::get`], but free to
    /// batch.
    fn get_all(&self, keys: &[K]) -> Result<HashMap<K, V>> {
        let mut result = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key)? {
                result.insert(key.clone(), value);
            }
        }
        Ok(result)
    }

    fn put(&self, key: K, value: V) -> Result<Option<V>> {
        self.put_with_ttl(key, value, EXPIRY_DEFAULT)
    }

    /// Upsert with a ttl: `0` uses the map default, `-1` never expires, a
    /// positive value expires that many milliseconds from now. Any other
    /// negative value is an argument error.
    fn put_with_ttl(&self, key: K, value: V, ttl_millis: i64) -> Result<Option<V>>;

    fn put_all(&self, entries: Vec<(K, V)>) -> Result<()> {
        for (key, value) in entries {
            self.put(key, value)?;
        }
        Ok(())
    }

    fn remove(&self, key: &K) -> Result<Option<V>>;

    fn contains_key(&self, key: &K) -> Result<bool>;

    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn clear(&self) -> Result<()>;

    fn key_set(&self) -> Result<Vec<K>>;

    fn values(&self) -> Result<Vec<V>>;

    fn entry_set(&self) -> Result<Vec<(K, V)>>;
}

/// Listener for entry events.
pub trait MapListener<K, V>: Send + Sync + 'static {
    fn on_event(&self, event: &EntryEvent<K, V>);

    /// A priming listener receives, as a side effect of key registration,
    /// an update-shaped event carrying the current value for the key.
    fn is_priming(&self) -> bool {
        false
    }

    /// Synchronous listeners bypass any asynchronous dispatch queue and run
    /// on the thread that generated the event; their panics propagate.
    fn is_synchronous(&self) -> bool {
        false
    }
}

/// Map lifecycle transitions observable by the near tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The map was destroyed or deactivated.
    Destroyed,
    /// The map's contents were truncated in one shot, without per-entry
    /// events.
    Truncated,
    /// The service backing the map lost a member / the connection dropped.
    Disconnected,
}

pub trait LifecycleListener: Send + Sync + 'static {
    fn on_lifecycle(&self, event: LifecycleEvent);
}

/// An observable map: the contract the back tier must provide for event
/// driven invalidation.
pub trait ObservableMap<K, V>: CacheMap<K, V>
where
    K: Key,
    V: Value,
{
    fn add_listener(&self, listener: Arc<dyn MapListener<K, V>>, lite: bool) -> Result<()>;

    fn remove_listener(&self, listener: &Arc<dyn MapListener<K, V>>) -> Result<()>;

    fn add_key_listener(&self, listener: Arc<dyn MapListener<K, V>>, key: K, lite: bool) -> Result<()>;

    fn remove_key_listener(&self, listener: &Arc<dyn MapListener<K, V>>, key: &K) -> Result<()>;

    fn add_filter_listener(
        &self,
        listener: Arc<dyn MapListener<K, V>>,
        filter: Option<Arc<dyn EventFilter<K, V>>>,
        lite: bool,
    ) -> Result<()>;

    fn remove_filter_listener(&self, listener: &Arc<dyn MapListener<K, V>>) -> Result<()>;

    fn add_lifecycle_listener(&self, listener: Arc<dyn LifecycleListener>) -> Result<()>;

    fn remove_lifecycle_listener(&self, listener: &Arc<dyn LifecycleListener>) -> Result<()>;
}

/// Read-through source for a cache.
pub trait CacheLoader<K, V>: Send + Sync + 'static
where
    K: Key,
    V: Value,
{
    fn load(&self, key: &K) -> Result<Option<V>>;

    fn load_all(&self, keys: &[K]) -> Result<HashMap<K, V>> {
        let mut result = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.load(key)? {
                result.insert(key.clone(), value);
            }
        }
        Ok(result)
    }
}

/// Write-through sink for a cache. Erasure is explicit: evictions and
/// expirations are never written through.
pub trait CacheStore<K, V>: CacheLoader<K, V>
where
    K: Key,
    V: Value,
{
    fn store(&self, key: &K, value: &V) -> Result<()>;

    fn store_all(&self, entries: &[(K, V)]) -> Result<()> {
        for (key, value) in entries {
            self.store(key, value)?;
        }
        Ok(())
    }

    fn erase(&self, key: &K) -> Result<()>;

    fn erase_all(&self, keys: &[K]) -> Result<()> {
        for key in keys {
            self.erase(key)?;
        }
        Ok(())
    }
}
