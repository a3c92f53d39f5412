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

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use ahash::RandomState;
use anteroom_common::{
    clock::{Clock, SystemClock},
    code::{HashBuilder, Key, Value},
    error::{Error, Result},
    event::{EntryEvent, EventFlags, EventFilter},
    listener::ListenerSupport,
    map::{
        CacheLoader, CacheMap, CacheStore, LifecycleEvent, LifecycleListener, MapListener, ObservableMap,
        EXPIRY_DEFAULT, EXPIRY_NEVER,
    },
    stats::CacheStatistics,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    calculator::{FixedUnitCalculator, UnitCalculator},
    entry::{CacheEntry, EntryView},
    eviction::{hybrid, lfu, lru, EvictScope, EvictionPolicyConfig},
    table::EntryTable,
};

/// By default, the cache size in units.
pub const DEFAULT_UNITS: u64 = 1000;
/// By default, cache entries expire after one hour.
pub const DEFAULT_EXPIRE_MILLIS: i64 = 3_600_000;
/// By default, expired cache entries are flushed on a minute interval.
pub const DEFAULT_FLUSH_MILLIS: i64 = 60_000;
/// By default, a prune retains 75% of the high watermark.
pub const DEFAULT_PRUNE_LEVEL: f64 = 0.75;

/// Where a write originated. Loader fills are synthetic and must not be
/// written through, otherwise a load would immediately write the value it
/// just read back to the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntrySource {
    Caller,
    Loader,
}

/// Plain-data front store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalCacheConfig {
    /// Maximum cost before a prune; 0 disables pruning.
    pub high_units: u64,
    /// Fraction of `high_units` retained after a prune, in `[0, 1)`.
    pub prune_level: f64,
    /// Default entry lifetime; 0 means entries never expire by default.
    pub expiry_delay_millis: i64,
    /// Interval between full expiry sweeps; 0 disables the periodic sweep
    /// (expiry on access still applies).
    pub flush_delay_millis: i64,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            high_units: DEFAULT_UNITS,
            prune_level: DEFAULT_PRUNE_LEVEL,
            expiry_delay_millis: DEFAULT_EXPIRE_MILLIS,
            flush_delay_millis: DEFAULT_FLUSH_MILLIS,
        }
    }
}

struct CacheState<K, V, S> {
    table: EntryTable<K, V, S>,
    current_units: u64,
    calculator: Arc<dyn UnitCalculator<K, V>>,
    policy: EvictionPolicyConfig<K, V>,
}

struct CacheInner<K, V, S> {
    state: Mutex<CacheState<K, V, S>>,
    support: ListenerSupport<K, V>,
    stats: CacheStatistics,
    clock: Arc<dyn Clock>,
    loader: Option<Arc<dyn CacheLoader<K, V>>>,
    store: Option<Arc<dyn CacheStore<K, V>>>,

    high_units: AtomicU64,
    prune_level_bits: AtomicU64,
    expiry_delay: AtomicI64,
    flush_delay: AtomicI64,

    next_flush: AtomicI64,
    last_prune: AtomicI64,
    average_touch: AtomicU32,
    released: AtomicBool,
}

/// The front store: a size-bounded local cache with per-entry expiry, unit
/// based cost accounting, a high/low watermark prune cycle and observable
/// mutation events. Cheap to clone; clones share the same store.
pub struct LocalCache<K, V, S = RandomState> {
    inner: Arc<CacheInner<K, V, S>>,
}

impl<K, V, S> Clone for LocalCache<K, V, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Prune pass view over the locked cache state.
struct PruneScope<'a, K, V, S> {
    table: &'a mut EntryTable<K, V, S>,
    current_units: &'a mut u64,
    events: &'a mut Vec<EntryEvent<K, V>>,
    now: i64,
    last_prune: i64,
    average_touch: u32,
}

impl<K, V, S> EvictScope<K, V> for PruneScope<'_, K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder + Clone,
{
    fn current_units(&self) -> u64 {
        *self.current_units
    }

    fn entries(&self) -> Vec<EntryView<K>> {
        self.table
            .iter()
            .filter_map(|entry| {
                entry.units().map(|units| EntryView {
                    key: entry.key().clone(),
                    units,
                    touch_count: entry.touch_count(),
                    created_at: entry.created_at(),
                    last_touched_at: entry.last_touched_at(),
                })
            })
            .collect()
    }

    fn evict(&mut self, key: &K) -> bool {
        match self.table.remove(key) {
            Some(mut entry) => {
                if let Some(units) = entry.discard() {
                    *self.current_units -= units as u64;
                }
                self.events
                    .push(EntryEvent::deleted(key.clone(), Some(entry.into_value())).with_flags(EventFlags::SYNTHETIC));
                true
            }
            None => false,
        }
    }

    fn now_millis(&self) -> i64 {
        self.now
    }

    fn last_prune_millis(&self) -> i64 {
        self.last_prune
    }

    fn average_touch(&self) -> u32 {
        self.average_touch
    }
}

impl<K, V> LocalCache<K, V, RandomState>
where
    K: Key,
    V: Value,
{
    pub fn builder() -> LocalCacheBuilder<K, V, RandomState> {
        LocalCacheBuilder::new()
    }
}

impl<K, V, S> LocalCache<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder + Clone,
{
    /// Current value for the key, or `None`; registers a hit or a miss. On
    /// a miss with a configured loader the value is loaded, populated (as a
    /// synthetic insert) and returned.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.maybe_flush();

        let mut events = Vec::new();
        let found = {
            let mut state = self.inner.state.lock();
            let now = self.inner.clock.now_millis();
            let peeked = match state.table.get_mut(key) {
                Some(entry) if entry.is_expired(now) => None,
                Some(entry) => {
                    entry.touch(now);
                    Some(Some(entry.value().clone()))
                }
                None => Some(None),
            };
            match peeked {
                None => {
                    self.remove_expired_locked(&mut state, key, &mut events);
                    None
                }
                Some(found) => found,
            }
        };
        self.dispatch_events(events);

        match found {
            Some(value) => {
                self.inner.stats.register_hit();
                Ok(Some(value))
            }
            None => {
                self.inner.stats.register_miss();
                match self.inner.loader.clone() {
                    Some(loader) => match loader.load(key)? {
                        Some(value) => {
                            self.put_internal(key.clone(), value.clone(), EXPIRY_DEFAULT, EntrySource::Loader)?;
                            Ok(Some(value))
                        }
                        None => Ok(None),
                    },
                    None => Ok(None),
                }
            }
        }
    }

    /// Batched form of [`LocalCache::get`]; missing keys are loaded in one
    /// `load_all` when a loader is configured.
    pub fn get_all(&self, keys: &[K]) -> Result<HashMap<K, V>> {
        self.maybe_flush();

        let mut events = Vec::new();
        let mut result = HashMap::with_capacity(keys.len());
        let mut missing = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let now = self.inner.clock.now_millis();
            for key in keys {
                let hit = match state.table.get_mut(key) {
                    Some(entry) if entry.is_expired(now) => None,
                    Some(entry) => {
                        entry.touch(now);
                        Some(Some(entry.value().clone()))
                    }
                    None => Some(None),
                };
                match hit {
                    None => {
                        self.remove_expired_locked(&mut state, key, &mut events);
                        missing.push(key.clone());
                    }
                    Some(Some(value)) => {
                        result.insert(key.clone(), value);
                    }
                    Some(None) => missing.push(key.clone()),
                }
            }
        }
        self.dispatch_events(events);

        self.inner.stats.register_hits(result.len() as u64);
        self.inner.stats.register_misses(missing.len() as u64);

        if !missing.is_empty() {
            if let Some(loader) = self.inner.loader.clone() {
                let loaded = loader.load_all(&missing)?;
                for (key, value) in loaded {
                    self.put_internal(key.clone(), value.clone(), EXPIRY_DEFAULT, EntrySource::Loader)?;
                    result.insert(key, value);
                }
            }
        }

        Ok(result)
    }

    pub fn put(&self, key: K, value: V) -> Result<Option<V>> {
        self.put_with_ttl(key, value, EXPIRY_DEFAULT)
    }

    /// Upsert. `ttl_millis > 0` expires relative to now, `0` applies the
    /// store default, `-1` never expires. After the write, a prune runs if
    /// the store went over its high watermark.
    pub fn put_with_ttl(&self, key: K, value: V, ttl_millis: i64) -> Result<Option<V>> {
        self.maybe_flush();
        self.put_internal(key, value, ttl_millis, EntrySource::Caller)
    }

    pub fn put_all(&self, entries: Vec<(K, V)>) -> Result<()> {
        for (key, value) in entries {
            self.put(key, value)?;
        }
        Ok(())
    }

    /// Delete the entry if present, write the erase through when a cache
    /// store is configured, and emit a natural delete event.
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        self.maybe_flush();

        let mut events = Vec::new();
        let old = {
            let mut state = self.inner.state.lock();
            match state.table.remove(key) {
                Some(mut entry) => {
                    if let Some(units) = entry.discard() {
                        state.current_units -= units as u64;
                    }
                    let old = entry.into_value();
                    events.push(EntryEvent::deleted(key.clone(), Some(old.clone())));
                    Some(old)
                }
                None => None,
            }
        };
        self.dispatch_events(events);

        if old.is_some() {
            if let Some(store) = &self.inner.store {
                store.erase(key)?;
            }
        }
        Ok(old)
    }

    /// Erase everything, through the cache store if one is configured,
    /// reset the hit/miss counters and reschedule the flush.
    pub fn clear(&self) -> Result<()> {
        if let Some(store) = &self.inner.store {
            let keys: Vec<K> = {
                let state = self.inner.state.lock();
                state.table.keys().cloned().collect()
            };
            store.erase_all(&keys)?;
        }

        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let entries: Vec<CacheEntry<K, V>> = state.table.drain().collect();
            for mut entry in entries {
                if let Some(units) = entry.discard() {
                    state.current_units -= units as u64;
                }
                let key = entry.key().clone();
                events.push(EntryEvent::deleted(key, Some(entry.into_value())));
            }
            debug_assert_eq!(state.current_units, 0);
            state.current_units = 0;
        }
        self.dispatch_events(events);

        self.inner.stats.reset_hit_statistics();
        self.schedule_flush();
        Ok(())
    }

    /// Non-mutating read: never invokes the loader, never counts a hit or
    /// miss, never touches the entry. Expired entries are still removed on
    /// observation.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.maybe_flush();

        let mut events = Vec::new();
        let found = {
            let mut state = self.inner.state.lock();
            let now = self.inner.clock.now_millis();
            let expired = matches!(state.table.get(key), Some(entry) if entry.is_expired(now));
            if expired {
                self.remove_expired_locked(&mut state, key, &mut events);
                None
            } else {
                state.table.get(key).map(|entry| entry.value().clone())
            }
        };
        self.dispatch_events(events);
        found
    }

    pub fn peek_all(&self, keys: &[K]) -> HashMap<K, V> {
        keys.iter()
            .filter_map(|key| self.peek(key).map(|value| (key.clone(), value)))
            .collect()
    }

    /// Force the expiry of one entry, emitting a synthetic delete.
    pub fn evict(&self, key: &K) {
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock();
            self.remove_expired_locked(&mut state, key, &mut events);
        }
        self.dispatch_events(events);
    }

    /// Full expiry sweep; reschedules the next flush afterwards.
    pub fn flush(&self) {
        // Push the next flush out so concurrent sweeps do not pile up.
        self.inner.next_flush.store(i64::MAX, Ordering::Relaxed);

        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let now = self.inner.clock.now_millis();
            self.sweep_expired_locked(&mut state, now, &mut events);
        }
        self.dispatch_events(events);

        self.schedule_flush();
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.maybe_flush();

        let mut events = Vec::new();
        let contained = {
            let mut state = self.inner.state.lock();
            let now = self.inner.clock.now_millis();
            let expired = matches!(state.table.get(key), Some(entry) if entry.is_expired(now));
            if expired {
                self.remove_expired_locked(&mut state, key, &mut events);
                false
            } else {
                state.table.get(key).is_some()
            }
        };
        self.dispatch_events(events);
        contained
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn key_set(&self) -> Vec<K> {
        let state = self.inner.state.lock();
        let now = self.inner.clock.now_millis();
        state
            .table
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn values(&self) -> Vec<V> {
        let state = self.inner.state.lock();
        let now = self.inner.clock.now_millis();
        state
            .table
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn entry_set(&self) -> Vec<(K, V)> {
        let state = self.inner.state.lock();
        let now = self.inner.clock.now_millis();
        state
            .table
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    // ----- accounting and tunables -----------------------------------------

    pub fn current_units(&self) -> u64 {
        self.inner.state.lock().current_units
    }

    pub fn high_units(&self) -> u64 {
        self.inner.high_units.load(Ordering::Relaxed)
    }

    pub fn low_units(&self) -> u64 {
        let level = f64::from_bits(self.inner.prune_level_bits.load(Ordering::Relaxed));
        (self.high_units() as f64 * level).round() as u64
    }

    pub fn set_high_units(&self, high_units: u64) {
        self.inner.high_units.store(high_units, Ordering::Relaxed);
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock();
            self.prune_locked(&mut state, &mut events);
        }
        self.dispatch_events(events);
    }

    pub fn set_prune_level(&self, prune_level: f64) -> Result<()> {
        if !(0.0..1.0).contains(&prune_level) {
            return Err(Error::argument(format!("prune level {prune_level} outside [0, 1)")));
        }
        self.inner
            .prune_level_bits
            .store(prune_level.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    /// Default lifetime applied to entries written with `ttl == 0`.
    /// Changing it does not affect the expiry of previously cached entries.
    pub fn set_expiry_delay(&self, expiry_delay_millis: i64) {
        self.inner.expiry_delay.store(expiry_delay_millis, Ordering::Relaxed);
    }

    pub fn set_flush_delay(&self, flush_delay_millis: i64) {
        self.inner.flush_delay.store(flush_delay_millis, Ordering::Relaxed);
        self.schedule_flush();
    }

    /// Swap the unit calculator, recomputing every entry's cost and the
    /// store total atomically under the write barrier.
    pub fn set_unit_calculator(&self, calculator: Arc<dyn UnitCalculator<K, V>>) {
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock();
            state.calculator = calculator;
            let calculator = state.calculator.clone();

            let mut total = 0u64;
            let mut updates: Vec<(K, u32)> = Vec::with_capacity(state.table.len());
            for entry in state.table.iter() {
                if entry.units().is_some() {
                    let units = calculator.calculate_units(entry.key(), entry.value());
                    updates.push((entry.key().clone(), units));
                    total += units as u64;
                }
            }
            for (key, units) in updates {
                if let Some(entry) = state.table.get_mut(&key) {
                    entry.set_units(units);
                }
            }
            state.current_units = total;

            self.prune_locked(&mut state, &mut events);
        }
        self.dispatch_events(events);
    }

    pub fn set_eviction_policy(&self, policy: EvictionPolicyConfig<K, V>) {
        self.inner.state.lock().policy = policy;
    }

    pub fn statistics(&self) -> &CacheStatistics {
        &self.inner.stats
    }

    /// Number of key listeners currently registered for the key.
    pub fn key_listener_count(&self, key: &K) -> usize {
        self.inner.support.key_listener_count(key)
    }

    /// Number of filter listeners currently registered.
    pub fn filter_listener_count(&self) -> usize {
        self.inner.support.filter_listener_count()
    }

    // ----- lifecycle --------------------------------------------------------

    /// Drop all contents without per-entry events and notify lifecycle
    /// listeners of the truncation.
    pub fn truncate(&self) {
        {
            let mut state = self.inner.state.lock();
            let _ = state.table.drain().count();
            state.current_units = 0;
        }
        self.inner.support.dispatch_lifecycle(LifecycleEvent::Truncated);
    }

    /// Destroy the store: contents dropped, lifecycle listeners notified.
    pub fn destroy(&self) {
        self.inner.released.store(true, Ordering::Relaxed);
        {
            let mut state = self.inner.state.lock();
            let _ = state.table.drain().count();
            state.current_units = 0;
        }
        self.inner.support.dispatch_lifecycle(LifecycleEvent::Destroyed);
    }

    /// Signal a service-membership drop to lifecycle listeners.
    pub fn disconnect(&self) {
        self.inner.support.dispatch_lifecycle(LifecycleEvent::Disconnected);
    }

    /// Release locally held resources: every listener registration is
    /// dropped.
    pub fn release(&self) {
        self.inner.released.store(true, Ordering::Relaxed);
        self.inner.support.clear();
    }

    // ----- internal ---------------------------------------------------------

    fn put_internal(&self, key: K, value: V, ttl_millis: i64, source: EntrySource) -> Result<Option<V>> {
        if ttl_millis < EXPIRY_NEVER {
            return Err(Error::argument(format!("ttl {ttl_millis} outside {{-1, 0, 1..}}")));
        }

        let mut events = Vec::new();
        let old = {
            let mut state = self.inner.state.lock();
            let now = self.inner.clock.now_millis();
            let expires_at = self.expiry_for(ttl_millis, now);
            let units = state.calculator.calculate_units(&key, &value);

            let expired = state.table.get(&key).map(|e| e.is_expired(now)).unwrap_or(false);
            if expired {
                self.remove_expired_locked(&mut state, &key, &mut events);
            }

            let synthetic = match source {
                EntrySource::Caller => EventFlags::empty(),
                EntrySource::Loader => EventFlags::SYNTHETIC,
            };

            let updated = match state.table.get_mut(&key) {
                Some(entry) => {
                    let reconcile = entry.set_units(units);
                    let old = entry.replace_value(value.clone());
                    entry.set_expires_at(expires_at);
                    entry.touch(now);
                    Some((reconcile, old))
                }
                None => None,
            };

            let old = match updated {
                Some((reconcile, old)) => {
                    if let Some((old_units, new_units)) = reconcile {
                        state.current_units = state.current_units - old_units as u64 + new_units as u64;
                    }
                    events.push(
                        EntryEvent::updated(key.clone(), Some(old.clone()), value.clone()).with_flags(synthetic),
                    );
                    Some(old)
                }
                None => {
                    let hash = state.table.hash(&key);
                    let mut entry = CacheEntry::new(key.clone(), value.clone(), hash, units, now, expires_at);
                    entry.touch(now);
                    state.table.insert(entry);
                    state.current_units += units as u64;
                    events.push(EntryEvent::inserted(key.clone(), value.clone()).with_flags(synthetic));
                    None
                }
            };

            self.prune_locked(&mut state, &mut events);
            old
        };

        self.dispatch_events(events);

        if source == EntrySource::Caller {
            self.inner.stats.register_put();
            if let Some(store) = &self.inner.store {
                store.store(&key, &value)?;
            }
        }
        Ok(old)
    }

    fn expiry_for(&self, ttl_millis: i64, now: i64) -> i64 {
        if ttl_millis > 0 {
            now + ttl_millis
        } else if ttl_millis == EXPIRY_DEFAULT {
            let delay = self.inner.expiry_delay.load(Ordering::Relaxed);
            if delay > 0 {
                now + delay
            } else {
                0
            }
        } else {
            0
        }
    }

    /// Remove one entry as expired/evicted, accounting for its units and
    /// queueing a synthetic delete.
    fn remove_expired_locked(&self, state: &mut CacheState<K, V, S>, key: &K, events: &mut Vec<EntryEvent<K, V>>) {
        if let Some(mut entry) = state.table.remove(key) {
            if let Some(units) = entry.discard() {
                state.current_units -= units as u64;
            }
            events
                .push(EntryEvent::deleted(key.clone(), Some(entry.into_value())).with_flags(EventFlags::SYNTHETIC));
        }
    }

    fn sweep_expired_locked(&self, state: &mut CacheState<K, V, S>, now: i64, events: &mut Vec<EntryEvent<K, V>>) {
        let expired: Vec<K> = state
            .table
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();
        for key in expired {
            self.remove_expired_locked(state, &key, events);
        }
    }

    fn prune_locked(&self, state: &mut CacheState<K, V, S>, events: &mut Vec<EntryEvent<K, V>>) {
        let high = self.inner.high_units.load(Ordering::Relaxed);
        if high == 0 || state.current_units <= high {
            return;
        }

        let now = self.inner.clock.now_millis();

        // Throwing away expired entries may already be enough.
        self.sweep_expired_locked(state, now, events);
        if state.current_units <= high {
            return;
        }

        let low = self.low_units();

        // A rough average number of touches each entry should expect.
        let average_touch = {
            let len = state.table.len() as u64;
            let accesses = self.inner.stats.total_gets() + self.inner.stats.total_puts();
            (accesses / ((len + 1) * (self.inner.stats.cache_prunes() + 1))) as u32
        };
        self.inner.average_touch.store(average_touch, Ordering::Relaxed);

        let policy = state.policy.clone();
        {
            let mut scope = PruneScope {
                table: &mut state.table,
                current_units: &mut state.current_units,
                events,
                now,
                last_prune: self.inner.last_prune.load(Ordering::Relaxed),
                average_touch,
            };
            match &policy {
                EvictionPolicyConfig::Hybrid => hybrid::prune(&mut scope, low),
                EvictionPolicyConfig::Lru => lru::prune(&mut scope, low),
                EvictionPolicyConfig::Lfu => lfu::prune(&mut scope, low),
                EvictionPolicyConfig::External(policy) => policy.request_eviction(low, &mut scope),
            }
        }

        // Frequency decay, so long lived entries stay evictable.
        if matches!(
            policy,
            EvictionPolicyConfig::Hybrid | EvictionPolicyConfig::Lfu
        ) {
            for entry in state.table.iter_mut() {
                entry.reset_touch_count();
            }
        }

        if state.current_units > high {
            tracing::warn!(
                current = state.current_units,
                high,
                "prune pass left the cache over its high watermark"
            );
        }

        self.inner.stats.register_prune(now);
        self.inner.last_prune.store(now, Ordering::Relaxed);
    }

    fn maybe_flush(&self) {
        if self.inner.clock.now_millis() > self.inner.next_flush.load(Ordering::Relaxed) {
            self.flush();
        }
    }

    fn schedule_flush(&self) {
        let delay = self.inner.flush_delay.load(Ordering::Relaxed);
        let next = if delay == 0 {
            i64::MAX
        } else {
            self.inner.clock.now_millis() + delay
        };
        self.inner.next_flush.store(next, Ordering::Relaxed);
    }

    fn dispatch_events(&self, events: Vec<EntryEvent<K, V>>) {
        if events.is_empty() {
            return;
        }
        for event in events {
            self.inner.support.dispatch(&event);
        }
    }
}

impl<K, V, S> CacheMap<K, V> for LocalCache<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder + Clone,
{
    fn get(&self, key: &K) -> Result<Option<V>> {
        LocalCache::get(self, key)
    }

    fn get_all(&self, keys: &[K]) -> Result<HashMap<K, V>> {
        LocalCache::get_all(self, keys)
    }

    fn put_with_ttl(&self, key: K, value: V, ttl_millis: i64) -> Result<Option<V>> {
        LocalCache::put_with_ttl(self, key, value, ttl_millis)
    }

    fn put_all(&self, entries: Vec<(K, V)>) -> Result<()> {
        LocalCache::put_all(self, entries)
    }

    fn remove(&self, key: &K) -> Result<Option<V>> {
        LocalCache::remove(self, key)
    }

    fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(LocalCache::contains_key(self, key))
    }

    fn len(&self) -> Result<usize> {
        Ok(LocalCache::len(self))
    }

    fn clear(&self) -> Result<()> {
        LocalCache::clear(self)
    }

    fn key_set(&self) -> Result<Vec<K>> {
        Ok(LocalCache::key_set(self))
    }

    fn values(&self) -> Result<Vec<V>> {
        Ok(LocalCache::values(self))
    }

    fn entry_set(&self) -> Result<Vec<(K, V)>> {
        Ok(LocalCache::entry_set(self))
    }
}

impl<K, V, S> ObservableMap<K, V> for LocalCache<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder + Clone,
{
    fn add_listener(&self, listener: Arc<dyn MapListener<K, V>>, lite: bool) -> Result<()> {
        self.inner.support.add_listener(listener, lite);
        Ok(())
    }

    fn remove_listener(&self, listener: &Arc<dyn MapListener<K, V>>) -> Result<()> {
        self.inner.support.remove_listener(listener);
        Ok(())
    }

    /// Registering a priming listener for a key delivers a priming event
    /// whose payload is the value (or absence) at registration time.
    fn add_key_listener(&self, listener: Arc<dyn MapListener<K, V>>, key: K, lite: bool) -> Result<()> {
        self.inner.support.add_key_listener(listener.clone(), key.clone(), lite);
        if listener.is_priming() {
            let current = self.peek(&key);
            let event = EntryEvent::priming(key, current);
            self.inner.support.prime(&listener, &event, lite);
        }
        Ok(())
    }

    fn remove_key_listener(&self, listener: &Arc<dyn MapListener<K, V>>, key: &K) -> Result<()> {
        self.inner.support.remove_key_listener(listener, key);
        Ok(())
    }

    fn add_filter_listener(
        &self,
        listener: Arc<dyn MapListener<K, V>>,
        filter: Option<Arc<dyn EventFilter<K, V>>>,
        lite: bool,
    ) -> Result<()> {
        self.inner.support.add_filter_listener(listener, filter, lite);
        Ok(())
    }

    fn remove_filter_listener(&self, listener: &Arc<dyn MapListener<K, V>>) -> Result<()> {
        self.inner.support.remove_filter_listener(listener);
        Ok(())
    }

    fn add_lifecycle_listener(&self, listener: Arc<dyn LifecycleListener>) -> Result<()> {
        self.inner.support.add_lifecycle_listener(listener);
        Ok(())
    }

    fn remove_lifecycle_listener(&self, listener: &Arc<dyn LifecycleListener>) -> Result<()> {
        self.inner.support.remove_lifecycle_listener(listener);
        Ok(())
    }
}

/// Builder for [`LocalCache`].
pub struct LocalCacheBuilder<K, V, S = RandomState> {
    config: LocalCacheConfig,
    policy: EvictionPolicyConfig<K, V>,
    calculator: Arc<dyn UnitCalculator<K, V>>,
    clock: Arc<dyn Clock>,
    loader: Option<Arc<dyn CacheLoader<K, V>>>,
    store: Option<Arc<dyn CacheStore<K, V>>>,
    hash_builder: S,
}

impl<K, V> Default for LocalCacheBuilder<K, V, RandomState>
where
    K: Key,
    V: Value,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> LocalCacheBuilder<K, V, RandomState>
where
    K: Key,
    V: Value,
{
    pub fn new() -> Self {
        Self {
            config: LocalCacheConfig::default(),
            policy: EvictionPolicyConfig::default(),
            calculator: Arc::new(FixedUnitCalculator),
            clock: Arc::new(SystemClock),
            loader: None,
            store: None,
            hash_builder: RandomState::default(),
        }
    }
}

impl<K, V, S> LocalCacheBuilder<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder + Clone,
{
    pub fn from_config(mut self, config: LocalCacheConfig) -> Self {
        assert!(
            (0.0..1.0).contains(&config.prune_level),
            "prune level {} outside [0, 1)",
            config.prune_level
        );
        self.config = config;
        self
    }

    pub fn with_high_units(mut self, high_units: u64) -> Self {
        self.config.high_units = high_units;
        self
    }

    pub fn with_prune_level(mut self, prune_level: f64) -> Self {
        assert!(
            (0.0..1.0).contains(&prune_level),
            "prune level {prune_level} outside [0, 1)"
        );
        self.config.prune_level = prune_level;
        self
    }

    pub fn with_expiry_delay(mut self, expiry_delay_millis: i64) -> Self {
        self.config.expiry_delay_millis = expiry_delay_millis;
        self
    }

    pub fn with_flush_delay(mut self, flush_delay_millis: i64) -> Self {
        self.config.flush_delay_millis = flush_delay_millis;
        self
    }

    pub fn with_eviction_policy(mut self, policy: EvictionPolicyConfig<K, V>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_unit_calculator(mut self, calculator: impl UnitCalculator<K, V>) -> Self {
        self.calculator = Arc::new(calculator);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cache_loader(mut self, loader: impl CacheLoader<K, V>) -> Self {
        self.loader = Some(Arc::new(loader));
        self
    }

    /// Install a write-through store; it also serves as the loader.
    pub fn with_cache_store(mut self, store: impl CacheStore<K, V>) -> Self {
        let store = Arc::new(store);
        self.loader = Some(store.clone());
        self.store = Some(store);
        self
    }

    pub fn with_hash_builder<OS>(self, hash_builder: OS) -> LocalCacheBuilder<K, V, OS>
    where
        OS: HashBuilder + Clone,
    {
        LocalCacheBuilder {
            config: self.config,
            policy: self.policy,
            calculator: self.calculator,
            clock: self.clock,
            loader: self.loader,
            store: self.store,
            hash_builder,
        }
    }

    pub fn build(self) -> LocalCache<K, V, S> {
        let now = self.clock.now_millis();
        let next_flush = if self.config.flush_delay_millis == 0 {
            i64::MAX
        } else {
            now + self.config.flush_delay_millis
        };

        LocalCache {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CacheState {
                    table: EntryTable::with_hasher(self.hash_builder),
                    current_units: 0,
                    calculator: self.calculator,
                    policy: self.policy,
                }),
                support: ListenerSupport::new(),
                stats: CacheStatistics::new(),
                clock: self.clock,
                loader: self.loader,
                store: self.store,
                high_units: AtomicU64::new(self.config.high_units),
                prune_level_bits: AtomicU64::new(self.config.prune_level.to_bits()),
                expiry_delay: AtomicI64::new(self.config.expiry_delay_millis),
                flush_delay: AtomicI64::new(self.config.flush_delay_millis),
                next_flush: AtomicI64::new(next_flush),
                last_prune: AtomicI64::new(now),
                average_touch: AtomicU32::new(0),
                released: AtomicBool::new(false),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex as StdMutex,
    };

    use anteroom_common::{clock::ManualClock, event::EntryEventKind};
    use rand::{rngs::SmallRng, RngCore, SeedableRng};

    use super::*;
    use crate::eviction::{EvictScope, EvictionPolicy};

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<EntryEvent<String, String>>>,
        priming: bool,
    }

    impl Recorder {
        fn priming() -> Self {
            Self {
                priming: true,
                ..Default::default()
            }
        }

        fn events(&self) -> Vec<EntryEvent<String, String>> {
            self.events.lock().unwrap().clone()
        }
    }

    impl MapListener<String, String> for Recorder {
        fn on_event(&self, event: &EntryEvent<String, String>) {
            self.events.lock().unwrap().push(event.clone());
        }

        fn is_priming(&self) -> bool {
            self.priming
        }
    }

    fn cache(high_units: u64, clock: Arc<ManualClock>) -> LocalCache<String, String> {
        LocalCache::builder()
            .with_high_units(high_units)
            .with_expiry_delay(0)
            .with_flush_delay(0)
            .with_clock(clock)
            .build()
    }

    #[test_log::test]
    fn test_hit_and_stats() {
        let clock = Arc::new(ManualClock::new(1_000));
        let cache = cache(100, clock);

        cache.put("a".to_string(), "1".to_string()).unwrap();
        assert_eq!(cache.get(&"a".to_string()).unwrap(), Some("1".to_string()));
        assert_eq!(cache.statistics().cache_hits(), 1);
        assert_eq!(cache.statistics().cache_misses(), 0);
        assert_eq!(cache.current_units(), 1);
    }

    #[test_log::test]
    fn test_expiry_on_access() {
        let clock = Arc::new(ManualClock::new(1_000));
        let cache = cache(100, clock.clone());
        let recorder = Arc::new(Recorder::default());
        cache.add_listener(recorder.clone(), false).unwrap();

        cache.put_with_ttl("a".to_string(), "1".to_string(), 10).unwrap();
        clock.advance(20);

        assert_eq!(cache.get(&"a".to_string()).unwrap(), None);
        assert_eq!(cache.statistics().cache_misses(), 1);
        assert_eq!(cache.current_units(), 0);

        let events = recorder.events();
        let deletes: Vec<_> = events.iter().filter(|e| e.kind == EntryEventKind::Deleted).collect();
        assert_eq!(deletes.len(), 1);
        assert!(deletes[0].is_synthetic());
        assert_eq!(deletes[0].old, Some("1".to_string()));
    }

    #[test_log::test]
    fn test_prune_by_units() {
        let clock = Arc::new(ManualClock::new(1_000));
        let cache = LocalCache::builder()
            .with_high_units(3)
            .with_prune_level(0.66)
            .with_expiry_delay(0)
            .with_flush_delay(0)
            .with_clock(clock.clone())
            .build();

        cache.put("a".to_string(), "1".to_string()).unwrap();
        cache.put("b".to_string(), "1".to_string()).unwrap();
        cache.put("c".to_string(), "1".to_string()).unwrap();

        clock.advance(10);
        cache.get(&"a".to_string()).unwrap();
        clock.advance(10);
        cache.get(&"a".to_string()).unwrap();

        clock.advance(10);
        cache.put("d".to_string(), "1".to_string()).unwrap();

        assert_eq!(cache.current_units(), 2);
        assert_eq!(cache.len(), 2);
        assert!(cache.contains_key(&"a".to_string()), "most used entry must survive");
    }

    #[test_log::test]
    fn test_double_put_emits_one_update() {
        let clock = Arc::new(ManualClock::new(1_000));
        let cache = cache(100, clock);
        let recorder = Arc::new(Recorder::default());
        cache.add_listener(recorder.clone(), false).unwrap();

        assert_eq!(cache.put("k".to_string(), "v".to_string()).unwrap(), None);
        assert_eq!(
            cache.put("k".to_string(), "v".to_string()).unwrap(),
            Some("v".to_string())
        );

        let events = recorder.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EntryEventKind::Inserted);
        assert_eq!(events[1].kind, EntryEventKind::Updated);
        assert!(!events[1].is_synthetic());
    }

    #[test_log::test]
    fn test_remove_emits_one_natural_delete() {
        let clock = Arc::new(ManualClock::new(1_000));
        let cache = cache(100, clock);
        let recorder = Arc::new(Recorder::default());
        cache.add_listener(recorder.clone(), false).unwrap();

        cache.put("k".to_string(), "v".to_string()).unwrap();
        assert_eq!(cache.remove(&"k".to_string()).unwrap(), Some("v".to_string()));
        assert!(!cache.contains_key(&"k".to_string()));
        assert_eq!(cache.remove(&"k".to_string()).unwrap(), None);

        let deletes: Vec<_> = recorder
            .events()
            .into_iter()
            .filter(|e| e.kind == EntryEventKind::Deleted)
            .collect();
        assert_eq!(deletes.len(), 1);
        assert!(!deletes[0].is_synthetic());
    }

    #[test_log::test]
    fn test_unit_calculator_switch_round_trip() {
        let clock = Arc::new(ManualClock::new(1_000));
        let cache = cache(1_000, clock);

        cache.put("a".to_string(), "xx".to_string()).unwrap();
        cache.put("b".to_string(), "xxxx".to_string()).unwrap();
        let original = cache.current_units();
        assert_eq!(original, 2);

        cache.set_unit_calculator(Arc::new(|_: &String, value: &String| value.len() as u32));
        assert_eq!(cache.current_units(), 6);

        cache.set_unit_calculator(Arc::new(FixedUnitCalculator));
        assert_eq!(cache.current_units(), original);
    }

    #[test_log::test]
    fn test_high_units_zero_disables_pruning() {
        let clock = Arc::new(ManualClock::new(1_000));
        let cache = cache(0, clock);

        for i in 0..100 {
            cache.put(format!("k{i}"), "v".to_string()).unwrap();
        }
        assert_eq!(cache.len(), 100);
        assert_eq!(cache.current_units(), 100);
    }

    #[test_log::test]
    fn test_periodic_flush_sweeps_untouched_keys() {
        let clock = Arc::new(ManualClock::new(1_000));
        let cache = LocalCache::builder()
            .with_high_units(100)
            .with_expiry_delay(0)
            .with_flush_delay(50)
            .with_clock(clock.clone())
            .build();
        let recorder = Arc::new(Recorder::default());
        cache.add_listener(recorder.clone(), false).unwrap();

        cache.put_with_ttl("a".to_string(), "1".to_string(), 10).unwrap();
        clock.advance(100);

        // Unrelated access runs the sweep.
        assert!(!cache.contains_key(&"other".to_string()));
        let deletes: Vec<_> = recorder
            .events()
            .into_iter()
            .filter(|e| e.kind == EntryEventKind::Deleted && e.key == "a")
            .collect();
        assert_eq!(deletes.len(), 1);
        assert!(deletes[0].is_synthetic());
    }

    #[test_log::test]
    fn test_explicit_ttl_outlives_default_expiry_change() {
        let clock = Arc::new(ManualClock::new(1_000));
        let cache = cache(100, clock.clone());

        cache.put_with_ttl("a".to_string(), "1".to_string(), 10).unwrap();
        cache.set_expiry_delay(0);

        clock.advance(20);
        assert_eq!(cache.get(&"a".to_string()).unwrap(), None);
    }

    #[derive(Default)]
    struct RecordingStore {
        backing: StdMutex<HashMap<String, String>>,
        stores: AtomicUsize,
        erases: AtomicUsize,
    }

    impl CacheLoader<String, String> for RecordingStore {
        fn load(&self, key: &String) -> Result<Option<String>> {
            Ok(self.backing.lock().unwrap().get(key).cloned())
        }
    }

    impl CacheStore<String, String> for RecordingStore {
        fn store(&self, key: &String, value: &String) -> Result<()> {
            self.stores.fetch_add(1, Ordering::SeqCst);
            self.backing.lock().unwrap().insert(key.clone(), value.clone());
            Ok(())
        }

        fn erase(&self, key: &String) -> Result<()> {
            self.erases.fetch_add(1, Ordering::SeqCst);
            self.backing.lock().unwrap().remove(key);
            Ok(())
        }
    }

    #[test_log::test]
    fn test_loader_fill_is_synthetic_and_not_written_through() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = RecordingStore::default();
        store
            .backing
            .lock()
            .unwrap()
            .insert("k".to_string(), "loaded".to_string());

        let cache = LocalCache::builder()
            .with_high_units(100)
            .with_expiry_delay(0)
            .with_flush_delay(0)
            .with_clock(clock)
            .with_cache_store(store)
            .build();
        let recorder = Arc::new(Recorder::default());
        cache.add_listener(recorder.clone(), false).unwrap();

        assert_eq!(cache.get(&"k".to_string()).unwrap(), Some("loaded".to_string()));
        assert_eq!(cache.statistics().cache_misses(), 1);

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EntryEventKind::Inserted);
        assert!(events[0].is_synthetic(), "loader fill must be synthetic");
    }

    #[test_log::test]
    fn test_write_through_and_erase_counts() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(RecordingStore::default());
        store
            .backing
            .lock()
            .unwrap()
            .insert("preload".to_string(), "x".to_string());

        struct Shared(Arc<RecordingStore>);
        impl CacheLoader<String, String> for Shared {
            fn load(&self, key: &String) -> Result<Option<String>> {
                self.0.load(key)
            }
        }
        impl CacheStore<String, String> for Shared {
            fn store(&self, key: &String, value: &String) -> Result<()> {
                self.0.store(key, value)
            }
            fn erase(&self, key: &String) -> Result<()> {
                self.0.erase(key)
            }
        }

        let cache = LocalCache::builder()
            .with_high_units(2)
            .with_prune_level(0.5)
            .with_expiry_delay(0)
            .with_flush_delay(0)
            .with_clock(clock)
            .with_cache_store(Shared(store.clone()))
            .build();

        // Loader fill: no store call.
        assert_eq!(cache.get(&"preload".to_string()).unwrap(), Some("x".to_string()));
        assert_eq!(store.stores.load(Ordering::SeqCst), 0);

        // Caller put: one store call.
        cache.put("a".to_string(), "1".to_string()).unwrap();
        assert_eq!(store.stores.load(Ordering::SeqCst), 1);

        // Prune-driven eviction: no erase call.
        cache.put("b".to_string(), "2".to_string()).unwrap();
        assert!(cache.current_units() <= 2);
        assert_eq!(store.erases.load(Ordering::SeqCst), 0);

        // Explicit remove of a cached key: one erase call.
        let keys = cache.key_set();
        cache.remove(&keys[0]).unwrap();
        assert_eq!(store.erases.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn test_peek_never_loads_or_counts() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = RecordingStore::default();
        store
            .backing
            .lock()
            .unwrap()
            .insert("k".to_string(), "loaded".to_string());

        let cache = LocalCache::builder()
            .with_high_units(100)
            .with_expiry_delay(0)
            .with_flush_delay(0)
            .with_clock(clock)
            .with_cache_store(store)
            .build();

        assert_eq!(cache.peek(&"k".to_string()), None);
        assert_eq!(cache.statistics().total_gets(), 0);
    }

    #[test_log::test]
    fn test_external_eviction_policy() {
        struct EvictEverything;
        impl EvictionPolicy<String, String> for EvictEverything {
            fn request_eviction(&self, _: u64, scope: &mut dyn EvictScope<String, String>) {
                for view in scope.entries() {
                    scope.evict(&view.key);
                }
            }
        }

        let clock = Arc::new(ManualClock::new(1_000));
        let cache = LocalCache::builder()
            .with_high_units(2)
            .with_eviction_policy(EvictionPolicyConfig::External(Arc::new(EvictEverything)))
            .with_expiry_delay(0)
            .with_flush_delay(0)
            .with_clock(clock)
            .build();

        cache.put("a".to_string(), "1".to_string()).unwrap();
        cache.put("b".to_string(), "1".to_string()).unwrap();
        cache.put("c".to_string(), "1".to_string()).unwrap();

        assert_eq!(cache.len(), 1, "only the entry that triggered the prune survives");
        assert_eq!(cache.current_units(), 1);
    }

    #[test_log::test]
    fn test_clear_twice_and_stat_reset() {
        let clock = Arc::new(ManualClock::new(1_000));
        let cache = cache(100, clock);

        cache.put("a".to_string(), "1".to_string()).unwrap();
        cache.get(&"a".to_string()).unwrap();
        assert_eq!(cache.statistics().cache_hits(), 1);

        cache.clear().unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.current_units(), 0);
        assert_eq!(cache.statistics().cache_hits(), 0);

        cache.clear().unwrap();
        assert!(cache.is_empty());
    }

    #[test_log::test]
    fn test_priming_key_listener_registration() {
        let clock = Arc::new(ManualClock::new(1_000));
        let cache = cache(100, clock);
        cache.put("k".to_string(), "v".to_string()).unwrap();

        let recorder = Arc::new(Recorder::priming());
        cache
            .add_key_listener(recorder.clone(), "k".to_string(), false)
            .unwrap();

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_priming());
        assert_eq!(events[0].new, Some("v".to_string()));
        assert_eq!(cache.key_listener_count(&"k".to_string()), 1);

        // Registration for an absent key primes with an absent payload.
        let absent = Arc::new(Recorder::priming());
        cache
            .add_key_listener(absent.clone(), "missing".to_string(), false)
            .unwrap();
        let events = absent.events();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_priming());
        assert_eq!(events[0].new, None);
    }

    #[test_log::test]
    fn test_cache_fuzzy() {
        const HIGH: u64 = 256;

        let cache: LocalCache<u64, u64> = LocalCache::builder().with_high_units(HIGH).build();

        let mut rng = SmallRng::seed_from_u64(114514);
        for _ in 0..10_000 {
            let key = rng.next_u64() % 512;
            if let Some(value) = cache.get(&key).unwrap() {
                assert_eq!(value, key);
                continue;
            }
            cache.put(key, key).unwrap();
            assert!(cache.current_units() <= HIGH);
        }
        assert_eq!(cache.current_units() as usize, cache.len());
    }
}
