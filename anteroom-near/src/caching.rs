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
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, OnceLock, Weak,
    },
    thread,
    time::{Duration, Instant},
};

use anteroom_common::{
    code::{Key, Value},
    error::{Error, Result},
    event::{CacheEventFilter, EntryEvent, EntryEventKind, EventFilter, EventMask, NotFilter},
    map::{CacheMap, LifecycleEvent, LifecycleListener, MapListener, ObservableMap, EXPIRY_DEFAULT},
    stats::CacheStatistics,
};
use anteroom_memory::LocalCache;
use parking_lot::Mutex;

use crate::control::{ControlMap, EventSlot};

/// Whether the back listener strictly adheres to the synchronous-listener
/// contract: with it enforced, a put that observes no event for its own
/// write is treated as invalid.
fn strict_back_listener() -> bool {
    static STRICT: OnceLock<bool> = OnceLock::new();
    *STRICT.get_or_init(|| {
        std::env::var("ANTEROOM_STRICT_BACK_LISTENER")
            .map(|value| !matches!(value.as_str(), "false" | "0"))
            .unwrap_or(true)
    })
}

/// How the front is kept consistent with the back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvalidationStrategy {
    /// Never listen; trust the front until it is removed explicitly.
    None,
    /// Listen only to the keys currently in the front; registration for a
    /// key is deferred until its first read.
    Present,
    /// One global filter listener; every successful read is cached.
    All,
    /// Like `All`, but with synthetic deletes filtered out.
    Logical,
    /// Resolved to `Present` at first use.
    #[default]
    Auto,
}

struct CachingMapInner<K, V, B>
where
    K: Key,
    V: Value,
    B: ObservableMap<K, V> + 'static,
{
    front: LocalCache<K, V>,
    back: Arc<B>,
    control: ControlMap<K, V>,

    strategy_target: InvalidationStrategy,
    strategy_current: Mutex<InvalidationStrategy>,

    back_listener: Arc<dyn MapListener<K, V>>,
    front_listener: Arc<dyn MapListener<K, V>>,
    deactivation_listener: Arc<dyn LifecycleListener>,

    stats: CacheStatistics,
    invalidation_hits: AtomicU64,
    invalidation_misses: AtomicU64,
    register_listener_count: AtomicU64,
    released: AtomicBool,
}

/// The two-tier caching map: composes a bounded front store with an
/// observable back store and keeps them consistent through an event driven
/// invalidation protocol.
pub struct CachingMap<K, V, B>
where
    K: Key,
    V: Value,
    B: ObservableMap<K, V> + 'static,
{
    inner: Arc<CachingMapInner<K, V, B>>,
}

impl<K, V, B> Clone for CachingMap<K, V, B>
where
    K: Key,
    V: Value,
    B: ObservableMap<K, V> + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

// ----- listener objects -----------------------------------------------------

struct BackListener<K, V, B>
where
    K: Key,
    V: Value,
    B: ObservableMap<K, V> + 'static,
{
    inner: Weak<CachingMapInner<K, V, B>>,
    priming: bool,
}

impl<K, V, B> MapListener<K, V> for BackListener<K, V, B>
where
    K: Key,
    V: Value,
    B: ObservableMap<K, V> + 'static,
{
    fn on_event(&self, event: &EntryEvent<K, V>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.validate(event);
        }
    }

    fn is_priming(&self) -> bool {
        self.priming
    }

    fn is_synchronous(&self) -> bool {
        true
    }
}

/// Listens for synthetic deletes on the front and deregisters the matching
/// key listener on the back, keeping the listener set equal to the front's
/// keyset.
struct FrontListener<K, V, B>
where
    K: Key,
    V: Value,
    B: ObservableMap<K, V> + 'static,
{
    inner: Weak<CachingMapInner<K, V, B>>,
}

impl<K, V, B> MapListener<K, V> for FrontListener<K, V, B>
where
    K: Key,
    V: Value,
    B: ObservableMap<K, V> + 'static,
{
    fn on_event(&self, event: &EntryEvent<K, V>) {
        if event.kind == EntryEventKind::Deleted && event.is_synthetic() {
            if let Some(inner) = self.inner.upgrade() {
                inner.unregister_key_listener(&event.key);
            }
        }
    }

    fn is_synchronous(&self) -> bool {
        true
    }
}

struct BackDeactivationListener<K, V, B>
where
    K: Key,
    V: Value,
    B: ObservableMap<K, V> + 'static,
{
    inner: Weak<CachingMapInner<K, V, B>>,
}

impl<K, V, B> LifecycleListener for BackDeactivationListener<K, V, B>
where
    K: Key,
    V: Value,
    B: ObservableMap<K, V> + 'static,
{
    fn on_lifecycle(&self, _: LifecycleEvent) {
        // Destroy, truncate and disconnect all converge on the same local
        // consequence: the front can no longer be trusted.
        if let Some(inner) = self.inner.upgrade() {
            inner.reset_front_map();
        }
    }
}

// ----- scoped cleanup -------------------------------------------------------

/// Unlocks (and detaches any leftover slot for) one key on every exit path.
struct KeyGuard<'a, K, V>
where
    K: Key,
    V: Value,
{
    control: &'a ControlMap<K, V>,
    key: &'a K,
}

impl<'a, K, V> KeyGuard<'a, K, V>
where
    K: Key,
    V: Value,
{
    fn new(control: &'a ControlMap<K, V>, key: &'a K) -> Self {
        Self { control, key }
    }
}

impl<K, V> Drop for KeyGuard<'_, K, V>
where
    K: Key,
    V: Value,
{
    fn drop(&mut self) {
        self.control.detach(self.key);
        self.control.unlock(self.key);
    }
}

/// Unlocks and detaches every key still registered with it; bulk operations
/// pop keys as they complete them.
struct MultiKeyGuard<'a, K, V>
where
    K: Key,
    V: Value,
{
    control: &'a ControlMap<K, V>,
    keys: Vec<K>,
}

impl<'a, K, V> MultiKeyGuard<'a, K, V>
where
    K: Key,
    V: Value,
{
    fn new(control: &'a ControlMap<K, V>) -> Self {
        Self { control, keys: vec![] }
    }
}

impl<K, V> Drop for MultiKeyGuard<'_, K, V>
where
    K: Key,
    V: Value,
{
    fn drop(&mut self) {
        for key in &self.keys {
            self.control.detach(key);
            self.control.unlock(key);
        }
    }
}

/// Bulk-write cleanup: a key still registered here when the operation
/// unwinds has unknown back state, so its front entry is invalidated before
/// the slot is detached and the lock released.
struct PutAllGuard<'a, K, V, B>
where
    K: Key,
    V: Value,
    B: ObservableMap<K, V> + 'static,
{
    inner: &'a CachingMapInner<K, V, B>,
    keys: Vec<K>,
}

impl<'a, K, V, B> PutAllGuard<'a, K, V, B>
where
    K: Key,
    V: Value,
    B: ObservableMap<K, V> + 'static,
{
    fn new(inner: &'a CachingMapInner<K, V, B>) -> Self {
        Self { inner, keys: vec![] }
    }
}

impl<K, V, B> Drop for PutAllGuard<'_, K, V, B>
where
    K: Key,
    V: Value,
    B: ObservableMap<K, V> + 'static,
{
    fn drop(&mut self) {
        for key in &self.keys {
            self.inner.invalidate_front(key);
            self.inner.control.detach(key);
            self.inner.control.unlock(key);
        }
    }
}

/// Reopens the global gate and drops the global slot.
struct GateGuard<'a, K, V>
where
    K: Key,
    V: Value,
{
    control: &'a ControlMap<K, V>,
}

impl<K, V> Drop for GateGuard<'_, K, V>
where
    K: Key,
    V: Value,
{
    fn drop(&mut self) {
        self.control.detach_global();
        self.control.unlock_all();
    }
}

// ----- inner behavior -------------------------------------------------------

impl<K, V, B> CachingMapInner<K, V, B>
where
    K: Key,
    V: Value,
    B: ObservableMap<K, V> + 'static,
{
    fn resolved_target(&self) -> InvalidationStrategy {
        match self.strategy_target {
            InvalidationStrategy::Auto => InvalidationStrategy::Present,
            target => target,
        }
    }

    fn front_delete_filter() -> Arc<dyn EventFilter<K, V>> {
        Arc::new(CacheEventFilter::new(EventMask::DELETED, true))
    }

    /// Resolve and install the current strategy's listeners on first use.
    fn ensure_strategy(&self) -> Result<InvalidationStrategy> {
        let target = self.resolved_target();
        match target {
            InvalidationStrategy::None => Ok(InvalidationStrategy::None),
            InvalidationStrategy::Present => {
                let mut current = self.strategy_current.lock();
                if *current != InvalidationStrategy::Present {
                    self.front
                        .add_filter_listener(self.front_listener.clone(), Some(Self::front_delete_filter()), true)?;
                    self.back.add_lifecycle_listener(self.deactivation_listener.clone())?;
                    *current = InvalidationStrategy::Present;
                }
                Ok(InvalidationStrategy::Present)
            }
            InvalidationStrategy::All | InvalidationStrategy::Logical => {
                let mut current = self.strategy_current.lock();
                if *current != target {
                    let filter: Option<Arc<dyn EventFilter<K, V>>> = match target {
                        InvalidationStrategy::Logical => {
                            // All, but with synthetic deletes filtered out.
                            Some(Arc::new(NotFilter::new(Arc::new(CacheEventFilter::new(
                                EventMask::DELETED,
                                true,
                            )))))
                        }
                        _ => None,
                    };
                    self.back
                        .add_filter_listener(self.back_listener.clone(), filter, true)?;
                    self.back.add_lifecycle_listener(self.deactivation_listener.clone())?;
                    *current = target;
                }
                Ok(target)
            }
            InvalidationStrategy::Auto => unreachable!("auto resolves to present"),
        }
    }

    fn current_strategy(&self) -> InvalidationStrategy {
        *self.strategy_current.lock()
    }

    /// Drop every listener and clear the front after a back deactivation;
    /// the next operation reinstalls the appropriate listeners.
    fn reset_front_map(&self) {
        let _ = self.front.remove_filter_listener(&self.front_listener);
        if let Err(err) = self.front.clear() {
            tracing::warn!("failed to clear the front map on deactivation: {err}");
        }
        *self.strategy_current.lock() = InvalidationStrategy::None;
    }

    fn register_key_listener(&self, key: &K) -> Result<()> {
        if self.ensure_strategy()? == InvalidationStrategy::Present {
            self.back
                .add_key_listener(self.back_listener.clone(), key.clone(), true)?;
            self.register_listener_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn unregister_key_listener(&self, key: &K) {
        if self.current_strategy() != InvalidationStrategy::Present {
            return;
        }
        if self.control.lock(key, 0).unwrap_or(false) {
            if let Err(err) = self.back.remove_key_listener(&self.back_listener, key) {
                tracing::debug!("failed to deregister the back listener for an evicted key: {err}");
            }
            self.control.unlock(key);
        }
    }

    fn invalidate_front(&self, key: &K) {
        match self.front.remove(key) {
            Ok(Some(_)) => {
                self.unregister_key_listener(key);
                self.invalidation_hits.fetch_add(1, Ordering::Relaxed);
            }
            Ok(None) => {
                self.invalidation_misses.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                tracing::warn!("failed to invalidate the front entry: {err}");
            }
        }
    }

    /// Line an incoming back event up against the in-flight operations: an
    /// attached per-key slot collects it; an active global slot (during
    /// clear/release) collects it; with neither, the front entry is
    /// invalidated. A bounded retry window covers the instant between lock
    /// acquisition and slot attachment on another thread.
    fn validate(&self, event: &EntryEvent<K, V>) {
        let key = &event.key;
        let mut started: Option<Instant> = None;
        let mut spins: u64 = 0;

        loop {
            if self.control.lock(key, 0).unwrap_or(false) {
                match self.control.slot(key).or_else(|| self.control.global_slot()) {
                    None => {
                        if !event.is_priming() {
                            self.invalidate_front(key);
                        }
                    }
                    Some(slot) => slot.append(event.clone()),
                }
                self.control.unlock(key);
                return;
            }

            let slot = self.control.slot(key).or_else(|| self.control.global_slot());
            match slot {
                None => {
                    // The lock holder has not attached its slot yet, or has
                    // just removed it; give it time.
                    thread::yield_now();
                    spins += 1;
                    let started = *started.get_or_insert_with(Instant::now);
                    if spins > 5_000 && started.elapsed() > Duration::from_secs(5) {
                        tracing::error!(
                            "detected control-map state corruption: a locked key has no pending-event slot; \
                             this can be caused by a mutating key or concurrent modification of a bulk \
                             operation's input"
                        );
                        self.invalidate_front(key);
                        return;
                    }
                }
                Some(EventSlot::Ignore) => {
                    // Re-check: the sentinel may have just been swapped for
                    // a collecting slot.
                    let current = self.control.slot(key).or_else(|| self.control.global_slot());
                    if matches!(current, Some(EventSlot::Ignore)) {
                        return;
                    }
                }
                Some(EventSlot::Collect(list)) => {
                    let mut events = list.lock();
                    let this = EventSlot::Collect(list.clone());
                    let still_current = match self.control.slot(key) {
                        Some(slot) => slot.same(&this),
                        None => self
                            .control
                            .global_slot()
                            .map(|slot| slot.same(&this))
                            .unwrap_or(false),
                    };
                    if still_current {
                        events.push(event.clone());
                        return;
                    }
                    // The slot switched while the monitor was being
                    // acquired; retry.
                }
            }
        }
    }

    /// Validate the events collected for a completed back write and update
    /// the front accordingly. The slot is detached under the list monitor
    /// so no event can slip between validation and removal.
    fn finalize_put(&self, key: &K, value: V, slot: EventSlot<K, V>, ttl_millis: i64) -> Result<()> {
        match slot {
            EventSlot::Ignore => {
                // The entry is not in the front and nobody listens for it;
                // nothing to add.
                self.control.detach(key);
                Ok(())
            }
            EventSlot::Collect(list) => {
                let events = list.lock();
                let current = self.current_strategy();

                // The write itself should have generated exactly one
                // natural insert or update; anything else is invalidating.
                let valid = match events.len() {
                    0 => {
                        if strict_back_listener()
                            && (matches!(
                                current,
                                InvalidationStrategy::All | InvalidationStrategy::Logical
                            ) || self.front.contains_key(key))
                        {
                            tracing::warn!(
                                "expected an insert/update event for the written key, but none have been received"
                            );
                            false
                        } else {
                            true
                        }
                    }
                    1 => {
                        matches!(
                            events[0].kind,
                            EntryEventKind::Inserted | EntryEventKind::Updated
                        ) && !events[0].is_synthetic()
                    }
                    _ => false,
                };

                let result = if valid {
                    match self.front.put_with_ttl(key.clone(), value, ttl_millis) {
                        Ok(None) if self.resolved_target() == InvalidationStrategy::Present => {
                            // The entry was evicted behind us, so we have
                            // not been listening to its events for some
                            // time; the value may already be stale.
                            self.front.remove(key).map(|_| ())
                        }
                        Ok(_) => Ok(()),
                        Err(err) => Err(err),
                    }
                } else {
                    self.invalidate_front(key);
                    Ok(())
                };

                self.control.detach(key);
                drop(events);
                result
            }
        }
    }
}

// ----- public surface -------------------------------------------------------

impl<K, V, B> CachingMap<K, V, B>
where
    K: Key,
    V: Value,
    B: ObservableMap<K, V> + 'static,
{
    pub fn new(front: LocalCache<K, V>, back: Arc<B>, strategy: InvalidationStrategy) -> Self {
        let priming = matches!(
            strategy,
            InvalidationStrategy::Present | InvalidationStrategy::Auto
        );
        let inner = Arc::new_cyclic(|weak: &Weak<CachingMapInner<K, V, B>>| CachingMapInner {
            front,
            back,
            control: ControlMap::new(),
            strategy_target: strategy,
            strategy_current: Mutex::new(InvalidationStrategy::None),
            back_listener: Arc::new(BackListener {
                inner: weak.clone(),
                priming,
            }),
            front_listener: Arc::new(FrontListener { inner: weak.clone() }),
            deactivation_listener: Arc::new(BackDeactivationListener { inner: weak.clone() }),
            stats: CacheStatistics::new(),
            invalidation_hits: AtomicU64::new(0),
            invalidation_misses: AtomicU64::new(0),
            register_listener_count: AtomicU64::new(0),
            released: AtomicBool::new(false),
        });
        Self { inner }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.inner.released.load(Ordering::Relaxed) {
            Err(Error::state("cache is not active"))
        } else {
            Ok(())
        }
    }

    pub fn front(&self) -> &LocalCache<K, V> {
        &self.inner.front
    }

    pub fn back(&self) -> &Arc<B> {
        &self.inner.back
    }

    pub fn strategy(&self) -> InvalidationStrategy {
        self.inner.strategy_target
    }

    /// Whether an invalidation listener is currently installed, i.e. the
    /// front is being kept coherent with the back.
    pub fn is_coherent(&self) -> bool {
        self.inner.current_strategy() != InvalidationStrategy::None
    }

    pub fn statistics(&self) -> &CacheStatistics {
        &self.inner.stats
    }

    pub fn invalidation_hits(&self) -> u64 {
        self.inner.invalidation_hits.load(Ordering::Relaxed)
    }

    pub fn invalidation_misses(&self) -> u64 {
        self.inner.invalidation_misses.load(Ordering::Relaxed)
    }

    pub fn total_register_listener(&self) -> u64 {
        self.inner.register_listener_count.load(Ordering::Relaxed)
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.ensure_active()?;
        let inner = &self.inner;

        // Avoid the control map entirely on a front hit.
        if let Some(value) = inner.front.get(key)? {
            inner.stats.register_hit();
            return Ok(Some(value));
        }

        inner.control.lock(key, -1)?;
        let guard = KeyGuard::new(&inner.control, key);

        if let Some(value) = inner.front.get(key)? {
            inner.stats.register_hit();
            return Ok(Some(value));
        }

        let value = if inner.resolved_target() == InvalidationStrategy::None {
            let value = inner.back.get(key)?;
            if let Some(value) = &value {
                inner.front.put(key.clone(), value.clone())?;
            }
            value
        } else {
            let (slot, list) = EventSlot::collect();
            inner.control.attach(key.clone(), slot);
            inner.register_key_listener(key)?;

            // The registration may have primed us with the current value,
            // making the back read unnecessary.
            let mut primed = false;
            let mut value: Option<V> = None;
            {
                let mut events = list.lock();
                if events.last().map(|event| event.is_priming()).unwrap_or(false) {
                    if let Some(event) = events.pop() {
                        value = event.new;
                        primed = true;
                    }
                }
            }

            if !primed {
                match inner.back.get(key) {
                    Ok(read) => value = read,
                    Err(err) => {
                        inner.unregister_key_listener(key);
                        return Err(err);
                    }
                }
            }

            {
                let events = list.lock();
                match &value {
                    None => {
                        // Absent values are not cached; stop listening.
                        inner.unregister_key_listener(key);
                    }
                    Some(read) => {
                        // The read itself can generate only a synthetic
                        // insert; anything else means a concurrent writer
                        // got in and the value cannot be cached safely.
                        let valid = match events.len() {
                            0 => true,
                            1 => {
                                events[0].kind == EntryEventKind::Inserted && events[0].is_synthetic()
                            }
                            _ => false,
                        };
                        if valid {
                            if let Err(err) = inner.front.put(key.clone(), read.clone()) {
                                inner.control.detach(key);
                                drop(events);
                                return Err(err);
                            }
                        } else {
                            inner.unregister_key_listener(key);
                            inner.invalidation_hits.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                // Detach while holding the list monitor, or a late event
                // could be appended to a list nobody will read.
                inner.control.detach(key);
            }
            value
        };

        inner.stats.register_miss();
        drop(guard);
        Ok(value)
    }

    /// Bulk read: the front-hit subset is served first, as many missing
    /// keys as possible are locked non-blockingly, and only event-observed
    /// keys are populated into the front. Unlockable keys are served from
    /// the back without caching.
    pub fn get_all(&self, keys: &[K]) -> Result<HashMap<K, V>> {
        self.ensure_active()?;
        let inner = &self.inner;

        let mut result = inner.front.get_all(keys)?;
        if !result.is_empty() {
            inner.stats.register_hits(result.len() as u64);
        }

        let mut miss_set: HashSet<K> = keys.iter().filter(|key| !result.contains_key(key)).cloned().collect();
        if miss_set.is_empty() {
            return Ok(result);
        }
        let miss_count = miss_set.len() as u64;

        let strategy = inner.ensure_strategy()?;
        let (shared_slot, shared_list) = EventSlot::collect();

        let mut guard = MultiKeyGuard::new(&inner.control);
        for key in &miss_set {
            if inner.control.lock(key, 0)? {
                if strategy != InvalidationStrategy::None {
                    inner.control.attach(key.clone(), shared_slot.clone());
                }
                guard.keys.push(key.clone());
            }
        }

        if strategy == InvalidationStrategy::Present {
            // Register listeners; priming events may hand us values without
            // a back read.
            for key in &guard.keys {
                inner
                    .back
                    .add_key_listener(inner.back_listener.clone(), key.clone(), true)?;
                inner.register_listener_count.fetch_add(1, Ordering::Relaxed);
            }

            let mut events = shared_list.lock();
            let mut index = events.len();
            while index > 0 {
                index -= 1;
                if events[index].is_priming() {
                    let event = events.remove(index);
                    miss_set.remove(&event.key);
                    if let Some(value) = event.new {
                        result.insert(event.key, value);
                    }
                }
            }
        }

        if !miss_set.is_empty() {
            let miss_keys: Vec<K> = miss_set.iter().cloned().collect();
            match inner.back.get_all(&miss_keys) {
                Ok(values) => result.extend(values),
                Err(err) => {
                    if strategy == InvalidationStrategy::Present {
                        for key in &guard.keys {
                            inner.unregister_key_listener(key);
                        }
                    }
                    return Err(err);
                }
            }
        }

        if strategy == InvalidationStrategy::None {
            for key in &guard.keys {
                if let Some(value) = result.get(key) {
                    inner.front.put(key.clone(), value.clone())?;
                }
            }
        } else {
            // Remove entries invalidated during the bulk read: the read
            // itself can generate at most one synthetic insert per key, so
            // a second event for a key is always an invalidation.
            let mut invalid: HashSet<K> = HashSet::new();
            let mut addable: HashSet<K> = guard.keys.iter().cloned().collect();

            let events = shared_list.lock();
            for event in events.iter() {
                let valid = addable.remove(&event.key)
                    && event.kind == EntryEventKind::Inserted
                    && event.is_synthetic();
                if !valid {
                    invalid.insert(event.key.clone());
                    inner.invalidation_hits.fetch_add(1, Ordering::Relaxed);
                }
            }

            for key in &guard.keys {
                match result.get(key) {
                    Some(value) if !invalid.contains(key) => {
                        inner.front.put(key.clone(), value.clone())?;
                    }
                    _ => {
                        let _ = inner.front.remove(key);
                        inner.unregister_key_listener(key);
                    }
                }
                // Under the list monitor, as in the single-key path.
                inner.control.detach(key);
            }
            drop(events);
        }

        inner.stats.register_misses(miss_count);
        Ok(result)
    }

    pub fn put(&self, key: K, value: V) -> Result<Option<V>> {
        self.put_with_ttl(key, value, EXPIRY_DEFAULT)
    }

    pub fn put_with_ttl(&self, key: K, value: V, ttl_millis: i64) -> Result<Option<V>> {
        self.ensure_active()?;
        let inner = &self.inner;

        inner.control.lock(&key, -1)?;
        let guard = KeyGuard::new(&inner.control, &key);

        // A put never registers a new key listener: that would double the
        // number of synchronous network operations, and "get(a), put(a)" is
        // a more likely sequence than "put(a), get(a)".
        let front_value = inner.front.get(&key)?;

        let slot = if inner.resolved_target() != InvalidationStrategy::None {
            let current = inner.current_strategy();
            let slot = if front_value.is_some()
                || matches!(
                    current,
                    InvalidationStrategy::All | InvalidationStrategy::Logical
                ) {
                // Already registered for events covering this key; cache
                // the new value once the write's own event confirms it.
                EventSlot::collect().0
            } else {
                EventSlot::Ignore
            };
            inner.control.attach(key.clone(), slot.clone());
            Some(slot)
        } else {
            None
        };

        let orig = match inner.back.put_with_ttl(key.clone(), value.clone(), ttl_millis) {
            Ok(orig) => orig,
            Err(err) => {
                // The state of the back is unknown; invalidate this key on
                // the front before propagating.
                inner.control.detach(&key);
                inner.invalidate_front(&key);
                return Err(err);
            }
        };

        match slot {
            None => {
                // Not validating; simply update the front.
                inner.front.put_with_ttl(key.clone(), value, ttl_millis)?;
            }
            Some(slot) => inner.finalize_put(&key, value, slot, ttl_millis)?,
        }

        inner.stats.register_put();
        drop(guard);
        Ok(orig)
    }

    /// Bulk write: lock what can be locked without blocking, push everything
    /// to the back in one call, then validate and update the front per key.
    /// Unlockable keys are pushed to the back only.
    pub fn put_all(&self, entries: Vec<(K, V)>) -> Result<()> {
        self.ensure_active()?;
        if entries.len() == 1 {
            let mut entries = entries;
            let (key, value) = entries.swap_remove(0);
            self.put(key, value)?;
            return Ok(());
        }

        let inner = &self.inner;
        let target = inner.resolved_target();
        let current = inner.current_strategy();
        let all_registered = matches!(
            current,
            InvalidationStrategy::All | InvalidationStrategy::Logical
        );

        let total = entries.len() as u64;
        let mut locked: HashMap<K, V> = HashMap::new();
        let mut unlockable: Vec<K> = Vec::new();
        let mut guard = PutAllGuard::new(inner);

        for (key, value) in &entries {
            if locked.contains_key(key) {
                // Duplicate key in the input; the lock and slot are already
                // in place, only the value to cache changes.
                locked.insert(key.clone(), value.clone());
                continue;
            }
            if inner.control.lock(key, 0)? {
                if target != InvalidationStrategy::None {
                    let slot = if all_registered || inner.front.contains_key(key) {
                        EventSlot::collect().0
                    } else {
                        EventSlot::Ignore
                    };
                    inner.control.attach(key.clone(), slot);
                }
                guard.keys.push(key.clone());
                locked.insert(key.clone(), value.clone());
            } else {
                // Pushed to the back only; event validation (or the manual
                // cleanup below for the none strategy) handles the front.
                unlockable.push(key.clone());
            }
        }

        let write = inner.back.put_all(entries);
        if write.is_err() || target == InvalidationStrategy::None {
            // Without events there is nothing to clean the front for the
            // keys we could not lock; do it manually. The locked keys are
            // invalidated by the guard when the error propagates: the state
            // of the back is unknown and the write may have partially
            // applied.
            for key in &unlockable {
                let _ = inner.front.remove(key);
            }
        }
        write?;

        if target == InvalidationStrategy::None {
            while let Some(key) = guard.keys.last().cloned() {
                if let Some(value) = locked.get(&key) {
                    inner.front.put(key.clone(), value.clone())?;
                }
                inner.control.unlock(&key);
                guard.keys.pop();
            }
        } else {
            while let Some(key) = guard.keys.last().cloned() {
                let slot = inner.control.slot(&key).ok_or_else(|| {
                    Error::state(
                        "encountered an unexpected key; this may be caused by concurrent modification \
                         of the supplied entries, or by an inconsistent hash or equality implementation",
                    )
                })?;
                let value = locked.remove(&key).ok_or_else(|| {
                    Error::state("locked key missing from the supplied entries")
                })?;
                inner.finalize_put(&key, value, slot, EXPIRY_DEFAULT)?;
                inner.control.unlock(&key);
                guard.keys.pop();
            }
        }

        inner.stats.register_puts(total);
        Ok(())
    }

    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        self.ensure_active()?;
        let inner = &self.inner;

        inner.control.lock(key, -1)?;
        let guard = KeyGuard::new(&inner.control, key);

        if inner.resolved_target() != InvalidationStrategy::None {
            inner.control.attach(key.clone(), EventSlot::Ignore);
        }

        if inner.front.remove(key)?.is_some() {
            inner.unregister_key_listener(key);
        }

        let removed = inner.back.remove(key);
        drop(guard);
        removed
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        self.ensure_active()?;
        let inner = &self.inner;

        if inner.front.contains_key(key) {
            inner.stats.register_hit();
            return Ok(true);
        }

        inner.control.lock(key, -1)?;
        let guard = KeyGuard::new(&inner.control, key);

        if inner.front.contains_key(key) {
            inner.stats.register_hit();
            return Ok(true);
        }

        inner.control.attach(key.clone(), EventSlot::Ignore);
        inner.stats.register_miss();
        let contained = inner.back.contains_key(key);
        drop(guard);
        contained
    }

    /// Clear both tiers. A blocking lock-all would make the event delivery
    /// path spin while the gate is closing, so the gate is taken with
    /// bounded non-blocking attempts; if they are exhausted, the back is
    /// cleared and its events are left to clean the front.
    pub fn clear(&self) -> Result<()> {
        self.ensure_active()?;
        let inner = &self.inner;

        let mut closed = false;
        for _ in 0..100 {
            if inner.control.lock_all(0) {
                closed = true;
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        if !closed {
            inner.back.clear()?;
            if inner.resolved_target() == InvalidationStrategy::None {
                inner.front.clear()?;
            }
            return Ok(());
        }

        let guard = GateGuard { control: &inner.control };
        inner.control.attach_global(EventSlot::Ignore);

        match inner.current_strategy() {
            InvalidationStrategy::Present => {
                let _ = inner.front.remove_filter_listener(&inner.front_listener);
                let unregister: Result<()> = (|| {
                    for key in inner.front.key_set() {
                        inner.back.remove_key_listener(&inner.back_listener, &key)?;
                        inner.front.remove(&key)?;
                    }
                    Ok(())
                })();
                if let Err(err) = unregister {
                    // The strategy is not being reset, so the front
                    // listener must stay around.
                    let _ = inner.front.add_filter_listener(
                        inner.front_listener.clone(),
                        Some(CachingMapInner::<K, V, B>::front_delete_filter()),
                        true,
                    );
                    return Err(err);
                }
            }
            InvalidationStrategy::All | InvalidationStrategy::Logical => {
                inner.back.remove_filter_listener(&inner.back_listener)?;
                inner.front.clear()?;
            }
            _ => {
                inner.front.clear()?;
            }
        }
        *inner.strategy_current.lock() = InvalidationStrategy::None;

        inner.back.clear()?;
        drop(guard);
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        self.ensure_active()?;
        self.inner.back.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn key_set(&self) -> Result<Vec<K>> {
        self.ensure_active()?;
        self.inner.back.key_set()
    }

    pub fn values(&self) -> Result<Vec<V>> {
        self.ensure_active()?;
        self.inner.back.values()
    }

    pub fn entry_set(&self) -> Result<Vec<(K, V)>> {
        self.ensure_active()?;
        self.inner.back.entry_set()
    }

    /// Release the cache. Fails if other threads are actively using it.
    pub fn release(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.control.lock_all(0) {
            // A blocking lock-all would make the event path spin; and
            // unlike clear there is no benefit in retrying, as any other
            // active thread makes the release itself an error.
            return Err(Error::state("cache is in active use by other threads"));
        }
        let guard = GateGuard { control: &inner.control };
        inner.control.attach_global(EventSlot::Ignore);

        match inner.current_strategy() {
            InvalidationStrategy::Present => {
                let _ = inner.front.remove_filter_listener(&inner.front_listener);
                for key in inner.front.key_set() {
                    let _ = inner.back.remove_key_listener(&inner.back_listener, &key);
                }
            }
            InvalidationStrategy::All | InvalidationStrategy::Logical => {
                let _ = inner.back.remove_filter_listener(&inner.back_listener);
            }
            _ => {}
        }
        let _ = inner.back.remove_lifecycle_listener(&inner.deactivation_listener);

        inner.front.release();
        *inner.strategy_current.lock() = InvalidationStrategy::None;
        inner.released.store(true, Ordering::Relaxed);
        drop(guard);
        Ok(())
    }
}

impl<K, V, B> CacheMap<K, V> for CachingMap<K, V, B>
where
    K: Key,
    V: Value,
    B: ObservableMap<K, V> + 'static,
{
    fn get(&self, key: &K) -> Result<Option<V>> {
        CachingMap::get(self, key)
    }

    fn get_all(&self, keys: &[K]) -> Result<HashMap<K, V>> {
        CachingMap::get_all(self, keys)
    }

    fn put_with_ttl(&self, key: K, value: V, ttl_millis: i64) -> Result<Option<V>> {
        CachingMap::put_with_ttl(self, key, value, ttl_millis)
    }

    fn put_all(&self, entries: Vec<(K, V)>) -> Result<()> {
        CachingMap::put_all(self, entries)
    }

    fn remove(&self, key: &K) -> Result<Option<V>> {
        CachingMap::remove(self, key)
    }

    fn contains_key(&self, key: &K) -> Result<bool> {
        CachingMap::contains_key(self, key)
    }

    fn len(&self) -> Result<usize> {
        CachingMap::len(self)
    }

    fn clear(&self) -> Result<()> {
        CachingMap::clear(self)
    }

    fn key_set(&self) -> Result<Vec<K>> {
        CachingMap::key_set(self)
    }

    fn values(&self) -> Result<Vec<V>> {
        CachingMap::values(self)
    }

    fn entry_set(&self) -> Result<Vec<(K, V)>> {
        CachingMap::entry_set(self)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use anteroom_common::error::Result;
    use anteroom_memory::LocalCacheBuilder;

    use super::*;

    type TestBack = LocalCache<String, String>;
    type TestNear<B> = CachingMap<String, String, B>;

    fn front() -> LocalCache<String, String> {
        LocalCacheBuilder::new()
            .with_high_units(100)
            .with_expiry_delay(0)
            .with_flush_delay(0)
            .build()
    }

    fn back() -> Arc<TestBack> {
        Arc::new(
            LocalCacheBuilder::new()
                .with_high_units(0)
                .with_expiry_delay(0)
                .with_flush_delay(0)
                .build(),
        )
    }

    fn near(strategy: InvalidationStrategy) -> (TestNear<TestBack>, Arc<TestBack>) {
        let back = back();
        (CachingMap::new(front(), back.clone(), strategy), back)
    }

    fn k(key: &str) -> String {
        key.to_string()
    }

    /// Delegating back tier that counts single-key reads and can be made to
    /// fail bulk writes.
    struct CountingBack {
        cache: TestBack,
        gets: AtomicUsize,
        fail_put_all: AtomicBool,
    }

    impl CountingBack {
        fn new() -> Self {
            Self {
                cache: LocalCacheBuilder::new()
                    .with_high_units(0)
                    .with_expiry_delay(0)
                    .with_flush_delay(0)
                    .build(),
                gets: AtomicUsize::new(0),
                fail_put_all: AtomicBool::new(false),
            }
        }
    }

    impl CacheMap<String, String> for CountingBack {
        fn get(&self, key: &String) -> Result<Option<String>> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.cache.get(key)
        }

        fn put_with_ttl(&self, key: String, value: String, ttl_millis: i64) -> Result<Option<String>> {
            self.cache.put_with_ttl(key, value, ttl_millis)
        }

        fn put_all(&self, entries: Vec<(String, String)>) -> Result<()> {
            if self.fail_put_all.load(Ordering::SeqCst) {
                return Err(Error::back_store(anyhow::anyhow!("bulk write failed")));
            }
            self.cache.put_all(entries)
        }

        fn remove(&self, key: &String) -> Result<Option<String>> {
            self.cache.remove(key)
        }

        fn contains_key(&self, key: &String) -> Result<bool> {
            Ok(self.cache.contains_key(key))
        }

        fn len(&self) -> Result<usize> {
            Ok(self.cache.len())
        }

        fn clear(&self) -> Result<()> {
            self.cache.clear()
        }

        fn key_set(&self) -> Result<Vec<String>> {
            Ok(self.cache.key_set())
        }

        fn values(&self) -> Result<Vec<String>> {
            Ok(self.cache.values())
        }

        fn entry_set(&self) -> Result<Vec<(String, String)>> {
            Ok(self.cache.entry_set())
        }
    }

    impl ObservableMap<String, String> for CountingBack {
        fn add_listener(&self, listener: Arc<dyn MapListener<String, String>>, lite: bool) -> Result<()> {
            self.cache.add_listener(listener, lite)
        }

        fn remove_listener(&self, listener: &Arc<dyn MapListener<String, String>>) -> Result<()> {
            self.cache.remove_listener(listener)
        }

        fn add_key_listener(
            &self,
            listener: Arc<dyn MapListener<String, String>>,
            key: String,
            lite: bool,
        ) -> Result<()> {
            self.cache.add_key_listener(listener, key, lite)
        }

        fn remove_key_listener(&self, listener: &Arc<dyn MapListener<String, String>>, key: &String) -> Result<()> {
            self.cache.remove_key_listener(listener, key)
        }

        fn add_filter_listener(
            &self,
            listener: Arc<dyn MapListener<String, String>>,
            filter: Option<Arc<dyn EventFilter<String, String>>>,
            lite: bool,
        ) -> Result<()> {
            self.cache.add_filter_listener(listener, filter, lite)
        }

        fn remove_filter_listener(&self, listener: &Arc<dyn MapListener<String, String>>) -> Result<()> {
            self.cache.remove_filter_listener(listener)
        }

        fn add_lifecycle_listener(&self, listener: Arc<dyn LifecycleListener>) -> Result<()> {
            self.cache.add_lifecycle_listener(listener)
        }

        fn remove_lifecycle_listener(&self, listener: &Arc<dyn LifecycleListener>) -> Result<()> {
            self.cache.remove_lifecycle_listener(listener)
        }
    }

    #[test_log::test]
    fn test_priming_get_skips_back_read() {
        let back = Arc::new(CountingBack::new());
        back.cache.put(k("k"), k("v")).unwrap();

        let near: TestNear<CountingBack> = CachingMap::new(front(), back.clone(), InvalidationStrategy::Present);

        assert_eq!(near.get(&k("k")).unwrap(), Some(k("v")));
        assert_eq!(
            back.gets.load(Ordering::SeqCst),
            0,
            "the priming event supplies the value; no back read"
        );
        assert_eq!(near.front().peek(&k("k")), Some(k("v")));
        assert_eq!(back.cache.key_listener_count(&k("k")), 1);
        assert_eq!(near.total_register_listener(), 1);

        // Second read is a pure front hit.
        assert_eq!(near.get(&k("k")).unwrap(), Some(k("v")));
        assert_eq!(back.gets.load(Ordering::SeqCst), 0);
    }

    /// Non-priming adapter: forces the near tier down the real back-read
    /// path, and mutates the key behind the reader's back.
    struct NoPrime {
        inner: Arc<dyn MapListener<String, String>>,
    }

    impl MapListener<String, String> for NoPrime {
        fn on_event(&self, event: &EntryEvent<String, String>) {
            self.inner.on_event(event);
        }

        fn is_synchronous(&self) -> bool {
            self.inner.is_synchronous()
        }
    }

    struct RacingBack {
        cache: TestBack,
        raced: AtomicBool,
    }

    impl RacingBack {
        fn new() -> Self {
            Self {
                cache: LocalCacheBuilder::new()
                    .with_high_units(0)
                    .with_expiry_delay(0)
                    .with_flush_delay(0)
                    .build(),
                raced: AtomicBool::new(false),
            }
        }
    }

    impl CacheMap<String, String> for RacingBack {
        fn get(&self, key: &String) -> Result<Option<String>> {
            let value = self.cache.get(key)?;
            if !self.raced.swap(true, Ordering::SeqCst) {
                // A concurrent writer updates the key after the read but
                // before the reader validates.
                self.cache.put(k("k"), k("w"))?;
            }
            Ok(value)
        }

        fn put_with_ttl(&self, key: String, value: String, ttl_millis: i64) -> Result<Option<String>> {
            self.cache.put_with_ttl(key, value, ttl_millis)
        }

        fn remove(&self, key: &String) -> Result<Option<String>> {
            self.cache.remove(key)
        }

        fn contains_key(&self, key: &String) -> Result<bool> {
            Ok(self.cache.contains_key(key))
        }

        fn len(&self) -> Result<usize> {
            Ok(self.cache.len())
        }

        fn clear(&self) -> Result<()> {
            self.cache.clear()
        }

        fn key_set(&self) -> Result<Vec<String>> {
            Ok(self.cache.key_set())
        }

        fn values(&self) -> Result<Vec<String>> {
            Ok(self.cache.values())
        }

        fn entry_set(&self) -> Result<Vec<(String, String)>> {
            Ok(self.cache.entry_set())
        }
    }

    impl ObservableMap<String, String> for RacingBack {
        fn add_listener(&self, listener: Arc<dyn MapListener<String, String>>, lite: bool) -> Result<()> {
            self.cache.add_listener(listener, lite)
        }

        fn remove_listener(&self, listener: &Arc<dyn MapListener<String, String>>) -> Result<()> {
            self.cache.remove_listener(listener)
        }

        fn add_key_listener(
            &self,
            listener: Arc<dyn MapListener<String, String>>,
            key: String,
            lite: bool,
        ) -> Result<()> {
            self.cache
                .add_key_listener(Arc::new(NoPrime { inner: listener }), key, lite)
        }

        fn remove_key_listener(&self, listener: &Arc<dyn MapListener<String, String>>, key: &String) -> Result<()> {
            self.cache.remove_key_listener(listener, key)
        }

        fn add_filter_listener(
            &self,
            listener: Arc<dyn MapListener<String, String>>,
            filter: Option<Arc<dyn EventFilter<String, String>>>,
            lite: bool,
        ) -> Result<()> {
            self.cache.add_filter_listener(listener, filter, lite)
        }

        fn remove_filter_listener(&self, listener: &Arc<dyn MapListener<String, String>>) -> Result<()> {
            self.cache.remove_filter_listener(listener)
        }

        fn add_lifecycle_listener(&self, listener: Arc<dyn LifecycleListener>) -> Result<()> {
            self.cache.add_lifecycle_listener(listener)
        }

        fn remove_lifecycle_listener(&self, listener: &Arc<dyn LifecycleListener>) -> Result<()> {
            self.cache.remove_lifecycle_listener(listener)
        }
    }

    #[test_log::test]
    fn test_invalidation_race_declines_to_cache() {
        let back = Arc::new(RacingBack::new());
        back.cache.put(k("k"), k("v")).unwrap();

        let near: TestNear<RacingBack> = CachingMap::new(front(), back.clone(), InvalidationStrategy::Present);

        // The reader sees the pre-race value but must not cache it.
        assert_eq!(near.get(&k("k")).unwrap(), Some(k("v")));
        assert_eq!(near.invalidation_hits(), 1);
        assert!(!near.front().contains_key(&k("k")));

        // The next read observes the concurrent writer's value.
        assert_eq!(near.get(&k("k")).unwrap(), Some(k("w")));
    }

    #[test_log::test]
    fn test_present_listener_set_tracks_front_keyset() {
        let (near, back) = near(InvalidationStrategy::Present);
        back.put(k("k1"), k("v1")).unwrap();
        back.put(k("k2"), k("v2")).unwrap();

        near.get(&k("k1")).unwrap();
        near.get(&k("k2")).unwrap();
        assert_eq!(back.key_listener_count(&k("k1")), 1);
        assert_eq!(back.key_listener_count(&k("k2")), 1);

        // A front eviction deregisters the matching back listener.
        near.front().evict(&k("k1"));
        assert_eq!(back.key_listener_count(&k("k1")), 0);
        assert_eq!(back.key_listener_count(&k("k2")), 1);

        // An explicit remove does too.
        near.remove(&k("k2")).unwrap();
        assert_eq!(back.key_listener_count(&k("k2")), 0);
    }

    #[test_log::test]
    fn test_all_strategy_global_listener_and_invalidation() {
        let (near, back) = near(InvalidationStrategy::All);
        back.put(k("k"), k("v")).unwrap();

        near.get(&k("k")).unwrap();
        near.get(&k("other")).unwrap();
        assert_eq!(back.filter_listener_count(), 1, "exactly one global filter listener");
        assert!(near.front().contains_key(&k("k")));

        // A back update invalidates the front entry.
        back.put(k("k"), k("w")).unwrap();
        assert!(!near.front().contains_key(&k("k")));
        assert_eq!(near.get(&k("k")).unwrap(), Some(k("w")));

        // A synthetic delete (expiry/eviction on the back) invalidates too.
        back.evict(&k("k"));
        assert!(!near.front().contains_key(&k("k")));
    }

    #[test_log::test]
    fn test_logical_strategy_filters_synthetic_deletes() {
        let (near, back) = near(InvalidationStrategy::Logical);
        back.put(k("k"), k("v")).unwrap();

        near.get(&k("k")).unwrap();
        assert!(near.front().contains_key(&k("k")));

        // Synthetic delete on the back: logically the data still exists
        // elsewhere, so the front keeps its copy.
        back.evict(&k("k"));
        assert!(near.front().contains_key(&k("k")));

        // A natural delete does invalidate.
        back.put(k("k2"), k("v2")).unwrap();
        near.get(&k("k2")).unwrap();
        back.remove(&k("k2")).unwrap();
        assert!(!near.front().contains_key(&k("k2")));
    }

    #[test_log::test]
    fn test_none_strategy_trusts_front() {
        let (near, back) = near(InvalidationStrategy::None);
        back.put(k("k"), k("v")).unwrap();

        assert_eq!(near.get(&k("k")).unwrap(), Some(k("v")));
        assert!(near.front().contains_key(&k("k")));
        assert!(!near.is_coherent());

        // Nothing invalidates the front on a direct back update.
        back.put(k("k"), k("w")).unwrap();
        assert_eq!(near.get(&k("k")).unwrap(), Some(k("v")));
    }

    #[test_log::test]
    fn test_put_updates_front_for_tracked_key() {
        let (near, back) = near(InvalidationStrategy::Present);
        back.put(k("k"), k("v")).unwrap();
        near.get(&k("k")).unwrap();

        let orig = near.put(k("k"), k("w")).unwrap();
        assert_eq!(orig, Some(k("v")));
        assert_eq!(near.front().peek(&k("k")), Some(k("w")));
        assert_eq!(back.peek(&k("k")), Some(k("w")));
    }

    #[test_log::test]
    fn test_put_defers_registration_for_untracked_key() {
        let (near, back) = near(InvalidationStrategy::Present);

        near.put(k("fresh"), k("v")).unwrap();
        assert_eq!(back.peek(&k("fresh")), Some(k("v")));
        // Registration is deferred until the first read.
        assert!(!near.front().contains_key(&k("fresh")));
        assert_eq!(back.key_listener_count(&k("fresh")), 0);

        assert_eq!(near.get(&k("fresh")).unwrap(), Some(k("v")));
        assert!(near.front().contains_key(&k("fresh")));
        assert_eq!(back.key_listener_count(&k("fresh")), 1);
    }

    #[test_log::test]
    fn test_put_all_and_get_all() {
        let (near, back) = near(InvalidationStrategy::Present);

        let entries: Vec<(String, String)> = (0..8).map(|i| (format!("k{i}"), format!("v{i}"))).collect();
        near.put_all(entries.clone()).unwrap();
        assert_eq!(back.len(), 8);

        let keys: Vec<String> = entries.iter().map(|(key, _)| key.clone()).collect();
        let result = near.get_all(&keys).unwrap();
        assert_eq!(result.len(), 8);
        for (key, value) in &entries {
            assert_eq!(result.get(key), Some(value));
            assert!(near.front().contains_key(key), "bulk read must populate the front");
            assert_eq!(back.key_listener_count(key), 1);
        }
    }

    #[test_log::test]
    fn test_put_all_failure_invalidates_locked_front_entries() {
        let back = Arc::new(CountingBack::new());
        back.cache.put(k("k1"), k("v1")).unwrap();
        back.cache.put(k("k2"), k("v2")).unwrap();

        let near: TestNear<CountingBack> = CachingMap::new(front(), back.clone(), InvalidationStrategy::Present);
        near.get(&k("k1")).unwrap();
        near.get(&k("k2")).unwrap();
        assert!(near.front().contains_key(&k("k1")));
        assert!(near.front().contains_key(&k("k2")));

        back.fail_put_all.store(true, Ordering::SeqCst);
        let result = near.put_all(vec![(k("k1"), k("w1")), (k("k2"), k("w2"))]);
        assert!(matches!(result, Err(Error::BackStore(_))));

        // The bulk write may have partially applied before failing; the
        // stale front copies must be gone.
        assert!(!near.front().contains_key(&k("k1")));
        assert!(!near.front().contains_key(&k("k2")));
        assert_eq!(near.invalidation_hits(), 2);
    }

    #[test_log::test]
    fn test_remove_clears_both_tiers() {
        let (near, back) = near(InvalidationStrategy::Present);
        back.put(k("k"), k("v")).unwrap();
        near.get(&k("k")).unwrap();

        assert_eq!(near.remove(&k("k")).unwrap(), Some(k("v")));
        assert!(!near.front().contains_key(&k("k")));
        assert!(!back.contains_key(&k("k")));
        assert_eq!(back.key_listener_count(&k("k")), 0);
        assert!(!near.contains_key(&k("k")).unwrap());
    }

    #[test_log::test]
    fn test_clear_clears_both_tiers_and_listeners() {
        let (near, back) = near(InvalidationStrategy::Present);
        back.put(k("k1"), k("v1")).unwrap();
        back.put(k("k2"), k("v2")).unwrap();
        near.get(&k("k1")).unwrap();
        near.get(&k("k2")).unwrap();

        near.clear().unwrap();
        assert!(near.front().is_empty());
        assert_eq!(near.len().unwrap(), 0);
        assert_eq!(back.key_listener_count(&k("k1")), 0);
        assert_eq!(back.key_listener_count(&k("k2")), 0);

        // A second clear is a no-op.
        near.clear().unwrap();
        assert_eq!(near.len().unwrap(), 0);
    }

    #[test_log::test]
    fn test_release_makes_operations_fail() {
        let (near, _back) = near(InvalidationStrategy::Present);
        near.release().unwrap();
        assert!(matches!(near.get(&k("k")), Err(Error::State(_))));
        assert!(matches!(near.put(k("k"), k("v")), Err(Error::State(_))));
    }

    #[test_log::test]
    fn test_truncate_resets_strategy_and_front() {
        let (near, back) = near(InvalidationStrategy::Present);
        back.put(k("k"), k("v")).unwrap();
        near.get(&k("k")).unwrap();
        assert!(near.is_coherent());

        back.truncate();
        assert!(near.front().is_empty());
        assert!(!near.is_coherent());

        // The next operation reinstalls the listeners.
        back.put(k("k"), k("v2")).unwrap();
        assert_eq!(near.get(&k("k")).unwrap(), Some(k("v2")));
        assert!(near.is_coherent());
    }

    #[test_log::test]
    fn test_concurrent_access_stays_coherent() {
        let (near, back) = near(InvalidationStrategy::Present);
        let near = Arc::new(near);

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let near = near.clone();
                thread::spawn(move || {
                    for i in 0..200u32 {
                        let key = format!("k{}", (worker * 7 + i) % 8);
                        if i % 3 == 0 {
                            near.put(key, format!("{worker}:{i}")).unwrap();
                        } else {
                            near.get(&key).unwrap();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Whatever remains cached in the front must match the back.
        for key in near.front().key_set() {
            assert_eq!(near.front().peek(&key), back.peek(&key), "front diverged for {key}");
        }
    }
}
