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
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Weak,
    },
    thread,
};

use anteroom_common::{
    clock::{Clock, SystemClock},
    code::{Key, Value},
    error::{Error, Result},
    event::{EntryEvent, EntryFilter, EventMask, MapEventFilter},
    listener::ListenerSupport,
    map::{CacheMap, LifecycleEvent, LifecycleListener, MapListener, ObservableMap},
};
use itertools::Itertools;
use parking_lot::{Mutex, RwLock};

/// Synchronization state of a continuous query view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ViewState {
    Disconnected,
    /// Listeners are being registered and the initial query is running;
    /// observed events are buffered for reconciliation.
    Configuring,
    /// The initial query completed; the buffered events are being
    /// reconciled against the back.
    Configured,
    /// The view is live: events update it directly.
    Synchronized,
}

type Transformer<K, V> = Arc<dyn Fn(&K, &V) -> V + Send + Sync>;

struct SyncState<K> {
    state: ViewState,
    /// Keys whose events were observed during configuration and need a
    /// re-read from the back once the initial query completes.
    pending: Option<HashSet<K>>,
}

enum QueueTask<K, V> {
    Dispatch(EntryEvent<K, V>),
    Shutdown,
}

struct QueueState<K, V> {
    tx: flume::Sender<QueueTask<K, V>>,
    worker: Option<thread::JoinHandle<()>>,
}

struct ViewInner<K, V, B>
where
    K: Key,
    V: Value,
    B: ObservableMap<K, V> + 'static,
{
    back: Arc<B>,
    filter: Arc<dyn EntryFilter<K, V>>,
    transformer: Option<Transformer<K, V>>,
    cache_values: bool,
    read_only: AtomicBool,
    reconnect_millis: i64,
    clock: Arc<dyn Clock>,

    sync: Mutex<SyncState<K>>,
    /// Serializes configuration passes; never held across listener
    /// callbacks.
    config_monitor: Mutex<()>,
    local: RwLock<HashMap<K, Option<V>>>,
    last_connect: AtomicI64,
    released: AtomicBool,

    /// User listeners that run on the generating thread.
    sync_support: ListenerSupport<K, V>,
    /// User listeners served through the asynchronous dispatch queue.
    async_support: Arc<ListenerSupport<K, V>>,
    queue: Mutex<Option<QueueState<K, V>>>,

    add_listener: Arc<dyn MapListener<K, V>>,
    remove_listener: Arc<dyn MapListener<K, V>>,
    lifecycle_listener: Arc<dyn LifecycleListener>,
}

/// A live materialized view of the back store filtered by a predicate,
/// maintained by an add-filter listener, a remove-filter listener and an
/// initial reconciliation pass.
pub struct ContinuousQueryView<K, V, B>
where
    K: Key,
    V: Value,
    B: ObservableMap<K, V> + 'static,
{
    inner: Arc<ViewInner<K, V, B>>,
}

impl<K, V, B> Clone for ContinuousQueryView<K, V, B>
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

// ----- filter listeners -----------------------------------------------------

/// Stores the new value locally on any event matching the add filter.
struct AddFilterListener<K, V, B>
where
    K: Key,
    V: Value,
    B: ObservableMap<K, V> + 'static,
{
    inner: Weak<ViewInner<K, V, B>>,
}

impl<K, V, B> MapListener<K, V> for AddFilterListener<K, V, B>
where
    K: Key,
    V: Value,
    B: ObservableMap<K, V> + 'static,
{
    fn on_event(&self, event: &EntryEvent<K, V>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_add_event(event);
        }
    }

    fn is_synchronous(&self) -> bool {
        true
    }
}

/// Removes the key locally on any event matching the remove filter.
struct RemoveFilterListener<K, V, B>
where
    K: Key,
    V: Value,
    B: ObservableMap<K, V> + 'static,
{
    inner: Weak<ViewInner<K, V, B>>,
}

impl<K, V, B> MapListener<K, V> for RemoveFilterListener<K, V, B>
where
    K: Key,
    V: Value,
    B: ObservableMap<K, V> + 'static,
{
    fn on_event(&self, event: &EntryEvent<K, V>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_remove_event(event);
        }
    }

    fn is_synchronous(&self) -> bool {
        true
    }
}

struct ViewLifecycleListener<K, V, B>
where
    K: Key,
    V: Value,
    B: ObservableMap<K, V> + 'static,
{
    inner: Weak<ViewInner<K, V, B>>,
}

impl<K, V, B> LifecycleListener for ViewLifecycleListener<K, V, B>
where
    K: Key,
    V: Value,
    B: ObservableMap<K, V> + 'static,
{
    fn on_lifecycle(&self, event: LifecycleEvent) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        match event {
            LifecycleEvent::Destroyed | LifecycleEvent::Disconnected => {
                inner.set_state(ViewState::Disconnected);
            }
            LifecycleEvent::Truncated => inner.on_truncate(),
        }
    }
}

// ----- inner behavior -------------------------------------------------------

impl<K, V, B> ViewInner<K, V, B>
where
    K: Key,
    V: Value,
    B: ObservableMap<K, V> + 'static,
{
    fn state(&self) -> ViewState {
        self.sync.lock().state
    }

    fn set_state(&self, state: ViewState) {
        self.sync.lock().state = state;
    }

    fn change_state(&self, next: ViewState) -> Result<()> {
        let mut sync = self.sync.lock();
        match next {
            ViewState::Disconnected => {
                sync.state = ViewState::Disconnected;
                Ok(())
            }
            ViewState::Configuring => {
                if matches!(sync.state, ViewState::Disconnected | ViewState::Synchronized) {
                    sync.pending = Some(HashSet::new());
                    sync.state = ViewState::Configuring;
                    Ok(())
                } else {
                    Err(Error::state(format!(
                        "cannot start configuring from {:?}",
                        sync.state
                    )))
                }
            }
            ViewState::Configured => {
                if sync.state == ViewState::Configuring {
                    sync.state = ViewState::Configured;
                    Ok(())
                } else {
                    Err(Error::state("the view has been invalidated"))
                }
            }
            ViewState::Synchronized => {
                if sync.state == ViewState::Configured {
                    sync.pending = None;
                    sync.state = ViewState::Synchronized;
                    Ok(())
                } else {
                    Err(Error::state("the view has been invalidated"))
                }
            }
        }
    }

    fn transform(&self, key: &K, value: &V) -> V {
        match &self.transformer {
            Some(transformer) => transformer(key, value),
            None => value.clone(),
        }
    }

    fn value_slot(&self, key: &K, value: &V) -> Option<V> {
        if self.cache_values {
            Some(self.transform(key, value))
        } else {
            None
        }
    }

    /// Buffer events observed while the initial query is in flight; events
    /// arriving after it resolve their key's pending re-read themselves.
    fn is_event_deferred(&self, key: &K) -> bool {
        let mut sync = self.sync.lock();
        let state = sync.state;
        match &mut sync.pending {
            Some(pending) => {
                if state <= ViewState::Configuring {
                    pending.insert(key.clone());
                    true
                } else {
                    pending.remove(key);
                    false
                }
            }
            None => false,
        }
    }

    fn on_add_event(&self, event: &EntryEvent<K, V>) {
        if self.is_event_deferred(&event.key) {
            return;
        }
        let slot = match &event.new {
            Some(value) => self.value_slot(&event.key, value),
            None => None,
        };
        self.local.write().insert(event.key.clone(), slot);
        self.route_event(event);
    }

    fn on_remove_event(&self, event: &EntryEvent<K, V>) {
        if self.is_event_deferred(&event.key) {
            return;
        }
        self.local.write().remove(&event.key);
        self.route_event(event);
    }

    fn on_truncate(&self) {
        let mut sync = self.sync.lock();
        if sync.state <= ViewState::Configuring {
            // Mid-configuration truncate: the buffered keys no longer mean
            // anything; the initial query result is authoritative.
            if let Some(pending) = &mut sync.pending {
                pending.clear();
            }
        } else {
            drop(sync);
            self.local.write().clear();
        }
    }

    fn route_event(&self, event: &EntryEvent<K, V>) {
        self.sync_support.dispatch(event);
        if !self.async_support.is_empty() {
            let queue = self.queue.lock();
            if let Some(queue) = queue.as_ref() {
                let _ = queue.tx.send(QueueTask::Dispatch(event.clone()));
            }
        }
    }

    fn ensure_queue(&self) -> Result<()> {
        let mut queue = self.queue.lock();
        if queue.is_some() {
            return Ok(());
        }
        let support = self.async_support.clone();
        let (tx, rx) = flume::unbounded::<QueueTask<K, V>>();
        let worker = thread::Builder::new()
            .name("anteroom-view-dispatch".to_string())
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    match task {
                        QueueTask::Dispatch(event) => support.dispatch(&event),
                        QueueTask::Shutdown => break,
                    }
                }
            })
            .map_err(|err| Error::state(format!("failed to spawn the dispatch worker: {err}")))?;
        *queue = Some(QueueState {
            tx,
            worker: Some(worker),
        });
        Ok(())
    }

    fn shutdown_queue(&self) {
        let state = self.queue.lock().take();
        if let Some(mut state) = state {
            // The shutdown marker queues behind any pending events, so the
            // worker drains before it stops.
            let _ = state.tx.send(QueueTask::Shutdown);
            if let Some(worker) = state.worker.take() {
                let _ = worker.join();
            }
        }
    }

    fn release_listeners(&self) {
        let _ = self.back.remove_filter_listener(&self.add_listener);
        let _ = self.back.remove_filter_listener(&self.remove_listener);
        let _ = self.back.remove_lifecycle_listener(&self.lifecycle_listener);
    }

    /// One full configuration pass: register the two filter listeners and
    /// the deactivation listener, populate the local image with a single
    /// filtered query, then reconcile everything observed meanwhile.
    fn configure_synchronization(&self, _reload: bool) -> Result<()> {
        let outcome: Result<()> = (|| {
            self.change_state(ViewState::Configuring)?;
            self.last_connect.store(self.clock.now_millis(), Ordering::Relaxed);

            // A previous incarnation's registrations may still be around
            // after an abrupt disconnect.
            self.release_listeners();

            // The "remove" listener matches entries updated out of or
            // deleted from the filter.
            let remove_filter = MapEventFilter::new(
                EventMask::UPDATED_LEFT | EventMask::DELETED,
                Some(self.filter.clone()),
            );
            self.back
                .add_filter_listener(self.remove_listener.clone(), Some(Arc::new(remove_filter)), true)?;

            // The "add" listener matches entries inserted into or updated
            // into the filter, plus in-filter updates when values are
            // cached.
            let mut add_mask = EventMask::INSERTED | EventMask::UPDATED_ENTERED;
            if self.cache_values {
                add_mask |= EventMask::UPDATED_WITHIN;
            }
            let add_filter = MapEventFilter::new(add_mask, Some(self.filter.clone()));
            self.back.add_filter_listener(
                self.add_listener.clone(),
                Some(Arc::new(add_filter)),
                !self.cache_values,
            )?;

            self.back.add_lifecycle_listener(self.lifecycle_listener.clone())?;

            // Populate the local image from one query under the filter.
            let matching = self
                .back
                .entry_set()?
                .into_iter()
                .filter(|(key, value)| self.filter.evaluate(key, value))
                .collect_vec();
            {
                let mut local = self.local.write();
                local.clear();
                for (key, value) in matching {
                    let slot = self.value_slot(&key, &value);
                    local.insert(key, slot);
                }
            }

            self.change_state(ViewState::Configured)?;

            // Resolve all changes that occurred during configuration.
            let pending_keys = {
                let sync = self.sync.lock();
                sync.pending
                    .as_ref()
                    .map(|pending| pending.iter().cloned().collect_vec())
                    .unwrap_or_default()
            };
            if !pending_keys.is_empty() {
                let values = self.back.get_all(&pending_keys)?;
                let mut local = self.local.write();
                let mut sync = self.sync.lock();
                for key in pending_keys {
                    match values.get(&key) {
                        Some(value) if self.filter.evaluate(&key, value) => {
                            let slot = self.value_slot(&key, value);
                            local.insert(key, slot);
                        }
                        _ => {
                            local.remove(&key);
                        }
                    }
                }
                if let Some(pending) = &mut sync.pending {
                    pending.clear();
                }
            }

            self.change_state(ViewState::Synchronized)?;
            Ok(())
        })();

        if let Err(err) = outcome {
            // Unregister and start from scratch on the next attempt.
            self.release_listeners();
            self.set_state(ViewState::Disconnected);
            return Err(err);
        }
        Ok(())
    }

    fn ensure_synchronized(&self, reload: bool) -> Result<()> {
        if self.released.load(Ordering::Relaxed) {
            return Err(Error::state("the view has been released"));
        }
        if self.state() == ViewState::Synchronized {
            return Ok(());
        }

        let reconnect = self.reconnect_millis;
        let allow_disconnected = reconnect > 0;
        if allow_disconnected
            && self.clock.now_millis() < self.last_connect.load(Ordering::Relaxed) + reconnect
        {
            // Not yet time to reconnect; serve what the view has.
            return Ok(());
        }

        let attempts = if allow_disconnected { 1 } else { 3 };
        let mut last_error = None;
        for _ in 0..attempts {
            let _monitor = self.config_monitor.lock();
            match self.state() {
                ViewState::Disconnected => match self.configure_synchronization(reload) {
                    Ok(()) => return Ok(()),
                    Err(err) => last_error = Some(err),
                },
                ViewState::Synchronized => return Ok(()),
                state => {
                    return Err(Error::state(format!("unexpected synchronization state: {state:?}")));
                }
            }
        }

        if allow_disconnected {
            Ok(())
        } else {
            if let Some(err) = &last_error {
                tracing::warn!("continuous query view failed to reconnect: {err}");
            }
            Err(Error::state("the view is disconnected; retry the operation"))
        }
    }

    fn check_read_only(&self) -> Result<()> {
        if self.read_only.load(Ordering::Relaxed) {
            Err(Error::state("the view is read-only"))
        } else {
            Ok(())
        }
    }

    fn check_entry(&self, key: &K, value: &V) -> Result<()> {
        if self.filter.evaluate(key, value) {
            Ok(())
        } else {
            Err(Error::argument(
                "the entry does not satisfy the view's filter and would immediately leave it",
            ))
        }
    }
}

// ----- public surface -------------------------------------------------------

impl<K, V, B> ContinuousQueryView<K, V, B>
where
    K: Key,
    V: Value,
    B: ObservableMap<K, V> + 'static,
{
    pub fn builder(back: Arc<B>, filter: impl EntryFilter<K, V>) -> ContinuousQueryViewBuilder<K, V, B> {
        ContinuousQueryViewBuilder::new(back, filter)
    }

    pub fn state(&self) -> ViewState {
        self.inner.state()
    }

    pub fn is_cache_values(&self) -> bool {
        self.inner.cache_values
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only.load(Ordering::Relaxed)
    }

    /// Once read-only, going back to mutable is itself a mutation and is
    /// disallowed.
    pub fn set_read_only(&self) {
        self.inner.read_only.store(true, Ordering::Relaxed);
    }

    pub fn back(&self) -> &Arc<B> {
        &self.inner.back
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.inner.ensure_synchronized(true)?;
        if self.inner.cache_values {
            Ok(self.inner.local.read().get(key).cloned().flatten())
        } else if self.inner.local.read().contains_key(key) {
            self.inner.back.get(key)
        } else {
            Ok(None)
        }
    }

    pub fn get_all(&self, keys: &[K]) -> Result<HashMap<K, V>> {
        self.inner.ensure_synchronized(true)?;
        if self.inner.cache_values {
            let local = self.inner.local.read();
            Ok(keys
                .iter()
                .filter_map(|key| {
                    local
                        .get(key)
                        .and_then(|slot| slot.clone())
                        .map(|value| (key.clone(), value))
                })
                .collect())
        } else {
            let contained = {
                let local = self.inner.local.read();
                keys.iter().filter(|key| local.contains_key(*key)).cloned().collect_vec()
            };
            let values = self.inner.back.get_all(&contained)?;
            Ok(values
                .into_iter()
                .filter(|(key, value)| self.inner.filter.evaluate(key, value))
                .collect())
        }
    }

    pub fn put(&self, key: K, value: V) -> Result<Option<V>> {
        self.inner.check_read_only()?;
        self.inner.check_entry(&key, &value)?;
        self.inner.ensure_synchronized(true)?;

        let orig = self.inner.back.put(key.clone(), value)?;
        Ok(orig.filter(|orig| self.inner.filter.evaluate(&key, orig)))
    }

    pub fn put_with_ttl(&self, key: K, value: V, ttl_millis: i64) -> Result<Option<V>> {
        self.inner.check_read_only()?;
        self.inner.check_entry(&key, &value)?;
        self.inner.ensure_synchronized(true)?;

        let orig = self.inner.back.put_with_ttl(key.clone(), value, ttl_millis)?;
        Ok(orig.filter(|orig| self.inner.filter.evaluate(&key, orig)))
    }

    pub fn put_all(&self, entries: Vec<(K, V)>) -> Result<()> {
        self.inner.check_read_only()?;
        for (key, value) in &entries {
            self.inner.check_entry(key, value)?;
        }
        self.inner.ensure_synchronized(true)?;
        self.inner.back.put_all(entries)
    }

    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        self.inner.check_read_only()?;
        self.inner.ensure_synchronized(true)?;

        if self.inner.local.read().contains_key(key) {
            self.inner.back.remove(key)
        } else {
            Ok(None)
        }
    }

    /// Remove every entry currently in the view from the back store.
    pub fn clear(&self) -> Result<()> {
        self.inner.check_read_only()?;
        self.inner.ensure_synchronized(true)?;

        let keys = {
            let local = self.inner.local.read();
            local.keys().cloned().collect_vec()
        };
        for key in keys {
            self.inner.back.remove(&key)?;
        }
        Ok(())
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        self.inner.ensure_synchronized(true)?;
        Ok(self.inner.local.read().contains_key(key))
    }

    pub fn contains_value(&self, value: &V) -> Result<bool>
    where
        V: PartialEq,
    {
        self.inner.ensure_synchronized(true)?;
        Ok(self
            .inner
            .local
            .read()
            .values()
            .any(|slot| slot.as_ref() == Some(value)))
    }

    pub fn len(&self) -> Result<usize> {
        self.inner.ensure_synchronized(true)?;
        Ok(self.inner.local.read().len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn key_set(&self) -> Result<Vec<K>> {
        self.inner.ensure_synchronized(true)?;
        Ok(self.inner.local.read().keys().cloned().collect())
    }

    pub fn entry_set(&self) -> Result<Vec<(K, V)>> {
        self.inner.ensure_synchronized(true)?;
        if self.inner.cache_values {
            Ok(self
                .inner
                .local
                .read()
                .iter()
                .filter_map(|(key, slot)| slot.clone().map(|value| (key.clone(), value)))
                .collect())
        } else {
            let keys = self.key_set()?;
            let values = self.inner.back.get_all(&keys)?;
            Ok(values
                .into_iter()
                .filter(|(key, value)| self.inner.filter.evaluate(key, value))
                .collect())
        }
    }

    pub fn values(&self) -> Result<Vec<V>> {
        Ok(self.entry_set()?.into_iter().map(|(_, value)| value).collect())
    }

    /// Register a user listener on the view. Asynchronous listeners are
    /// served through the dispatch queue so they never run on the thread
    /// delivering back-store events; synchronous listeners bypass it.
    pub fn add_listener(&self, listener: Arc<dyn MapListener<K, V>>, lite: bool) -> Result<()> {
        if listener.is_synchronous() {
            self.inner.sync_support.add_listener(listener, lite);
        } else {
            self.inner.ensure_queue()?;
            self.inner.async_support.add_listener(listener, lite);
        }
        Ok(())
    }

    pub fn remove_listener(&self, listener: &Arc<dyn MapListener<K, V>>) {
        self.inner.sync_support.remove_listener(listener);
        self.inner.async_support.remove_listener(listener);
    }

    pub fn add_key_listener(&self, listener: Arc<dyn MapListener<K, V>>, key: K, lite: bool) -> Result<()> {
        if listener.is_synchronous() {
            self.inner.sync_support.add_key_listener(listener, key, lite);
        } else {
            self.inner.ensure_queue()?;
            self.inner.async_support.add_key_listener(listener, key, lite);
        }
        Ok(())
    }

    pub fn remove_key_listener(&self, listener: &Arc<dyn MapListener<K, V>>, key: &K) {
        self.inner.sync_support.remove_key_listener(listener, key);
        self.inner.async_support.remove_key_listener(listener, key);
    }

    /// Tear the view down: deregister the back listeners, drain and stop
    /// the dispatch queue, drop the local image.
    pub fn release(&self) {
        self.inner.released.store(true, Ordering::Relaxed);
        self.inner.release_listeners();
        self.inner.shutdown_queue();
        self.inner.set_state(ViewState::Disconnected);
        self.inner.local.write().clear();
        self.inner.sync_support.clear();
        self.inner.async_support.clear();
    }
}

impl<K, V, B> CacheMap<K, V> for ContinuousQueryView<K, V, B>
where
    K: Key,
    V: Value,
    B: ObservableMap<K, V> + 'static,
{
    fn get(&self, key: &K) -> Result<Option<V>> {
        ContinuousQueryView::get(self, key)
    }

    fn get_all(&self, keys: &[K]) -> Result<HashMap<K, V>> {
        ContinuousQueryView::get_all(self, keys)
    }

    fn put_with_ttl(&self, key: K, value: V, ttl_millis: i64) -> Result<Option<V>> {
        ContinuousQueryView::put_with_ttl(self, key, value, ttl_millis)
    }

    fn put_all(&self, entries: Vec<(K, V)>) -> Result<()> {
        ContinuousQueryView::put_all(self, entries)
    }

    fn remove(&self, key: &K) -> Result<Option<V>> {
        ContinuousQueryView::remove(self, key)
    }

    fn contains_key(&self, key: &K) -> Result<bool> {
        ContinuousQueryView::contains_key(self, key)
    }

    fn len(&self) -> Result<usize> {
        ContinuousQueryView::len(self)
    }

    fn clear(&self) -> Result<()> {
        ContinuousQueryView::clear(self)
    }

    fn key_set(&self) -> Result<Vec<K>> {
        ContinuousQueryView::key_set(self)
    }

    fn values(&self) -> Result<Vec<V>> {
        ContinuousQueryView::values(self)
    }

    fn entry_set(&self) -> Result<Vec<(K, V)>> {
        ContinuousQueryView::entry_set(self)
    }
}

/// Builder for [`ContinuousQueryView`].
pub struct ContinuousQueryViewBuilder<K, V, B>
where
    K: Key,
    V: Value,
    B: ObservableMap<K, V> + 'static,
{
    back: Arc<B>,
    filter: Arc<dyn EntryFilter<K, V>>,
    cache_values: bool,
    read_only: bool,
    transformer: Option<Transformer<K, V>>,
    reconnect_millis: i64,
    clock: Arc<dyn Clock>,
}

impl<K, V, B> ContinuousQueryViewBuilder<K, V, B>
where
    K: Key,
    V: Value,
    B: ObservableMap<K, V> + 'static,
{
    pub fn new(back: Arc<B>, filter: impl EntryFilter<K, V>) -> Self {
        Self {
            back,
            filter: Arc::new(filter),
            cache_values: true,
            read_only: false,
            transformer: None,
            reconnect_millis: 0,
            clock: Arc::new(SystemClock),
        }
    }

    /// Cache only keys locally; values are read through on access.
    pub fn with_keys_only(mut self) -> Self {
        self.cache_values = false;
        self
    }

    pub fn with_read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Derive the locally cached value from the back value. A transformed
    /// view is implicitly read-only.
    pub fn with_transformer(mut self, transformer: impl Fn(&K, &V) -> V + Send + Sync + 'static) -> Self {
        self.transformer = Some(Arc::new(transformer));
        self.read_only = true;
        self
    }

    /// How long after a disconnect the view serves possibly-stale local
    /// data before re-entering configuration; 0 disables auto-reconnect
    /// and surfaces a state error instead.
    pub fn with_reconnect_interval(mut self, reconnect_millis: i64) -> Self {
        self.reconnect_millis = reconnect_millis;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build the view and run the initial synchronization pass.
    pub fn build(self) -> Result<ContinuousQueryView<K, V, B>> {
        let inner = Arc::new_cyclic(|weak: &Weak<ViewInner<K, V, B>>| ViewInner {
            back: self.back,
            filter: self.filter,
            transformer: self.transformer,
            cache_values: self.cache_values,
            read_only: AtomicBool::new(self.read_only),
            reconnect_millis: self.reconnect_millis,
            clock: self.clock,
            sync: Mutex::new(SyncState {
                state: ViewState::Disconnected,
                pending: None,
            }),
            config_monitor: Mutex::new(()),
            local: RwLock::new(HashMap::new()),
            last_connect: AtomicI64::new(i64::MIN / 2),
            released: AtomicBool::new(false),
            sync_support: ListenerSupport::new(),
            async_support: Arc::new(ListenerSupport::new()),
            queue: Mutex::new(None),
            add_listener: Arc::new(AddFilterListener { inner: weak.clone() }),
            remove_listener: Arc::new(RemoveFilterListener { inner: weak.clone() }),
            lifecycle_listener: Arc::new(ViewLifecycleListener { inner: weak.clone() }),
        });

        inner.ensure_synchronized(false)?;
        Ok(ContinuousQueryView { inner })
    }
}
