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

use std::{panic::AssertUnwindSafe, sync::Arc};

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::{
    code::{Key, Value},
    event::{EntryEvent, EventFilter},
    map::{LifecycleEvent, LifecycleListener, MapListener},
};

struct Registration<K, V> {
    listener: Arc<dyn MapListener<K, V>>,
    lite: bool,
}

impl<K, V> Clone for Registration<K, V> {
    fn clone(&self) -> Self {
        Self {
            listener: self.listener.clone(),
            lite: self.lite,
        }
    }
}

struct Registrations<K, V> {
    all: Vec<Registration<K, V>>,
    filters: Vec<(Option<Arc<dyn EventFilter<K, V>>>, Registration<K, V>)>,
    keys: HashMap<K, Vec<Registration<K, V>>>,
    lifecycle: Vec<Arc<dyn LifecycleListener>>,
}

impl<K, V> Default for Registrations<K, V> {
    fn default() -> Self {
        Self {
            all: vec![],
            filters: vec![],
            keys: HashMap::new(),
            lifecycle: vec![],
        }
    }
}

fn same_listener<K, V>(a: &Arc<dyn MapListener<K, V>>, b: &Arc<dyn MapListener<K, V>>) -> bool {
    Arc::ptr_eq(a, b)
}

/// Listener registry shared by the observable maps: all-event, filter and
/// key registrations, each with an optional lite mode, plus lifecycle
/// listeners.
pub struct ListenerSupport<K, V> {
    registrations: RwLock<Registrations<K, V>>,
}

impl<K, V> Default for ListenerSupport<K, V> {
    fn default() -> Self {
        Self {
            registrations: RwLock::new(Registrations::default()),
        }
    }
}

impl<K, V> ListenerSupport<K, V>
where
    K: Key,
    V: Value,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn MapListener<K, V>>, lite: bool) {
        self.registrations.write().all.push(Registration { listener, lite });
    }

    pub fn remove_listener(&self, listener: &Arc<dyn MapListener<K, V>>) {
        self.registrations
            .write()
            .all
            .retain(|r| !same_listener(&r.listener, listener));
    }

    pub fn add_filter_listener(
        &self,
        listener: Arc<dyn MapListener<K, V>>,
        filter: Option<Arc<dyn EventFilter<K, V>>>,
        lite: bool,
    ) {
        self.registrations
            .write()
            .filters
            .push((filter, Registration { listener, lite }));
    }

    pub fn remove_filter_listener(&self, listener: &Arc<dyn MapListener<K, V>>) {
        self.registrations
            .write()
            .filters
            .retain(|(_, r)| !same_listener(&r.listener, listener));
    }

    pub fn add_key_listener(&self, listener: Arc<dyn MapListener<K, V>>, key: K, lite: bool) {
        self.registrations
            .write()
            .keys
            .entry(key)
            .or_default()
            .push(Registration { listener, lite });
    }

    pub fn remove_key_listener(&self, listener: &Arc<dyn MapListener<K, V>>, key: &K) {
        let mut registrations = self.registrations.write();
        if let Some(list) = registrations.keys.get_mut(key) {
            list.retain(|r| !same_listener(&r.listener, listener));
            if list.is_empty() {
                registrations.keys.remove(key);
            }
        }
    }

    pub fn add_lifecycle_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.registrations.write().lifecycle.push(listener);
    }

    pub fn remove_lifecycle_listener(&self, listener: &Arc<dyn LifecycleListener>) {
        self.registrations
            .write()
            .lifecycle
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn is_empty(&self) -> bool {
        let registrations = self.registrations.read();
        registrations.all.is_empty() && registrations.filters.is_empty() && registrations.keys.is_empty()
    }

    pub fn key_listener_count(&self, key: &K) -> usize {
        self.registrations
            .read()
            .keys
            .get(key)
            .map(|list| list.len())
            .unwrap_or(0)
    }

    pub fn filter_listener_count(&self) -> usize {
        self.registrations.read().filters.len()
    }

    pub fn clear(&self) {
        let mut registrations = self.registrations.write();
        registrations.all.clear();
        registrations.filters.clear();
        registrations.keys.clear();
        registrations.lifecycle.clear();
    }

    /// Dispatch an event to every matching registration. Filters are
    /// evaluated against the full event; lite registrations receive the
    /// lite projection. Panics from non-synchronous listeners are caught
    /// and logged so a misbehaving listener cannot break the pipeline;
    /// synchronous listener panics propagate to the generating thread.
    pub fn dispatch(&self, event: &EntryEvent<K, V>) {
        let targets = {
            let registrations = self.registrations.read();
            let mut targets: Vec<Registration<K, V>> = Vec::new();
            targets.extend(registrations.all.iter().cloned());
            for (filter, registration) in &registrations.filters {
                let matched = match filter {
                    None => true,
                    Some(filter) => filter.evaluate(event),
                };
                if matched {
                    targets.push(registration.clone());
                }
            }
            if let Some(list) = registrations.keys.get(&event.key) {
                targets.extend(list.iter().cloned());
            }
            targets
        };

        for target in targets {
            let projected;
            let delivered = if target.lite {
                projected = event.to_lite();
                &projected
            } else {
                event
            };
            if target.listener.is_synchronous() {
                target.listener.on_event(delivered);
            } else if let Err(panic) =
                std::panic::catch_unwind(AssertUnwindSafe(|| target.listener.on_event(delivered)))
            {
                tracing::error!("map listener panicked while handling an event: {panic:?}");
            }
        }
    }

    /// Deliver a priming event to a freshly registered key listener only.
    pub fn prime(&self, listener: &Arc<dyn MapListener<K, V>>, event: &EntryEvent<K, V>, lite: bool) {
        let projected;
        let delivered = if lite {
            projected = event.to_lite();
            &projected
        } else {
            event
        };
        // A priming payload must survive the lite projection, otherwise the
        // registration would lose the value it was primed with.
        let delivered = if delivered.new.is_none() && event.new.is_some() {
            event
        } else {
            delivered
        };
        listener.on_event(delivered);
    }

    pub fn dispatch_lifecycle(&self, event: LifecycleEvent) {
        let listeners = self.registrations.read().lifecycle.clone();
        for listener in listeners {
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| listener.on_lifecycle(event))) {
                tracing::error!("lifecycle listener panicked: {panic:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::event::{CacheEventFilter, EventMask};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<EntryEvent<String, i64>>>,
    }

    impl MapListener<String, i64> for Recorder {
        fn on_event(&self, event: &EntryEvent<String, i64>) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_key_and_filter_dispatch() {
        let support = ListenerSupport::<String, i64>::new();

        let all = Arc::new(Recorder::default());
        let keyed = Arc::new(Recorder::default());
        let filtered = Arc::new(Recorder::default());

        support.add_listener(all.clone(), false);
        support.add_key_listener(keyed.clone(), "a".to_string(), false);
        support.add_filter_listener(
            filtered.clone(),
            Some(Arc::new(CacheEventFilter::new(EventMask::DELETED, false))),
            true,
        );

        support.dispatch(&EntryEvent::inserted("a".to_string(), 1));
        support.dispatch(&EntryEvent::inserted("b".to_string(), 2));
        support.dispatch(&EntryEvent::deleted("b".to_string(), Some(2)));

        assert_eq!(all.events.lock().unwrap().len(), 3);
        assert_eq!(keyed.events.lock().unwrap().len(), 1);

        let filtered_events = filtered.events.lock().unwrap();
        assert_eq!(filtered_events.len(), 1);
        // lite registration: no values
        assert!(filtered_events[0].old.is_none());
    }

    #[test]
    fn test_remove_by_identity() {
        let support = ListenerSupport::<String, i64>::new();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());

        let a_dyn: Arc<dyn MapListener<String, i64>> = a.clone();
        let b_dyn: Arc<dyn MapListener<String, i64>> = b.clone();
        support.add_key_listener(a_dyn.clone(), "k".to_string(), false);
        support.add_key_listener(b_dyn.clone(), "k".to_string(), false);
        assert_eq!(support.key_listener_count(&"k".to_string()), 2);

        support.remove_key_listener(&a_dyn, &"k".to_string());
        assert_eq!(support.key_listener_count(&"k".to_string()), 1);

        support.dispatch(&EntryEvent::inserted("k".to_string(), 7));
        assert_eq!(a.events.lock().unwrap().len(), 0);
        assert_eq!(b.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_listener_panic_is_contained() {
        struct Panicky;
        impl MapListener<String, i64> for Panicky {
            fn on_event(&self, _: &EntryEvent<String, i64>) {
                panic!("boom");
            }
        }

        let support = ListenerSupport::<String, i64>::new();
        let recorder = Arc::new(Recorder::default());
        support.add_listener(Arc::new(Panicky), false);
        support.add_listener(recorder.clone(), false);

        support.dispatch(&EntryEvent::inserted("k".to_string(), 1));
        assert_eq!(recorder.events.lock().unwrap().len(), 1);
    }
}
