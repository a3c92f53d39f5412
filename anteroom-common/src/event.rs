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

use std::sync::Arc;

use bitflags::bitflags;

use crate::code::{Key, Value};

bitflags! {
    /// Flags carried by every entry event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventFlags: u8 {
        /// The event originated from the cache itself (expiry, prune,
        /// loader fill) rather than from an explicit caller mutation.
        const SYNTHETIC = 0b0000_0001;
        /// The event was emitted as the side effect of installing a
        /// listener and its payload is the value at registration time.
        const PRIMING = 0b0000_0010;
        /// The event carries only the key and the flags, not the values.
        const LITE = 0b0000_0100;
    }
}

/// The shape of a mutation observed on a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryEventKind {
    Inserted,
    Updated,
    Deleted,
}

/// A mutation event for a single entry.
#[derive(Debug, Clone)]
pub struct EntryEvent<K, V> {
    pub kind: EntryEventKind,
    pub key: K,
    pub old: Option<V>,
    pub new: Option<V>,
    pub flags: EventFlags,
}

impl<K, V> EntryEvent<K, V>
where
    K: Key,
    V: Value,
{
    pub fn inserted(key: K, new: V) -> Self {
        Self {
            kind: EntryEventKind::Inserted,
            key,
            old: None,
            new: Some(new),
            flags: EventFlags::empty(),
        }
    }

    pub fn updated(key: K, old: Option<V>, new: V) -> Self {
        Self {
            kind: EntryEventKind::Updated,
            key,
            old,
            new: Some(new),
            flags: EventFlags::empty(),
        }
    }

    pub fn deleted(key: K, old: Option<V>) -> Self {
        Self {
            kind: EntryEventKind::Deleted,
            key,
            old,
            new: None,
            flags: EventFlags::empty(),
        }
    }

    /// A priming event: update-shaped, carrying the value (or absence) seen
    /// at listener registration time.
    pub fn priming(key: K, current: Option<V>) -> Self {
        Self {
            kind: EntryEventKind::Updated,
            key,
            old: None,
            new: current,
            flags: EventFlags::PRIMING | EventFlags::SYNTHETIC,
        }
    }

    pub fn with_flags(mut self, flags: EventFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn is_synthetic(&self) -> bool {
        self.flags.contains(EventFlags::SYNTHETIC)
    }

    /// Priming events are recognized by shape and flags, for wire
    /// compatibility with backs that only set the synthetic bit.
    pub fn is_priming(&self) -> bool {
        self.kind == EntryEventKind::Updated
            && (self.flags.contains(EventFlags::PRIMING) || self.flags.contains(EventFlags::SYNTHETIC))
    }

    /// The lite projection: key identity and flags survive, values do not.
    pub fn to_lite(&self) -> Self {
        Self {
            kind: self.kind,
            key: self.key.clone(),
            old: None,
            new: None,
            flags: self.flags | EventFlags::LITE,
        }
    }
}

bitflags! {
    /// Event selection mask used by [`MapEventFilter`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventMask: u8 {
        const INSERTED = 0b0000_0001;
        const UPDATED = 0b0000_0010;
        const DELETED = 0b0000_0100;
        /// Update whose new value matches the entry filter while the old
        /// value did not.
        const UPDATED_ENTERED = 0b0000_1000;
        /// Update whose old value matched the entry filter while the new
        /// value does not.
        const UPDATED_LEFT = 0b0001_0000;
        /// Update where both the old and the new value match.
        const UPDATED_WITHIN = 0b0010_0000;
    }
}

/// A predicate over `(key, value)` pairs.
pub trait EntryFilter<K, V>: Send + Sync + 'static {
    fn evaluate(&self, key: &K, value: &V) -> bool;
}

impl<K, V, F> EntryFilter<K, V> for F
where
    F: Fn(&K, &V) -> bool + Send + Sync + 'static,
{
    fn evaluate(&self, key: &K, value: &V) -> bool {
        self(key, value)
    }
}

/// A predicate over entry events, used for filter-listener registration.
pub trait EventFilter<K, V>: Send + Sync + 'static {
    fn evaluate(&self, event: &EntryEvent<K, V>) -> bool;
}

/// Selects events by kind and, when an entry filter is present, by whether
/// the old/new values move into, out of, or within the filtered set.
pub struct MapEventFilter<K, V> {
    mask: EventMask,
    filter: Option<Arc<dyn EntryFilter<K, V>>>,
}

impl<K, V> MapEventFilter<K, V> {
    pub fn new(mask: EventMask, filter: Option<Arc<dyn EntryFilter<K, V>>>) -> Self {
        Self { mask, filter }
    }

    /// Matches every insert, update and delete.
    pub fn all() -> Self {
        Self {
            mask: EventMask::INSERTED | EventMask::UPDATED | EventMask::DELETED,
            filter: None,
        }
    }
}

impl<K, V> EventFilter<K, V> for MapEventFilter<K, V>
where
    K: Key,
    V: Value,
{
    fn evaluate(&self, event: &EntryEvent<K, V>) -> bool {
        let mask = self.mask;
        let filter = match &self.filter {
            None => {
                return match event.kind {
                    EntryEventKind::Inserted => mask.contains(EventMask::INSERTED),
                    EntryEventKind::Updated => mask.intersects(
                        EventMask::UPDATED
                            | EventMask::UPDATED_ENTERED
                            | EventMask::UPDATED_LEFT
                            | EventMask::UPDATED_WITHIN,
                    ),
                    EntryEventKind::Deleted => mask.contains(EventMask::DELETED),
                };
            }
            Some(filter) => filter,
        };

        let key = &event.key;
        let old_match = event.old.as_ref().map(|v| filter.evaluate(key, v)).unwrap_or(false);
        let new_match = event.new.as_ref().map(|v| filter.evaluate(key, v)).unwrap_or(false);

        match event.kind {
            EntryEventKind::Inserted => mask.contains(EventMask::INSERTED) && new_match,
            EntryEventKind::Deleted => mask.contains(EventMask::DELETED) && old_match,
            EntryEventKind::Updated => {
                (mask.contains(EventMask::UPDATED) && (old_match || new_match))
                    || (mask.contains(EventMask::UPDATED_ENTERED) && !old_match && new_match)
                    || (mask.contains(EventMask::UPDATED_LEFT) && old_match && !new_match)
                    || (mask.contains(EventMask::UPDATED_WITHIN) && old_match && new_match)
            }
        }
    }
}

/// Selects events by kind, optionally restricted to synthetic ones.
pub struct CacheEventFilter {
    mask: EventMask,
    synthetic_only: bool,
}

impl CacheEventFilter {
    pub fn new(mask: EventMask, synthetic_only: bool) -> Self {
        Self { mask, synthetic_only }
    }
}

impl<K, V> EventFilter<K, V> for CacheEventFilter
where
    K: Key,
    V: Value,
{
    fn evaluate(&self, event: &EntryEvent<K, V>) -> bool {
        let kind_match = match event.kind {
            EntryEventKind::Inserted => self.mask.contains(EventMask::INSERTED),
            EntryEventKind::Updated => self.mask.contains(EventMask::UPDATED),
            EntryEventKind::Deleted => self.mask.contains(EventMask::DELETED),
        };
        kind_match && (!self.synthetic_only || event.is_synthetic())
    }
}

/// Logical negation of another event filter.
pub struct NotFilter<K, V> {
    inner: Arc<dyn EventFilter<K, V>>,
}

impl<K, V> NotFilter<K, V> {
    pub fn new(inner: Arc<dyn EventFilter<K, V>>) -> Self {
        Self { inner }
    }
}

impl<K, V> EventFilter<K, V> for NotFilter<K, V>
where
    K: Key,
    V: Value,
{
    fn evaluate(&self, event: &EntryEvent<K, V>) -> bool {
        !self.inner.evaluate(event)
    }
}
