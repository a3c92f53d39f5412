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

/// Unit accounting state of an entry.
///
/// An entry transitions `Live -> Discarded` exactly once, when it leaves
/// the table. A discarded entry's units have already been subtracted from
/// the store total and must never be counted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnitState {
    Live(u32),
    Discarded,
}

/// One cached entry with the usage metadata the eviction policies read.
#[derive(Debug)]
pub(crate) struct CacheEntry<K, V> {
    key: K,
    value: V,
    hash: u64,
    created_at: i64,
    last_touched_at: i64,
    /// 0 means the entry never expires.
    expires_at: i64,
    touch_count: u32,
    units: UnitState,
}

impl<K, V> CacheEntry<K, V> {
    pub fn new(key: K, value: V, hash: u64, units: u32, now: i64, expires_at: i64) -> Self {
        Self {
            key,
            value,
            hash,
            created_at: now,
            last_touched_at: now,
            expires_at,
            touch_count: 0,
            units: UnitState::Live(units),
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn replace_value(&mut self, value: V) -> V {
        std::mem::replace(&mut self.value, value)
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn last_touched_at(&self) -> i64 {
        self.last_touched_at
    }

    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    pub fn set_expires_at(&mut self, at: i64) {
        self.expires_at = at;
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at != 0 && self.expires_at < now
    }

    pub fn touch_count(&self) -> u32 {
        self.touch_count
    }

    /// Record a logical access: touch count and last-touched move together.
    pub fn touch(&mut self, now: i64) {
        self.touch_count = self.touch_count.saturating_add(1);
        self.last_touched_at = now;
    }

    /// Shrink the touch count rather than zeroing it, so long lived entries
    /// do not gain an unassailable advantage in the eviction process.
    pub fn reset_touch_count(&mut self) {
        if self.touch_count > 0 {
            self.touch_count = (self.touch_count >> 1).max(1);
        }
    }

    pub fn units(&self) -> Option<u32> {
        match self.units {
            UnitState::Live(units) => Some(units),
            UnitState::Discarded => None,
        }
    }

    /// Re-cost a live entry; returns `(old, new)` units for the caller to
    /// reconcile the store total. A discarded entry is left alone.
    pub fn set_units(&mut self, units: u32) -> Option<(u32, u32)> {
        match self.units {
            UnitState::Live(old) => {
                self.units = UnitState::Live(units);
                Some((old, units))
            }
            UnitState::Discarded => None,
        }
    }

    /// Consume the entry, yielding its value (used when emitting delete
    /// events for removed entries).
    pub fn into_value(self) -> V {
        self.value
    }

    /// Mark the entry discarded; returns the units to subtract from the
    /// store total, or `None` if it was already discarded.
    pub fn discard(&mut self) -> Option<u32> {
        match self.units {
            UnitState::Live(units) => {
                self.units = UnitState::Discarded;
                Some(units)
            }
            UnitState::Discarded => None,
        }
    }
}

/// A read-only projection of an entry handed to eviction policies.
#[derive(Debug, Clone)]
pub struct EntryView<K> {
    pub key: K,
    pub units: u32,
    pub touch_count: u32,
    pub created_at: i64,
    pub last_touched_at: i64,
}
