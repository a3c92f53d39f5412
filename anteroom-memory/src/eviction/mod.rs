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

use crate::entry::EntryView;

pub(crate) mod hybrid;
pub(crate) mod lfu;
pub(crate) mod lru;

/// The store-side surface a prune pass works against: entry inspection and
/// the eviction primitive. The scope runs under the store's write barrier.
pub trait EvictScope<K, V> {
    fn current_units(&self) -> u64;

    /// Snapshot of the live entries at the start of the pass.
    fn entries(&self) -> Vec<EntryView<K>>;

    /// Remove one entry, discarding it and emitting a synthetic delete.
    /// Returns false if the key is already gone.
    fn evict(&mut self, key: &K) -> bool;

    fn now_millis(&self) -> i64;

    /// When the previous prune pass ran; the recency window for scoring.
    fn last_prune_millis(&self) -> i64;

    /// Running average touches-per-entry, recomputed at each prune.
    fn average_touch(&self) -> u32;
}

/// An externally supplied eviction policy.
///
/// Invoked when the store is over its high watermark; the implementation
/// must call [`EvictScope::evict`] until the current units drop to
/// `target_low_units`. A policy that refuses to evict enough leaves the
/// store over budget but functional.
pub trait EvictionPolicy<K, V>: Send + Sync + 'static {
    fn request_eviction(&self, target_low_units: u64, scope: &mut dyn EvictScope<K, V>);
}

/// Eviction policy selection for a front store.
pub enum EvictionPolicyConfig<K, V> {
    /// Recency and frequency combined into a 0-10 priority score.
    Hybrid,
    Lru,
    Lfu,
    External(Arc<dyn EvictionPolicy<K, V>>),
}

impl<K, V> Default for EvictionPolicyConfig<K, V> {
    fn default() -> Self {
        Self::Hybrid
    }
}

impl<K, V> Clone for EvictionPolicyConfig<K, V> {
    fn clone(&self) -> Self {
        match self {
            Self::Hybrid => Self::Hybrid,
            Self::Lru => Self::Lru,
            Self::Lfu => Self::Lfu,
            Self::External(policy) => Self::External(policy.clone()),
        }
    }
}

impl<K, V> std::fmt::Debug for EvictionPolicyConfig<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hybrid => write!(f, "Hybrid"),
            Self::Lru => write!(f, "Lru"),
            Self::Lfu => write!(f, "Lfu"),
            Self::External(_) => write!(f, "External"),
        }
    }
}
