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

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Cache access counters. Reads are advisory and may be slightly stale
/// relative to concurrent mutation.
#[derive(Debug, Default)]
pub struct CacheStatistics {
    gets: AtomicU64,
    puts: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    prunes: AtomicU64,
    last_prune_millis: AtomicI64,
}

impl CacheStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_hit(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn register_hits(&self, count: u64) {
        self.gets.fetch_add(count, Ordering::Relaxed);
        self.hits.fetch_add(count, Ordering::Relaxed);
    }

    pub fn register_miss(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn register_misses(&self, count: u64) {
        self.gets.fetch_add(count, Ordering::Relaxed);
        self.misses.fetch_add(count, Ordering::Relaxed);
    }

    pub fn register_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn register_puts(&self, count: u64) {
        self.puts.fetch_add(count, Ordering::Relaxed);
    }

    pub fn register_prune(&self, now_millis: i64) {
        self.prunes.fetch_add(1, Ordering::Relaxed);
        self.last_prune_millis.store(now_millis, Ordering::Relaxed);
    }

    pub fn total_gets(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    pub fn total_puts(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn cache_prunes(&self) -> u64 {
        self.prunes.load(Ordering::Relaxed)
    }

    pub fn last_prune_millis(&self) -> i64 {
        self.last_prune_millis.load(Ordering::Relaxed)
    }

    pub fn hit_probability(&self) -> f64 {
        let hits = self.cache_hits();
        let total = hits + self.cache_misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Reset the hit/miss counters. Prune history survives: the eviction
    /// heuristics depend on it.
    pub fn reset_hit_statistics(&self) {
        self.gets.store(0, Ordering::Relaxed);
        self.puts.store(0, Ordering::Relaxed);
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = CacheStatistics::new();
        stats.register_hit();
        stats.register_hit();
        stats.register_miss();
        stats.register_put();

        assert_eq!(stats.total_gets(), 3);
        assert_eq!(stats.cache_hits(), 2);
        assert_eq!(stats.cache_misses(), 1);
        assert_eq!(stats.total_puts(), 1);
        assert!((stats.hit_probability() - 2.0 / 3.0).abs() < 1e-9);

        stats.register_prune(42);
        stats.reset_hit_statistics();
        assert_eq!(stats.cache_hits(), 0);
        assert_eq!(stats.cache_prunes(), 1);
        assert_eq!(stats.last_prune_millis(), 42);
    }
}
