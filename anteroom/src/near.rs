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

use anteroom_common::{
    code::{Key, Value},
    map::ObservableMap,
};
use anteroom_memory::{LocalCache, LocalCacheBuilder};
use anteroom_near::{CachingMap, InvalidationStrategy};

/// Builder wiring a front store and a back store into a near cache.
///
/// The front defaults to a [`LocalCache`] with its default watermarks and
/// expiry; the strategy defaults to `Auto`.
pub struct NearCacheBuilder<K, V, B>
where
    K: Key,
    V: Value,
    B: ObservableMap<K, V> + 'static,
{
    back: Arc<B>,
    front: Option<LocalCache<K, V>>,
    strategy: InvalidationStrategy,
}

impl<K, V, B> NearCacheBuilder<K, V, B>
where
    K: Key,
    V: Value,
    B: ObservableMap<K, V> + 'static,
{
    pub fn new(back: Arc<B>) -> Self {
        Self {
            back,
            front: None,
            strategy: InvalidationStrategy::default(),
        }
    }

    pub fn with_front(mut self, front: LocalCache<K, V>) -> Self {
        self.front = Some(front);
        self
    }

    pub fn with_strategy(mut self, strategy: InvalidationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn build(self) -> CachingMap<K, V, B> {
        let front = self.front.unwrap_or_else(|| LocalCacheBuilder::new().build());
        CachingMap::new(front, self.back, self.strategy)
    }
}

#[cfg(test)]
mod tests {
    use anteroom_memory::LocalCacheBuilder;

    use super::*;

    #[test]
    fn test_builder_defaults() {
        let back: Arc<LocalCache<u64, u64>> = Arc::new(LocalCacheBuilder::new().with_high_units(0).build());
        back.put(1, 10).unwrap();

        let near = NearCacheBuilder::new(back).build();
        assert_eq!(near.strategy(), InvalidationStrategy::Auto);
        assert_eq!(near.get(&1).unwrap(), Some(10));
        assert!(near.front().contains_key(&1));
    }
}
