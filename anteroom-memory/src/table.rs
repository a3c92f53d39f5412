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

use std::hash::BuildHasher;

use anteroom_common::code::{HashBuilder, Key};
use hashbrown::HashMap;

use crate::entry::CacheEntry;

/// The hash table substrate for the front store: a plain mapping from keys
/// to entries carrying their precomputed hash. Consistency is provided by
/// the owning store's write barrier, not here.
pub(crate) struct EntryTable<K, V, S> {
    map: HashMap<K, CacheEntry<K, V>, S>,
    hash_builder: S,
}

impl<K, V, S> EntryTable<K, V, S>
where
    K: Key,
    S: HashBuilder + Clone,
{
    pub fn with_hasher(hash_builder: S) -> Self {
        Self {
            map: HashMap::with_hasher(hash_builder.clone()),
            hash_builder,
        }
    }

    pub fn hash(&self, key: &K) -> u64 {
        self.hash_builder.hash_one(key)
    }

    pub fn get(&self, key: &K) -> Option<&CacheEntry<K, V>> {
        self.map.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut CacheEntry<K, V>> {
        self.map.get_mut(key)
    }

    /// Insert an entry, returning the replaced one if the key was present.
    pub fn insert(&mut self, entry: CacheEntry<K, V>) -> Option<CacheEntry<K, V>> {
        self.map.insert(entry.key().clone(), entry)
    }

    /// Remove the entry for the key. Ownership moves to the caller, which
    /// is what keeps discarded entries out of the table by construction.
    pub fn remove(&mut self, key: &K) -> Option<CacheEntry<K, V>> {
        self.map.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CacheEntry<K, V>> {
        self.map.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut CacheEntry<K, V>> {
        self.map.values_mut()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = CacheEntry<K, V>> + '_ {
        self.map.drain().map(|(_, entry)| entry)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.map.keys()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use ahash::RandomState;
    use itertools::Itertools;

    use super::*;

    fn entry(key: &str, value: u64, table: &EntryTable<String, u64, RandomState>) -> CacheEntry<String, u64> {
        let key = key.to_string();
        let hash = table.hash(&key);
        CacheEntry::new(key, value, hash, 1, 0, 0)
    }

    #[test]
    fn test_insert_replace_remove() {
        let mut table = EntryTable::with_hasher(RandomState::default());

        let e = entry("a", 1, &table);
        assert!(table.insert(e).is_none());
        assert_eq!(table.len(), 1);

        let e = entry("a", 2, &table);
        let replaced = table.insert(e).unwrap();
        assert_eq!(*replaced.value(), 1);
        assert_eq!(table.len(), 1);
        assert_eq!(*table.get(&"a".to_string()).unwrap().value(), 2);

        let removed = table.remove(&"a".to_string()).unwrap();
        assert_eq!(*removed.value(), 2);
        assert!(table.is_empty());
        assert!(table.remove(&"a".to_string()).is_none());
    }

    #[test]
    fn test_hash_is_cached_on_entry() {
        let mut table = EntryTable::with_hasher(RandomState::default());
        let e = entry("a", 1, &table);
        let hash = e.hash();
        table.insert(e);
        assert_eq!(table.get(&"a".to_string()).unwrap().hash(), hash);
        assert_eq!(table.hash(&"a".to_string()), hash);
    }

    #[test]
    fn test_drain() {
        let mut table = EntryTable::with_hasher(RandomState::default());
        for (i, k) in ["a", "b", "c"].iter().enumerate() {
            let e = entry(k, i as u64, &table);
            table.insert(e);
        }
        let drained = table.drain().map(|e| e.key().clone()).sorted().collect_vec();
        assert_eq!(drained, vec!["a", "b", "c"]);
        assert!(table.is_empty());
    }
}
