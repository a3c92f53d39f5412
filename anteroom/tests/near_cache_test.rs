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

use anteroom::prelude::*;
use anteroom::NearCacheBuilder;

fn back() -> Arc<LocalCache<String, String>> {
    Arc::new(
        LocalCacheBuilder::new()
            .with_high_units(0)
            .with_expiry_delay(0)
            .with_flush_delay(0)
            .build(),
    )
}

fn k(key: &str) -> String {
    key.to_string()
}

#[test_log::test]
fn test_near_cache_end_to_end() {
    let clock = Arc::new(ManualClock::new(1_000));
    let back = back();

    let front = LocalCacheBuilder::new()
        .with_high_units(4)
        .with_prune_level(0.5)
        .with_expiry_delay(0)
        .with_flush_delay(0)
        .with_clock(clock.clone())
        .build();

    let near = NearCacheBuilder::new(back.clone())
        .with_front(front)
        .with_strategy(InvalidationStrategy::Present)
        .build();

    // Write-through the near tier, then read it back warm.
    for i in 0..4 {
        near.put(format!("k{i}"), format!("v{i}")).unwrap();
    }
    for i in 0..4 {
        assert_eq!(near.get(&format!("k{i}")).unwrap(), Some(format!("v{i}")));
        assert!(near.front().contains_key(&format!("k{i}")));
        assert_eq!(back.key_listener_count(&format!("k{i}")), 1);
    }

    // Overflow the front; evicted keys lose their back listeners but stay
    // readable through the back.
    clock.advance(10);
    for i in 4..8 {
        let key = format!("k{i}");
        back.put(key.clone(), format!("v{i}")).unwrap();
        near.get(&key).unwrap();
    }
    assert!(near.front().current_units() <= 4);

    let mut registered = 0;
    for i in 0..8 {
        let key = format!("k{i}");
        let in_front = near.front().contains_key(&key);
        let listeners = back.key_listener_count(&key);
        assert_eq!(listeners, usize::from(in_front), "listener set must track the front keyset");
        registered += listeners;
        assert_eq!(near.get(&key).unwrap(), Some(format!("v{i}")));
    }
    assert!(registered > 0);

    // A back-side write invalidates the front copy and the next read sees
    // the new value.
    near.get(&k("k0")).unwrap();
    back.put(k("k0"), k("fresh")).unwrap();
    assert!(!near.front().contains_key(&k("k0")));
    assert_eq!(near.get(&k("k0")).unwrap(), Some(k("fresh")));

    near.clear().unwrap();
    assert_eq!(near.len().unwrap(), 0);
    assert!(near.front().is_empty());
}

#[test_log::test]
fn test_front_expiry_falls_back_to_the_back() {
    let clock = Arc::new(ManualClock::new(1_000));
    let back = back();
    back.put(k("k"), k("v")).unwrap();

    let front = LocalCacheBuilder::new()
        .with_high_units(100)
        .with_expiry_delay(50)
        .with_flush_delay(0)
        .with_clock(clock.clone())
        .build();

    let near = NearCacheBuilder::new(back.clone())
        .with_front(front)
        .with_strategy(InvalidationStrategy::Present)
        .build();

    assert_eq!(near.get(&k("k")).unwrap(), Some(k("v")));
    assert!(near.front().contains_key(&k("k")));

    // The front copy expires; the key listener is deregistered and the
    // value is re-fetched from the back.
    clock.advance(100);
    assert_eq!(near.get(&k("k")).unwrap(), Some(k("v")));
    assert_eq!(back.key_listener_count(&k("k")), 1);
}

#[test_log::test]
fn test_view_observes_near_cache_writes() {
    let back = back();
    let near = NearCacheBuilder::new(back.clone())
        .with_strategy(InvalidationStrategy::Present)
        .build();

    let view = ContinuousQueryView::builder(back.clone(), |_: &String, value: &String| value.starts_with("hot"))
        .build()
        .unwrap();

    near.put(k("a"), k("hot-1")).unwrap();
    near.put(k("b"), k("cold-1")).unwrap();
    near.put(k("c"), k("hot-2")).unwrap();

    assert_eq!(view.len().unwrap(), 2);
    assert_eq!(view.get(&k("a")).unwrap(), Some(k("hot-1")));
    assert!(!view.contains_key(&k("b")).unwrap());

    // Updating an entry out of the filter drops it from the view.
    near.put(k("a"), k("cold-2")).unwrap();
    assert!(!view.contains_key(&k("a")).unwrap());

    near.remove(&k("c")).unwrap();
    assert_eq!(view.len().unwrap(), 0);
}

#[test_log::test]
fn test_ttl_constants_round_trip() {
    let clock = Arc::new(ManualClock::new(1_000));
    let cache: LocalCache<String, String> = LocalCacheBuilder::new()
        .with_high_units(10)
        .with_expiry_delay(100)
        .with_flush_delay(0)
        .with_clock(clock.clone())
        .build();

    cache.put_with_ttl(k("default"), k("v"), EXPIRY_DEFAULT).unwrap();
    cache.put_with_ttl(k("never"), k("v"), EXPIRY_NEVER).unwrap();
    cache.put_with_ttl(k("short"), k("v"), 10).unwrap();

    clock.advance(50);
    assert_eq!(cache.get(&k("default")).unwrap(), Some(k("v")));
    assert_eq!(cache.get(&k("never")).unwrap(), Some(k("v")));
    assert_eq!(cache.get(&k("short")).unwrap(), None);

    clock.advance(100);
    assert_eq!(cache.get(&k("default")).unwrap(), None);
    assert_eq!(cache.get(&k("never")).unwrap(), Some(k("v")));
}
