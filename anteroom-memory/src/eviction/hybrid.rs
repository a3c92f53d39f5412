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

use crate::entry::EntryView;

use super::EvictScope;

/// Index of the most significant set bit; -1 for zero.
fn index_of_msb(n: u32) -> i32 {
    if n == 0 {
        -1
    } else {
        (31 - n.leading_zeros()) as i32
    }
}

/// Cache priority for an entry: 0 is the safest, 10 the most evictable.
///
/// The recency sub-score buckets the entry's dormancy against the window
/// since the last prune and turns the squared ratio into an exponential
/// score; the frequency sub-score compares the touch count against the
/// running average touches-per-entry.
pub(crate) fn priority<K>(view: &EntryView<K>, now: i64, last_prune: i64, average_touch: u32) -> usize {
    let mut score_lru = 0i32;
    if view.last_touched_at > last_prune {
        let dormant = now - view.last_touched_at;
        let window = now - last_prune;
        let pct = (window - dormant) as f64 / (1.0 + window as f64);
        score_lru = 1 + index_of_msb((pct * pct * 64.0) as u32);
    }

    let mut score_lfu = 0i32;
    let touches = view.touch_count;
    if touches > 0 {
        score_lfu = 1;
        if touches > average_touch {
            score_lfu += 1;
        }
        let adjusted = (touches as i64) * 2 - average_touch as i64;
        if adjusted > 0 {
            let ratio = ((adjusted << 3) as f64 / (1.0 + average_touch as f64)) as u32;
            score_lfu += 1 + index_of_msb(ratio).min(4);
        }
    }

    (10 - score_lru - score_lfu).clamp(0, 10) as usize
}

/// Prune by priority bands: sum units per band, find the cut-off band where
/// the cumulative kept units exceed the target, evict every band above it
/// whole and the cut-off band partially.
pub(crate) fn prune<K, V>(scope: &mut dyn EvictScope<K, V>, target_low_units: u64) {
    let now = scope.now_millis();
    let last_prune = scope.last_prune_millis();
    let average_touch = scope.average_touch();

    let views = scope.entries();
    let priorities: Vec<usize> = views
        .iter()
        .map(|view| priority(view, now, last_prune, average_touch))
        .collect();

    let mut units_per_band = [0u64; 11];
    for (view, &band) in views.iter().zip(priorities.iter()) {
        units_per_band[band] += view.units as u64;
    }

    let mut kept = 0u64;
    let mut cut_band = 10;
    let mut additional = 0u64;
    for (band, units) in units_per_band.iter().enumerate() {
        kept += units;
        if kept > target_low_units {
            cut_band = band;
            additional = kept - target_low_units;
            break;
        }
    }

    for (view, &band) in views.iter().zip(priorities.iter()) {
        if scope.current_units() <= target_low_units {
            break;
        }
        if band > cut_band {
            scope.evict(&view.key);
        } else if band == cut_band && additional > 0 {
            additional = additional.saturating_sub(view.units as u64);
            scope.evict(&view.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(touches: u32, last_touched_at: i64) -> EntryView<&'static str> {
        EntryView {
            key: "k",
            units: 1,
            touch_count: touches,
            created_at: 0,
            last_touched_at,
        }
    }

    #[test]
    fn test_index_of_msb() {
        assert_eq!(index_of_msb(0), -1);
        assert_eq!(index_of_msb(1), 0);
        assert_eq!(index_of_msb(2), 1);
        assert_eq!(index_of_msb(3), 1);
        assert_eq!(index_of_msb(64), 6);
        assert_eq!(index_of_msb(u32::MAX), 31);
    }

    #[test]
    fn test_untouched_old_entry_is_most_evictable() {
        // Never touched since the last prune window opened.
        let p = priority(&view(0, 0), 1000, 0, 1);
        assert_eq!(p, 10);
    }

    #[test]
    fn test_hot_entry_is_safest() {
        // Touched very recently and far above the average frequency.
        let p = priority(&view(100, 999), 1000, 0, 1);
        assert_eq!(p, 0);
    }

    #[test]
    fn test_recency_orders_priorities() {
        let fresh = priority(&view(0, 990), 1000, 0, 0);
        let stale = priority(&view(0, 200), 1000, 0, 0);
        assert!(fresh < stale, "fresh={fresh} stale={stale}");
    }
}
