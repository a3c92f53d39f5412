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

use super::EvictScope;

/// Evict in ascending last-touched order until the target is met. The sort
/// is stable, so ties fall back to snapshot order.
pub(crate) fn prune<K, V>(scope: &mut dyn EvictScope<K, V>, target_low_units: u64) {
    let mut views = scope.entries();
    views.sort_by_key(|view| view.last_touched_at);

    for view in views {
        if scope.current_units() <= target_low_units {
            break;
        }
        scope.evict(&view.key);
    }
}
