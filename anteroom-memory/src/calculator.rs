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

/// Maps a value to a non-negative cost in abstract units.
///
/// Implementations must be pure and must not touch the store that invokes
/// them: the calculator runs under the store's write barrier.
pub trait UnitCalculator<K, V>: Send + Sync + 'static {
    fn calculate_units(&self, key: &K, value: &V) -> u32;
}

/// The default calculator: every entry costs one unit.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedUnitCalculator;

impl<K, V> UnitCalculator<K, V> for FixedUnitCalculator {
    fn calculate_units(&self, _: &K, _: &V) -> u32 {
        1
    }
}

impl<K, V, F> UnitCalculator<K, V> for F
where
    F: Fn(&K, &V) -> u32 + Send + Sync + 'static,
{
    fn calculate_units(&self, key: &K, value: &V) -> u32 {
        self(key, value)
    }
}
