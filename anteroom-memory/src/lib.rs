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

//! The front tier: a size-bounded, eviction-managed, expiry-aware local
//! cache with observable mutations.

mod cache;
mod calculator;
mod entry;
mod eviction;
mod table;

pub mod prelude;

pub use cache::{LocalCache, LocalCacheBuilder, LocalCacheConfig};
pub use calculator::{FixedUnitCalculator, UnitCalculator};
pub use entry::EntryView;
pub use eviction::{EvictScope, EvictionPolicy, EvictionPolicyConfig};
