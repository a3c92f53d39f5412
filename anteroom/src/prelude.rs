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

pub use ahash::RandomState;
pub use anteroom_common::{
    clock::{Clock, ManualClock, SystemClock},
    code::{HashBuilder, Key, Value},
    error::{Error, Result},
    event::{
        CacheEventFilter, EntryEvent, EntryEventKind, EntryFilter, EventFilter, EventFlags, EventMask,
        MapEventFilter, NotFilter,
    },
    map::{
        CacheLoader, CacheMap, CacheStore, LifecycleEvent, LifecycleListener, MapListener, ObservableMap,
        EXPIRY_DEFAULT, EXPIRY_NEVER,
    },
    stats::CacheStatistics,
};
pub use anteroom_memory::{
    EvictScope, EvictionPolicy, EvictionPolicyConfig, FixedUnitCalculator, LocalCache, LocalCacheBuilder,
    LocalCacheConfig, UnitCalculator,
};
pub use anteroom_near::{
    CachingMap, ContinuousQueryView, ContinuousQueryViewBuilder, ControlMap, InvalidationStrategy, ViewState,
};
