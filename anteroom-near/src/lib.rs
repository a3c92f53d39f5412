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

//! The near tier: the two-tier caching map with event-driven invalidation
//! and the continuous query view.

mod caching;
mod control;
mod gate;
mod query;

pub use caching::{CachingMap, InvalidationStrategy};
pub use control::{ControlMap, EventList, EventSlot};
pub use query::{ContinuousQueryView, ContinuousQueryViewBuilder, ViewState};
