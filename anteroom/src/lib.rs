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

//! anteroom - a near cache for Rust.
//!
//! A two-tier cache that combines a bounded, eviction-managed front store
//! with an authoritative observable back store, kept consistent through an
//! event-driven invalidation protocol, plus a continuous query view over
//! the back store.

mod near;

pub mod prelude;

pub use near::NearCacheBuilder;
pub use prelude::*;
