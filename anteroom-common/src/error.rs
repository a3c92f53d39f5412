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

/// Error type shared by all anteroom crates.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Null-like keys, illegal ttl, illegal unit count, unknown enum value.
    #[error("invalid argument: {0}")]
    Argument(String),
    /// Operation on a released/disconnected cache, mutation of a read-only
    /// view, multi-initialization of a single-assignment handle.
    #[error("illegal state: {0}")]
    State(String),
    /// Lock timeout with enforced locking, detected control-map corruption.
    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),
    /// Numeric overflow on lock reentrancy depth and similar bounds.
    #[error("limit exceeded: {0}")]
    Limit(String),
    /// Any failure surfaced by the external back store or loader.
    #[error("back store error: {0}")]
    BackStore(#[source] anyhow::Error),
}

impl Error {
    pub fn argument(msg: impl Into<String>) -> Self {
        Self::Argument(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    pub fn concurrent(msg: impl Into<String>) -> Self {
        Self::ConcurrentModification(msg.into())
    }

    pub fn limit(msg: impl Into<String>) -> Self {
        Self::Limit(msg.into())
    }

    pub fn back_store(err: impl Into<anyhow::Error>) -> Self {
        Self::BackStore(err.into())
    }

    pub fn is_back_store(&self) -> bool {
        matches!(self, Self::BackStore(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = Error::argument("ttl must be >= -1");
        assert_eq!(e.to_string(), "invalid argument: ttl must be >= -1");

        let e = Error::back_store(anyhow::anyhow!("connection reset"));
        assert!(e.is_back_store());
        assert!(e.to_string().contains("connection reset"));
    }
}
