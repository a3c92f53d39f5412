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

use std::{
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct GateState {
    /// Thread currently holding the gate closed, if any.
    closed_by: Option<ThreadId>,
    /// A close attempt is draining the enterers; bars new enters.
    closing: bool,
    /// Number of threads currently inside the gate.
    active: u32,
}

/// The global "lock-all" gate: per-key lock holders enter it, a lock-all
/// closes it. Closing is mutually exclusive with any enterer, and no enter
/// may succeed while the gate is closed, except reentrantly by the closer.
#[derive(Debug, Default)]
pub(crate) struct ThreadGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

fn deadline_for(wait_millis: i64) -> Option<Instant> {
    if wait_millis < 0 {
        None
    } else {
        Some(Instant::now() + Duration::from_millis(wait_millis as u64))
    }
}

impl ThreadGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the gate; `wait_millis < 0` waits forever, `0` is a
    /// non-blocking try. Returns false on timeout.
    pub fn enter(&self, wait_millis: i64) -> bool {
        let me = thread::current().id();
        let deadline = deadline_for(wait_millis);
        let mut state = self.state.lock();

        while (state.closed_by.is_some() && state.closed_by != Some(me)) || state.closing {
            match deadline {
                None => {
                    self.cond.wait(&mut state);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let _ = self.cond.wait_for(&mut state, deadline - now);
                    if Instant::now() >= deadline
                        && ((state.closed_by.is_some() && state.closed_by != Some(me)) || state.closing)
                    {
                        return false;
                    }
                }
            }
        }

        state.active += 1;
        true
    }

    pub fn exit(&self) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        if state.active == 0 {
            // A close attempt may be waiting for the enterers to drain.
            self.cond.notify_all();
        }
    }

    /// Close the gate: bar new enterers and wait for the active ones to
    /// drain. Returns false on timeout, leaving the gate open.
    pub fn close(&self, wait_millis: i64) -> bool {
        let me = thread::current().id();
        let deadline = deadline_for(wait_millis);
        let mut state = self.state.lock();

        if state.closed_by == Some(me) {
            return true;
        }

        // Wait for any other closer or close-in-progress to finish.
        while state.closed_by.is_some() || state.closing {
            match deadline {
                None => {
                    self.cond.wait(&mut state);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let _ = self.cond.wait_for(&mut state, deadline - now);
                    if Instant::now() >= deadline && (state.closed_by.is_some() || state.closing) {
                        return false;
                    }
                }
            }
        }

        state.closing = true;
        while state.active > 0 {
            match deadline {
                None => {
                    self.cond.wait(&mut state);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.closing = false;
                        self.cond.notify_all();
                        return false;
                    }
                    let _ = self.cond.wait_for(&mut state, deadline - now);
                    if Instant::now() >= deadline && state.active > 0 {
                        state.closing = false;
                        self.cond.notify_all();
                        return false;
                    }
                }
            }
        }
        state.closing = false;
        state.closed_by = Some(me);
        true
    }

    /// Reopen a gate closed by the calling thread. Returns false if the
    /// caller does not hold it closed.
    pub fn open(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.closed_by == Some(me) {
            state.closed_by = None;
            self.cond.notify_all();
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed_by.is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_enter_exit_reentrant_close() {
        let gate = ThreadGate::new();
        assert!(gate.enter(0));
        assert!(gate.enter(0));
        gate.exit();
        gate.exit();

        assert!(gate.close(0));
        assert!(gate.is_closed());
        // The closer may still enter its own gate.
        assert!(gate.enter(0));
        gate.exit();
        assert!(gate.open());
        assert!(!gate.open());
    }

    #[test]
    fn test_close_blocked_by_enterer() {
        let gate = Arc::new(ThreadGate::new());
        assert!(gate.enter(0));

        let other = {
            let gate = gate.clone();
            thread::spawn(move || gate.close(0))
        };
        assert!(!other.join().unwrap(), "close must fail while an enterer is inside");

        gate.exit();
        let other = {
            let gate = gate.clone();
            thread::spawn(move || {
                if !gate.close(100) {
                    return false;
                }
                gate.open()
            })
        };
        assert!(other.join().unwrap());
    }

    #[test]
    fn test_enter_blocked_by_closed_gate() {
        let gate = Arc::new(ThreadGate::new());
        assert!(gate.close(0));

        let other = {
            let gate = gate.clone();
            thread::spawn(move || gate.enter(0))
        };
        assert!(!other.join().unwrap(), "enter must fail while the gate is closed");
        assert!(gate.open());
    }
}
