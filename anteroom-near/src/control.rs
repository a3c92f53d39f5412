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
    sync::{Arc, Weak},
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use anteroom_common::{
    code::{Key, Value},
    error::{Error, Result},
    event::EntryEvent,
};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::gate::ThreadGate;

/// Reentrancy bound, after which further locking is a limit error.
const MAX_LOCK_DEPTH: u32 = i16::MAX as u32;

/// Upper bound for one blocked wait slice: the holder thread may die while
/// we sleep, and its death is an implicit unlock that must be observed.
const MAX_WAIT_SLICE: Duration = Duration::from_millis(1_000);

thread_local! {
    /// Liveness token: dropped when the thread terminates, releasing every
    /// lock the thread still holds on the next inspection.
    static THREAD_ALIVE: Arc<()> = Arc::new(());
}

fn current_alive_token() -> Weak<()> {
    THREAD_ALIVE.with(Arc::downgrade)
}

#[derive(Debug)]
struct LockOwner {
    thread: ThreadId,
    alive: Weak<()>,
}

#[derive(Debug, Default)]
struct LockRecord {
    owner: Option<LockOwner>,
    depth: u32,
    waiters: u32,
}

impl LockRecord {
    fn is_discardable(&self) -> bool {
        self.depth == 0 && self.waiters == 0
    }

    /// Attempt to take or re-take the lock for the current thread. A dead
    /// holder is reclaimed on inspection.
    fn try_acquire(&mut self, me: ThreadId) -> Result<bool> {
        match &self.owner {
            None => {
                self.owner = Some(LockOwner {
                    thread: me,
                    alive: current_alive_token(),
                });
                self.depth = 1;
                Ok(true)
            }
            Some(owner) if owner.thread == me => {
                if self.depth >= MAX_LOCK_DEPTH {
                    return Err(Error::limit("lock reentrancy depth overflow"));
                }
                self.depth += 1;
                Ok(true)
            }
            Some(owner) => {
                if owner.alive.upgrade().is_some() {
                    return Ok(false);
                }
                // The holder is dead; its death is an implicit unlock.
                self.owner = Some(LockOwner {
                    thread: me,
                    alive: current_alive_token(),
                });
                self.depth = 1;
                Ok(true)
            }
        }
    }
}

/// An externally synchronized list of pending back-store events for one
/// in-flight operation.
#[derive(Debug)]
pub struct EventList<K, V> {
    events: Mutex<Vec<EntryEvent<K, V>>>,
}

impl<K, V> Default for EventList<K, V> {
    fn default() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }
}

impl<K, V> EventList<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The list monitor. Validation and slot detachment happen under it so
    /// no event can slip between a validation and the slot removal.
    pub fn lock(&self) -> MutexGuard<'_, Vec<EntryEvent<K, V>>> {
        self.events.lock()
    }
}

/// A pending-event slot attached to a key (or globally) in the control map.
///
/// `Ignore` is the sentinel for "events for this key are expected and
/// irrelevant": appends are dropped. `Collect` gathers events for the
/// operation that attached it.
pub enum EventSlot<K, V> {
    Ignore,
    Collect(Arc<EventList<K, V>>),
}

impl<K, V> Clone for EventSlot<K, V> {
    fn clone(&self) -> Self {
        match self {
            Self::Ignore => Self::Ignore,
            Self::Collect(list) => Self::Collect(list.clone()),
        }
    }
}

impl<K, V> EventSlot<K, V> {
    pub fn collect() -> (Self, Arc<EventList<K, V>>) {
        let list = Arc::new(EventList::new());
        (Self::Collect(list.clone()), list)
    }

    /// Slot identity: every `Ignore` is the same sentinel; collecting slots
    /// compare by list identity.
    pub fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Ignore, Self::Ignore) => true,
            (Self::Collect(a), Self::Collect(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn append(&self, event: EntryEvent<K, V>) {
        match self {
            Self::Ignore => {}
            Self::Collect(list) => list.lock().push(event),
        }
    }
}

struct ControlCore<K> {
    locks: HashMap<K, LockRecord>,
}

/// Per-key reentrant lock map with a global lock-all gate and a side table
/// of per-key pending-event slots.
///
/// Ownership is established by thread identity; a lock held by a thread
/// that has terminated is implicitly released on the next inspection.
pub struct ControlMap<K, V> {
    gate: ThreadGate,
    core: Mutex<ControlCore<K>>,
    cond: Condvar,
    slots: Mutex<HashMap<K, EventSlot<K, V>>>,
    global_slot: Mutex<Option<EventSlot<K, V>>>,
}

impl<K, V> Default for ControlMap<K, V> {
    fn default() -> Self {
        Self {
            gate: ThreadGate::new(),
            core: Mutex::new(ControlCore { locks: HashMap::new() }),
            cond: Condvar::new(),
            slots: Mutex::new(HashMap::new()),
            global_slot: Mutex::new(None),
        }
    }
}

impl<K, V> ControlMap<K, V>
where
    K: Key,
    V: Value,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the key for the calling thread. `wait_millis < 0` waits
    /// forever, `0` is a non-blocking try, positive bounds the wait.
    /// Timeout is reported as `Ok(false)`, never as an error.
    pub fn lock(&self, key: &K, wait_millis: i64) -> Result<bool> {
        if !self.gate.enter(wait_millis) {
            return Ok(false);
        }
        match self.lock_inner(key, wait_millis) {
            Ok(true) => Ok(true),
            other => {
                self.gate.exit();
                other
            }
        }
    }

    fn lock_inner(&self, key: &K, wait_millis: i64) -> Result<bool> {
        let me = thread::current().id();
        let deadline = if wait_millis < 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_millis(wait_millis as u64))
        };

        let mut core = self.core.lock();
        loop {
            let acquired = core
                .locks
                .entry(key.clone())
                .or_default()
                .try_acquire(me);
            match acquired {
                Ok(true) => return Ok(true),
                Err(err) => {
                    Self::discard_if_unused(&mut core, key);
                    return Err(err);
                }
                Ok(false) => {}
            }

            if wait_millis == 0 {
                Self::discard_if_unused(&mut core, key);
                return Ok(false);
            }

            // Block for one bounded slice, then re-inspect; the bounded
            // slice is what notices a dead holder.
            if let Some(record) = core.locks.get_mut(key) {
                record.waiters += 1;
            }
            let slice = match deadline {
                None => MAX_WAIT_SLICE,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        Self::forget_waiter(&mut core, key);
                        return Ok(false);
                    }
                    (deadline - now).min(MAX_WAIT_SLICE)
                }
            };
            let _ = self.cond.wait_for(&mut core, slice);
            Self::forget_waiter(&mut core, key);

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    // One last non-blocking inspection before giving up.
                    let acquired = core
                        .locks
                        .entry(key.clone())
                        .or_default()
                        .try_acquire(me)?;
                    if !acquired {
                        Self::discard_if_unused(&mut core, key);
                    }
                    return Ok(acquired);
                }
            }
        }
    }

    fn forget_waiter(core: &mut MutexGuard<'_, ControlCore<K>>, key: &K) {
        if let Some(record) = core.locks.get_mut(key) {
            record.waiters = record.waiters.saturating_sub(1);
        }
    }

    fn discard_if_unused(core: &mut MutexGuard<'_, ControlCore<K>>, key: &K) {
        if let Some(record) = core.locks.get(key) {
            if record.owner.is_none() && record.is_discardable() {
                core.locks.remove(key);
            }
        }
    }

    /// Release one level of reentrancy; the record is removed once neither
    /// held nor waited on. Returns false if the caller does not own the
    /// lock.
    pub fn unlock(&self, key: &K) -> bool {
        let me = thread::current().id();
        let released = {
            let mut core = self.core.lock();
            let released = match core.locks.get_mut(key) {
                Some(record) => match &record.owner {
                    Some(owner) if owner.thread == me => {
                        record.depth = record.depth.saturating_sub(1);
                        if record.depth == 0 {
                            record.owner = None;
                            if record.waiters > 0 {
                                self.cond.notify_all();
                            }
                        }
                        record.depth == 0
                    }
                    _ => false,
                },
                None => false,
            };
            Self::discard_if_unused(&mut core, key);
            released
        };
        self.gate.exit();
        released
    }

    /// Close the global gate. No per-key lock may be entered while closed,
    /// and closing fails while any per-key lock is held. Callers on the
    /// event-delivery path must use non-blocking attempts with backoff.
    pub fn lock_all(&self, wait_millis: i64) -> bool {
        self.gate.close(wait_millis)
    }

    pub fn unlock_all(&self) -> bool {
        self.gate.open()
    }

    // ----- pending-event side table -----------------------------------------

    pub fn attach(&self, key: K, slot: EventSlot<K, V>) {
        self.slots.lock().insert(key, slot);
    }

    pub fn detach(&self, key: &K) -> Option<EventSlot<K, V>> {
        self.slots.lock().remove(key)
    }

    pub fn slot(&self, key: &K) -> Option<EventSlot<K, V>> {
        self.slots.lock().get(key).cloned()
    }

    pub fn attach_global(&self, slot: EventSlot<K, V>) {
        *self.global_slot.lock() = Some(slot);
    }

    pub fn detach_global(&self) -> Option<EventSlot<K, V>> {
        self.global_slot.lock().take()
    }

    pub fn global_slot(&self) -> Option<EventSlot<K, V>> {
        self.global_slot.lock().clone()
    }

    #[cfg(test)]
    fn record_count(&self) -> usize {
        self.core.lock().locks.len()
    }
}
