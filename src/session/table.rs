//! Fixed-capacity session registry.
//!
//! An arena of slots plus an ordered free list. Allocation always takes the lowest
//! free index, so handle numbering is deterministic. Every lookup checks both the
//! range and the slot state; a handle is valid only while its slot is `Open`.
//!
//! A slot is returned to the free list only after its worker has been joined. A
//! session whose worker misses the close deadline stays in its slot as `Draining`
//! until `reap` finds the worker finished.

use std::collections::BTreeSet;
use std::time::Duration;

use super::{Handle, Session};
use crate::error::EngineError;

/// Result of closing a handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The worker exited and the handle was reclaimed.
    Closed,
    /// The handle was not open; nothing happened.
    NotOpen,
    /// The worker did not exit in time. The handle is already invalid; its slot is
    /// reclaimed once the worker finishes.
    Draining,
}

enum Slot {
    Free,
    Open(Session),
    Draining(Session),
}

pub struct SessionTable {
    slots: Vec<Slot>,
    free: BTreeSet<usize>,
    open_count: usize,
}

impl SessionTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Slot::Free).collect(),
            free: (0..capacity).collect(),
            open_count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of open sessions.
    pub fn open_count(&self) -> usize {
        self.open_count
    }

    /// Number of closed sessions whose workers are still running.
    pub fn draining_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Draining(_)))
            .count()
    }

    /// Handles of all open sessions, ascending.
    pub fn handles(&self) -> Vec<Handle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| matches!(slot, Slot::Open(_)))
            .map(|(index, _)| Handle::new(index))
            .collect()
    }

    /// Reserve the lowest free slot and fill it with the session `build` returns.
    ///
    /// Fails with `CapacityExceeded` before `build` runs when no slot is free. If
    /// `build` fails the slot goes back to the free list.
    pub(crate) fn insert_with<F>(&mut self, build: F) -> Result<Handle, EngineError>
    where
        F: FnOnce(Handle) -> Result<Session, EngineError>,
    {
        let index = self.free.pop_first().ok_or(EngineError::CapacityExceeded {
            capacity: self.capacity(),
        })?;
        let handle = Handle::new(index);
        match build(handle) {
            Ok(session) => {
                self.slots[index] = Slot::Open(session);
                self.open_count += 1;
                Ok(handle)
            }
            Err(err) => {
                self.free.insert(index);
                Err(err)
            }
        }
    }

    pub(crate) fn get(&self, handle: Handle) -> Option<&Session> {
        match self.slots.get(handle.index()) {
            Some(Slot::Open(session)) => Some(session),
            _ => None,
        }
    }

    /// Stop the session behind `handle` and reclaim its slot once the worker exits.
    ///
    /// Waits at most `timeout` (polling every `poll`) for the worker. There is no
    /// forced termination: a worker that misses the deadline leaves the slot
    /// `Draining`.
    pub(crate) fn close(&mut self, handle: Handle, timeout: Duration, poll: Duration) -> CloseOutcome {
        let index = handle.index();
        if !matches!(self.slots.get(index), Some(Slot::Open(_))) {
            return CloseOutcome::NotOpen;
        }
        let Slot::Open(mut session) = std::mem::replace(&mut self.slots[index], Slot::Free) else {
            return CloseOutcome::NotOpen;
        };
        self.open_count -= 1;

        session.request_stop();
        if session.join_within(timeout, poll) {
            drop(session);
            self.free.insert(index);
            CloseOutcome::Closed
        } else {
            log::warn!(
                "StreamEngine: session {} did not stop within {:?}, draining",
                handle,
                timeout
            );
            self.slots[index] = Slot::Draining(session);
            CloseOutcome::Draining
        }
    }

    /// Reclaim draining slots whose workers have exited. Returns how many were freed.
    pub(crate) fn reap(&mut self) -> usize {
        let mut reclaimed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let finished = match slot {
                Slot::Draining(session) => session.try_join(),
                _ => false,
            };
            if finished {
                *slot = Slot::Free;
                self.free.insert(index);
                reclaimed += 1;
                log::debug!("StreamEngine: reclaimed drained session {}", index);
            }
        }
        reclaimed
    }
}
