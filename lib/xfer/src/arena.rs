// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Generational slot arena backing the opaque handles handed to callers.
//!
//! A handle is `(agent, index, generation)`. Removing an entry bumps the slot
//! generation, so a stale handle, or a handle issued by another agent, is
//! reported as [`XferError::InvalidHandle`] instead of aliasing a live entry.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{Result, XferError};

static NEXT_AGENT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique id for a new agent.
pub(crate) fn next_agent_id() -> u64 {
    NEXT_AGENT_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub(crate) struct RawHandle {
    agent: u64,
    index: u32,
    generation: u32,
}

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub(crate) RawHandle);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(
                    f,
                    concat!($label, "#{}.{}.{}"),
                    self.0.agent, self.0.index, self.0.generation
                )
            }
        }
    };
}

opaque_handle!(
    /// Identity of a backend instance created by an agent.
    BackendHandle,
    "backend"
);

opaque_handle!(
    /// Caller-side reference to a transfer request owned by an agent.
    XferReqHandle,
    "xfer"
);

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

#[derive(Debug)]
pub(crate) struct HandleArena<T> {
    agent: u64,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> HandleArena<T> {
    pub(crate) fn new(agent: u64) -> Self {
        Self {
            agent,
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub(crate) fn insert(&mut self, value: T) -> RawHandle {
        self.insert_with(|_| value)
    }

    /// Insert a value that needs to know its own handle.
    pub(crate) fn insert_with(&mut self, make: impl FnOnce(RawHandle) -> T) -> RawHandle {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let handle = RawHandle {
                agent: self.agent,
                index,
                generation: slot.generation,
            };
            slot.value = Some(make(handle));
            return handle;
        }

        let handle = RawHandle {
            agent: self.agent,
            index: self.slots.len() as u32,
            generation: 0,
        };
        self.slots.push(Slot {
            generation: 0,
            value: Some(make(handle)),
        });
        handle
    }

    fn slot(&self, handle: &RawHandle) -> Option<&Slot<T>> {
        if handle.agent != self.agent {
            return None;
        }
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
    }

    pub(crate) fn get(&self, handle: &RawHandle) -> Result<&T> {
        self.slot(handle)
            .and_then(|slot| slot.value.as_ref())
            .ok_or_else(|| self.stale(handle))
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, handle: &RawHandle) -> bool {
        self.get(handle).is_ok()
    }

    pub(crate) fn remove(&mut self, handle: &RawHandle) -> Result<T> {
        if self.slot(handle).is_none() {
            return Err(self.stale(handle));
        }
        let slot = &mut self.slots[handle.index as usize];
        let value = slot.value.take().ok_or_else(|| {
            XferError::invalid_handle(format!("handle {handle:?} was already released"))
        })?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.live -= 1;
        Ok(value)
    }

    /// Live entries in slot order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (RawHandle, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(move |(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    RawHandle {
                        agent: self.agent,
                        index: index as u32,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }

    fn stale(&self, handle: &RawHandle) -> XferError {
        if handle.agent != self.agent {
            XferError::invalid_handle(format!(
                "handle belongs to agent {} not agent {}",
                handle.agent, self.agent
            ))
        } else {
            XferError::invalid_handle(format!(
                "handle {}.{} is stale or was never issued",
                handle.index, handle.generation
            ))
        }
    }
}
