//! In-flight request table.
//!
//! Maps correlation ids to the oneshot sender of the caller awaiting the
//! reply. Ids are handed out by a linear counter that wraps from 65535
//! back to 1 and skips any id still waiting for a reply.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{BlazeError, Result};
use crate::protocol::{Packet, MAX_CORRELATION_ID, UNCORRELATED_ID};

/// Sender half of a waiter.
pub(crate) type Waiter = oneshot::Sender<Result<Packet>>;

struct State {
    waiters: HashMap<u32, Waiter>,
    next_id: u32,
}

/// Correlation id → waiter table.
pub(crate) struct PendingTable {
    state: Mutex<State>,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State {
                waiters: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Register a waiter and return its id.
    ///
    /// A requested id that is in range and free is kept; otherwise the
    /// next free id from the counter is used.
    pub(crate) fn register(
        &self,
        requested: u32,
    ) -> Result<(u32, oneshot::Receiver<Result<Packet>>)> {
        let mut state = self.state.lock();

        let id = if requested != UNCORRELATED_ID
            && requested <= MAX_CORRELATION_ID
            && !state.waiters.contains_key(&requested)
        {
            requested
        } else {
            allocate(&mut state).ok_or_else(|| {
                BlazeError::Connection("No free correlation ids".to_string())
            })?
        };

        let (tx, rx) = oneshot::channel();
        state.waiters.insert(id, tx);
        Ok((id, rx))
    }

    /// Remove and return the waiter for `id`.
    pub(crate) fn take(&self, id: u32) -> Option<Waiter> {
        if id == UNCORRELATED_ID {
            return None;
        }
        self.state.lock().waiters.remove(&id)
    }

    /// Discard the waiter for `id`, if still present.
    pub(crate) fn remove(&self, id: u32) -> bool {
        self.state.lock().waiters.remove(&id).is_some()
    }

    /// Drop every waiter, waking their callers with a closed channel.
    pub(crate) fn clear(&self) -> usize {
        let drained: Vec<Waiter> = self.state.lock().waiters.drain().map(|(_, w)| w).collect();
        drained.len()
    }

    /// Fail every waiter with the error built by `error`.
    pub(crate) fn fail_all(&self, error: impl Fn() -> BlazeError) -> usize {
        let drained: Vec<Waiter> = self.state.lock().waiters.drain().map(|(_, w)| w).collect();
        let count = drained.len();
        for waiter in drained {
            let _ = waiter.send(Err(error()));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub(crate) fn contains(&self, id: u32) -> bool {
        self.state.lock().waiters.contains_key(&id)
    }

    #[cfg(test)]
    fn set_next_id(&self, id: u32) {
        self.state.lock().next_id = id;
    }
}

fn allocate(state: &mut State) -> Option<u32> {
    for _ in 0..MAX_CORRELATION_ID {
        let id = state.next_id;
        state.next_id = if id >= MAX_CORRELATION_ID { 1 } else { id + 1 };
        if !state.waiters.contains_key(&id) {
            return Some(id);
        }
    }
    None
}
