//! FIFO admission for ingestion jobs that merge into shared device records.
//!
//! Each job takes a ticket and blocks on a condition variable until its ticket
//! heads the queue for its key. `serialized()` puts every device on one queue;
//! `per_device()` gives each device its own.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use log::debug;

const GLOBAL_KEY: &str = "*";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GateScope {
    Global,
    PerDevice,
}

#[derive(Default)]
struct GateState {
    next_ticket: u64,
    queues: HashMap<String, VecDeque<u64>>,
}

pub struct AdmissionGate {
    scope: GateScope,
    state: Mutex<GateState>,
    ready: Condvar,
}

/// Held while a job runs; dropping it admits the next ticket.
#[must_use = "dropping the permit immediately releases the gate"]
pub struct AdmissionPermit<'a> {
    gate: &'a AdmissionGate,
    key: String,
    ticket: u64,
}

impl AdmissionGate {
    pub fn serialized() -> Self {
        Self::with_scope(GateScope::Global)
    }

    pub fn per_device() -> Self {
        Self::with_scope(GateScope::PerDevice)
    }

    fn with_scope(scope: GateScope) -> Self {
        Self {
            scope,
            state: Mutex::new(GateState::default()),
            ready: Condvar::new(),
        }
    }

    fn key_for(&self, device: &str) -> String {
        match self.scope {
            GateScope::Global => GLOBAL_KEY.to_string(),
            GateScope::PerDevice => device.to_string(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        // queue bookkeeping stays consistent even if a job panicked
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until every earlier ticket for the same key has been released.
    pub fn admit(&self, device: &str) -> AdmissionPermit<'_> {
        let key = self.key_for(device);
        let mut state = self.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queues.entry(key.clone()).or_default().push_back(ticket);
        debug!("device {device}: ticket {ticket} queued");

        let _state = self
            .ready
            .wait_while(state, |s| {
                s.queues.get(&key).and_then(|q| q.front()) != Some(&ticket)
            })
            .unwrap_or_else(PoisonError::into_inner);
        AdmissionPermit {
            gate: self,
            key,
            ticket,
        }
    }

    /// Tickets queued or running under `device`'s key.
    pub fn pending(&self, device: &str) -> usize {
        let key = self.key_for(device);
        self.lock().queues.get(&key).map_or(0, VecDeque::len)
    }
}

impl AdmissionPermit<'_> {
    pub fn ticket(&self) -> u64 {
        self.ticket
    }
}

impl Drop for AdmissionPermit<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.lock();
        if let Some(queue) = state.queues.get_mut(&self.key) {
            queue.retain(|&t| t != self.ticket);
            if queue.is_empty() {
                state.queues.remove(&self.key);
            }
        }
        drop(state);
        self.gate.ready.notify_all();
    }
}
