use crate::cancel::CancelToken;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Fixed pool of GPU slots, `instances_per_gpu` per device.
///
/// Waiters are served strictly in arrival order: each takes a ticket and may
/// only claim a slot once its ticket is at the head of the line.
pub struct ResourceSlotPool {
    state: Mutex<PoolState>,
    condvar: Condvar,
    capacity: usize,
}

struct PoolState {
    /// gpu ids of idle slots, in hand-out order
    free: VecDeque<usize>,
    outstanding: usize,
    waiting: VecDeque<u64>,
    next_ticket: u64,
}

/// Counters observed atomically under the pool lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub available: usize,
    pub outstanding: usize,
    pub capacity: usize,
    pub waiting: usize,
}

/// RAII guard for one slot. Dropping it (including during unwinding) returns the slot.
pub struct SlotGuard<'a> {
    pool: &'a ResourceSlotPool,
    gpu_id: usize,
}

impl ResourceSlotPool {
    /// Slots are laid out interleaved across devices: 0, 1, .., n-1, 0, 1, ..
    pub fn new(num_gpus: usize, instances_per_gpu: usize) -> Self {
        let num_gpus = num_gpus.max(1);
        let instances_per_gpu = instances_per_gpu.max(1);
        let free: VecDeque<usize> = (0..instances_per_gpu)
            .flat_map(|_| 0..num_gpus)
            .collect();
        let capacity = free.len();
        tracing::info!(
            "Slot pool: {} GPU(s) x {} instance(s) = {} slots",
            num_gpus,
            instances_per_gpu,
            capacity
        );

        Self {
            state: Mutex::new(PoolState {
                free,
                outstanding: 0,
                waiting: VecDeque::new(),
                next_ticket: 0,
            }),
            condvar: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Blocks until a slot is available.
    pub fn acquire(&self) -> SlotGuard<'_> {
        let mut state = self.lock();
        let ticket = state.enqueue();
        while !state.can_claim(ticket) {
            state = self
                .condvar
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        self.claim(state)
    }

    /// Like `acquire`, but gives up (returning `None`) once `cancel` fires.
    pub fn acquire_cancellable(&self, cancel: &CancelToken) -> Option<SlotGuard<'_>> {
        if cancel.is_cancelled() {
            return None;
        }
        let mut state = self.lock();
        let ticket = state.enqueue();
        while !state.can_claim(ticket) {
            if cancel.is_cancelled() {
                state.waiting.retain(|t| *t != ticket);
                drop(state);
                // The next ticket may now be at the head of the line
                self.condvar.notify_all();
                return None;
            }
            state = self
                .condvar
                .wait_timeout(state, CANCEL_POLL)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        Some(self.claim(state))
    }

    /// Claims a slot only if one is idle and nobody is queued ahead.
    pub fn try_acquire(&self) -> Option<SlotGuard<'_>> {
        let mut state = self.lock();
        if !state.waiting.is_empty() {
            return None;
        }
        let gpu_id = state.take_free()?;
        Some(SlotGuard { pool: self, gpu_id })
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.lock();
        PoolSnapshot {
            available: state.free.len(),
            outstanding: state.outstanding,
            capacity: self.capacity,
            waiting: state.waiting.len(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn claim(&self, mut state: MutexGuard<'_, PoolState>) -> SlotGuard<'_> {
        state.waiting.pop_front();
        // can_claim guaranteed a free slot
        let gpu_id = state.take_free().unwrap_or(0);
        let more = !state.free.is_empty() && !state.waiting.is_empty();
        drop(state);
        if more {
            self.condvar.notify_all();
        }
        SlotGuard { pool: self, gpu_id }
    }

    fn release(&self, gpu_id: usize) {
        let mut state = self.lock();
        state.free.push_back(gpu_id);
        state.outstanding -= 1;
        drop(state);
        self.condvar.notify_all();
    }
}

impl PoolState {
    fn enqueue(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.waiting.push_back(ticket);
        ticket
    }

    fn can_claim(&self, ticket: u64) -> bool {
        !self.free.is_empty() && self.waiting.front() == Some(&ticket)
    }

    fn take_free(&mut self) -> Option<usize> {
        let gpu_id = self.free.pop_front()?;
        self.outstanding += 1;
        Some(gpu_id)
    }
}

impl SlotGuard<'_> {
    pub fn gpu_id(&self) -> usize {
        self.gpu_id
    }

    /// Returns the slot now rather than at end of scope.
    pub fn release(self) {
        drop(self)
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.pool.release(self.gpu_id);
    }
}
