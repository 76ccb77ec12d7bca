//! Pending-Reply Registry
//!
//! A fixed table of 256 slots indexed by reply id. A caller that is about to
//! send a command takes a slot and receives a [`PendingReply`] guard; the
//! receive thread fulfils the slot when the matching reply arrives. The guard
//! frees the slot when it is consumed by [`PendingReply::wait`] or dropped, so
//! a slot never refers to a caller that has gone away.

use common::{ReplyId, NUM_REPLY_IDS};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

/// Registry errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Reply id {0} already has a pending command")]
    IdInUse(ReplyId),

    #[error("No command pending on reply id {0}")]
    NoSuchPending(ReplyId),

    #[error("All reply ids are in use")]
    Exhausted,

    #[error("Registry is shutting down")]
    ShuttingDown,
}

/// How a wait ended
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome<T> {
    Fulfilled(T),
    TimedOut,
    Cancelled,
}

enum SlotState<T> {
    Free,
    Waiting,
    Fulfilled(T),
    Cancelled,
}

struct Slot<T> {
    state: Mutex<SlotState<T>>,
    ready: Condvar,
}

struct AllocState {
    next: usize,
    closed: bool,
}

/// Table of pending replies carrying payloads of type `T`
pub struct ReplyRegistry<T> {
    slots: Box<[Slot<T>]>,
    alloc: Mutex<AllocState>,
}

impl<T> ReplyRegistry<T> {
    pub fn new() -> Self {
        let slots = (0..NUM_REPLY_IDS)
            .map(|_| Slot {
                state: Mutex::new(SlotState::Free),
                ready: Condvar::new(),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            alloc: Mutex::new(AllocState {
                next: 0,
                closed: false,
            }),
        }
    }

    fn slot(&self, id: ReplyId) -> &Slot<T> {
        &self.slots[id.index()]
    }

    /// Take the next free reply id, round robin from the last one handed out
    pub fn allocate(&self) -> Result<PendingReply<'_, T>, RegistryError> {
        let mut alloc = self.alloc.lock();
        if alloc.closed {
            return Err(RegistryError::ShuttingDown);
        }

        for offset in 0..NUM_REPLY_IDS {
            let index = (alloc.next + offset) % NUM_REPLY_IDS;
            let mut state = self.slots[index].state.lock();
            if matches!(*state, SlotState::Free) {
                *state = SlotState::Waiting;
                alloc.next = (index + 1) % NUM_REPLY_IDS;
                let id = ReplyId(index as u8);
                trace!("Allocated reply id {}", id);
                return Ok(PendingReply::new(self, id));
            }
        }

        Err(RegistryError::Exhausted)
    }

    /// Claim a specific reply id
    pub fn register(&self, id: ReplyId) -> Result<PendingReply<'_, T>, RegistryError> {
        let alloc = self.alloc.lock();
        if alloc.closed {
            return Err(RegistryError::ShuttingDown);
        }

        let mut state = self.slot(id).state.lock();
        if !matches!(*state, SlotState::Free) {
            return Err(RegistryError::IdInUse(id));
        }
        *state = SlotState::Waiting;
        Ok(PendingReply::new(self, id))
    }

    /// Deliver a reply payload to the waiter on `id`
    ///
    /// Fails softly when nobody is waiting (late reply after a timeout, or a
    /// duplicate); the payload is dropped.
    pub fn fulfil(&self, id: ReplyId, payload: T) -> Result<(), RegistryError> {
        let slot = self.slot(id);
        let mut state = slot.state.lock();
        if !matches!(*state, SlotState::Waiting) {
            return Err(RegistryError::NoSuchPending(id));
        }
        *state = SlotState::Fulfilled(payload);
        slot.ready.notify_all();
        Ok(())
    }

    /// Wake the waiter on `id` with a cancellation; returns false if nothing was pending
    pub fn cancel(&self, id: ReplyId) -> bool {
        let slot = self.slot(id);
        let mut state = slot.state.lock();
        if !matches!(*state, SlotState::Waiting) {
            return false;
        }
        *state = SlotState::Cancelled;
        slot.ready.notify_all();
        true
    }

    /// Cancel every pending reply and refuse new ones
    pub fn close(&self) -> usize {
        let mut alloc = self.alloc.lock();
        alloc.closed = true;

        let mut cancelled = 0;
        for index in 0..NUM_REPLY_IDS {
            if self.cancel(ReplyId(index as u8)) {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            debug!("Registry closed, cancelled {} pending replies", cancelled);
        }
        cancelled
    }

    pub fn is_closed(&self) -> bool {
        self.alloc.lock().closed
    }

    /// Number of reply ids currently held by callers
    pub fn outstanding(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| !matches!(*slot.state.lock(), SlotState::Free))
            .count()
    }
}

impl<T> Default for ReplyRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A claimed reply id
///
/// Frees the slot when consumed by [`wait`](Self::wait) or dropped.
pub struct PendingReply<'a, T> {
    registry: &'a ReplyRegistry<T>,
    id: ReplyId,
    armed: bool,
}

impl<'a, T> PendingReply<'a, T> {
    fn new(registry: &'a ReplyRegistry<T>, id: ReplyId) -> Self {
        Self {
            registry,
            id,
            armed: true,
        }
    }

    pub fn id(&self) -> ReplyId {
        self.id
    }

    /// Block until the reply arrives, the wait is cancelled, or `timeout` elapses
    ///
    /// `None` waits indefinitely. A timeout clears the slot under its lock, so
    /// a reply racing the timeout is either delivered here or rejected by
    /// `fulfil`, never both.
    pub fn wait(mut self, timeout: Option<Duration>) -> WaitOutcome<T> {
        let slot = self.registry.slot(self.id);
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = slot.state.lock();

        while matches!(*state, SlotState::Waiting) {
            match deadline {
                Some(deadline) => {
                    if slot.ready.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => slot.ready.wait(&mut state),
            }
        }

        let outcome = match std::mem::replace(&mut *state, SlotState::Free) {
            SlotState::Fulfilled(payload) => WaitOutcome::Fulfilled(payload),
            SlotState::Waiting => WaitOutcome::TimedOut,
            SlotState::Cancelled | SlotState::Free => WaitOutcome::Cancelled,
        };
        self.armed = false;
        outcome
    }
}

impl<T> Drop for PendingReply<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            *self.registry.slot(self.id).state.lock() = SlotState::Free;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_allocate_unique_until_exhausted() {
        let registry = ReplyRegistry::<u32>::new();
        let guards: Vec<_> = (0..NUM_REPLY_IDS).map(|_| registry.allocate().unwrap()).collect();

        let ids: HashSet<_> = guards.iter().map(|g| g.id()).collect();
        assert_eq!(ids.len(), NUM_REPLY_IDS);
        assert_eq!(registry.allocate().err(), Some(RegistryError::Exhausted));

        drop(guards);
        assert_eq!(registry.outstanding(), 0);
        assert!(registry.allocate().is_ok());
    }

    #[test]
    fn test_round_robin_allocation() {
        let registry = ReplyRegistry::<u32>::new();
        let first = registry.allocate().unwrap().id();
        let second = registry.allocate().unwrap().id();
        assert_eq!(first, ReplyId(0));
        assert_eq!(second, ReplyId(1));

        let _held = registry.register(ReplyId(2)).unwrap();
        assert_eq!(registry.allocate().unwrap().id(), ReplyId(3));
    }

    #[test]
    fn test_register_in_use() {
        let registry = ReplyRegistry::<u32>::new();
        let _guard = registry.register(ReplyId(7)).unwrap();
        assert_eq!(
            registry.register(ReplyId(7)).err(),
            Some(RegistryError::IdInUse(ReplyId(7)))
        );
    }

    #[test]
    fn test_fulfil_then_wait() {
        let registry = ReplyRegistry::new();
        let guard = registry.allocate().unwrap();
        registry.fulfil(guard.id(), "ack").unwrap();
        assert_eq!(guard.wait(Some(Duration::from_secs(1))), WaitOutcome::Fulfilled("ack"));
        assert_eq!(registry.outstanding(), 0);
    }

    #[test]
    fn test_fulfil_unknown_is_soft_error() {
        let registry = ReplyRegistry::new();
        assert_eq!(
            registry.fulfil(ReplyId(9), 1u8),
            Err(RegistryError::NoSuchPending(ReplyId(9)))
        );

        // Duplicate reply after the first one landed
        let guard = registry.register(ReplyId(9)).unwrap();
        registry.fulfil(ReplyId(9), 1).unwrap();
        assert!(registry.fulfil(ReplyId(9), 2).is_err());
        assert_eq!(guard.wait(None), WaitOutcome::Fulfilled(1));
    }

    #[test]
    fn test_timeout_clears_slot() {
        let registry = ReplyRegistry::<u32>::new();
        let guard = registry.register(ReplyId(4)).unwrap();
        assert_eq!(guard.wait(Some(Duration::from_millis(10))), WaitOutcome::TimedOut);

        assert_eq!(registry.outstanding(), 0);
        assert!(registry.fulfil(ReplyId(4), 5).is_err());
        assert!(registry.register(ReplyId(4)).is_ok());
    }

    #[test]
    fn test_fulfil_wakes_waiter() {
        let registry = Arc::new(ReplyRegistry::new());
        let guard = registry.register(ReplyId(1)).unwrap();

        let fulfiller = {
            let registry = registry.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                registry.fulfil(ReplyId(1), 42u32).unwrap();
            })
        };

        assert_eq!(guard.wait(None), WaitOutcome::Fulfilled(42));
        fulfiller.join().unwrap();
    }

    #[test]
    fn test_close_cancels_waiters() {
        let registry = Arc::new(ReplyRegistry::<u32>::new());

        thread::scope(|s| {
            let waiters: Vec<_> = (0..4)
                .map(|_| {
                    let registry = &registry;
                    s.spawn(move || registry.allocate().unwrap().wait(None))
                })
                .collect();

            while registry.outstanding() < 4 {
                thread::yield_now();
            }
            assert_eq!(registry.close(), 4);

            for waiter in waiters {
                assert_eq!(waiter.join().unwrap(), WaitOutcome::Cancelled);
            }
        });

        assert!(registry.is_closed());
        assert_eq!(registry.allocate().err(), Some(RegistryError::ShuttingDown));
        assert_eq!(registry.register(ReplyId(0)).err(), Some(RegistryError::ShuttingDown));
    }

    #[test]
    fn test_drop_frees_slot() {
        let registry = ReplyRegistry::<u32>::new();
        {
            let _guard = registry.register(ReplyId(200)).unwrap();
            assert_eq!(registry.outstanding(), 1);
        }
        assert_eq!(registry.outstanding(), 0);
    }

    #[test]
    fn test_fulfil_timeout_race() {
        use rand::{Rng, SeedableRng};

        let registry = Arc::new(ReplyRegistry::<u32>::new());
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut fulfilled = 0;
        let mut timed_out = 0;

        for round in 0..200u32 {
            let guard = registry.allocate().unwrap();
            let id = guard.id();
            let delay = Duration::from_micros(rng.gen_range(0..400));

            let fulfiller = {
                let registry = registry.clone();
                thread::spawn(move || {
                    thread::sleep(delay);
                    registry.fulfil(id, round).is_ok()
                })
            };

            let outcome = guard.wait(Some(Duration::from_micros(200)));
            let delivered = fulfiller.join().unwrap();
            match outcome {
                WaitOutcome::Fulfilled(value) => {
                    assert_eq!(value, round);
                    assert!(delivered);
                    fulfilled += 1;
                }
                WaitOutcome::TimedOut => {
                    assert!(!delivered);
                    timed_out += 1;
                }
                WaitOutcome::Cancelled => panic!("nothing cancels in this test"),
            }
        }

        assert_eq!(fulfilled + timed_out, 200);
        assert_eq!(registry.outstanding(), 0);
    }
}
