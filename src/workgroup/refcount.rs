use crate::{Error, Result};
use std::sync::atomic::{AtomicI32, Ordering};

/// Marks a count that is being evicted. Any value `<= 0` refuses new references.
const FROZEN: i32 = i32::MIN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefState {
    /// Dropped out of the index with no holders left
    Freed,
    /// Held by the index alone; eligible for eviction
    Idle,
    /// Held by the index plus this many others (or, before insertion, by
    /// `n + 1` owners)
    Live(u32),
    /// Eviction in progress
    Frozen,
}

impl RefState {
    fn decode(raw: i32) -> Self {
        match raw {
            FROZEN => RefState::Frozen,
            i32::MIN..=0 => RefState::Freed,
            1 => RefState::Idle,
            n => RefState::Live((n - 1) as u32),
        }
    }
}

#[derive(Debug)]
pub struct Refcount(AtomicI32);

impl Refcount {
    pub fn new(initial: i32) -> Self {
        debug_assert!(initial > 0);
        Self(AtomicI32::new(initial))
    }

    pub fn get(&self) -> i32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn state(&self) -> RefState {
        RefState::decode(self.get())
    }

    /// Take one more reference unless frozen or freed. Returns the count seen
    /// before the increment.
    pub fn try_get(&self) -> Result<i32> {
        let mut observed = self.0.load(Ordering::Acquire);
        loop {
            if observed <= 0 {
                return Err(Error::NotAvailable);
            }
            match self.0.compare_exchange_weak(
                observed,
                observed + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(observed),
                Err(current) => {
                    observed = current;
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// Unconditional increment, returning the new count.
    pub fn inc(&self) -> i32 {
        let prev = self.0.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "increment of unreferenced count {}", prev);
        prev + 1
    }

    /// Drop one reference, returning the new count.
    pub fn dec(&self) -> i32 {
        let prev = self.0.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "release of unreferenced count {}", prev);
        prev - 1
    }

    /// Freeze only if the count is exactly `expected`.
    pub fn try_freeze(&self, expected: i32) -> bool {
        self.0
            .compare_exchange(expected, FROZEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn unfreeze(&self, count: i32) {
        debug_assert_eq!(self.get(), FROZEN);
        self.0.store(count, Ordering::Release);
    }
}
