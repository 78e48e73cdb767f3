//! Fan-in accumulator: combine contributions from many producers into one.
//!
//! A node that waits on `expected` producers holds at most one partial sum.
//! A producer that finds a partial sum already parked takes it, adds it to
//! its own value *outside* the lock and tries again; producers never wait on
//! one another's arithmetic. Exactly one contribution per epoch observes the
//! count reaching `expected` and receives the finished sum.

use parking_lot::Mutex;
use sluice_core::{Cube, PooledCube};

/// Values that can be folded into one another.
pub trait Accumulate: Send {
    fn accumulate(&mut self, other: &Self);
}

impl Accumulate for Cube {
    fn accumulate(&mut self, other: &Self) {
        *self += other;
    }
}

impl Accumulate for PooledCube {
    fn accumulate(&mut self, other: &Self) {
        **self += &**other;
    }
}

impl Accumulate for f64 {
    fn accumulate(&mut self, other: &Self) {
        *self += *other;
    }
}

#[derive(Debug)]
struct FanInState<T> {
    received: usize,
    slot: Option<T>,
}

/// Reduction node completing once per epoch after `expected` contributions.
#[derive(Debug)]
pub struct FanIn<T> {
    expected: usize,
    state: Mutex<FanInState<T>>,
}

impl<T: Accumulate> FanIn<T> {
    pub fn new(expected: usize) -> Self {
        assert!(expected > 0, "FanIn needs at least one producer");
        Self {
            expected,
            state: Mutex::new(FanInState {
                received: 0,
                slot: None,
            }),
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Contributions counted so far in the current epoch.
    pub fn received(&self) -> usize {
        self.state.lock().received
    }

    /// Fold `value` into the node.
    ///
    /// Returns the combined value to the one call that completes the epoch and
    /// `None` to every other. The node is reset before the completing call
    /// returns, so it is immediately ready for the next epoch.
    ///
    /// Panics if more than `expected` contributions arrive in one epoch.
    pub fn contribute(&self, mut value: T) -> Option<T> {
        loop {
            let mut state = self.state.lock();

            if state.received == 0 {
                // first arrival of the epoch
                if self.expected == 1 {
                    return Some(value);
                }
                state.received = 1;
                state.slot = Some(value);
                return None;
            }

            if let Some(parked) = state.slot.take() {
                drop(state);
                value.accumulate(&parked);
                continue;
            }

            state.received += 1;
            assert!(
                state.received <= self.expected,
                "FanIn: contribution {} exceeds expected {}",
                state.received,
                self.expected
            );
            if state.received == self.expected {
                state.received = 0;
                return Some(value);
            }
            state.slot = Some(value);
            return None;
        }
    }

    /// Count a contribution that carries no value.
    ///
    /// Returns `true` to exactly one call per epoch.
    pub fn tick(&self) -> bool {
        let mut state = self.state.lock();
        state.received += 1;
        assert!(
            state.received <= self.expected,
            "FanIn: tick {} exceeds expected {}",
            state.received,
            self.expected
        );
        if state.received == self.expected {
            state.received = 0;
            true
        } else {
            false
        }
    }

    /// Discard any partial state left by an abandoned epoch.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.received = 0;
        state.slot = None;
    }
}
