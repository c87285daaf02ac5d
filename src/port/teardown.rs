//! Reference counting against concurrent destruction.
//!
//! Every callback-driven component follows the same pattern:
//!
//! ```
//! use flightlink::port::SafeTeardown;
//!
//! let teardown = SafeTeardown::new();
//!
//! // callback side
//! if let Some(_guard) = teardown.enter() {
//!     // touch state; the guard decrements on every exit path
//! }
//!
//! // close side
//! if !teardown.begin_shutdown() {
//!     // someone else is closing; return once they are done
//!     teardown.wait_closed();
//!     return;
//! }
//! teardown.finish_shutdown();
//! // no callback body can be running now, release resources
//! teardown.mark_closed();
//! ```

use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::thread::{self, ThreadId};

thread_local! {
    /// Guards held by the current thread, keyed by teardown address.
    static HELD: RefCell<Vec<(usize, usize)>> = const { RefCell::new(Vec::new()) };
}

fn held_here(key: usize) -> usize {
    HELD.with(|held| {
        held.borrow()
            .iter()
            .find(|(k, _)| *k == key)
            .map_or(0, |(_, n)| *n)
    })
}

fn adjust_held(key: usize, delta: isize) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        match held.iter().position(|(k, _)| *k == key) {
            Some(i) => {
                let n = (held[i].1 as isize + delta).max(0) as usize;
                if n == 0 {
                    held.swap_remove(i);
                } else {
                    held[i].1 = n;
                }
            }
            None if delta > 0 => held.push((key, delta as usize)),
            None => {}
        }
    });
}

#[derive(Debug, Default)]
struct TeardownState {
    in_flight: usize,
    shutdown: bool,
    closer: Option<ThreadId>,
    closed: bool,
}

/// In-flight counter with a shutdown flag.
///
/// Once shutdown begins the counter never increases again, and
/// [`finish_shutdown`](Self::finish_shutdown) returns only after every
/// admitted callback has left.
#[derive(Debug, Default)]
pub struct SafeTeardown {
    state: Mutex<TeardownState>,
    drained: Condvar,
}

impl SafeTeardown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one callback. Returns `false` without side effect once shutdown
    /// has begun.
    pub fn increment(&self) -> bool {
        let mut state = self.state.lock();
        if state.shutdown {
            return false;
        }
        state.in_flight += 1;
        true
    }

    /// Release one callback admitted by [`increment`](Self::increment).
    pub fn decrement(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.in_flight > 0, "decrement without increment");
        state.in_flight = state.in_flight.saturating_sub(1);
        // A closer may be waiting for a count above zero (its own guards).
        if state.shutdown {
            self.drained.notify_all();
        }
    }

    /// Admit one callback and return a guard that releases it on drop.
    ///
    /// Guards are tracked per thread, so a `close()` issued from inside a
    /// guarded callback does not wait for its own caller.
    pub fn enter(&self) -> Option<TeardownGuard<'_>> {
        if self.increment() {
            adjust_held(self.key(), 1);
            Some(TeardownGuard { owner: self })
        } else {
            None
        }
    }

    fn key(&self) -> usize {
        self as *const Self as usize
    }

    /// Refuse all further callbacks.
    ///
    /// Returns `true` for the call that started the shutdown and `false` for
    /// any later one, which lets idempotent `close()` implementations bail
    /// out early.
    pub fn begin_shutdown(&self) -> bool {
        let mut state = self.state.lock();
        if state.shutdown {
            return false;
        }
        state.shutdown = true;
        state.closer = Some(thread::current().id());
        true
    }

    /// Block until no admitted callback is running on any other thread.
    pub fn finish_shutdown(&self) {
        let own = held_here(self.key());
        let mut state = self.state.lock();
        while state.in_flight > own {
            self.drained.wait(&mut state);
        }
    }

    /// Record that the caller of the winning
    /// [`begin_shutdown`](Self::begin_shutdown) has released everything.
    pub fn mark_closed(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.drained.notify_all();
    }

    /// Block until the first closer has called [`mark_closed`](Self::mark_closed)
    /// and no callback is left running on another thread.
    ///
    /// Returns at once on the closing thread itself and inside a guarded
    /// callback, where waiting would deadlock against the closer.
    pub fn wait_closed(&self) {
        let own = held_here(self.key());
        let mut state = self.state.lock();
        if !state.shutdown || own > 0 || state.closer == Some(thread::current().id()) {
            return;
        }
        while !state.closed || state.in_flight > 0 {
            self.drained.wait(&mut state);
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }
}

/// Scoped admission returned by [`SafeTeardown::enter`].
#[must_use = "the callback is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct TeardownGuard<'a> {
    owner: &'a SafeTeardown,
}

impl Drop for TeardownGuard<'_> {
    fn drop(&mut self) {
        adjust_held(self.owner.key(), -1);
        self.owner.decrement();
    }
}
