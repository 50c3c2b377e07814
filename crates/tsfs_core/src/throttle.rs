//! Admission control for I/O generating work.
//!
//! The [`Throttle`] hands out permits from a fixed budget. Requests are
//! served strictly in arrival order, so a large request at the head of the
//! queue is not starved by a stream of small ones. A write costs more than
//! a read. [`Throttle::greedy_acquire`] takes about half of what is free
//! so one batch cannot drain the budget for everyone else.

use crate::config::EngineConfig;
use crate::error::{FsResult, StorageFault};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

struct State {
    total: usize,
    free: usize,
    next_ticket: u64,
    serving: u64,
    closed: bool,
}

struct Inner {
    state: Mutex<State>,
    changed: Condvar,
    read_cost: usize,
    write_cost: usize,
    greedy_minimum: usize,
}

impl Inner {
    fn release(&self, count: usize) {
        if count == 0 {
            return;
        }
        let mut state = self.state.lock();
        state.free = (state.free + count).min(state.total);
        drop(state);
        self.changed.notify_all();
    }
}

/// Shared permit budget. Cloning yields another handle to the same budget.
#[derive(Clone)]
pub struct Throttle {
    inner: Arc<Inner>,
}

impl fmt::Debug for Throttle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Throttle")
            .field("total", &state.total)
            .field("free", &state.free)
            .finish()
    }
}

impl Throttle {
    /// Budget of `total` permits with the given costs.
    #[must_use]
    pub fn new(total: usize, read_cost: usize, write_cost: usize, greedy_minimum: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    total,
                    free: total,
                    next_ticket: 0,
                    serving: 0,
                    closed: false,
                }),
                changed: Condvar::new(),
                read_cost: read_cost.max(1),
                write_cost: write_cost.max(1),
                greedy_minimum: greedy_minimum.max(1),
            }),
        }
    }

    /// Budget configured from `config`.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.total_permits,
            config.read_cost,
            config.write_cost,
            config.greedy_minimum,
        )
    }

    /// Blocks until a read's worth of permits is granted.
    pub fn acquire_read_permit(&self) -> FsResult<AcquiredPermits> {
        self.acquire_exact(self.inner.read_cost)
    }

    /// Blocks until a write's worth of permits is granted.
    pub fn acquire_write_permit(&self) -> FsResult<AcquiredPermits> {
        self.acquire_exact(self.inner.write_cost)
    }

    /// Returns a read permit. Same as [`AcquiredPermits::release`].
    pub fn release_read_permit(&self, permits: AcquiredPermits) {
        permits.release();
    }

    /// Returns a write permit. Same as [`AcquiredPermits::release`].
    pub fn release_write_permit(&self, permits: AcquiredPermits) {
        permits.release();
    }

    /// Takes `max(minimum, free / 2)` permits, capped at what is free.
    ///
    /// Waits until at least the configured minimum is free. Never returns
    /// zero permits.
    pub fn greedy_acquire(&self) -> FsResult<AcquiredPermits> {
        let min = self.inner.greedy_minimum;
        self.acquire_with(|free, total| {
            let needed = min.min(total).max(1);
            (free >= needed).then(|| (free / 2).max(needed).min(free))
        })
    }

    fn acquire_exact(&self, cost: usize) -> FsResult<AcquiredPermits> {
        self.acquire_with(|free, total| {
            let cost = cost.min(total).max(1);
            (free >= cost).then_some(cost)
        })
    }

    fn acquire_with(
        &self,
        grant: impl Fn(usize, usize) -> Option<usize>,
    ) -> FsResult<AcquiredPermits> {
        let mut state = self.inner.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        let mut waited = false;
        loop {
            if state.closed {
                if state.serving == ticket {
                    state.serving += 1;
                }
                self.inner.changed.notify_all();
                return Err(StorageFault::ShuttingDown);
            }
            if state.serving == ticket && state.total > 0 {
                if let Some(count) = grant(state.free, state.total) {
                    state.free -= count;
                    state.serving += 1;
                    drop(state);
                    self.inner.changed.notify_all();
                    if waited {
                        debug!(permits = count, "permits granted after wait");
                    }
                    return Ok(AcquiredPermits {
                        inner: Some(Arc::clone(&self.inner)),
                        count: AtomicUsize::new(count),
                    });
                }
            }
            waited = true;
            self.inner.changed.wait(&mut state);
        }
    }

    /// Adds capacity. The budget never shrinks.
    pub fn add_permits(&self, count: usize) {
        let mut state = self.inner.state.lock();
        state.total += count;
        state.free += count;
        drop(state);
        self.inner.changed.notify_all();
    }

    /// Fails all current and future waiters with `ShuttingDown`.
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
        self.inner.changed.notify_all();
    }

    /// Total budget.
    #[must_use]
    pub fn total(&self) -> usize {
        self.inner.state.lock().total
    }

    /// Permits not currently granted.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.state.lock().free
    }

    /// Permits currently granted.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        let state = self.inner.state.lock();
        state.total - state.free
    }
}

/// A slice of the throttle budget, returned exactly once.
///
/// Dropping the value releases whatever has not been released yet.
pub struct AcquiredPermits {
    inner: Option<Arc<Inner>>,
    count: AtomicUsize,
}

impl fmt::Debug for AcquiredPermits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquiredPermits")
            .field("count", &self.count())
            .finish()
    }
}

impl AcquiredPermits {
    /// Permits not backed by any throttle, for work that is not admitted.
    #[must_use]
    pub fn unbounded(count: usize) -> Self {
        Self {
            inner: None,
            count: AtomicUsize::new(count.max(1)),
        }
    }

    /// Number of permits held.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Returns the permits. Only the first call has an effect.
    pub fn release(&self) {
        let count = self.count.swap(0, Ordering::AcqRel);
        if let Some(inner) = &self.inner {
            inner.release(count);
        }
    }
}

impl Drop for AcquiredPermits {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn reads_and_writes_cost_differently() {
        let throttle = Throttle::new(10, 1, 3, 1);
        let r = throttle.acquire_read_permit().unwrap();
        let w = throttle.acquire_write_permit().unwrap();
        assert_eq!((r.count(), w.count()), (1, 3));
        assert_eq!(throttle.available(), 6);
        throttle.release_read_permit(r);
        drop(w);
        assert_eq!(throttle.available(), 10);
    }

    #[test]
    fn greedy_leaves_half_behind() {
        let throttle = Throttle::new(64, 1, 2, 1);
        let first = throttle.greedy_acquire().unwrap();
        assert_eq!(first.count(), 32);
        let second = throttle.greedy_acquire().unwrap();
        assert_eq!(second.count(), 16);
        let rest: Vec<_> = (0..5).map(|_| throttle.greedy_acquire().unwrap()).collect();
        assert_eq!(
            rest.iter().map(AcquiredPermits::count).collect::<Vec<_>>(),
            vec![8, 4, 2, 1, 1]
        );
        assert_eq!(throttle.available(), 0);
    }

    #[test]
    fn greedy_never_returns_zero() {
        let throttle = Throttle::new(1, 1, 1, 0);
        assert_eq!(throttle.greedy_acquire().unwrap().count(), 1);
    }

    #[test]
    fn release_happens_once() {
        let throttle = Throttle::new(4, 1, 2, 1);
        let permits = throttle.acquire_write_permit().unwrap();
        permits.release();
        permits.release();
        drop(permits);
        assert_eq!(throttle.available(), 4);
        assert_eq!(throttle.outstanding(), 0);
    }

    #[test]
    fn added_capacity_wakes_waiters() {
        let throttle = Throttle::new(1, 1, 1, 1);
        let held = throttle.acquire_read_permit().unwrap();
        let waiter = {
            let throttle = throttle.clone();
            thread::spawn(move || throttle.acquire_read_permit().map(|p| p.count()))
        };
        thread::sleep(Duration::from_millis(30));
        throttle.add_permits(1);
        assert_eq!(waiter.join().unwrap().unwrap(), 1);
        assert_eq!(throttle.total(), 2);
        drop(held);
    }

    #[test]
    fn close_fails_waiters() {
        let throttle = Throttle::new(1, 1, 1, 1);
        let _held = throttle.acquire_read_permit().unwrap();
        let waiter = {
            let throttle = throttle.clone();
            thread::spawn(move || throttle.acquire_read_permit().map(|p| p.count()))
        };
        thread::sleep(Duration::from_millis(30));
        throttle.close();
        assert!(matches!(
            waiter.join().unwrap(),
            Err(StorageFault::ShuttingDown)
        ));
    }

    #[test]
    fn oversized_cost_is_capped_at_total() {
        let throttle = Throttle::new(2, 1, 5, 1);
        assert_eq!(throttle.acquire_write_permit().unwrap().count(), 2);
    }

    proptest! {
        #[test]
        fn outstanding_never_exceeds_total(ops in proptest::collection::vec(0u8..4, 1..60)) {
            let throttle = Throttle::new(16, 1, 2, 1);
            let mut held = Vec::new();
            for op in ops {
                match op {
                    0 if throttle.available() >= 1 => held.push(throttle.acquire_read_permit().unwrap()),
                    1 if throttle.available() >= 2 => held.push(throttle.acquire_write_permit().unwrap()),
                    2 if throttle.available() >= 1 => {
                        let p = throttle.greedy_acquire().unwrap();
                        prop_assert!(p.count() >= 1);
                        held.push(p);
                    }
                    _ => { held.pop(); }
                }
                let sum: usize = held.iter().map(AcquiredPermits::count).sum();
                prop_assert!(sum <= throttle.total());
                prop_assert_eq!(sum, throttle.outstanding());
            }
        }
    }
}
