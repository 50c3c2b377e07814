//! Bounded per-transaction executor.
//!
//! Work items run on scoped threads. The number of threads is the number
//! of permits held, so the throttle and not the caller decides how much
//! I/O runs at once.

use crate::error::{FsResult, StorageFault};
use crate::throttle::AcquiredPermits;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Runs a batch of tasks on at most `width` threads.
#[derive(Debug)]
pub struct BoundedExecutor<'p> {
    permits: &'p AcquiredPermits,
    ceiling: usize,
}

impl<'p> BoundedExecutor<'p> {
    /// Executor sized by `permits`, never wider than `ceiling`.
    #[must_use]
    pub fn new(permits: &'p AcquiredPermits, ceiling: usize) -> Self {
        Self {
            permits,
            ceiling: ceiling.max(1),
        }
    }

    /// Number of threads a batch of `items` tasks would use.
    #[must_use]
    pub fn width(&self, items: usize) -> usize {
        self.permits.count().min(self.ceiling).min(items).max(1)
    }

    /// Runs `task` over every item, returning results in item order.
    ///
    /// After the first failure no new items are started. If any task ran
    /// out of memory that error is returned, otherwise the error of the
    /// earliest failed item.
    pub fn run<T, R, F>(&self, items: Vec<T>, task: F) -> FsResult<Vec<R>>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> FsResult<R> + Sync,
    {
        let count = items.len();
        if count == 0 {
            return Ok(Vec::new());
        }
        let width = self.width(count);
        if width == 1 {
            let mut out = Vec::with_capacity(count);
            for item in items {
                out.push(task(item)?);
            }
            return Ok(out);
        }

        let queue: Vec<Mutex<Option<T>>> = items.into_iter().map(|t| Mutex::new(Some(t))).collect();
        let next = AtomicUsize::new(0);
        let failed = AtomicBool::new(false);
        let results: Mutex<Vec<(usize, FsResult<R>)>> = Mutex::new(Vec::with_capacity(count));

        std::thread::scope(|s| {
            for _ in 0..width {
                s.spawn(|| loop {
                    if failed.load(Ordering::Acquire) {
                        break;
                    }
                    let i = next.fetch_add(1, Ordering::AcqRel);
                    if i >= count {
                        break;
                    }
                    let Some(item) = queue[i].lock().take() else {
                        continue;
                    };
                    let result = task(item);
                    if result.is_err() {
                        failed.store(true, Ordering::Release);
                    }
                    results.lock().push((i, result));
                });
            }
        });

        collect(results.into_inner())
    }
}

fn collect<R>(mut results: Vec<(usize, FsResult<R>)>) -> FsResult<Vec<R>> {
    results.sort_by_key(|(i, _)| *i);
    let mut first_error: Option<StorageFault> = None;
    let mut out = Vec::with_capacity(results.len());
    for (_, result) in results {
        match result {
            Ok(value) => out.push(value),
            Err(e) if e.is_out_of_memory() => return Err(e),
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::Throttle;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn results_keep_item_order() {
        let throttle = Throttle::new(8, 1, 2, 1);
        let permits = throttle.greedy_acquire().unwrap();
        let exec = BoundedExecutor::new(&permits, 16);
        assert_eq!(exec.width(100), 4);
        let out = exec
            .run((0..50).collect(), |i: u64| Ok(i * 2))
            .unwrap();
        assert_eq!(out, (0..50).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn concurrency_is_bounded_by_permits() {
        let permits = AcquiredPermits::unbounded(3);
        let exec = BoundedExecutor::new(&permits, 16);
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        exec.run((0..24).collect(), |_: u32| {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(2));
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn out_of_memory_wins_over_other_errors() {
        let permits = AcquiredPermits::unbounded(1);
        let exec = BoundedExecutor::new(&permits, 1);
        let err = collect::<()>(vec![
            (0, Err(StorageFault::invalid_operation("first"))),
            (1, Err(StorageFault::OutOfMemory { requested: 9 })),
        ])
        .unwrap_err();
        assert!(err.is_out_of_memory());
        let err = exec
            .run(vec![1, 2], |i: i32| {
                if i == 1 {
                    Err(StorageFault::invalid_operation("boom"))
                } else {
                    Ok(i)
                }
            })
            .unwrap_err();
        assert!(matches!(err, StorageFault::InvalidOperation { .. }));
    }
}
