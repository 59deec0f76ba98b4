use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn sleep(&self, duration: Duration) -> bool {
        const SLICE: Duration = Duration::from_millis(50);
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(SLICE.min(deadline - now));
        }
    }
}

// One mutex per artifact path; two workers never write the same file.
#[derive(Debug, Default)]
pub struct PathLocks {
    inflight: Mutex<HashMap<Utf8PathBuf, Arc<Mutex<()>>>>,
}

pub struct PathGuard {
    lock: Arc<Mutex<()>>,
}

impl PathGuard {
    pub fn hold(&self) -> MutexGuard<'_, ()> {
        self.lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_path(&self, path: &Utf8Path) -> PathGuard {
        let mut inflight = self
            .inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let lock = Arc::clone(
            inflight
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        );
        PathGuard { lock }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    pub workers: usize,
    pub item_delay: Duration,
}

pub fn run_pool<T, F, C>(items: Vec<T>, options: PoolOptions, cancel: &CancelToken, job: F, skipped: C)
where
    T: Send,
    F: Fn(T) + Sync,
    C: Fn(T) + Sync,
{
    let workers = options.workers.max(1).min(items.len().max(1));
    let queue = Mutex::new(items.into_iter().collect::<VecDeque<T>>());

    let next = || {
        queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    };

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                let mut first = true;
                while let Some(item) = next() {
                    if cancel.is_cancelled() {
                        skipped(item);
                        continue;
                    }
                    if !first && !options.item_delay.is_zero() && !cancel.sleep(options.item_delay) {
                        skipped(item);
                        continue;
                    }
                    first = false;
                    job(item);
                }
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn pool_runs_every_item_once() {
        let seen = Mutex::new(Vec::new());
        run_pool(
            (0..20).collect(),
            PoolOptions {
                workers: 4,
                item_delay: Duration::ZERO,
            },
            &CancelToken::new(),
            |item: usize| seen.lock().unwrap().push(item),
            |_| panic!("nothing should be skipped"),
        );
        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn pool_respects_worker_cap() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        run_pool(
            (0..12).collect(),
            PoolOptions {
                workers: 3,
                item_delay: Duration::ZERO,
            },
            &CancelToken::new(),
            |_: usize| {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
                active.fetch_sub(1, Ordering::SeqCst);
            },
            |_| {},
        );
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn single_worker_spaces_items_by_delay() {
        let starts = Mutex::new(Vec::new());
        run_pool(
            (0..3).collect(),
            PoolOptions {
                workers: 1,
                item_delay: Duration::from_millis(80),
            },
            &CancelToken::new(),
            |_: usize| starts.lock().unwrap().push(Instant::now()),
            |_| panic!("nothing should be skipped"),
        );
        let starts = starts.into_inner().unwrap();
        assert_eq!(starts.len(), 3);
        for pair in starts.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(80));
        }
    }

    #[test]
    fn cancelled_pool_skips_remaining_items() {
        let cancel = CancelToken::new();
        let done = AtomicUsize::new(0);
        let skipped = AtomicUsize::new(0);
        run_pool(
            (0..5).collect(),
            PoolOptions {
                workers: 1,
                item_delay: Duration::ZERO,
            },
            &cancel,
            |item: usize| {
                done.fetch_add(1, Ordering::SeqCst);
                if item == 1 {
                    cancel.cancel();
                }
            },
            |_| {
                skipped.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert_eq!(done.load(Ordering::SeqCst), 2);
        assert_eq!(skipped.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn same_path_shares_a_lock() {
        let locks = PathLocks::new();
        let a = locks.for_path(Utf8Path::new("data/x.geojson"));
        let b = locks.for_path(Utf8Path::new("data/x.geojson"));
        let _held = a.hold();
        assert!(b.lock.try_lock().is_err());
        let c = locks.for_path(Utf8Path::new("data/y.geojson"));
        assert!(c.lock.try_lock().is_ok());
    }

    #[test]
    fn cancelled_sleep_returns_early() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let start = Instant::now();
        assert!(!cancel.sleep(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
