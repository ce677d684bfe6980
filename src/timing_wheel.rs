use std::cmp;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use concurrent_queue::ConcurrentQueue;
use log::error;
use slab::Slab;

use crate::sync::SpinLock;

type Callback = Arc<dyn Fn() + Send + Sync + 'static>;

/// A handle to a scheduled callback. Dropping the handle does not cancel
/// the timer; call `stop`.
#[derive(Clone)]
pub struct Timer {
    cancelled: Arc<AtomicBool>,
}

impl Timer {
    /// Cancels the timer. A callback that is already running on the wheel
    /// thread finishes; it will not fire again.
    pub fn stop(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

struct Submission {
    delay: Duration,
    interval: Option<Duration>,
    f: Callback,
    cancelled: Arc<AtomicBool>,
}

struct Entry {
    deadline: u64,
    interval_ticks: Option<u64>,
    f: Callback,
    cancelled: Arc<AtomicBool>,
}

struct Inner {
    tick: Duration,
    wheel_size: usize,
    queue: ConcurrentQueue<Submission>,
    running: AtomicBool,
    thread: SpinLock<Option<thread::JoinHandle<()>>>,
}

/// A hashed timing wheel: a bucket array indexed by expiry tick, driven by
/// a ticker thread.
///
/// Insertion is O(1) from any thread (timers travel through a concurrent
/// queue drained once per tick). Callbacks run on the wheel thread and must
/// be short; anything touching connection state has to re-post itself onto
/// the owning event loop.
#[derive(Clone)]
pub struct TimingWheel {
    inner: Arc<Inner>,
}

impl TimingWheel {
    pub fn new(tick: Duration, wheel_size: usize) -> TimingWheel {
        let tick = cmp::max(tick, Duration::from_millis(1));
        let wheel_size = cmp::max(wheel_size, 1);

        TimingWheel {
            inner: Arc::new(Inner {
                tick,
                wheel_size,
                queue: ConcurrentQueue::unbounded(),
                running: AtomicBool::new(false),
                thread: SpinLock::new(None),
            }),
        }
    }

    /// Spawns the ticker thread. Idempotent.
    pub fn start(&self) {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let inner = self.inner.clone();
        let handle = thread::Builder::new()
            .name("timing-wheel".to_string())
            .spawn(move || run(inner));

        match handle {
            Ok(handle) => *self.inner.thread.lock() = Some(handle),
            Err(e) => {
                self.inner.running.store(false, Ordering::Release);
                error!("timing wheel spawn: {}", e);
            }
        }
    }

    /// Stops the ticker thread and waits for it to exit. Idempotent.
    pub fn stop(&self) {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let handle = self.inner.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Schedules `f` to run once after `d`.
    pub fn after_func<F>(&self, d: Duration, f: F) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.submit(d, None, Arc::new(f))
    }

    /// Schedules `f` to run every `d`, re-arming after each firing.
    pub fn every_func<F>(&self, d: Duration, f: F) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.submit(d, Some(d), Arc::new(f))
    }

    fn submit(&self, delay: Duration, interval: Option<Duration>, f: Callback) -> Timer {
        let cancelled = Arc::new(AtomicBool::new(false));

        let _ = self.inner.queue.push(Submission {
            delay,
            interval,
            f,
            cancelled: cancelled.clone(),
        });

        Timer { cancelled }
    }
}

fn run(inner: Arc<Inner>) {
    let start = Instant::now();
    let tick_nanos = inner.tick.as_nanos() as u64;
    let mut tick: u64 = 0;

    let mut slots: Vec<Vec<usize>> = vec![Vec::new(); inner.wheel_size];
    let mut timers: Slab<Entry> = Slab::new();
    let mut due: Vec<usize> = Vec::new();

    while inner.running.load(Ordering::Acquire) {
        tick += 1;

        let deadline = start + Duration::from_nanos(tick_nanos * tick);
        if let Some(wait) = deadline.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }

        while let Ok(sub) = inner.queue.pop() {
            let delay_ticks = cmp::max(
                1,
                (sub.delay.as_nanos() as u64 + tick_nanos - 1) / tick_nanos,
            );
            let interval_ticks = sub.interval.map(|iv| {
                cmp::max(1, (iv.as_nanos() as u64 + tick_nanos - 1) / tick_nanos)
            });

            let deadline = tick + delay_ticks;
            let key = timers.insert(Entry {
                deadline,
                interval_ticks,
                f: sub.f,
                cancelled: sub.cancelled,
            });
            slots[(deadline % inner.wheel_size as u64) as usize].push(key);
        }

        let slot = (tick % inner.wheel_size as u64) as usize;
        due.clear();
        slots[slot].retain(|&key| {
            if timers[key].deadline <= tick {
                due.push(key);
                false
            } else {
                true
            }
        });

        for &key in &due {
            let entry = timers.remove(key);
            if entry.cancelled.load(Ordering::Acquire) {
                continue;
            }

            (entry.f)();

            if let Some(iv) = entry.interval_ticks {
                let deadline = tick + iv;
                let key = timers.insert(Entry { deadline, ..entry });
                slots[(deadline % inner.wheel_size as u64) as usize].push(key);
            }
        }
    }
}
