//! Cached monotonic clock
//!
//! A background thread publishes the elapsed nanoseconds into an atomic cell at a fixed
//! interval. Readers use the cached value while the thread is alive and fall back to
//! `Instant::now()` otherwise.

use log::*;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

static BASE: OnceLock<Instant> = OnceLock::new();
static CACHED_NS: AtomicU64 = AtomicU64::new(0);
static ACTIVE: AtomicUsize = AtomicUsize::new(0);

#[inline(always)]
fn base() -> Instant {
    *BASE.get_or_init(Instant::now)
}

#[inline(always)]
fn elapsed_ns() -> u64 {
    Instant::now().duration_since(base()).as_nanos() as u64
}

/// Nanoseconds since the process-wide time base
#[inline]
pub fn now_ns() -> u64 {
    if ACTIVE.load(Ordering::Acquire) > 0 {
        let v = CACHED_NS.load(Ordering::Acquire);
        if v > 0 {
            return v;
        }
    }
    elapsed_ns()
}

/// Handle of the background updater, stops the thread on drop.
///
/// Several handles may coexist, the cache is considered active while any is alive.
pub struct TimeCache {
    stop: Arc<AtomicBool>,
    th: Option<thread::JoinHandle<()>>,
}

impl TimeCache {
    pub fn start(interval: Duration) -> Self {
        let _ = base();
        CACHED_NS.store(elapsed_ns(), Ordering::Release);
        ACTIVE.fetch_add(1, Ordering::AcqRel);
        let stop = Arc::new(AtomicBool::new(false));
        let _stop = stop.clone();
        let th = thread::Builder::new().name("time_cache".to_string()).spawn(move || {
            while !_stop.load(Ordering::Acquire) {
                CACHED_NS.store(elapsed_ns(), Ordering::Release);
                thread::sleep(interval);
            }
        });
        let th = match th {
            Ok(th) => Some(th),
            Err(e) => {
                warn!("time cache thread spawn failed: {}", e);
                ACTIVE.fetch_sub(1, Ordering::AcqRel);
                None
            }
        };
        Self { stop, th }
    }
}

impl Drop for TimeCache {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(th) = self.th.take() {
            ACTIVE.fetch_sub(1, Ordering::AcqRel);
            let _ = th.join();
        }
    }
}
