use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::cache::CacheInner;

#[derive(Debug, Clone, Copy)]
pub(crate) enum ShutdownState {
    Running,
    ShuttingDown,
    ShutDown,
}

impl ShutdownState {
    fn is_running(self) -> bool {
        matches!(self, ShutdownState::Running)
    }

    fn is_shutdown(self) -> bool {
        matches!(self, ShutdownState::ShutDown)
    }
}

/// Periodically flushes the cache's dirty blocks until dropped.
#[derive(Debug)]
pub(crate) struct Flusher {
    shutdown: Arc<Mutex<ShutdownState>>,
    sc: Arc<Condvar>,
    join_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Flusher {
    /// Spawns a thread that flushes `cache` every `flush_every_ms`.
    pub(crate) fn new(
        name: String,
        cache: Arc<CacheInner>,
        flush_every_ms: u64,
    ) -> io::Result<Flusher> {
        #[allow(clippy::mutex_atomic)] // mutex used in CondVar below
        let shutdown = Arc::new(Mutex::new(ShutdownState::Running));
        let sc = Arc::new(Condvar::new());

        let join_handle = thread::Builder::new().name(name).spawn({
            let shutdown = shutdown.clone();
            let sc = sc.clone();
            move || run(&shutdown, &sc, &cache, flush_every_ms)
        })?;

        Ok(Flusher { shutdown, sc, join_handle: Mutex::new(Some(join_handle)) })
    }
}

fn run(
    shutdown: &Arc<Mutex<ShutdownState>>,
    sc: &Arc<Condvar>,
    cache: &Arc<CacheInner>,
    flush_every_ms: u64,
) {
    let flush_every = Duration::from_millis(flush_every_ms);
    let mut shutdown = shutdown.lock();
    while shutdown.is_running() {
        let before = Instant::now();

        if let Err(e) = cache.flush() {
            log::error!("failed to flush from periodic flush thread: {}", e);
            cache.set_global_error(e);

            *shutdown = ShutdownState::ShutDown;

            // having held the mutex makes this linearized
            // with the notify below.
            drop(shutdown);

            let _notified = sc.notify_all();
            return;
        }

        let sleep_duration = flush_every
            .checked_sub(before.elapsed())
            .unwrap_or_else(|| Duration::from_millis(1));

        if shutdown.is_running() {
            sc.wait_for(&mut shutdown, sleep_duration);
        }
    }

    // the final flush belongs to Cache::shutdown, which runs
    // after every transaction has finished
    *shutdown = ShutdownState::ShutDown;

    // having held the mutex makes this linearized
    // with the notify below.
    drop(shutdown);

    let _notified = sc.notify_all();
}

impl Drop for Flusher {
    fn drop(&mut self) {
        let mut shutdown = self.shutdown.lock();
        if shutdown.is_running() {
            *shutdown = ShutdownState::ShuttingDown;
            let _notified = self.sc.notify_all();
        }

        while !shutdown.is_shutdown() {
            let _ = self.sc.wait_for(&mut shutdown, Duration::from_millis(100));
        }
        drop(shutdown);

        let mut join_handle_opt = self.join_handle.lock();
        if let Some(join_handle) = join_handle_opt.take() {
            if let Err(e) = join_handle.join() {
                log::error!("error joining flusher thread: {:?}", e);
            }
        }
    }
}
