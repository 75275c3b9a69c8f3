use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::signal::{WaitState, Waiter};
use crate::{Access, Error, Interruptor, Result};

/// A reader/writer lock that grants waiters strictly in arrival order.
///
/// Any number of readers or a single writer may hold it. A reader that
/// arrives while a writer is queued waits behind that writer, so writers
/// never starve. `ReadOutdatedOk` locks exactly like `Read`; callers that
/// want to skip the queue use `try_lock` and fall back to stale data.
///
/// The lock is not tied to a guard: whoever `lock`s must `unlock` with the
/// same access mode. `Buf` is the RAII owner in this crate.
#[derive(Debug, Default)]
pub struct RwiLock {
    state: Mutex<LockState>,
}

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: bool,
    queue: VecDeque<Request>,
}

#[derive(Debug)]
struct Request {
    exclusive: bool,
    waiter: Arc<Waiter>,
}

impl LockState {
    fn compatible(&self, exclusive: bool) -> bool {
        if exclusive { !self.writer && self.readers == 0 } else { !self.writer }
    }

    fn take(&mut self, exclusive: bool) {
        if exclusive {
            self.writer = true;
        } else {
            self.readers += 1;
        }
    }

    fn grant_pending(&mut self) {
        while self.queue.front().is_some_and(|front| self.compatible(front.exclusive)) {
            let Some(request) = self.queue.pop_front() else {
                return;
            };
            // an interrupted waiter has already given up its place
            if request.waiter.grant() {
                self.take(request.exclusive);
            }
        }
    }
}

impl RwiLock {
    /// An unlocked lock.
    pub fn new() -> RwiLock {
        RwiLock::default()
    }

    /// A lock that starts out held for writing by its creator, used while
    /// a block is being loaded.
    pub(crate) fn new_write_locked() -> RwiLock {
        let lock = RwiLock::new();
        lock.state.lock().writer = true;
        lock
    }

    /// Take the lock without waiting. Fails if anybody holds it
    /// incompatibly or is already queued.
    pub fn try_lock(&self, access: Access) -> bool {
        let exclusive = !access.is_read();
        let mut state = self.state.lock();
        if state.queue.is_empty() && state.compatible(exclusive) {
            state.take(exclusive);
            true
        } else {
            false
        }
    }

    /// Wait in line for the lock.
    ///
    /// `call_when_in_line` runs exactly once, after this request has a
    /// place in the queue and before it is granted (or right after an
    /// immediate grant). If `interruptor` fires first, the request leaves
    /// the queue and `Error::Interrupted` is returned.
    pub fn lock(
        &self,
        access: Access,
        interruptor: Option<&Interruptor>,
        call_when_in_line: Option<&mut dyn FnMut()>,
    ) -> Result<()> {
        let exclusive = !access.is_read();
        let mut state = self.state.lock();

        if state.queue.is_empty() && state.compatible(exclusive) {
            state.take(exclusive);
            drop(state);
            if let Some(hook) = call_when_in_line {
                hook();
            }
            return Ok(());
        }

        let waiter = Waiter::new();
        state.queue.push_back(Request { exclusive, waiter: waiter.clone() });
        drop(state);

        log::trace!("waiting in line for {:?} lock", access);

        if let Some(hook) = call_when_in_line {
            hook();
        }
        if let Some(interruptor) = interruptor {
            interruptor.subscribe(&waiter);
        }

        match waiter.wait() {
            WaitState::Granted => Ok(()),
            WaitState::Interrupted => {
                let mut state = self.state.lock();
                if let Some(idx) = state
                    .queue
                    .iter()
                    .position(|r| Arc::ptr_eq(&r.waiter, &waiter))
                {
                    state.queue.remove(idx);
                    state.grant_pending();
                }
                Err(Error::Interrupted)
            }
            WaitState::Pending => unreachable!(),
        }
    }

    /// Release a hold taken with `access`.
    pub fn unlock(&self, access: Access) {
        let mut state = self.state.lock();
        if access.is_read() {
            assert!(state.readers > 0, "unlocking a read lock that is not held");
            state.readers -= 1;
        } else {
            assert!(state.writer, "unlocking a write lock that is not held");
            state.writer = false;
        }
        state.grant_pending();
    }

    /// Whether anybody holds the lock.
    pub fn locked(&self) -> bool {
        let state = self.state.lock();
        state.writer || state.readers > 0
    }

    /// Whether a writer holds the lock.
    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer
    }

    /// Whether anybody holds the lock or waits for it.
    pub(crate) fn in_use(&self) -> bool {
        let state = self.state.lock();
        state.writer || state.readers > 0 || !state.queue.is_empty()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn readers_share() {
        let lock = RwiLock::new();
        lock.lock(Access::Read, None, None).unwrap();
        assert!(lock.try_lock(Access::Read));
        assert!(!lock.try_lock(Access::Write));
        lock.unlock(Access::Read);
        lock.unlock(Access::Read);
        assert!(!lock.locked());
    }

    #[test]
    fn reader_queues_behind_waiting_writer() {
        let lock = Arc::new(RwiLock::new());
        lock.lock(Access::Read, None, None).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let l2 = lock.clone();
        let writer = thread::spawn(move || {
            let mut in_line = || tx.send(()).unwrap();
            l2.lock(Access::Write, None, Some(&mut in_line)).unwrap();
            l2.unlock(Access::Write);
        });

        rx.recv().unwrap();
        // the writer is queued, so a new reader may not jump ahead
        assert!(!lock.try_lock(Access::Read));

        lock.unlock(Access::Read);
        writer.join().unwrap();
        assert!(lock.try_lock(Access::Read));
        lock.unlock(Access::Read);
    }

    #[test]
    fn writers_are_exclusive() {
        let lock = Arc::new(RwiLock::new());
        let inside = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let lock = lock.clone();
                let inside = inside.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        lock.lock(Access::Write, None, None).unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        lock.unlock(Access::Write);
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }
        assert!(!lock.locked());
    }

    #[test]
    fn interrupted_waiter_leaves_the_queue() {
        let lock = Arc::new(RwiLock::new());
        lock.lock(Access::Write, None, None).unwrap();

        let interruptor = Interruptor::new();
        let l2 = lock.clone();
        let i2 = interruptor.clone();
        let waiter = thread::spawn(move || l2.lock(Access::Read, Some(&i2), None));

        thread::sleep(Duration::from_millis(20));
        interruptor.pulse();
        assert_eq!(waiter.join().unwrap(), Err(Error::Interrupted));

        lock.unlock(Access::Write);
        assert!(!lock.in_use());
        assert!(lock.try_lock(Access::Write));
        lock.unlock(Access::Write);
    }
}
