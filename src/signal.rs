use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

/// A one-shot cancellation signal.
///
/// Pass it to a blocking acquisition (`AcquireOptions::interruptor`) and
/// `pulse` it from anywhere to make that acquisition return
/// `Error::Interrupted`. Clones share the same signal.
#[derive(Clone, Default)]
pub struct Interruptor {
    inner: Arc<SignalInner>,
}

#[derive(Default)]
struct SignalInner {
    pulsed: AtomicBool,
    waiters: Mutex<Vec<Weak<Waiter>>>,
}

impl std::fmt::Debug for Interruptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interruptor")
            .field("pulsed", &self.is_pulsed())
            .finish()
    }
}

impl Interruptor {
    /// A signal that has not fired.
    pub fn new() -> Interruptor {
        Interruptor::default()
    }

    /// Fire the signal, waking everything currently waiting on it.
    pub fn pulse(&self) {
        self.inner.pulsed.store(true, Ordering::SeqCst);

        let waiters = std::mem::take(&mut *self.inner.waiters.lock());
        for waiter in waiters.iter().filter_map(Weak::upgrade) {
            waiter.interrupt();
        }
    }

    /// Whether `pulse` has been called.
    pub fn is_pulsed(&self) -> bool {
        self.inner.pulsed.load(Ordering::SeqCst)
    }

    pub(crate) fn subscribe(&self, waiter: &Arc<Waiter>) {
        let mut waiters = self.inner.waiters.lock();
        waiters.retain(|w| w.strong_count() > 0);
        waiters.push(Arc::downgrade(waiter));
        drop(waiters);

        // pulse may have drained the list before we pushed
        if self.is_pulsed() {
            waiter.interrupt();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitState {
    Pending,
    Granted,
    Interrupted,
}

/// One blocked thread. The first of `grant` and `interrupt` wins.
#[derive(Debug)]
pub(crate) struct Waiter {
    state: Mutex<WaitState>,
    cv: Condvar,
}

impl Waiter {
    pub(crate) fn new() -> Arc<Waiter> {
        Arc::new(Waiter { state: Mutex::new(WaitState::Pending), cv: Condvar::new() })
    }

    pub(crate) fn grant(&self) -> bool {
        self.transition(WaitState::Granted)
    }

    pub(crate) fn interrupt(&self) -> bool {
        self.transition(WaitState::Interrupted)
    }

    fn transition(&self, to: WaitState) -> bool {
        let mut state = self.state.lock();
        if *state != WaitState::Pending {
            return false;
        }
        *state = to;
        drop(state);
        self.cv.notify_all();
        true
    }

    /// Blocks until granted or interrupted.
    pub(crate) fn wait(&self) -> WaitState {
        let mut state = self.state.lock();
        while *state == WaitState::Pending {
            self.cv.wait(&mut state);
        }
        *state
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_transition_wins() {
        let waiter = Waiter::new();
        assert!(waiter.interrupt());
        assert!(!waiter.grant());
        assert_eq!(waiter.wait(), WaitState::Interrupted);
    }

    #[test]
    fn pulse_wakes_subscribed_waiter() {
        let interruptor = Interruptor::new();
        let waiter = Waiter::new();
        interruptor.subscribe(&waiter);

        let i2 = interruptor.clone();
        let t = std::thread::spawn(move || i2.pulse());

        assert_eq!(waiter.wait(), WaitState::Interrupted);
        t.join().unwrap();
    }

    #[test]
    fn subscribing_after_pulse_interrupts_immediately() {
        let interruptor = Interruptor::new();
        interruptor.pulse();

        let waiter = Waiter::new();
        interruptor.subscribe(&waiter);
        assert_eq!(waiter.wait(), WaitState::Interrupted);
    }
}
