use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::signal::{WaitState, Waiter};
use crate::{Error, Interruptor, Result};

/// Admits at most `width` holders at a time, strictly in the order they
/// asked. Write transactions pass through one of these, which fixes the
/// order their versions and order tokens are assigned in.
#[derive(Debug)]
pub(crate) struct FifoThrottle {
    width: usize,
    state: Mutex<FifoState>,
}

#[derive(Debug, Default)]
struct FifoState {
    active: usize,
    queue: VecDeque<Arc<Waiter>>,
}

/// Returns its slot to the throttle on drop.
#[derive(Debug)]
pub(crate) struct FifoPermit {
    throttle: Arc<FifoThrottle>,
}

impl Drop for FifoPermit {
    fn drop(&mut self) {
        let mut state = self.throttle.state.lock();
        state.active -= 1;
        self.throttle.admit(&mut state);
    }
}

impl FifoThrottle {
    pub(crate) fn new(width: usize) -> Arc<FifoThrottle> {
        assert!(width > 0, "a FifoThrottle must admit at least one holder");
        Arc::new(FifoThrottle { width, state: Mutex::default() })
    }

    fn admit(&self, state: &mut FifoState) {
        while state.active < self.width {
            let Some(waiter) = state.queue.pop_front() else {
                return;
            };
            if waiter.grant() {
                state.active += 1;
            }
        }
    }

    pub(crate) fn enter(
        self: &Arc<Self>,
        interruptor: Option<&Interruptor>,
    ) -> Result<FifoPermit> {
        let mut state = self.state.lock();
        if state.queue.is_empty() && state.active < self.width {
            state.active += 1;
            return Ok(FifoPermit { throttle: self.clone() });
        }

        let waiter = Waiter::new();
        state.queue.push_back(waiter.clone());
        drop(state);

        if let Some(interruptor) = interruptor {
            interruptor.subscribe(&waiter);
        }

        match waiter.wait() {
            WaitState::Granted => Ok(FifoPermit { throttle: self.clone() }),
            WaitState::Interrupted => {
                let mut state = self.state.lock();
                state.queue.retain(|w| !Arc::ptr_eq(w, &waiter));
                self.admit(&mut state);
                Err(Error::Interrupted)
            }
            WaitState::Pending => unreachable!(),
        }
    }

    #[cfg(test)]
    fn active(&self) -> usize {
        self.state.lock().active
    }
}

#[cfg(test)]
mod test {
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn admits_in_request_order() {
        let fifo = FifoThrottle::new(1);
        let first = fifo.enter(None).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let mut threads = vec![];
        for i in 0..4 {
            let waiting = fifo.clone();
            let tx = tx.clone();
            threads.push(thread::spawn(move || {
                let _permit = waiting.enter(None).unwrap();
                tx.send(i).unwrap();
            }));
            // give each thread time to queue before the next one
            while fifo.state.lock().queue.len() < i + 1 {
                thread::sleep(Duration::from_millis(1));
            }
        }

        drop(first);
        for t in threads {
            t.join().unwrap();
        }
        let order: Vec<usize> = rx.try_iter().collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
        assert_eq!(fifo.active(), 0);
    }

    #[test]
    fn width_bounds_holders() {
        let fifo = FifoThrottle::new(2);
        let a = fifo.enter(None).unwrap();
        let _b = fifo.enter(None).unwrap();

        let interruptor = Interruptor::new();
        interruptor.pulse();
        assert_eq!(fifo.enter(Some(&interruptor)).unwrap_err(), Error::Interrupted);

        drop(a);
        let _c = fifo.enter(None).unwrap();
        assert_eq!(fifo.active(), 2);
    }
}
