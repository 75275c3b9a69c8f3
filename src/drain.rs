use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::{Error, Result};

#[derive(Debug, Default)]
struct DrainState {
    live: usize,
    draining: bool,
}

/// Counts live transactions so that shutdown can wait for the last one.
#[derive(Debug, Default)]
pub(crate) struct Drain {
    mu: Mutex<DrainState>,
    cv: Condvar,
}

/// Held by each live transaction.
#[derive(Debug)]
pub(crate) struct DrainGuard {
    drain: Arc<Drain>,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        let mut state = self.drain.mu.lock();
        state.live -= 1;
        if state.live == 0 {
            drop(state);
            self.drain.cv.notify_all();
        }
    }
}

impl Drain {
    /// Fails once `begin_draining` has been called.
    pub(crate) fn enter(self: &Arc<Self>) -> Result<DrainGuard> {
        let mut state = self.mu.lock();
        if state.draining {
            return Err(Error::ShuttingDown);
        }
        state.live += 1;
        Ok(DrainGuard { drain: self.clone() })
    }

    pub(crate) fn live(&self) -> usize {
        self.mu.lock().live
    }

    #[cfg(test)]
    fn is_draining(&self) -> bool {
        self.mu.lock().draining
    }

    /// Refuse new entries and block until every guard is dropped. Returns
    /// false if another caller had already started draining.
    pub(crate) fn begin_draining(&self) -> bool {
        let mut state = self.mu.lock();
        let first = !state.draining;
        state.draining = true;
        while state.live > 0 {
            log::debug!("waiting for {} live transactions to finish", state.live);
            self.cv.wait(&mut state);
        }
        first
    }
}
