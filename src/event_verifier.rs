use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::BlockId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Unloaded,
    Loading,
    Clean,
    Dirty,
    Deleted,
}

impl State {
    fn can_transition_to(&self, next: State) -> bool {
        match (self, next) {
            (State::Unloaded, State::Loading) => true,
            (State::Unloaded, State::Clean) => true,
            (State::Unloaded, State::Dirty) => true,
            (State::Unloaded, _) => false,
            (State::Loading, State::Clean) => true,
            (State::Loading, State::Unloaded) => true,
            (State::Loading, _) => false,
            (State::Clean, State::Dirty) => true,
            (State::Clean, State::Deleted) => true,
            (State::Clean, State::Unloaded) => true,
            (State::Clean, _) => false,
            (State::Dirty, State::Dirty) => true,
            (State::Dirty, State::Clean) => true,
            (State::Dirty, State::Deleted) => true,
            (State::Dirty, _) => false,
            (State::Deleted, State::Unloaded) => true,
            (State::Deleted, _) => false,
        }
    }
}

/// Checks that every block moves through its load, write and eviction
/// states legally, and that nothing is left dirty after a clean shutdown.
#[derive(Debug, Default)]
pub(crate) struct EventVerifier {
    model: Mutex<BTreeMap<BlockId, Vec<(State, &'static str)>>>,
}

impl EventVerifier {
    pub(crate) fn mark(&self, block_id: BlockId, state: State, at: &'static str) {
        let mut model = self.model.lock();
        let history = model.entry(block_id).or_default();

        let last = history.last().map_or(State::Unloaded, |(last, _at)| *last);
        assert!(
            last.can_transition_to(state),
            "block {block_id} performed illegal state transition from \
            {last:?} to {state:?} at {at}.\nhistory: {:#?}",
            *history
        );
        history.push((state, at));
    }

    /// Called once the final flush of a shutdown succeeded.
    pub(crate) fn assert_nothing_dirty(&self) {
        let model = self.model.lock();
        for (block_id, history) in model.iter() {
            if let Some((last_state, _at)) = history.last() {
                assert_ne!(
                    *last_state,
                    State::Dirty,
                    "block {block_id} is Dirty after the final flush.\nhistory: {history:#?}"
                );
            }
        }
    }

    pub(crate) fn print_debug_history_for_block(&self, block_id: BlockId) {
        let model = self.model.lock();
        println!("history for block {}: {:#?}", block_id, model.get(&block_id));
    }
}
