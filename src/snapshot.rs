use std::collections::{BTreeMap, BTreeSet};

use crate::{SnapshotVersion, TxnId};

/// The version a transaction settled on at its first acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Finalized {
    /// A write transaction's own version, in flight until it finishes.
    Write(SnapshotVersion),
    /// A snapshotting reader's pin.
    Pinned(SnapshotVersion),
    /// A plain reader, which always sees the latest data.
    Unpinned,
}

impl Finalized {
    pub fn pin(self) -> Option<SnapshotVersion> {
        match self {
            Finalized::Pinned(version) => Some(version),
            _ => None,
        }
    }

    pub fn write_version(self) -> Option<SnapshotVersion> {
        match self {
            Finalized::Write(version) => Some(version),
            _ => None,
        }
    }
}

/// Cache-wide version bookkeeping.
///
/// `current` is the last version handed to a write transaction. Write
/// versions stay `in_flight` until their transaction finishes, and a
/// snapshotting reader pins the newest version whose writers have all
/// finished (the horizon). The registry maps each pinned version to the
/// transactions pinning it, so the oldest and newest pins are O(1) lookups.
#[derive(Debug, Default)]
pub(crate) struct Versions {
    current: SnapshotVersion,
    in_flight: BTreeSet<SnapshotVersion>,
    registry: BTreeMap<SnapshotVersion, BTreeSet<TxnId>>,
}

impl Versions {
    pub fn current(&self) -> SnapshotVersion {
        self.current
    }

    /// Hand out the next write version.
    pub fn begin_write(&mut self) -> SnapshotVersion {
        self.current = self.current.next();
        self.in_flight.insert(self.current);
        self.current
    }

    pub fn end_write(&mut self, version: SnapshotVersion) {
        let removed = self.in_flight.remove(&version);
        debug_assert!(removed, "write version {:?} was not in flight", version);
    }

    /// The newest version no unfinished writer can still change. Any pin
    /// taken from now on is at least this.
    pub fn horizon(&self) -> SnapshotVersion {
        match self.in_flight.first() {
            Some(oldest) => SnapshotVersion(oldest.0 - 1),
            None => self.current,
        }
    }

    /// Pin the horizon on behalf of `txn_id`.
    pub fn register(&mut self, txn_id: TxnId) -> SnapshotVersion {
        let version = self.horizon();
        self.registry.entry(version).or_default().insert(txn_id);
        version
    }

    pub fn unregister(&mut self, version: SnapshotVersion, txn_id: TxnId) {
        let Some(txns) = self.registry.get_mut(&version) else {
            panic!("{:?} unregistered a snapshot it never registered", txn_id);
        };
        let removed = txns.remove(&txn_id);
        assert!(removed, "{:?} unregistered a snapshot twice", txn_id);
        if txns.is_empty() {
            self.registry.remove(&version);
        }
    }

    pub fn min_pinned(&self, default: SnapshotVersion) -> SnapshotVersion {
        self.registry.first_key_value().map_or(default, |(v, _)| *v)
    }

    pub fn max_pinned(&self, default: SnapshotVersion) -> SnapshotVersion {
        self.registry.last_key_value().map_or(default, |(v, _)| *v)
    }

    /// Number of live pins in `from..until`.
    pub fn pins_in(&self, from: SnapshotVersion, until: SnapshotVersion) -> usize {
        if from >= until || self.registry.is_empty() {
            return 0;
        }
        // cheap rejection before walking the range
        let min = self.min_pinned(until);
        let max = self.max_pinned(from);
        if min >= until || max < from {
            return 0;
        }
        self.registry.range(from..until).map(|(_, txns)| txns.len()).sum()
    }

    /// Whether data that was current over `from..until` may still be read
    /// by a live or future snapshot.
    pub fn needs_range(&self, from: SnapshotVersion, until: SnapshotVersion) -> bool {
        self.horizon() < until || self.pins_in(from, until) > 0
    }

    pub fn writers_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn live_snapshots(&self) -> usize {
        self.registry.values().map(BTreeSet::len).sum()
    }
}
