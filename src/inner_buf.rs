use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::order::OrderSink;
use crate::patch::PatchEntry;
use crate::rwi_lock::RwiLock;
use crate::serializer::BlockToken;
use crate::snapshot::Versions;
use crate::{BlockId, Error, Recency, Result, SnapshotVersion};

/// Where a block is in its load cycle.
#[derive(Debug)]
pub(crate) enum Load {
    /// The creator holds the write lock and is reading the block.
    Loading,
    Loaded,
    /// The read failed. Every waiter gets a clone of the error.
    Failed(Error),
}

/// Per-block writeback bookkeeping.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LocalBuf {
    /// The data changed since it was last written.
    pub dirty: bool,
    /// The recency changed since it was last written.
    pub recency_dirty: bool,
    /// The next flush must write the whole block rather than rely on the
    /// patch log.
    pub needs_full_write: bool,
}

impl LocalBuf {
    pub fn is_clean(&self) -> bool {
        !self.dirty && !self.recency_dirty && !self.needs_full_write
    }
}

/// A copy of a block's data as it was before a write superseded it.
///
/// Keyed in `InnerState::snapshots` by the version it became current at,
/// so it is valid for pins in `key..superseded_at`.
#[derive(Debug)]
pub(crate) struct BufSnapshot {
    pub superseded_at: SnapshotVersion,
    /// `None` once the memory was shed; reloaded from `token` on demand.
    pub data: Option<Arc<Vec<u8>>>,
    pub token: Option<BlockToken>,
    /// Handles currently reading this snapshot.
    pub data_refcount: usize,
}

/// What a pinned reader should see.
#[derive(Debug)]
pub(crate) enum Resolved {
    Current(Arc<Vec<u8>>),
    Snapshot {
        key: SnapshotVersion,
        data: Option<Arc<Vec<u8>>>,
        token: Option<BlockToken>,
    },
}

#[derive(Debug)]
pub(crate) struct InnerState {
    pub load: Load,
    pub data: Option<Arc<Vec<u8>>>,
    /// The version `data` belongs to.
    pub version: SnapshotVersion,
    pub recency: Recency,
    pub patch_counter: u64,
    /// Bumped by every publish. Writeback compares it to tell whether a
    /// block changed while its image was being written.
    pub modifications: u64,
    /// Live handles plus threads between the page map and the lock.
    pub refcount: usize,
    pub deleted: bool,
    /// The on-disk image equal to `data`, if there is one.
    pub disk_token: Option<BlockToken>,
    /// Some image of this block exists on disk, so patches can be replayed
    /// on top of it.
    pub has_disk_base: bool,
    pub snapshots: BTreeMap<SnapshotVersion, BufSnapshot>,
    pub writeback: LocalBuf,
    pub unload_on_flush: bool,
    /// `data` is a zeroed stand-in handed to a writer that skipped the
    /// read. Nobody but that writer may see it until it is released.
    pub unpublished: bool,
    pub order_sink: OrderSink,
}

/// The cache's authoritative in-memory state for one block.
#[derive(Debug)]
pub(crate) struct InnerBuf {
    pub block_id: BlockId,
    pub lock: RwiLock,
    pub state: Mutex<InnerState>,
}

impl InnerBuf {
    fn with_state(block_id: BlockId, lock: RwiLock, state: InnerState) -> Arc<InnerBuf> {
        Arc::new(InnerBuf { block_id, lock, state: Mutex::new(state) })
    }

    /// A block about to be read by its creator, who holds the write lock
    /// and one reference.
    pub fn loading(block_id: BlockId, ordering_checks: bool) -> Arc<InnerBuf> {
        let mut state = InnerState::new(ordering_checks);
        state.refcount = 1;
        InnerBuf::with_state(block_id, RwiLock::new_write_locked(), state)
    }

    /// A block fresh from the allocator, write-locked and referenced by its
    /// creator, to be written whole on the next flush.
    pub fn allocated(
        block_id: BlockId,
        data: Vec<u8>,
        recency: Recency,
        version: SnapshotVersion,
        ordering_checks: bool,
    ) -> Arc<InnerBuf> {
        let mut state = InnerState::new(ordering_checks);
        state.load = Load::Loaded;
        state.data = Some(Arc::new(data));
        state.recency = recency;
        state.version = version;
        state.refcount = 1;
        state.writeback =
            LocalBuf { dirty: true, recency_dirty: true, needs_full_write: true };
        InnerBuf::with_state(block_id, RwiLock::new_write_locked(), state)
    }

    /// A block whose contents are already known.
    pub fn loaded(
        block_id: BlockId,
        data: Vec<u8>,
        recency: Recency,
        disk_token: Option<BlockToken>,
        has_disk_base: bool,
        ordering_checks: bool,
    ) -> Arc<InnerBuf> {
        let mut state = InnerState::new(ordering_checks);
        state.load = Load::Loaded;
        state.has_disk_base = has_disk_base;
        state.disk_token = disk_token;
        state.data = Some(Arc::new(data));
        state.recency = recency;
        InnerBuf::with_state(block_id, RwiLock::new(), state)
    }
}

impl InnerState {
    fn new(ordering_checks: bool) -> InnerState {
        InnerState {
            load: Load::Loading,
            data: None,
            version: SnapshotVersion::FAUX,
            recency: Recency::DISTANT_PAST,
            patch_counter: 0,
            modifications: 0,
            refcount: 0,
            deleted: false,
            disk_token: None,
            has_disk_base: false,
            snapshots: BTreeMap::new(),
            writeback: LocalBuf::default(),
            unload_on_flush: false,
            unpublished: false,
            order_sink: OrderSink::new(ordering_checks),
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.load, Load::Loaded)
    }

    /// Loaded, and `data` is something a reader may see without the lock.
    pub fn is_published(&self) -> bool {
        self.is_loaded() && !self.unpublished
    }

    /// Finish a load whose read was skipped for the writer at `version`.
    /// Readers pinned before that writer keep seeing `old_image`.
    pub fn finish_skipped_load(
        &mut self,
        data: Vec<u8>,
        recency: Recency,
        old_image: Option<BlockToken>,
        version: SnapshotVersion,
    ) {
        let has_disk_base = old_image.is_some();
        self.finish_load(data, recency, None, has_disk_base);
        self.unpublished = true;
        // patches against the old image must not be replayed over the
        // writer's contents
        self.writeback.needs_full_write = true;

        if let Some(token) = old_image {
            let snapshot = BufSnapshot {
                superseded_at: version,
                data: None,
                token: Some(token),
                data_refcount: 0,
            };
            self.snapshots.insert(self.version, snapshot);
            self.version = version;
        }
    }

    /// The error a waiter should report, if the load failed.
    pub fn load_error(&self) -> Option<Error> {
        match &self.load {
            Load::Failed(e) => Some(e.clone()),
            _ => None,
        }
    }

    pub fn finish_load(
        &mut self,
        data: Vec<u8>,
        recency: Recency,
        disk_token: Option<BlockToken>,
        has_disk_base: bool,
    ) {
        debug_assert!(matches!(self.load, Load::Loading));
        self.load = Load::Loaded;
        self.data = Some(Arc::new(data));
        self.recency = recency;
        self.disk_token = disk_token;
        self.has_disk_base = has_disk_base;
    }

    pub fn fail_load(&mut self, error: Error) {
        debug_assert!(matches!(self.load, Load::Loading));
        self.load = Load::Failed(error);
    }

    /// The published data. Only valid once loaded.
    pub fn current_data(&self) -> Result<Arc<Vec<u8>>> {
        self.data.clone().ok_or_else(|| {
            Error::ReportableBug("block has no data after loading".into())
        })
    }

    /// Retain the current data for readers pinned before `new_version`, if
    /// any may need it, and move the block to `new_version`. Returns whether
    /// a snapshot was taken.
    pub fn snapshot_if_needed(
        &mut self,
        new_version: SnapshotVersion,
        versions: &Versions,
    ) -> bool {
        // a writer that reached this block out of version order leaves it
        // at the newer version
        if new_version <= self.version {
            return false;
        }

        let old_version = std::mem::replace(&mut self.version, new_version);
        let token = self.disk_token.take();

        if !versions.needs_range(old_version, new_version) {
            return false;
        }

        let snapshot = BufSnapshot {
            superseded_at: new_version,
            data: self.data.clone(),
            token,
            data_refcount: 0,
        };
        let displaced = self.snapshots.insert(old_version, snapshot);
        debug_assert!(displaced.is_none());
        true
    }

    /// Pick the data a reader pinned at `pin` should see. An unpinned
    /// reader sees the current data. A snapshot handed out here has its
    /// data refcount raised and must be given back to
    /// `release_snapshot_data`.
    pub fn resolve(
        &mut self,
        block_id: BlockId,
        pin: Option<SnapshotVersion>,
    ) -> Result<Resolved> {
        let pin = match pin {
            Some(pin) if pin < self.version => pin,
            _ => return Ok(Resolved::Current(self.current_data()?)),
        };

        let Some((key, snapshot)) = self.snapshots.range_mut(..=pin).next_back()
        else {
            return Err(missing_snapshot(block_id, pin, self.version));
        };

        if snapshot.superseded_at <= pin {
            return Err(missing_snapshot(block_id, pin, self.version));
        }

        snapshot.data_refcount += 1;
        Ok(Resolved::Snapshot {
            key: *key,
            data: snapshot.data.clone(),
            token: snapshot.token.clone(),
        })
    }

    /// Put reloaded data back into a snapshot whose memory was shed.
    pub fn restore_snapshot_data(&mut self, key: SnapshotVersion, data: &Arc<Vec<u8>>) {
        if let Some(snapshot) = self.snapshots.get_mut(&key) {
            if snapshot.data.is_none() {
                snapshot.data = Some(data.clone());
            }
        }
    }

    pub fn release_snapshot_data(&mut self, key: SnapshotVersion) {
        let snapshot = self
            .snapshots
            .get_mut(&key)
            .expect("a snapshot with readers is never pruned");
        assert!(snapshot.data_refcount > 0, "snapshot data released twice");
        snapshot.data_refcount -= 1;
    }

    /// Drop snapshots that no live or future reader can need. Returns how
    /// many were dropped.
    pub fn prune_snapshots(&mut self, versions: &Versions) -> usize {
        let before = self.snapshots.len();
        self.snapshots.retain(|key, snapshot| {
            snapshot.data_refcount > 0
                || versions.needs_range(*key, snapshot.superseded_at)
        });
        before - self.snapshots.len()
    }

    /// Drop the memory of snapshots that can be reloaded from disk.
    /// Returns how many were shed.
    pub fn shed_snapshot_memory(&mut self) -> usize {
        let mut shed = 0;
        for snapshot in self.snapshots.values_mut() {
            if snapshot.token.is_some()
                && snapshot.data_refcount == 0
                && snapshot.data.take().is_some()
            {
                shed += 1;
            }
        }
        shed
    }

    /// Safe to drop from the cache. `lock_in_use` is the state of the
    /// block's lock.
    pub fn safe_to_unload(&self, lock_in_use: bool) -> bool {
        self.refcount == 0
            && !lock_in_use
            && self.is_loaded()
            && !self.deleted
            && self.writeback.is_clean()
            && self.snapshots.is_empty()
    }

    /// A deleted block with no handles and no snapshots left.
    pub fn can_destroy(&self) -> bool {
        self.deleted && self.refcount == 0 && self.snapshots.is_empty()
    }
}

fn missing_snapshot(
    block_id: BlockId,
    pin: SnapshotVersion,
    version: SnapshotVersion,
) -> Error {
    Error::Corruption {
        block_id,
        detail: format!(
            "no snapshot covers version {} (block is at version {})",
            pin.0, version.0
        ),
    }
}

/// Re-apply patches recorded since the on-disk image was written.
pub(crate) fn replay_patches(data: &mut [u8], patches: &[PatchEntry]) {
    for entry in patches {
        entry.patch.apply_to(data);
    }
}
