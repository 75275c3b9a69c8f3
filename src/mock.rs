use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::debug_delay::pace_write;
use crate::order::OrderSink;
use crate::snapshot::{Finalized, Versions};
use crate::transaction::lock_mode;
use crate::{
    AcquireOptions, Access, BlockId, Error, OrderToken, Patch, Recency, Result,
    RwiLock, SUPERBLOCK_ID, SnapshotVersion, TxnId,
};

/// Configuration for [`MockCache`].
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Size of every block.
    pub block_size: usize,
    /// Pause or yield at random as write transactions begin and finish,
    /// while other writers are in flight.
    pub inject_delays: bool,
    /// Check order tokens when transactions begin and at every block, the
    /// way the real cache does.
    pub enable_ordering_checks: bool,
}

impl Default for MockConfig {
    fn default() -> MockConfig {
        MockConfig { block_size: 4096, inject_delays: false, enable_ordering_checks: true }
    }
}

/// An in-memory reference implementation of the cache's interface.
///
/// Every block lives in memory forever, and every version a snapshotting
/// reader could still ask for is kept alongside the newest one. There is no
/// writeback and no eviction.
#[derive(Clone)]
pub struct MockCache {
    inner: Arc<MockInner>,
}

struct MockInner {
    config: MockConfig,
    blocks: Mutex<BTreeMap<BlockId, Arc<MockBlock>>>,
    ids: Mutex<MockIds>,
    versions: Mutex<Versions>,
    admission: Mutex<OrderSink>,
    next_txn_id: AtomicU64,
}

#[derive(Debug)]
struct MockIds {
    tip: BlockId,
    free: BTreeSet<BlockId>,
}

#[derive(Debug)]
struct MockBlock {
    block_id: BlockId,
    lock: RwiLock,
    state: Mutex<MockState>,
}

#[derive(Debug)]
struct MockState {
    /// Contents keyed by the version that wrote them. `None` is a deletion.
    history: BTreeMap<SnapshotVersion, Option<Arc<Vec<u8>>>>,
    recency: Recency,
    refcount: usize,
    order_sink: OrderSink,
}

impl MockState {
    fn latest(&self) -> Option<(SnapshotVersion, &Option<Arc<Vec<u8>>>)> {
        self.history.last_key_value().map(|(version, data)| (*version, data))
    }

    fn is_deleted(&self) -> bool {
        matches!(self.latest(), Some((_, None)))
    }

    fn prune(&mut self, versions: &Versions) {
        let keys: Vec<SnapshotVersion> = self.history.keys().copied().collect();
        for pair in keys.windows(2) {
            if !versions.needs_range(pair[0], pair[1]) {
                self.history.remove(&pair[0]);
            }
        }
    }
}

impl fmt::Debug for MockCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockCache")
            .field("config", &self.inner.config)
            .field("blocks", &self.inner.blocks.lock().len())
            .finish()
    }
}

impl MockCache {
    /// A mock holding only a zeroed superblock.
    pub fn new(config: MockConfig) -> MockCache {
        let superblock = MockBlock::new(
            SUPERBLOCK_ID,
            SnapshotVersion::FAUX,
            vec![0; config.block_size],
            Recency::DISTANT_PAST,
            config.enable_ordering_checks,
        );
        let admission = OrderSink::new(config.enable_ordering_checks);

        let mut blocks = BTreeMap::new();
        blocks.insert(SUPERBLOCK_ID, superblock);

        MockCache {
            inner: Arc::new(MockInner {
                config,
                blocks: Mutex::new(blocks),
                ids: Mutex::new(MockIds { tip: SUPERBLOCK_ID + 1, free: BTreeSet::new() }),
                versions: Mutex::default(),
                admission: Mutex::new(admission),
                next_txn_id: AtomicU64::new(1),
            }),
        }
    }

    /// Begin a `Read` or `Write` transaction. The mock has no admission
    /// limit, so `expected_change_count` is only checked for sanity.
    pub fn begin_transaction(
        &self,
        access: Access,
        expected_change_count: usize,
        recency: Recency,
        order_token: OrderToken,
    ) -> Result<MockTransaction> {
        assert_ne!(access, Access::ReadOutdatedOk, "transactions are either Read or Write");
        debug_assert!(
            access == Access::Write || expected_change_count == 0,
            "read transactions change nothing"
        );

        self.inner.admission.lock().check_out(order_token);

        if access == Access::Write && self.inner.config.inject_delays {
            pace_write(self.inner.versions.lock().writers_in_flight());
        }

        Ok(MockTransaction {
            cache: self.inner.clone(),
            txn_id: TxnId(self.inner.next_txn_id.fetch_add(1, Ordering::Relaxed)),
            access,
            recency,
            order_token,
            snapshotted: false,
            version: OnceLock::new(),
            finished: false,
        })
    }

    /// The last version handed to a write transaction.
    pub fn get_current_version_id(&self) -> SnapshotVersion {
        self.inner.versions.lock().current()
    }

    /// The oldest pinned version, or `default`.
    pub fn get_min_snapshot_version(&self, default: SnapshotVersion) -> SnapshotVersion {
        self.inner.versions.lock().min_pinned(default)
    }

    /// The newest pinned version, or `default`.
    pub fn get_max_snapshot_version(&self, default: SnapshotVersion) -> SnapshotVersion {
        self.inner.versions.lock().max_pinned(default)
    }

    /// Whether `block_id` is live.
    pub fn contains_block(&self, block_id: BlockId) -> bool {
        self.inner
            .blocks
            .lock()
            .get(&block_id)
            .is_some_and(|block| !block.state.lock().is_deleted())
    }

    /// Size of every block.
    pub fn block_size(&self) -> usize {
        self.inner.config.block_size
    }

    /// How many versions of `block_id` are still kept.
    pub fn retained_versions(&self, block_id: BlockId) -> usize {
        self.inner
            .blocks
            .lock()
            .get(&block_id)
            .map_or(0, |block| block.state.lock().history.len())
    }
}

impl MockBlock {
    fn new(
        block_id: BlockId,
        version: SnapshotVersion,
        data: Vec<u8>,
        recency: Recency,
        ordering_checks: bool,
    ) -> Arc<MockBlock> {
        let mut history = BTreeMap::new();
        history.insert(version, Some(Arc::new(data)));
        let state = MockState {
            history,
            recency,
            refcount: 0,
            order_sink: OrderSink::new(ordering_checks),
        };
        Arc::new(MockBlock { block_id, lock: RwiLock::new(), state: Mutex::new(state) })
    }
}

impl MockInner {
    fn pin(&self, block_id: BlockId) -> Result<Arc<MockBlock>> {
        let blocks = self.blocks.lock();
        let Some(block) = blocks.get(&block_id) else {
            return Err(Error::ReportableBug(format!(
                "acquired block {} which is not allocated",
                block_id
            )));
        };
        block.state.lock().refcount += 1;
        Ok(block.clone())
    }

    fn unpin(&self, block: &MockBlock) {
        let mut blocks = self.blocks.lock();
        let mut state = block.state.lock();
        state.refcount -= 1;
        state.prune(&self.versions.lock());
        if state.refcount == 0 && state.is_deleted() && state.history.len() == 1 {
            drop(state);
            blocks.remove(&block.block_id);
            self.ids.lock().free.insert(block.block_id);
        }
    }

    /// Drop versions that no reader can see any more.
    fn collect(&self) {
        let mut blocks = self.blocks.lock();
        let mut gone = vec![];
        for (block_id, block) in blocks.iter() {
            let mut state = block.state.lock();
            state.prune(&self.versions.lock());
            if state.refcount == 0 && state.is_deleted() && state.history.len() == 1 {
                gone.push(*block_id);
            }
        }
        for block_id in gone {
            blocks.remove(&block_id);
            self.ids.lock().free.insert(block_id);
        }
    }

    fn allocate_id(&self) -> BlockId {
        let mut ids = self.ids.lock();
        if let Some(block_id) = ids.free.pop_first() {
            return block_id;
        }
        let block_id = ids.tip;
        ids.tip += 1;
        block_id
    }
}

/// A transaction against a [`MockCache`].
pub struct MockTransaction {
    cache: Arc<MockInner>,
    txn_id: TxnId,
    access: Access,
    recency: Recency,
    order_token: OrderToken,
    snapshotted: bool,
    version: OnceLock<Finalized>,
    finished: bool,
}

impl fmt::Debug for MockTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransaction")
            .field("txn_id", &self.txn_id)
            .field("access", &self.access)
            .field("version", &self.version.get())
            .finish()
    }
}

impl Drop for MockTransaction {
    fn drop(&mut self) {
        self.finish();
    }
}

impl MockTransaction {
    /// `Read` or `Write`.
    pub fn access(&self) -> Access {
        self.access
    }

    /// The token this transaction was begun with. It is checked at every
    /// block the transaction acquires.
    pub fn order_token(&self) -> OrderToken {
        self.order_token
    }

    /// Read as of a fixed version from the first acquire on.
    pub fn snapshot(&mut self) {
        assert_eq!(self.access, Access::Read, "only read transactions snapshot");
        assert!(
            self.version.get().is_none(),
            "snapshot() must be called before the first acquire"
        );
        self.snapshotted = true;
    }

    /// The pinned version, once a snapshotting transaction has acquired
    /// something.
    pub fn snapshot_version(&self) -> Option<SnapshotVersion> {
        self.version.get().and_then(|finalized| finalized.pin())
    }

    fn finalize_version(&self) -> Finalized {
        *self.version.get_or_init(|| {
            let mut versions = self.cache.versions.lock();
            match self.access {
                Access::Write => Finalized::Write(versions.begin_write()),
                _ if self.snapshotted => Finalized::Pinned(versions.register(self.txn_id)),
                _ => Finalized::Unpinned,
            }
        })
    }

    /// Acquire `block_id`.
    pub fn acquire(&self, block_id: BlockId, access: Access) -> Result<MockBuf<'_>> {
        self.acquire_with(block_id, access, AcquireOptions::default())
    }

    /// Acquire `block_id` with options. `should_load` makes no difference
    /// to the mock.
    pub fn acquire_with(
        &self,
        block_id: BlockId,
        access: Access,
        mut options: AcquireOptions<'_>,
    ) -> Result<MockBuf<'_>> {
        assert!(
            access.is_read() || self.access == Access::Write,
            "a read transaction cannot acquire blocks for writing"
        );
        assert!(
            options.should_load || access == Access::Write,
            "skipping the load is only allowed for writes"
        );

        let finalized = self.finalize_version();
        let pin = if access.is_read() { finalized.pin() } else { None };

        let block = self.cache.pin(block_id)?;

        let holds_lock = if pin.is_some() {
            false
        } else if access == Access::ReadOutdatedOk && !block.lock.try_lock(Access::Read) {
            false
        } else if access == Access::ReadOutdatedOk {
            true
        } else {
            match block.lock.lock(
                lock_mode(access),
                options.interruptor,
                options.call_when_in_line.take(),
            ) {
                Ok(()) => true,
                Err(e) => {
                    self.cache.unpin(&block);
                    return Err(e);
                }
            }
        };
        if let Some(hook) = options.call_when_in_line.take() {
            hook();
        }

        match self.resolve(&block, pin) {
            Ok(data) => Ok(MockBuf {
                txn: self,
                block,
                access,
                holds_lock,
                data,
                changed: false,
                deleted: false,
                new_recency: None,
                released: false,
            }),
            Err(e) => {
                if holds_lock {
                    block.lock.unlock(lock_mode(access));
                }
                self.cache.unpin(&block);
                Err(e)
            }
        }
    }

    fn resolve(&self, block: &MockBlock, pin: Option<SnapshotVersion>) -> Result<Arc<Vec<u8>>> {
        let mut state = block.state.lock();
        state.order_sink.check_out(self.order_token);
        let found = match pin {
            Some(pin) => state.history.range(..=pin).next_back(),
            None => state.history.last_key_value(),
        };
        match found {
            Some((_, Some(data))) => Ok(data.clone()),
            Some((_, None)) => Err(Error::ReportableBug(format!(
                "acquired block {} after it was deleted",
                block.block_id
            ))),
            None => Err(Error::Corruption {
                block_id: block.block_id,
                detail: format!("no version of the block is visible at {:?}", pin),
            }),
        }
    }

    /// Allocate a fresh zeroed block for writing.
    pub fn allocate(&self) -> Result<MockBuf<'_>> {
        assert_eq!(self.access, Access::Write, "only write transactions allocate");
        let Finalized::Write(version) = self.finalize_version() else {
            unreachable!("write transactions finalize to a write version");
        };

        let block_id = self.cache.allocate_id();
        let recency =
            if self.recency.is_valid() { self.recency } else { Recency::DISTANT_PAST };
        let block = MockBlock::new(
            block_id,
            version,
            vec![0; self.cache.config.block_size],
            recency,
            self.cache.config.enable_ordering_checks,
        );
        assert!(block.lock.try_lock(Access::Write));
        block.state.lock().refcount = 1;
        self.cache.blocks.lock().insert(block_id, block.clone());

        let data = self.resolve(&block, None)?;
        Ok(MockBuf {
            txn: self,
            block,
            access: Access::Write,
            holds_lock: true,
            data,
            changed: false,
            deleted: false,
            new_recency: None,
            released: false,
        })
    }

    /// Recorded recencies of `block_ids`.
    pub fn get_subtree_recencies(&self, block_ids: &[BlockId]) -> Vec<Recency> {
        let blocks = self.cache.blocks.lock();
        block_ids
            .iter()
            .map(|block_id| {
                blocks
                    .get(block_id)
                    .map_or(Recency::DISTANT_PAST, |block| block.state.lock().recency)
            })
            .collect()
    }

    /// Finish the transaction.
    pub fn commit(mut self) -> Result<()> {
        self.finish();
        Ok(())
    }

    fn finish(&mut self) {
        if std::mem::replace(&mut self.finished, true) {
            return;
        }

        if self.access == Access::Write && self.cache.config.inject_delays {
            let others = self.cache.versions.lock().writers_in_flight().saturating_sub(1);
            pace_write(others);
        }

        match self.version.get() {
            Some(Finalized::Write(version)) => {
                self.cache.versions.lock().end_write(*version);
            }
            Some(Finalized::Pinned(version)) => {
                self.cache.versions.lock().unregister(*version, self.txn_id);
            }
            Some(Finalized::Unpinned) | None => {}
        }

        self.cache.collect();
    }
}

/// A handle on a block of a [`MockCache`].
pub struct MockBuf<'t> {
    txn: &'t MockTransaction,
    block: Arc<MockBlock>,
    access: Access,
    holds_lock: bool,
    data: Arc<Vec<u8>>,
    changed: bool,
    deleted: bool,
    new_recency: Option<Recency>,
    released: bool,
}

impl fmt::Debug for MockBuf<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockBuf")
            .field("block_id", &self.block.block_id)
            .field("access", &self.access)
            .field("changed", &self.changed)
            .field("deleted", &self.deleted)
            .finish()
    }
}

impl Drop for MockBuf<'_> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl MockBuf<'_> {
    /// The block this handle is on.
    pub fn block_id(&self) -> BlockId {
        self.block.block_id
    }

    /// The block's contents.
    pub fn get_data_read(&self) -> &[u8] {
        &self.data
    }

    fn assert_writable(&self) {
        assert_eq!(self.access, Access::Write, "block {} is not writable", self.block.block_id);
        assert!(!self.deleted, "block {} is deleted", self.block.block_id);
    }

    /// Mutable contents.
    pub fn get_data_major_write(&mut self) -> &mut [u8] {
        self.assert_writable();
        self.changed = true;
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    /// Apply a delta.
    pub fn apply_patch(&mut self, patch: Patch) {
        self.assert_writable();
        assert!(patch.fits(self.data.len()), "{:?} does not fit the block", patch);
        patch.apply_to(Arc::make_mut(&mut self.data).as_mut_slice());
        self.changed = true;
    }

    /// Copy `src` to offset `dest`.
    pub fn set_data(&mut self, dest: usize, src: &[u8]) {
        self.apply_patch(Patch::set_data(dest, src));
    }

    /// Move `n` bytes from offset `src` to offset `dest`.
    pub fn move_data(&mut self, dest: usize, src: usize, n: usize) {
        self.apply_patch(Patch::move_data(dest, src, n));
    }

    /// Delete the block on release.
    pub fn mark_deleted(&mut self) {
        self.assert_writable();
        self.deleted = true;
    }

    /// Set the block's recency unless `recency` is `Recency::INVALID`.
    pub fn touch_recency(&mut self, recency: Recency) {
        self.assert_writable();
        if recency.is_valid() {
            self.new_recency = Some(recency);
        }
    }

    /// The block's recency.
    pub fn recency(&self) -> Recency {
        self.new_recency.unwrap_or_else(|| self.block.state.lock().recency)
    }

    /// Publish changes and give the block back.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }

        if self.access == Access::Write {
            self.publish();
        }
        if self.holds_lock {
            self.block.lock.unlock(lock_mode(self.access));
        }
        self.txn.cache.unpin(&self.block);
    }

    fn publish(&mut self) {
        let modified = self.changed || self.deleted;
        let mut state = self.block.state.lock();

        if modified {
            let Finalized::Write(version) = self.txn.finalize_version() else {
                unreachable!("only write transactions publish");
            };
            // a writer that reached the block late keeps the newer version
            let key = state.latest().map_or(version, |(latest, _)| latest.max(version));
            let data = if self.deleted { None } else { Some(self.data.clone()) };
            state.history.insert(key, data);
        }

        let recency = self.new_recency.or(if modified && self.txn.recency.is_valid() {
            Some(self.txn.recency)
        } else {
            None
        });
        if let Some(recency) = recency {
            state.recency = recency;
        }
    }
}
