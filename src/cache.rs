use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use fnv::{FnvHashMap, FnvHashSet};
use parking_lot::Mutex;
use rayon::prelude::*;

use crate::drain::Drain;
#[cfg(feature = "for-internal-testing-only")]
use crate::event_verifier::{EventVerifier, State};
use crate::fifo::{FifoPermit, FifoThrottle};
use crate::flusher::Flusher;
use crate::free_list::FreeList;
use crate::inner_buf::{InnerBuf, replay_patches};
use crate::order::{OrderCheckpoint, OrderToken};
use crate::patch_store::PatchStore;
use crate::serializer::{BlockToken, BlockWrite, IoAccount, WriteBatch};
use crate::snapshot::Versions;
use crate::writeback::Writeback;
use crate::{
    Access, AdvisorPolicy, BlockId, Config, Error, Interruptor, IoKind,
    PageReplacementPolicy, ReadAheadCallback, Recency, Result, SUPERBLOCK_ID,
    Serializer, SnapshotVersion, Transaction, TxnId,
};

/// Counters describing the cache's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    /// Blocks currently in the page map.
    pub resident_blocks: usize,
    /// Blocks waiting for writeback.
    pub dirty_blocks: usize,
    /// Completed writeback passes.
    pub flushes: u64,
    /// Blocks unloaded by the page-replacement policy.
    pub evictions: u64,
    /// Copy-on-write snapshots taken.
    pub snapshots_created: u64,
    /// Read-ahead offers accepted.
    pub read_ahead_accepted: u64,
    /// Transactions not yet finished.
    pub live_transactions: usize,
    /// Snapshots pinned by readers.
    pub live_snapshots: usize,
    /// One past the highest block id that may be live.
    pub block_id_tip: BlockId,
}

pub(crate) struct CacheInner {
    pub config: Config,
    pub serializer: Arc<dyn Serializer>,
    pub block_size: usize,
    pub page_map: Mutex<FnvHashMap<BlockId, Arc<InnerBuf>>>,
    policy: Mutex<Box<dyn PageReplacementPolicy>>,
    pub free_list: FreeList,
    pub patches: PatchStore,
    pub versions: Mutex<Versions>,
    pub writeback: Writeback,
    checkpoint: Mutex<OrderCheckpoint>,
    write_fifo: Arc<FifoThrottle>,
    pub drain: Arc<Drain>,
    pub read_account: IoAccount,
    pub writeback_account: IoAccount,
    prefetch_account: IoAccount,
    next_txn_id: AtomicU64,
    /// Blocks that may hold snapshots, swept when pins go away.
    snapshotted: Mutex<FnvHashSet<BlockId>>,
    global_error: Mutex<Option<Error>>,
    shutting_down: AtomicBool,
    flusher: Mutex<Option<Flusher>>,
    read_ahead_cb: Mutex<Option<Weak<dyn ReadAheadCallback>>>,
    evictions: AtomicU64,
    snapshots_created: AtomicU64,
    read_ahead_accepted: AtomicU64,
    #[cfg(feature = "for-internal-testing-only")]
    pub event_verifier: EventVerifier,
}

impl std::fmt::Debug for CacheInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheInner")
            .field("block_size", &self.block_size)
            .field("resident_blocks", &self.page_map.lock().len())
            .field("dirty_blocks", &self.writeback.dirty_count())
            .finish_non_exhaustive()
    }
}

/// The buffer cache.
///
/// Handles are cheap to clone and share one cache. Dropping the last handle
/// shuts the cache down, which blocks until every transaction has finished
/// and then flushes everything dirty.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
    _shutdown_on_drop: Arc<ShutdownOnDrop>,
}

/// Shared by every `Cache` handle; the last one to go shuts the cache down.
struct ShutdownOnDrop(Arc<CacheInner>);

impl Drop for ShutdownOnDrop {
    fn drop(&mut self) {
        if let Err(e) = self.0.shutdown() {
            log::error!("error while shutting down cache on drop: {:?}", e);
        }
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").field("stats", &self.stats()).finish()
    }
}

impl Cache {
    /// Initialize a fresh serializer by writing a zeroed superblock.
    pub fn create(serializer: &dyn Serializer) -> Result<()> {
        if serializer.index_read(SUPERBLOCK_ID).is_some() {
            return Err(Error::Unsupported(
                "the serializer already contains a superblock".into(),
            ));
        }

        let batch = WriteBatch {
            writes: vec![BlockWrite::Data {
                block_id: SUPERBLOCK_ID,
                data: Arc::new(serializer.malloc()),
                recency: Recency::DISTANT_PAST,
            }],
            patch_log: None,
        };
        let account = serializer
            .make_io_account(Config::default().io_priority.classify(IoKind::Writeback));
        serializer.block_write(batch, &account)?;
        Ok(())
    }

    /// Open a cache over an initialized serializer.
    pub fn open(serializer: Arc<dyn Serializer>, config: Config) -> Result<Cache> {
        let policy = Box::new(AdvisorPolicy::new(&config));
        Cache::open_with_policy(serializer, config, policy)
    }

    /// Open a cache with a custom page-replacement policy.
    pub fn open_with_policy(
        serializer: Arc<dyn Serializer>,
        config: Config,
        policy: Box<dyn PageReplacementPolicy>,
    ) -> Result<Cache> {
        if config.max_concurrent_write_transactions == 0 {
            return Err(Error::Unsupported(
                "max_concurrent_write_transactions must be at least 1".into(),
            ));
        }

        if serializer.get_delete_bit(SUPERBLOCK_ID) {
            return Err(Error::Unsupported(
                "the serializer has no superblock; call Cache::create first".into(),
            ));
        }

        let patches = match serializer.read_patch_log()? {
            Some(encoded) => PatchStore::decode(&encoded)?,
            None => PatchStore::default(),
        };
        log::debug!("recovered {} patches from the patch log", patches.len());

        let allocated: FnvHashSet<BlockId> = (0..serializer.max_block_id())
            .filter(|block_id| !serializer.get_delete_bit(*block_id))
            .collect();
        log::debug!("opening cache over {} live blocks", allocated.len());

        let free_list =
            FreeList::from_allocated(&allocated, serializer.block_id_limit());

        let io_priority = &config.io_priority;
        let read_account =
            serializer.make_io_account(io_priority.classify(IoKind::Read));
        let writeback_account =
            serializer.make_io_account(io_priority.classify(IoKind::Writeback));
        let prefetch_account =
            serializer.make_io_account(io_priority.classify(IoKind::Prefetch));

        let inner = Arc::new(CacheInner {
            block_size: serializer.block_size(),
            page_map: Mutex::default(),
            policy: Mutex::new(policy),
            free_list,
            patches,
            versions: Mutex::default(),
            writeback: Writeback::default(),
            checkpoint: Mutex::new(OrderCheckpoint::new(
                config.enable_ordering_checks,
            )),
            write_fifo: FifoThrottle::new(config.max_concurrent_write_transactions),
            drain: Arc::default(),
            read_account,
            writeback_account,
            prefetch_account,
            next_txn_id: AtomicU64::new(1),
            snapshotted: Mutex::default(),
            global_error: Mutex::default(),
            shutting_down: AtomicBool::new(false),
            flusher: Mutex::default(),
            read_ahead_cb: Mutex::default(),
            evictions: AtomicU64::new(0),
            snapshots_created: AtomicU64::new(0),
            read_ahead_accepted: AtomicU64::new(0),
            #[cfg(feature = "for-internal-testing-only")]
            event_verifier: EventVerifier::default(),
            serializer,
            config,
        });

        let read_ahead_cb: Weak<dyn ReadAheadCallback> = Arc::downgrade(&inner) as _;
        inner.serializer.register_read_ahead_cb(read_ahead_cb.clone());
        *inner.read_ahead_cb.lock() = Some(read_ahead_cb);

        if inner.config.prefetch_on_open {
            inner.prefetch(&allocated)?;
        }

        if let Some(flush_every_ms) = inner.config.flush_every_ms {
            let flusher = Flusher::new(
                "mcache_flusher".into(),
                inner.clone(),
                flush_every_ms,
            )?;
            *inner.flusher.lock() = Some(flusher);
        }

        let shutdown_on_drop = Arc::new(ShutdownOnDrop(inner.clone()));
        Ok(Cache { inner, _shutdown_on_drop: shutdown_on_drop })
    }

    /// Begin a transaction.
    ///
    /// `access` must be `Read` or `Write`. Write transactions wait for
    /// admission through a FIFO bounded by
    /// `Config::max_concurrent_write_transactions`. `expected_change_count`
    /// is the number of blocks the transaction expects to dirty; if that
    /// would push the dirty set past `Config::max_dirty_blocks`, writeback
    /// runs first. `recency` stamps every block the transaction modifies,
    /// unless it is `Recency::INVALID`. `order_token` is checked at the
    /// cache's checkpoint and then at every block the transaction acquires.
    pub fn begin_transaction(
        &self,
        access: Access,
        expected_change_count: usize,
        recency: Recency,
        order_token: OrderToken,
    ) -> Result<Transaction> {
        self.inner.begin_transaction(
            access,
            expected_change_count,
            recency,
            order_token,
            None,
        )
    }

    /// Like `begin_transaction`, but gives up with `Error::Interrupted`
    /// if `interruptor` fires while waiting for admission.
    pub fn begin_transaction_interruptible(
        &self,
        access: Access,
        expected_change_count: usize,
        recency: Recency,
        order_token: OrderToken,
        interruptor: &Interruptor,
    ) -> Result<Transaction> {
        self.inner.begin_transaction(
            access,
            expected_change_count,
            recency,
            order_token,
            Some(interruptor),
        )
    }

    /// An I/O account of the given priority, for `Transaction::set_account`.
    pub fn create_account(&self, priority: u32) -> IoAccount {
        self.inner.serializer.make_io_account(priority)
    }

    /// The last version handed to a write transaction.
    pub fn get_current_version_id(&self) -> SnapshotVersion {
        self.inner.versions.lock().current()
    }

    /// The oldest version pinned by a live snapshot, or `default`.
    pub fn get_min_snapshot_version(&self, default: SnapshotVersion) -> SnapshotVersion {
        self.inner.versions.lock().min_pinned(default)
    }

    /// The newest version pinned by a live snapshot, or `default`.
    pub fn get_max_snapshot_version(&self, default: SnapshotVersion) -> SnapshotVersion {
        self.inner.versions.lock().max_pinned(default)
    }

    /// Whether `block_id` is a live block.
    pub fn contains_block(&self, block_id: BlockId) -> bool {
        self.inner.contains_block(block_id)
    }

    /// Offer the contents of a block nobody asked for yet. Returns whether
    /// the cache took it.
    pub fn offer_read_ahead_buf(
        &self,
        block_id: BlockId,
        data: Vec<u8>,
        token: BlockToken,
        recency: Recency,
    ) -> bool {
        self.inner.offer_read_ahead_buf(block_id, data, token, recency)
    }

    /// Run one writeback pass. Returns the number of block writes issued.
    pub fn flush(&self) -> Result<usize> {
        self.inner.flush()
    }

    /// Stop accepting transactions, wait for the live ones to finish, stop
    /// the background flusher and flush everything.
    ///
    /// Blocks forever if the calling thread still owns a transaction.
    pub fn shutdown(&self) -> Result<()> {
        self.inner.shutdown()
    }

    /// Current counters.
    pub fn stats(&self) -> Stats {
        self.inner.stats()
    }

    /// Returns the error the background flusher hit, if any.
    pub fn check_error(&self) -> Result<()> {
        self.inner.check_error()
    }

    /// Size in bytes of every block.
    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    #[cfg(feature = "for-internal-testing-only")]
    #[doc(hidden)]
    /// Log every state transition recorded for `block_id`.
    pub fn print_debug_history_for_block(&self, block_id: BlockId) {
        self.inner.event_verifier.print_debug_history_for_block(block_id);
    }
}

impl CacheInner {
    fn begin_transaction(
        self: &Arc<Self>,
        access: Access,
        expected_change_count: usize,
        recency: Recency,
        order_token: OrderToken,
        interruptor: Option<&Interruptor>,
    ) -> Result<Transaction> {
        assert_ne!(
            access,
            Access::ReadOutdatedOk,
            "transactions are either Read or Write"
        );
        self.check_error()?;

        let drain_guard = self.drain.enter()?;

        let write_permit: Option<FifoPermit> = if access == Access::Write {
            Some(self.write_fifo.enter(interruptor)?)
        } else {
            None
        };

        if access == Access::Write
            && expected_change_count > 0
            && self.writeback.dirty_count() + expected_change_count
                > self.config.max_dirty_blocks
        {
            log::debug!(
                "flushing before admitting a transaction expecting {} changes",
                expected_change_count
            );
            self.flush()?;
        }

        let client_token = order_token;
        let order_token = self.checkpoint.lock().check_through(client_token);
        let txn_id = TxnId(self.next_txn_id.fetch_add(1, Ordering::Relaxed));

        Ok(Transaction::new(
            self.clone(),
            txn_id,
            access,
            recency,
            client_token,
            order_token,
            write_permit,
            drain_guard,
        ))
    }

    pub(crate) fn check_error(&self) -> Result<()> {
        match &*self.global_error.lock() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    pub(crate) fn set_global_error(&self, error: Error) {
        let mut global_error = self.global_error.lock();
        if global_error.is_none() {
            *global_error = Some(error);
        }
    }

    pub(crate) fn flush(&self) -> Result<usize> {
        let writes = self.writeback.flush(self)?;
        self.collect_snapshots();
        Ok(writes)
    }

    fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            // someone else is shutting down; wait for the same condition
            self.drain.begin_draining();
            return Ok(());
        }

        log::debug!("shutting down cache");
        self.drain.begin_draining();

        let flusher = self.flusher.lock().take();
        drop(flusher);

        if let Some(read_ahead_cb) = self.read_ahead_cb.lock().take() {
            self.serializer.unregister_read_ahead_cb(&read_ahead_cb);
        }

        self.flush()?;

        #[cfg(feature = "for-internal-testing-only")]
        self.event_verifier.assert_nothing_dirty();

        let (allocations, frees) = self.free_list.counters();
        log::debug!(
            "cache shut down with {:?} after {} allocations and {} frees",
            self.stats(),
            allocations,
            frees
        );
        Ok(())
    }

    fn stats(&self) -> Stats {
        Stats {
            resident_blocks: self.page_map.lock().len(),
            dirty_blocks: self.writeback.dirty_count(),
            flushes: self.writeback.flushes(),
            evictions: self.evictions.load(Ordering::Acquire),
            snapshots_created: self.snapshots_created.load(Ordering::Acquire),
            read_ahead_accepted: self.read_ahead_accepted.load(Ordering::Acquire),
            live_transactions: self.drain.live(),
            live_snapshots: self.versions.lock().live_snapshots(),
            block_id_tip: self.free_list.tip(),
        }
    }

    pub(crate) fn register_snapshot(&self, txn_id: TxnId) -> SnapshotVersion {
        self.versions.lock().register(txn_id)
    }

    pub(crate) fn unregister_snapshot(&self, version: SnapshotVersion, txn_id: TxnId) {
        self.versions.lock().unregister(version, txn_id);
    }

    pub(crate) fn note_snapshot_taken(&self, block_id: BlockId) {
        self.snapshots_created.fetch_add(1, Ordering::Relaxed);
        self.snapshotted.lock().insert(block_id);
    }

    fn contains_block(&self, block_id: BlockId) -> bool {
        if let Some(inner) = self.page_map.lock().get(&block_id) {
            return !inner.state.lock().deleted;
        }
        !self.writeback.is_destroyed(block_id)
            && !self.serializer.get_delete_bit(block_id)
    }

    pub(crate) fn recency_of(&self, block_id: BlockId) -> Recency {
        if let Some(inner) = self.page_map.lock().get(&block_id) {
            let state = inner.state.lock();
            // a block still being read has no recency of its own yet
            if state.is_loaded() {
                return state.recency;
            }
        }
        self.serializer.get_recency(block_id)
    }

    /// Find `block_id` in the page map, or insert it and load it. The
    /// returned block has one more reference for the caller. The flag says
    /// whether the caller loaded it and so already holds its write lock.
    /// A `skip_for` version skips the read on behalf of that writer, who is
    /// about to overwrite the whole block.
    pub(crate) fn pin_or_load(
        &self,
        block_id: BlockId,
        skip_for: Option<SnapshotVersion>,
        account: &IoAccount,
    ) -> Result<(Arc<InnerBuf>, bool)> {
        let mut page_map = self.page_map.lock();
        if let Some(inner) = page_map.get(&block_id) {
            let inner = inner.clone();
            inner.state.lock().refcount += 1;
            return Ok((inner, false));
        }

        let inner = InnerBuf::loading(block_id, self.config.enable_ordering_checks);
        page_map.insert(block_id, inner.clone());

        #[cfg(feature = "for-internal-testing-only")]
        self.event_verifier.mark(block_id, State::Loading, "pin_or_load");

        drop(page_map);

        match self.load(&inner, skip_for, account) {
            Ok(()) => Ok((inner, true)),
            Err(e) => {
                log::debug!("failed to load block {}: {:?}", block_id, e);
                {
                    let mut page_map = self.page_map.lock();
                    if page_map
                        .get(&block_id)
                        .is_some_and(|mapped| Arc::ptr_eq(mapped, &inner))
                    {
                        page_map.remove(&block_id);
                    }
                    let mut state = inner.state.lock();
                    state.fail_load(e.clone());
                    state.refcount -= 1;

                    #[cfg(feature = "for-internal-testing-only")]
                    self.event_verifier.mark(block_id, State::Unloaded, "load failed");
                }

                inner.lock.unlock(Access::Write);
                Err(e)
            }
        }
    }

    fn load(
        &self,
        inner: &InnerBuf,
        skip_for: Option<SnapshotVersion>,
        account: &IoAccount,
    ) -> Result<()> {
        let block_id = inner.block_id;

        if self.writeback.is_destroyed(block_id) {
            return Err(Error::ReportableBug(format!(
                "acquired block {} after it was deleted",
                block_id
            )));
        }

        // an image with patches on top cannot be reread from its token
        // alone, so earlier readers would have nothing to fall back on
        let skip_for =
            skip_for.filter(|_| self.patches.last_counter(block_id).is_none());

        if let Some(version) = skip_for {
            log::trace!("skipping the read of block {}", block_id);
            let entry = self.serializer.index_read(block_id);
            let recency = entry.as_ref().map_or(Recency::DISTANT_PAST, |e| e.recency);
            let old_image = entry.and_then(|e| e.token);

            let mut state = inner.state.lock();
            state.finish_skipped_load(self.serializer.malloc(), recency, old_image, version);

            #[cfg(feature = "for-internal-testing-only")]
            self.event_verifier.mark(block_id, State::Clean, "skipped load");
            return Ok(());
        }

        let entry = match self.serializer.index_read(block_id) {
            Some(entry) if !entry.deleted => entry,
            _ => {
                return Err(Error::ReportableBug(format!(
                    "acquired block {} which is not allocated",
                    block_id
                )));
            }
        };

        log::trace!("loading block {}", block_id);
        let mut data = self.serializer.malloc();
        if let Some(token) = &entry.token {
            self.serializer.block_read(token, &mut data, account)?;
        }

        let patches = self.patches.patches_for(block_id);
        replay_patches(&mut data, &patches);

        let has_disk_base = entry.token.is_some();
        let patch_counter = patches.last().map_or(0, |entry| entry.counter);
        let disk_token = if patches.is_empty() { entry.token } else { None };

        let mut state = inner.state.lock();
        state.finish_load(data, entry.recency, disk_token, has_disk_base);
        state.patch_counter = patch_counter;

        #[cfg(feature = "for-internal-testing-only")]
        self.event_verifier.mark(block_id, State::Clean, "load");

        Ok(())
    }

    /// Insert a freshly allocated block, write-locked and referenced by the
    /// caller.
    pub(crate) fn insert_allocated(
        &self,
        block_id: BlockId,
        recency: Recency,
        version: SnapshotVersion,
    ) -> Result<Arc<InnerBuf>> {
        let inner = InnerBuf::allocated(
            block_id,
            self.serializer.malloc(),
            recency,
            version,
            self.config.enable_ordering_checks,
        );

        let mut page_map = self.page_map.lock();
        if page_map.contains_key(&block_id) {
            return Err(Error::ReportableBug(format!(
                "allocated block {} is still in the page map",
                block_id
            )));
        }
        page_map.insert(block_id, inner.clone());

        #[cfg(feature = "for-internal-testing-only")]
        self.event_verifier.mark(block_id, State::Dirty, "allocate");

        drop(page_map);

        self.patches.drop_block(block_id);
        self.writeback.forget_destroyed(block_id);
        self.writeback.mark_dirty(block_id);

        Ok(inner)
    }

    /// Drop a reference taken by `pin_or_load` or `insert_allocated`,
    /// destroying the block if it was deleted and nothing needs it.
    pub(crate) fn unpin(&self, inner: &Arc<InnerBuf>) {
        {
            let mut state = inner.state.lock();
            assert!(state.refcount > 0, "block {} unpinned too often", inner.block_id);
            state.refcount -= 1;
            if state.refcount > 0 || !state.deleted {
                return;
            }
        }
        self.maybe_destroy(inner);
    }

    fn maybe_destroy(&self, inner: &Arc<InnerBuf>) {
        let block_id = inner.block_id;
        let mut page_map = self.page_map.lock();
        let mut state = inner.state.lock();
        if !state.snapshots.is_empty() {
            state.prune_snapshots(&self.versions.lock());
        }
        // somebody else may have destroyed it already
        if state.can_destroy()
            && page_map.get(&block_id).is_some_and(|mapped| Arc::ptr_eq(mapped, inner))
        {
            page_map.remove(&block_id);
            self.destroy(block_id);
        }
    }

    /// Reclaim a deleted block that just left the page map. Called with the
    /// page map locked.
    fn destroy(&self, block_id: BlockId) {
        log::trace!("destroying deleted block {}", block_id);
        self.patches.drop_block(block_id);
        self.snapshotted.lock().remove(&block_id);
        self.policy.lock().forget(block_id);
        self.writeback.mark_destroyed(block_id);

        #[cfg(feature = "for-internal-testing-only")]
        self.event_verifier.mark(block_id, State::Unloaded, "destroy");

        self.free_list.free(block_id);
    }

    /// Drop snapshots nobody can read any more, and destroy deleted blocks
    /// that were only waiting for theirs.
    pub(crate) fn collect_snapshots(&self) {
        let ids: Vec<BlockId> = self.snapshotted.lock().iter().copied().collect();
        if ids.is_empty() {
            return;
        }

        let mut page_map = self.page_map.lock();
        for block_id in ids {
            let Some(inner) = page_map.get(&block_id).cloned() else {
                self.snapshotted.lock().remove(&block_id);
                continue;
            };

            let mut state = inner.state.lock();
            let pruned = state.prune_snapshots(&self.versions.lock());
            if pruned > 0 {
                log::trace!("dropped {} snapshots of block {}", pruned, block_id);
            }
            if state.snapshots.is_empty() {
                self.snapshotted.lock().remove(&block_id);
            }
            if state.can_destroy() {
                drop(state);
                page_map.remove(&block_id);
                self.destroy(block_id);
            }
        }
    }

    pub(crate) fn release_snapshot_data(&self, inner: &InnerBuf, key: SnapshotVersion) {
        inner.state.lock().release_snapshot_data(key);
    }

    /// Tell the page-replacement policy about an access and unload
    /// whatever victims it picks, as far as that is safe.
    pub(crate) fn note_access(&self, block_id: BlockId) {
        let victims = self.policy.lock().accessed(block_id, self.block_size);
        for victim in victims {
            self.try_unload(victim);
        }
    }

    /// Unload `block_id` if nothing needs it in memory. Dirty blocks are
    /// unloaded after their next flush instead, and blocks held only by
    /// snapshots shed whatever snapshot memory can be reloaded.
    pub(crate) fn try_unload(&self, block_id: BlockId) -> bool {
        let mut page_map = self.page_map.lock();
        let Some(inner) = page_map.get(&block_id).cloned() else {
            return false;
        };

        let mut state = inner.state.lock();
        if !state.snapshots.is_empty() {
            state.prune_snapshots(&self.versions.lock());
        }

        // a clean block can still be queued for the flush that cleaned it
        let pending = self.writeback.is_pending(block_id);

        if !pending && state.safe_to_unload(inner.lock.in_use()) {
            page_map.remove(&block_id);

            #[cfg(feature = "for-internal-testing-only")]
            self.event_verifier.mark(block_id, State::Unloaded, "evict");

            drop(state);
            drop(page_map);

            log::debug!("evicted block {}", block_id);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            self.snapshotted.lock().remove(&block_id);
            return true;
        }

        if (pending || !state.writeback.is_clean()) && !state.deleted {
            log::trace!("block {} will be unloaded after its next flush", block_id);
            state.unload_on_flush = true;
        }
        let shed = state.shed_snapshot_memory();
        if shed > 0 {
            log::debug!("shed {} snapshots of block {}", shed, block_id);
        }
        false
    }

    /// Read a block into memory before anybody asks for it.
    fn prefetch(&self, allocated: &FnvHashSet<BlockId>) -> Result<()> {
        let budget = self.config.cache_capacity_bytes / self.block_size.max(1);
        let mut ids: Vec<BlockId> = allocated.iter().copied().collect();
        ids.sort_unstable();
        ids.truncate(budget);

        log::debug!("prefetching {} blocks", ids.len());

        ids.into_par_iter().try_for_each(|block_id| {
            let Some(entry) = self.serializer.index_read(block_id) else {
                return Ok(());
            };
            let Some(token) = entry.token else {
                return Ok(());
            };
            let mut data = self.serializer.malloc();
            self.serializer.block_read(&token, &mut data, &self.prefetch_account)?;
            self.offer_read_ahead_buf(block_id, data, token, entry.recency);
            Ok(())
        })
    }
}

impl ReadAheadCallback for CacheInner {
    fn offer_read_ahead_buf(
        &self,
        block_id: BlockId,
        mut data: Vec<u8>,
        token: BlockToken,
        recency: Recency,
    ) -> bool {
        if self.shutting_down.load(Ordering::Acquire) || data.len() != self.block_size {
            return false;
        }

        let mut page_map = self.page_map.lock();
        if page_map.contains_key(&block_id)
            || self.writeback.is_pending(block_id)
            || self.writeback.is_destroyed(block_id)
        {
            return false;
        }

        let patches = self.patches.patches_for(block_id);
        replay_patches(&mut data, &patches);
        let disk_token = if patches.is_empty() { Some(token) } else { None };

        let inner = InnerBuf::loaded(
            block_id,
            data,
            recency,
            disk_token,
            true,
            self.config.enable_ordering_checks,
        );
        inner.state.lock().patch_counter = patches.last().map_or(0, |entry| entry.counter);
        page_map.insert(block_id, inner);

        #[cfg(feature = "for-internal-testing-only")]
        self.event_verifier.mark(block_id, State::Clean, "read-ahead");

        drop(page_map);

        log::trace!("accepted read-ahead of block {}", block_id);
        self.read_ahead_accepted.fetch_add(1, Ordering::Relaxed);

        self.note_access(block_id);
        true
    }
}
