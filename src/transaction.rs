use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::buf::Buf;
use crate::cache::CacheInner;
use crate::drain::DrainGuard;
use crate::fifo::FifoPermit;
use crate::inner_buf::{InnerBuf, Resolved};
use crate::order::OrderToken;
use crate::serializer::IoAccount;
use crate::snapshot::Finalized;
use crate::{
    Access, BlockId, Error, Interruptor, Recency, Result, SnapshotVersion,
    TxnId,
};

/// Knobs for `Transaction::acquire_with`.
pub struct AcquireOptions<'a> {
    /// Read the block if it is not resident. Passing `false` is only valid
    /// for `Access::Write`, and promises that the caller overwrites the
    /// whole block.
    pub should_load: bool,
    /// Runs once this acquisition has its place in the lock's queue, before
    /// the lock is granted.
    pub call_when_in_line: Option<&'a mut dyn FnMut()>,
    /// Gives up with `Error::Interrupted` when pulsed while waiting.
    pub interruptor: Option<&'a Interruptor>,
}

impl Default for AcquireOptions<'_> {
    fn default() -> Self {
        AcquireOptions { should_load: true, call_when_in_line: None, interruptor: None }
    }
}

impl fmt::Debug for AcquireOptions<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquireOptions")
            .field("should_load", &self.should_load)
            .field("call_when_in_line", &self.call_when_in_line.is_some())
            .field("interruptor", &self.interruptor)
            .finish()
    }
}

/// A unit of work against the cache.
///
/// Blocks are acquired through a transaction and the returned [`Buf`]s
/// borrow it, so every handle is released before the transaction ends. A
/// write transaction gets its version on its first acquire or allocate; a
/// read transaction that called [`Transaction::snapshot`] pins the newest
/// fully written version at that point and reads as of it from then on.
///
/// Dropping a transaction finishes it. [`Transaction::commit`] does the same
/// but reports the error of an inline flush, if one ran.
pub struct Transaction {
    cache: Arc<CacheInner>,
    txn_id: TxnId,
    access: Access,
    recency: Recency,
    client_token: OrderToken,
    order_token: OrderToken,
    account: IoAccount,
    snapshotted: bool,
    version: OnceLock<Finalized>,
    write_permit: Option<FifoPermit>,
    drain_guard: Option<DrainGuard>,
    finished: bool,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("txn_id", &self.txn_id)
            .field("access", &self.access)
            .field("recency", &self.recency)
            .field("snapshotted", &self.snapshotted)
            .field("version", &self.version.get())
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            log::error!("error while finishing {:?}: {:?}", self.txn_id, e);
        }
    }
}

impl Transaction {
    pub(crate) fn new(
        cache: Arc<CacheInner>,
        txn_id: TxnId,
        access: Access,
        recency: Recency,
        client_token: OrderToken,
        order_token: OrderToken,
        write_permit: Option<FifoPermit>,
        drain_guard: DrainGuard,
    ) -> Transaction {
        let account = cache.read_account.clone();
        Transaction {
            cache,
            txn_id,
            access,
            recency,
            client_token,
            order_token,
            account,
            snapshotted: false,
            version: OnceLock::new(),
            write_permit,
            drain_guard: Some(drain_guard),
            finished: false,
        }
    }

    /// `Read` or `Write`.
    pub fn access(&self) -> Access {
        self.access
    }

    /// The recency stamped on every block this transaction modifies.
    pub fn recency(&self) -> Recency {
        self.recency
    }

    /// This transaction's token in the cache's own ordering domain.
    ///
    /// Blocks check the caller's token instead, so that transactions from
    /// unrelated buckets may reach a block in any order.
    pub fn order_token(&self) -> OrderToken {
        self.order_token
    }

    pub(crate) fn cache(&self) -> &CacheInner {
        &self.cache
    }

    /// Classify this transaction's reads under another I/O account.
    pub fn set_account(&mut self, account: IoAccount) {
        self.account = account;
    }

    /// Ask for a point-in-time view. The version is pinned by the first
    /// acquire that follows.
    ///
    /// # Panics
    ///
    /// Panics on write transactions and after the first acquire.
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
        *self.version.get_or_init(|| match self.access {
            Access::Write => Finalized::Write(self.cache.versions.lock().begin_write()),
            _ if self.snapshotted => {
                let pin = self.cache.register_snapshot(self.txn_id);
                log::trace!("{:?} pinned {:?}", self.txn_id, pin);
                Finalized::Pinned(pin)
            }
            _ => Finalized::Unpinned,
        })
    }

    pub(crate) fn write_version(&self) -> SnapshotVersion {
        match self.finalize_version() {
            Finalized::Write(version) => version,
            other => panic!("{:?} is not a write version", other),
        }
    }

    /// Acquire `block_id`, loading it if needed.
    pub fn acquire(&self, block_id: BlockId, access: Access) -> Result<Buf<'_>> {
        self.acquire_with(block_id, access, AcquireOptions::default())
    }

    /// Acquire `block_id` with the given options.
    ///
    /// # Panics
    ///
    /// Panics if a read transaction asks for `Access::Write`, if
    /// `should_load` is false for a read, if `block_id` is beyond the
    /// serializer's id space, or if the transaction's order token arrives
    /// out of order at this block.
    pub fn acquire_with(
        &self,
        block_id: BlockId,
        access: Access,
        mut options: AcquireOptions<'_>,
    ) -> Result<Buf<'_>> {
        assert!(
            access.is_read() || self.access == Access::Write,
            "a read transaction cannot acquire blocks for writing"
        );
        assert!(
            options.should_load || access == Access::Write,
            "skipping the load is only allowed for writes"
        );
        assert!(
            block_id < self.cache.serializer.block_id_limit(),
            "block {} is out of range",
            block_id
        );

        let finalized = self.finalize_version();
        let pin = if access.is_read() { finalized.pin() } else { None };

        let skip_for =
            if options.should_load { None } else { finalized.write_version() };
        let (inner, loaded_here) =
            self.cache.pin_or_load(block_id, skip_for, &self.account)?;

        let holds_lock = match self.lock_block(&inner, access, pin, loaded_here, &mut options)
        {
            Ok(holds_lock) => holds_lock,
            Err(e) => {
                self.cache.unpin(&inner);
                return Err(e);
            }
        };

        match self.resolve(&inner, access, pin) {
            Ok((data, snapshot_key)) => {
                let buf = Buf::new(self, inner, access, holds_lock, data, snapshot_key);
                self.cache.note_access(block_id);
                Ok(buf)
            }
            Err(e) => {
                if holds_lock {
                    inner.lock.unlock(lock_mode(access));
                }
                self.cache.unpin(&inner);
                Err(e)
            }
        }
    }

    /// Returns whether the caller ends up holding the block's lock.
    fn lock_block(
        &self,
        inner: &InnerBuf,
        access: Access,
        pin: Option<SnapshotVersion>,
        loaded_here: bool,
        options: &mut AcquireOptions<'_>,
    ) -> Result<bool> {
        if loaded_here {
            if access == Access::Write {
                run_hook(options);
                return Ok(true);
            }
            inner.lock.unlock(Access::Write);
        }

        if pin.is_some() {
            // snapshot readers wait for the load but never for writers
            if inner.state.lock().is_loaded() {
                run_hook(options);
            } else {
                inner.lock.lock(
                    Access::Read,
                    options.interruptor,
                    options.call_when_in_line.take(),
                )?;
                inner.lock.unlock(Access::Read);
            }
            return Ok(false);
        }

        if access == Access::ReadOutdatedOk {
            if inner.lock.try_lock(Access::Read) {
                run_hook(options);
                return Ok(true);
            }
            if inner.state.lock().is_published() {
                log::trace!("reading block {} outdated", inner.block_id);
                run_hook(options);
                return Ok(false);
            }
        }

        inner.lock.lock(
            lock_mode(access),
            options.interruptor,
            options.call_when_in_line.take(),
        )?;
        Ok(true)
    }

    fn resolve(
        &self,
        inner: &InnerBuf,
        access: Access,
        pin: Option<SnapshotVersion>,
    ) -> Result<(Arc<Vec<u8>>, Option<SnapshotVersion>)> {
        let block_id = inner.block_id;
        let mut state = inner.state.lock();

        if let Some(e) = state.load_error() {
            return Err(e);
        }

        state.order_sink.check_out(self.client_token);

        if state.deleted && (pin.is_none() || access == Access::Write) {
            return Err(Error::ReportableBug(format!(
                "acquired block {} after it was deleted",
                block_id
            )));
        }

        let (key, token) = match state.resolve(block_id, pin)? {
            Resolved::Current(_) if state.deleted => {
                return Err(Error::ReportableBug(format!(
                    "block {} was deleted before version {:?}",
                    block_id, pin
                )));
            }
            Resolved::Current(data) => return Ok((data, None)),
            Resolved::Snapshot { key, data: Some(data), .. } => return Ok((data, Some(key))),
            Resolved::Snapshot { key, data: None, token } => (key, token),
        };
        drop(state);

        // the snapshot's memory was shed; read it back from its image
        let reloaded = match token {
            Some(token) => {
                let mut data = self.cache.serializer.malloc();
                match self.cache.serializer.block_read(&token, &mut data, &self.account) {
                    Ok(()) => Ok(Arc::new(data)),
                    Err(e) => Err(e.into()),
                }
            }
            None => Err(Error::ReportableBug(format!(
                "snapshot {:?} of block {} has neither data nor an image",
                key, block_id
            ))),
        };

        match reloaded {
            Ok(data) => {
                inner.state.lock().restore_snapshot_data(key, &data);
                Ok((data, Some(key)))
            }
            Err(e) => {
                self.cache.release_snapshot_data(inner, key);
                Err(e)
            }
        }
    }

    /// Allocate a fresh, zeroed block and acquire it for writing.
    ///
    /// # Panics
    ///
    /// Panics on read transactions.
    pub fn allocate(&self) -> Result<Buf<'_>> {
        assert_eq!(self.access, Access::Write, "only write transactions allocate");
        let version = self.write_version();
        let block_id = self.cache.free_list.allocate()?;

        let recency =
            if self.recency.is_valid() { self.recency } else { Recency::DISTANT_PAST };
        let inner = self.cache.insert_allocated(block_id, recency, version)?;
        log::trace!("{:?} allocated block {}", self.txn_id, block_id);

        let data = {
            let mut state = inner.state.lock();
            state.order_sink.check_out(self.client_token);
            state.current_data()?
        };

        let buf = Buf::new(self, inner, Access::Write, true, data, None);
        self.cache.note_access(block_id);
        Ok(buf)
    }

    /// Recorded recencies of `block_ids`, without acquiring them.
    pub fn get_subtree_recencies(&self, block_ids: &[BlockId]) -> Vec<Recency> {
        block_ids.iter().map(|block_id| self.cache.recency_of(*block_id)).collect()
    }

    /// Finish the transaction, returning the error of an inline flush if
    /// one ran.
    pub fn commit(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.finished, true) {
            return Ok(());
        }

        match self.version.get() {
            Some(Finalized::Write(version)) => {
                self.cache.versions.lock().end_write(*version);
            }
            Some(Finalized::Pinned(version)) => {
                self.cache.unregister_snapshot(*version, self.txn_id);
            }
            Some(Finalized::Unpinned) | None => {}
        }

        drop(self.write_permit.take());
        self.cache.collect_snapshots();

        let result = if self.access == Access::Write
            && self.cache.writeback.dirty_count() >= self.cache.config.max_dirty_blocks
        {
            log::debug!("{:?} flushing inline on commit", self.txn_id);
            self.cache.flush().map(|_| ())
        } else {
            Ok(())
        };

        drop(self.drain_guard.take());
        result
    }
}

fn run_hook(options: &mut AcquireOptions<'_>) {
    if let Some(hook) = options.call_when_in_line.take() {
        hook();
    }
}

/// `ReadOutdatedOk` holds the lock like `Read`.
pub(crate) fn lock_mode(access: Access) -> Access {
    if access.is_read() { Access::Read } else { Access::Write }
}
