//! The interface shared by [`Cache`] and [`MockCache`], so that code built
//! on the cache can be tested against the in-memory reference.

use crate::{
    AcquireOptions, Access, BlockId, Buf, Cache, MockBuf, MockCache,
    MockTransaction, OrderToken, Patch, Recency, Result, SnapshotVersion,
    Transaction,
};

/// An acquired block.
pub trait BufApi {
    /// The block this handle is on.
    fn block_id(&self) -> BlockId;

    /// The block's contents.
    fn get_data_read(&self) -> &[u8];

    /// Mutable contents for whole-block rewrites.
    fn get_data_major_write(&mut self) -> &mut [u8];

    /// Record and apply a delta.
    fn apply_patch(&mut self, patch: Patch);

    /// Copy `src` to offset `dest`.
    fn set_data(&mut self, dest: usize, src: &[u8]) {
        self.apply_patch(Patch::set_data(dest, src));
    }

    /// Move `n` bytes from offset `src` to offset `dest`.
    fn move_data(&mut self, dest: usize, src: usize, n: usize) {
        self.apply_patch(Patch::move_data(dest, src, n));
    }

    /// Delete the block on release.
    fn mark_deleted(&mut self);

    /// Set the block's recency unless `recency` is `Recency::INVALID`.
    fn touch_recency(&mut self, recency: Recency);

    /// The block's recency.
    fn recency(&self) -> Recency;

    /// Publish changes and give the block back.
    fn release(self)
    where
        Self: Sized,
    {
        drop(self);
    }
}

/// A transaction against either backend.
pub trait TransactionApi {
    /// The handle type this transaction hands out.
    type Buf<'a>: BufApi
    where
        Self: 'a;

    /// Acquire a block.
    fn acquire(&self, block_id: BlockId, access: Access) -> Result<Self::Buf<'_>> {
        self.acquire_with(block_id, access, AcquireOptions::default())
    }

    /// Acquire a block with options.
    fn acquire_with(
        &self,
        block_id: BlockId,
        access: Access,
        options: AcquireOptions<'_>,
    ) -> Result<Self::Buf<'_>>;

    /// Allocate a fresh zeroed block for writing.
    fn allocate(&self) -> Result<Self::Buf<'_>>;

    /// Read as of a fixed version from the first acquire on.
    fn snapshot(&mut self);

    /// Recorded recencies, without acquiring.
    fn get_subtree_recencies(&self, block_ids: &[BlockId]) -> Vec<Recency>;

    /// Finish the transaction.
    fn commit(self) -> Result<()>
    where
        Self: Sized;
}

/// A cache that transactions can be begun against.
pub trait CacheBackend: Send + Sync {
    /// The transaction type.
    type Transaction: TransactionApi;

    /// Begin a `Read` or `Write` transaction.
    fn begin_transaction(
        &self,
        access: Access,
        expected_change_count: usize,
        recency: Recency,
        order_token: OrderToken,
    ) -> Result<Self::Transaction>;

    /// The last version handed to a write transaction.
    fn get_current_version_id(&self) -> SnapshotVersion;

    /// Whether `block_id` is live.
    fn contains_block(&self, block_id: BlockId) -> bool;

    /// Size of every block.
    fn block_size(&self) -> usize;
}

impl BufApi for Buf<'_> {
    fn block_id(&self) -> BlockId {
        Buf::block_id(self)
    }

    fn get_data_read(&self) -> &[u8] {
        Buf::get_data_read(self)
    }

    fn get_data_major_write(&mut self) -> &mut [u8] {
        Buf::get_data_major_write(self)
    }

    fn apply_patch(&mut self, patch: Patch) {
        Buf::apply_patch(self, patch);
    }

    fn mark_deleted(&mut self) {
        Buf::mark_deleted(self);
    }

    fn touch_recency(&mut self, recency: Recency) {
        Buf::touch_recency(self, recency);
    }

    fn recency(&self) -> Recency {
        Buf::recency(self)
    }

    fn release(self) {
        Buf::release(self);
    }
}

impl TransactionApi for Transaction {
    type Buf<'a> = Buf<'a>;

    fn acquire_with(
        &self,
        block_id: BlockId,
        access: Access,
        options: AcquireOptions<'_>,
    ) -> Result<Buf<'_>> {
        Transaction::acquire_with(self, block_id, access, options)
    }

    fn allocate(&self) -> Result<Buf<'_>> {
        Transaction::allocate(self)
    }

    fn snapshot(&mut self) {
        Transaction::snapshot(self);
    }

    fn get_subtree_recencies(&self, block_ids: &[BlockId]) -> Vec<Recency> {
        Transaction::get_subtree_recencies(self, block_ids)
    }

    fn commit(self) -> Result<()> {
        Transaction::commit(self)
    }
}

impl CacheBackend for Cache {
    type Transaction = Transaction;

    fn begin_transaction(
        &self,
        access: Access,
        expected_change_count: usize,
        recency: Recency,
        order_token: OrderToken,
    ) -> Result<Transaction> {
        Cache::begin_transaction(self, access, expected_change_count, recency, order_token)
    }

    fn get_current_version_id(&self) -> SnapshotVersion {
        Cache::get_current_version_id(self)
    }

    fn contains_block(&self, block_id: BlockId) -> bool {
        Cache::contains_block(self, block_id)
    }

    fn block_size(&self) -> usize {
        Cache::block_size(self)
    }
}

impl BufApi for MockBuf<'_> {
    fn block_id(&self) -> BlockId {
        MockBuf::block_id(self)
    }

    fn get_data_read(&self) -> &[u8] {
        MockBuf::get_data_read(self)
    }

    fn get_data_major_write(&mut self) -> &mut [u8] {
        MockBuf::get_data_major_write(self)
    }

    fn apply_patch(&mut self, patch: Patch) {
        MockBuf::apply_patch(self, patch);
    }

    fn mark_deleted(&mut self) {
        MockBuf::mark_deleted(self);
    }

    fn touch_recency(&mut self, recency: Recency) {
        MockBuf::touch_recency(self, recency);
    }

    fn recency(&self) -> Recency {
        MockBuf::recency(self)
    }

    fn release(self) {
        MockBuf::release(self);
    }
}

impl TransactionApi for MockTransaction {
    type Buf<'a> = MockBuf<'a>;

    fn acquire_with(
        &self,
        block_id: BlockId,
        access: Access,
        options: AcquireOptions<'_>,
    ) -> Result<MockBuf<'_>> {
        MockTransaction::acquire_with(self, block_id, access, options)
    }

    fn allocate(&self) -> Result<MockBuf<'_>> {
        MockTransaction::allocate(self)
    }

    fn snapshot(&mut self) {
        MockTransaction::snapshot(self);
    }

    fn get_subtree_recencies(&self, block_ids: &[BlockId]) -> Vec<Recency> {
        MockTransaction::get_subtree_recencies(self, block_ids)
    }

    fn commit(self) -> Result<()> {
        MockTransaction::commit(self)
    }
}

impl CacheBackend for MockCache {
    type Transaction = MockTransaction;

    fn begin_transaction(
        &self,
        access: Access,
        expected_change_count: usize,
        recency: Recency,
        order_token: OrderToken,
    ) -> Result<MockTransaction> {
        MockCache::begin_transaction(self, access, expected_change_count, recency, order_token)
    }

    fn get_current_version_id(&self) -> SnapshotVersion {
        MockCache::get_current_version_id(self)
    }

    fn contains_block(&self, block_id: BlockId) -> bool {
        MockCache::contains_block(self, block_id)
    }

    fn block_size(&self) -> usize {
        MockCache::block_size(self)
    }
}
