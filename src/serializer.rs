use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use fault_injection::{annotate, maybe};
use fnv::{FnvHashMap, FnvHashSet};
use parking_lot::Mutex;

use crate::{BlockId, Recency};

/// Names one on-disk image of a block.
///
/// The serializer keeps an image readable for as long as any token for it
/// is alive, so the cache holds on to tokens for snapshots that may need to
/// reload their data after shedding it.
#[derive(Clone)]
pub struct BlockToken(Arc<TokenInner>);

struct TokenInner {
    offset: u64,
}

impl BlockToken {
    /// A token for the image stored at `offset`.
    pub fn new(offset: u64) -> BlockToken {
        BlockToken(Arc::new(TokenInner { offset }))
    }

    /// Where the image lives.
    pub fn offset(&self) -> u64 {
        self.0.offset
    }

    /// Whether some clone of this token is still alive, given a weak
    /// reference taken from it.
    fn is_alive(weak: &Weak<TokenInner>) -> bool {
        weak.strong_count() > 0
    }
}

impl PartialEq for BlockToken {
    fn eq(&self, other: &BlockToken) -> bool {
        self.offset() == other.offset()
    }
}

impl Eq for BlockToken {}

impl fmt::Debug for BlockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockToken({})", self.offset())
    }
}

/// What the serializer's index knows about a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// The current image, if the block was ever written.
    pub token: Option<BlockToken>,
    /// The recency last written for the block.
    pub recency: Recency,
    /// Whether the block has been deleted.
    pub deleted: bool,
}

/// Classifies a stream of I/O for prioritization and counts its
/// operations. Clones share the counter.
#[derive(Debug, Clone)]
pub struct IoAccount {
    priority: u32,
    ops: Arc<AtomicU64>,
}

impl IoAccount {
    /// An account with the given priority and no recorded operations.
    pub fn new(priority: u32) -> IoAccount {
        IoAccount { priority, ops: Arc::default() }
    }

    /// The account's priority. Higher is more urgent.
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Number of operations issued through this account.
    pub fn ops(&self) -> u64 {
        self.ops.load(Ordering::Acquire)
    }

    /// Count one operation against this account.
    pub fn record_op(&self) {
        self.ops.fetch_add(1, Ordering::Release);
    }
}

/// One entry of a `WriteBatch`.
#[derive(Debug, Clone)]
pub enum BlockWrite {
    /// A whole new image of the block.
    Data {
        /// The block written.
        block_id: BlockId,
        /// Its full contents.
        data: Arc<Vec<u8>>,
        /// Its recency.
        recency: Recency,
    },
    /// Only the block's recency changed.
    Recency {
        /// The block touched.
        block_id: BlockId,
        /// Its new recency.
        recency: Recency,
    },
    /// The block was deleted.
    Delete {
        /// The block deleted.
        block_id: BlockId,
    },
}

impl BlockWrite {
    /// The block this write is for.
    pub fn block_id(&self) -> BlockId {
        match self {
            BlockWrite::Data { block_id, .. }
            | BlockWrite::Recency { block_id, .. }
            | BlockWrite::Delete { block_id } => *block_id,
        }
    }
}

/// Everything one writeback pass persists, applied atomically.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    /// Block images, recency updates and deletions.
    pub writes: Vec<BlockWrite>,
    /// The encoded patch log replacing the previous one, if it changed.
    pub patch_log: Option<Vec<u8>>,
}

/// Implemented by the cache to receive blocks the serializer reads ahead.
pub trait ReadAheadCallback: Send + Sync {
    /// Offer `data` as the contents of `block_id`, stored at `token`.
    /// Returns whether the cache took it.
    fn offer_read_ahead_buf(
        &self,
        block_id: BlockId,
        data: Vec<u8>,
        token: BlockToken,
        recency: Recency,
    ) -> bool;
}

/// The block store underneath the cache.
pub trait Serializer: Send + Sync {
    /// Size in bytes of every block.
    fn block_size(&self) -> usize;

    /// A zeroed block-sized buffer.
    fn malloc(&self) -> Vec<u8> {
        vec![0; self.block_size()]
    }

    /// One past the highest block id the index has ever seen.
    fn max_block_id(&self) -> BlockId;

    /// Block ids at or past this are never valid.
    fn block_id_limit(&self) -> BlockId {
        BlockId::MAX
    }

    /// Look up a block, or `None` if it was never written.
    fn index_read(&self, block_id: BlockId) -> Option<IndexEntry>;

    /// Whether `block_id` is deleted (or was never written).
    fn get_delete_bit(&self, block_id: BlockId) -> bool {
        self.index_read(block_id).map_or(true, |entry| entry.deleted)
    }

    /// The recency recorded for `block_id`.
    fn get_recency(&self, block_id: BlockId) -> Recency {
        self.index_read(block_id)
            .map_or(Recency::DISTANT_PAST, |entry| entry.recency)
    }

    /// Read the image named by `token` into `dest`.
    fn block_read(
        &self,
        token: &BlockToken,
        dest: &mut [u8],
        account: &IoAccount,
    ) -> io::Result<()>;

    /// Persist `batch`, returning a token for every `BlockWrite::Data`.
    fn block_write(
        &self,
        batch: WriteBatch,
        account: &IoAccount,
    ) -> io::Result<Vec<(BlockId, BlockToken)>>;

    /// The last patch log written, if any.
    fn read_patch_log(&self) -> io::Result<Option<Vec<u8>>>;

    /// An account for I/O of the given priority.
    fn make_io_account(&self, priority: u32) -> IoAccount {
        IoAccount::new(priority)
    }

    /// Start offering read-ahead blocks to `cb`.
    fn register_read_ahead_cb(&self, cb: Weak<dyn ReadAheadCallback>) {
        let _ = cb;
    }

    /// Stop offering read-ahead blocks to `cb`.
    fn unregister_read_ahead_cb(&self, cb: &Weak<dyn ReadAheadCallback>) {
        let _ = cb;
    }
}

struct Image {
    block_id: BlockId,
    data: Vec<u8>,
    token: Weak<TokenInner>,
}

#[derive(Default)]
struct IndexSlot {
    token: Option<BlockToken>,
    recency: Recency,
    deleted: bool,
}

#[derive(Default)]
struct MemState {
    next_offset: u64,
    images: BTreeMap<u64, Image>,
    index: BTreeMap<BlockId, IndexSlot>,
    patch_log: Option<Vec<u8>>,
    io_by_priority: FnvHashMap<u32, u64>,
    failing_reads: FnvHashSet<BlockId>,
    fail_writes: bool,
}

impl MemState {
    fn record_io(&mut self, account: &IoAccount) {
        account.record_op();
        *self.io_by_priority.entry(account.priority()).or_default() += 1;
    }

    fn collect_garbage(&mut self) {
        self.images.retain(|_, image| BlockToken::is_alive(&image.token));
    }
}

/// A log-structured serializer that keeps everything in memory.
///
/// Every written image gets a fresh offset and stays readable while a token
/// for it is alive. Intended for tests and for embedding the cache without
/// a disk.
pub struct MemorySerializer {
    block_size: usize,
    block_id_limit: BlockId,
    read_ahead_window: usize,
    state: Mutex<MemState>,
    read_ahead_cbs: Mutex<Vec<Weak<dyn ReadAheadCallback>>>,
}

impl fmt::Debug for MemorySerializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemorySerializer")
            .field("block_size", &self.block_size)
            .field("blocks", &state.index.len())
            .field("images", &state.images.len())
            .finish()
    }
}

impl MemorySerializer {
    /// An empty serializer with blocks of `block_size` bytes.
    pub fn new(block_size: usize) -> MemorySerializer {
        MemorySerializer {
            block_size,
            block_id_limit: BlockId::MAX,
            read_ahead_window: 0,
            state: Mutex::default(),
            read_ahead_cbs: Mutex::default(),
        }
    }

    /// Refuse block ids at or past `limit`.
    #[must_use]
    pub fn with_block_id_limit(mut self, limit: BlockId) -> MemorySerializer {
        self.block_id_limit = limit;
        self
    }

    /// After each read, offer the next `window` live blocks to registered
    /// read-ahead callbacks.
    #[must_use]
    pub fn with_read_ahead_window(mut self, window: usize) -> MemorySerializer {
        self.read_ahead_window = window;
        self
    }

    /// Make every read of `block_id`'s images fail until
    /// `clear_read_failures` is called.
    pub fn fail_reads_of(&self, block_id: BlockId) {
        self.state.lock().failing_reads.insert(block_id);
    }

    /// Undo all `fail_reads_of` calls.
    pub fn clear_read_failures(&self) {
        self.state.lock().failing_reads.clear();
    }

    /// Make every `block_write` fail while `fail` is set.
    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Number of operations performed through accounts of `priority`.
    pub fn io_count(&self, priority: u32) -> u64 {
        self.state.lock().io_by_priority.get(&priority).copied().unwrap_or(0)
    }

    /// Number of images still readable.
    pub fn live_images(&self) -> usize {
        let mut state = self.state.lock();
        state.collect_garbage();
        state.images.len()
    }

    fn read_ahead_candidates(
        &self,
        state: &MemState,
        after: BlockId,
    ) -> Vec<(BlockId, Vec<u8>, BlockToken, Recency)> {
        state
            .index
            .range(after + 1..)
            .filter(|(_, slot)| !slot.deleted)
            .filter_map(|(block_id, slot)| {
                let token = slot.token.clone()?;
                let image = state.images.get(&token.offset())?;
                Some((*block_id, image.data.clone(), token, slot.recency))
            })
            .take(self.read_ahead_window)
            .collect()
    }

    fn offer_read_ahead(
        &self,
        candidates: Vec<(BlockId, Vec<u8>, BlockToken, Recency)>,
    ) {
        let cbs: Vec<Arc<dyn ReadAheadCallback>> = {
            let mut cbs = self.read_ahead_cbs.lock();
            cbs.retain(|cb| cb.strong_count() > 0);
            cbs.iter().filter_map(Weak::upgrade).collect()
        };

        for (block_id, data, token, recency) in candidates {
            for cb in &cbs {
                if cb.offer_read_ahead_buf(
                    block_id,
                    data.clone(),
                    token.clone(),
                    recency,
                ) {
                    log::trace!("read-ahead of block {} accepted", block_id);
                    break;
                }
            }
        }
    }
}

impl Serializer for MemorySerializer {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn max_block_id(&self) -> BlockId {
        self.state
            .lock()
            .index
            .last_key_value()
            .map_or(0, |(block_id, _)| block_id + 1)
    }

    fn block_id_limit(&self) -> BlockId {
        self.block_id_limit
    }

    fn index_read(&self, block_id: BlockId) -> Option<IndexEntry> {
        self.state.lock().index.get(&block_id).map(|slot| IndexEntry {
            token: slot.token.clone(),
            recency: slot.recency,
            deleted: slot.deleted,
        })
    }

    fn block_read(
        &self,
        token: &BlockToken,
        dest: &mut [u8],
        account: &IoAccount,
    ) -> io::Result<()> {
        let mut state = self.state.lock();
        state.record_io(account);

        let Some(image) = state.images.get(&token.offset()) else {
            return Err(annotate!(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no image at offset {}", token.offset()),
            )));
        };

        if state.failing_reads.contains(&image.block_id) {
            return Err(annotate!(io::Error::new(
                io::ErrorKind::Other,
                format!("injected read failure for block {}", image.block_id),
            )));
        }

        maybe!(copy_image(&image.data, dest))?;

        let block_id = image.block_id;
        let candidates = if self.read_ahead_window > 0 {
            self.read_ahead_candidates(&state, block_id)
        } else {
            vec![]
        };
        drop(state);

        if !candidates.is_empty() {
            self.offer_read_ahead(candidates);
        }

        Ok(())
    }

    fn block_write(
        &self,
        batch: WriteBatch,
        account: &IoAccount,
    ) -> io::Result<Vec<(BlockId, BlockToken)>> {
        let mut state = self.state.lock();
        state.record_io(account);

        if state.fail_writes {
            return Err(annotate!(io::Error::new(
                io::ErrorKind::Other,
                "injected write failure"
            )));
        }

        for write in &batch.writes {
            if write.block_id() >= self.block_id_limit {
                return Err(annotate!(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("block id {} is out of range", write.block_id()),
                )));
            }
            if let BlockWrite::Data { data, .. } = write {
                if data.len() != self.block_size {
                    return Err(annotate!(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("image of {} bytes written", data.len()),
                    )));
                }
            }
        }

        maybe!(apply_batch(&mut state, batch))
    }

    fn read_patch_log(&self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.state.lock().patch_log.clone())
    }

    fn register_read_ahead_cb(&self, cb: Weak<dyn ReadAheadCallback>) {
        self.read_ahead_cbs.lock().push(cb);
    }

    fn unregister_read_ahead_cb(&self, cb: &Weak<dyn ReadAheadCallback>) {
        self.read_ahead_cbs
            .lock()
            .retain(|registered| !Weak::ptr_eq(registered, cb));
    }
}

fn copy_image(image: &[u8], dest: &mut [u8]) -> io::Result<()> {
    if dest.len() != image.len() {
        return Err(annotate!(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "read buffer of {} bytes for a block of {} bytes",
                dest.len(),
                image.len()
            ),
        )));
    }
    dest.copy_from_slice(image);
    Ok(())
}

fn apply_batch(
    state: &mut MemState,
    batch: WriteBatch,
) -> io::Result<Vec<(BlockId, BlockToken)>> {
    let mut tokens = vec![];
    for write in batch.writes {
        match write {
            BlockWrite::Data { block_id, data, recency } => {
                let offset = state.next_offset;
                state.next_offset += 1;

                let token = BlockToken::new(offset);
                state.images.insert(
                    offset,
                    Image {
                        block_id,
                        data: data.as_ref().clone(),
                        token: Arc::downgrade(&token.0),
                    },
                );

                let slot = state.index.entry(block_id).or_default();
                slot.token = Some(token.clone());
                slot.recency = recency;
                slot.deleted = false;

                tokens.push((block_id, token));
            }
            BlockWrite::Recency { block_id, recency } => {
                state.index.entry(block_id).or_default().recency = recency;
            }
            BlockWrite::Delete { block_id } => {
                let slot = state.index.entry(block_id).or_default();
                slot.token = None;
                slot.deleted = true;
            }
        }
    }

    if let Some(patch_log) = batch.patch_log {
        state.patch_log = Some(patch_log);
    }

    state.collect_garbage();

    Ok(tokens)
}

#[cfg(test)]
mod test {
    use super::*;

    fn write_block(
        serializer: &MemorySerializer,
        block_id: BlockId,
        byte: u8,
    ) -> BlockToken {
        let batch = WriteBatch {
            writes: vec![BlockWrite::Data {
                block_id,
                data: Arc::new(vec![byte; serializer.block_size()]),
                recency: Recency(u64::from(byte)),
            }],
            patch_log: None,
        };
        let mut tokens =
            serializer.block_write(batch, &IoAccount::new(1)).unwrap();
        tokens.pop().unwrap().1
    }

    #[test]
    fn old_images_live_while_tokens_do() {
        let serializer = MemorySerializer::new(8);
        let account = IoAccount::new(7);

        let old = write_block(&serializer, 3, 1);
        let new = write_block(&serializer, 3, 2);
        assert_eq!(serializer.live_images(), 2);

        let mut buf = vec![0; 8];
        serializer.block_read(&old, &mut buf, &account).unwrap();
        assert_eq!(buf, vec![1; 8]);

        drop(old);
        assert_eq!(serializer.live_images(), 1);

        let entry = serializer.index_read(3).unwrap();
        assert_eq!(entry.token, Some(new));
        assert_eq!(entry.recency, Recency(2));
        assert_eq!(serializer.io_count(7), 1);
        assert_eq!(account.ops(), 1);
    }

    #[test]
    fn deletion_clears_the_index_token() {
        let serializer = MemorySerializer::new(8);
        let _token = write_block(&serializer, 1, 1);
        assert!(!serializer.get_delete_bit(1));

        let batch = WriteBatch {
            writes: vec![BlockWrite::Delete { block_id: 1 }],
            patch_log: None,
        };
        serializer.block_write(batch, &IoAccount::new(1)).unwrap();

        assert!(serializer.get_delete_bit(1));
        assert_eq!(serializer.index_read(1).unwrap().token, None);
        assert!(serializer.get_delete_bit(99));
        assert_eq!(serializer.max_block_id(), 2);
    }

    #[test]
    fn injected_read_failures() {
        let serializer = MemorySerializer::new(8);
        let token = write_block(&serializer, 5, 1);

        serializer.fail_reads_of(5);
        let mut buf = vec![0; 8];
        assert!(serializer.block_read(&token, &mut buf, &IoAccount::new(1)).is_err());

        serializer.clear_read_failures();
        serializer.block_read(&token, &mut buf, &IoAccount::new(1)).unwrap();
    }

    struct Collector(Mutex<Vec<BlockId>>);

    impl ReadAheadCallback for Collector {
        fn offer_read_ahead_buf(
            &self,
            block_id: BlockId,
            _data: Vec<u8>,
            _token: BlockToken,
            _recency: Recency,
        ) -> bool {
            self.0.lock().push(block_id);
            true
        }
    }

    #[test]
    fn reads_offer_following_blocks() {
        let serializer = MemorySerializer::new(8).with_read_ahead_window(2);
        let first = write_block(&serializer, 1, 1);
        for block_id in 2..6 {
            write_block(&serializer, block_id, 1);
        }

        let collector = Arc::new(Collector(Mutex::default()));
        let weak: Weak<dyn ReadAheadCallback> = Arc::downgrade(&collector) as _;
        serializer.register_read_ahead_cb(weak.clone());

        let mut buf = vec![0; 8];
        serializer.block_read(&first, &mut buf, &IoAccount::new(1)).unwrap();
        assert_eq!(*collector.0.lock(), vec![2, 3]);

        serializer.unregister_read_ahead_cb(&weak);
        serializer.block_read(&first, &mut buf, &IoAccount::new(1)).unwrap();
        assert_eq!(collector.0.lock().len(), 2);
    }
}
