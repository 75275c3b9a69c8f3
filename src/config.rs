use std::fmt;
use std::sync::Arc;

use crate::{Cache, Result, Serializer};

/// The kinds of I/O the cache issues, for prioritization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoKind {
    /// Loading blocks that a transaction is waiting for.
    Read,
    /// Flushing dirty blocks and the patch log.
    Writeback,
    /// Loading blocks nobody asked for yet (`Config::prefetch_on_open`).
    Prefetch,
}

/// Maps each `IoKind` to a serializer account priority.
///
/// Keeping reads and writeback on separate accounts lets the serializer
/// schedule reads ahead of background flushing.
#[derive(Clone)]
pub struct IoPriority(Arc<dyn Fn(IoKind) -> u32 + Send + Sync>);

impl IoPriority {
    /// Wrap a classifier function.
    pub fn new<F>(f: F) -> IoPriority
    where
        F: Fn(IoKind) -> u32 + Send + Sync + 'static,
    {
        IoPriority(Arc::new(f))
    }

    /// The priority of one kind of I/O.
    pub fn classify(&self, kind: IoKind) -> u32 {
        (self.0)(kind)
    }
}

impl Default for IoPriority {
    fn default() -> IoPriority {
        IoPriority::new(|kind| match kind {
            IoKind::Read => 100,
            IoKind::Writeback => 50,
            IoKind::Prefetch => 10,
        })
    }
}

impl fmt::Debug for IoPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IoPriority {{ read: {}, writeback: {}, prefetch: {} }}",
            self.classify(IoKind::Read),
            self.classify(IoKind::Writeback),
            self.classify(IoKind::Prefetch),
        )
    }
}

/// Top-level configuration for the cache.
#[derive(Debug, Clone)]
pub struct Config {
    /// Memory budget for resident blocks, in bytes. Default is 256mb.
    pub cache_capacity_bytes: usize,
    /// The percentage of the cache that is dedicated to the
    /// scan-resistant entry cache.
    pub entry_cache_percent: u8,
    /// Start a background thread that flushes dirty blocks
    /// every few milliseconds. Defaults to every 200ms.
    pub flush_every_ms: Option<u64>,
    /// Once this many blocks are dirty, committing a write transaction
    /// flushes inline.
    pub max_dirty_blocks: usize,
    /// How many write transactions may be admitted at once. Admission is
    /// first-come first-served.
    pub max_concurrent_write_transactions: usize,
    /// Check order tokens at the cache checkpoint and at every block.
    /// Defaults to on in debug builds only.
    pub enable_ordering_checks: bool,
    /// Load every live block when the cache is opened, as long as it fits
    /// in `cache_capacity_bytes`.
    pub prefetch_on_open: bool,
    /// A patched block whose pending patches take more than this many
    /// bytes is flushed as a whole block rather than through the patch log.
    pub max_patch_bytes_per_block: usize,
    /// The zstd compression level used for the encoded patch log.
    pub zstd_compression_level: i32,
    /// Assigns serializer priorities to the cache's I/O accounts.
    pub io_priority: IoPriority,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            cache_capacity_bytes: 256 * 1024 * 1024,
            entry_cache_percent: 20,
            flush_every_ms: Some(200),
            max_dirty_blocks: 1024,
            max_concurrent_write_transactions: 64,
            enable_ordering_checks: cfg!(debug_assertions),
            prefetch_on_open: false,
            max_patch_bytes_per_block: 1024,
            zstd_compression_level: 3,
            io_priority: IoPriority::default(),
        }
    }
}

impl Config {
    /// Open a cache over `serializer` using this configuration.
    pub fn open(&self, serializer: Arc<dyn Serializer>) -> Result<Cache> {
        Cache::open(serializer, self.clone())
    }
}
