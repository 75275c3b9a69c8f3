//! `mcache` is a mirrored block buffer cache.
//!
//! It sits between a block [`Serializer`] and the code that interprets
//! blocks. Callers open a [`Transaction`], acquire [`Buf`] handles on
//! blocks, read or mutate them (either wholesale or through byte-range
//! [`Patch`]es), and release them. Dirty blocks and patches are written back
//! to the serializer in batches by the [`Cache`]'s writeback pass, and
//! long-running readers may [`Transaction::snapshot`] to get a stable
//! point-in-time view while writers keep going.
//!
//! ```
//! use std::sync::Arc;
//!
//! use mcache::{Access, Config, MemorySerializer, OrderToken, Recency};
//!
//! let serializer = Arc::new(MemorySerializer::new(4096));
//! mcache::Cache::create(&*serializer).unwrap();
//!
//! let cache = Config { flush_every_ms: None, ..Config::default() }
//!     .open(serializer)
//!     .unwrap();
//!
//! let txn = cache
//!     .begin_transaction(Access::Write, 1, Recency(1), OrderToken::ignore())
//!     .unwrap();
//! let mut buf = txn.allocate().unwrap();
//! let block_id = buf.block_id();
//! buf.set_data(0, b"hello");
//! buf.release();
//! txn.commit().unwrap();
//!
//! let txn = cache
//!     .begin_transaction(Access::Read, 0, Recency::INVALID, OrderToken::ignore())
//!     .unwrap();
//! let buf = txn.acquire(block_id, Access::Read).unwrap();
//! assert_eq!(&buf.get_data_read()[..5], b"hello");
//! ```
#![deny(missing_docs)]
#![forbid(unsafe_code)]

mod backend;
mod buf;
mod cache;
mod config;
mod debug_delay;
mod drain;
#[cfg(feature = "for-internal-testing-only")]
mod event_verifier;
mod fifo;
mod flusher;
mod free_list;
mod inner_buf;
mod mock;
pub mod order;
mod page_repl;
mod patch;
mod patch_store;
mod result;
mod rwi_lock;
mod serializer;
mod signal;
mod snapshot;
mod transaction;
mod writeback;

pub use crate::backend::{BufApi, CacheBackend, TransactionApi};
pub use crate::buf::Buf;
pub use crate::cache::{Cache, Stats};
pub use crate::config::{Config, IoKind, IoPriority};
pub use crate::mock::{MockBuf, MockCache, MockConfig, MockTransaction};
pub use crate::order::{
    OrderBucket, OrderCheckpoint, OrderSink, OrderSource, OrderToken,
    OrderViolation, PlainSink,
};
pub use crate::page_repl::{AdvisorPolicy, PageReplacementPolicy};
pub use crate::patch::Patch;
pub use crate::result::{Error, Result};
pub use crate::rwi_lock::RwiLock;
pub use crate::serializer::{
    BlockToken, BlockWrite, IndexEntry, IoAccount, MemorySerializer,
    ReadAheadCallback, Serializer, WriteBatch,
};
pub use crate::signal::Interruptor;
pub use crate::transaction::{AcquireOptions, Transaction};

/// Names one fixed-size block of the underlying store.
pub type BlockId = u64;

/// The block that `Cache::create` initializes. Never handed out by
/// `Transaction::allocate`.
pub const SUPERBLOCK_ID: BlockId = 0;

/// Logical time of the last modification of a block (or of the subtree
/// rooted at it). Used for replication and backfill ordering, unrelated to
/// wall-clock time.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Recency(pub u64);

impl Recency {
    /// Recency of blocks that were never stamped.
    pub const DISTANT_PAST: Recency = Recency(0);

    /// Passing this to `Buf::touch_recency` (or as a transaction's recency)
    /// leaves the block's recency untouched.
    pub const INVALID: Recency = Recency(u64::MAX);

    /// Whether this is a real timestamp rather than `INVALID`.
    pub const fn is_valid(self) -> bool {
        self.0 != u64::MAX
    }
}

/// A generation of cache-wide state. Every write transaction gets a fresh
/// one; snapshotting readers pin one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub struct SnapshotVersion(pub u64);

impl SnapshotVersion {
    /// The version of data that came from disk or from read-ahead.
    pub const FAUX: SnapshotVersion = SnapshotVersion(0);

    pub(crate) const fn next(self) -> SnapshotVersion {
        SnapshotVersion(self.0 + 1)
    }
}

/// Identifies a transaction in the active-snapshot registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnId(pub u64);

/// Access mode of transactions and of block acquisitions.
///
/// Transactions are either `Read` or `Write`. Acquisitions additionally
/// support `ReadOutdatedOk`, a shared read that does not wait behind a
/// writer and instead sees the last published contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    /// Shared access to the latest (or snapshotted) contents.
    Read,
    /// Shared access that tolerates slightly stale contents.
    ReadOutdatedOk,
    /// Exclusive access.
    Write,
}

impl Access {
    /// `Read` and `ReadOutdatedOk` are both reads.
    pub const fn is_read(self) -> bool {
        !matches!(self, Access::Write)
    }
}
