use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use fnv::FnvHashMap;
use parking_lot::Mutex;

use crate::cache::CacheInner;
#[cfg(feature = "for-internal-testing-only")]
use crate::event_verifier::State;
use crate::inner_buf::InnerBuf;
use crate::serializer::{BlockToken, BlockWrite, WriteBatch};
use crate::{BlockId, Result};

/// Blocks waiting to be written back.
///
/// A block is in the dirty set from the publish that changed it until a
/// flush persisted it unchanged. The per-block `LocalBuf` flags say what
/// kind of write it needs. Destroyed blocks have left the page map and stay
/// in `destroyed` until their deletion is written.
#[derive(Debug, Default)]
pub(crate) struct Writeback {
    dirty: Mutex<BTreeSet<BlockId>>,
    destroyed: Mutex<BTreeSet<BlockId>>,
    flush_mu: Mutex<()>,
    flushes: AtomicU64,
}

/// What one flush captured for one block.
struct Captured {
    block_id: BlockId,
    inner: Option<Arc<InnerBuf>>,
    modifications: u64,
    wrote_image: bool,
    wrote_delete: bool,
}

impl Writeback {
    pub fn mark_dirty(&self, block_id: BlockId) {
        self.dirty.lock().insert(block_id);
    }

    pub fn is_pending(&self, block_id: BlockId) -> bool {
        self.dirty.lock().contains(&block_id)
    }

    /// Queue the deletion of a block that left the page map.
    pub fn mark_destroyed(&self, block_id: BlockId) {
        self.destroyed.lock().insert(block_id);
        self.dirty.lock().insert(block_id);
    }

    /// The id was handed out again before its deletion was written.
    pub fn forget_destroyed(&self, block_id: BlockId) {
        self.destroyed.lock().remove(&block_id);
    }

    pub fn is_destroyed(&self, block_id: BlockId) -> bool {
        self.destroyed.lock().contains(&block_id)
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.lock().len()
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Acquire)
    }

    /// Write every dirty block and the patch log in one batch. Returns the
    /// number of block writes issued.
    ///
    /// On failure every block stays dirty, and blocks whose patches were
    /// folded into the failed image will be written whole next time.
    pub fn flush(&self, cache: &CacheInner) -> Result<usize> {
        let flush_guard = self.flush_mu.lock();

        let ids = std::mem::take(&mut *self.dirty.lock());
        let (batch, captured) = self.capture(cache, &ids);

        let patch_log = if cache.patches.take_changed() {
            match cache.patches.encode(cache.config.zstd_compression_level) {
                Ok(encoded) => Some(encoded),
                Err(e) => {
                    self.restore(cache, ids, &captured);
                    return Err(e);
                }
            }
        } else {
            None
        };

        if batch.is_empty() && patch_log.is_none() {
            return Ok(0);
        }

        let writes = batch.len();
        log::debug!(
            "flushing {} block writes{}",
            writes,
            if patch_log.is_some() { " and the patch log" } else { "" }
        );

        let batch = WriteBatch { writes: batch, patch_log };
        let tokens =
            match cache.serializer.block_write(batch, &cache.writeback_account) {
                Ok(tokens) => tokens,
                Err(e) => {
                    log::warn!("flush failed, keeping blocks dirty: {}", e);
                    self.restore(cache, ids, &captured);
                    return Err(e.into());
                }
            };

        let tokens: FnvHashMap<BlockId, BlockToken> = tokens.into_iter().collect();
        let mut to_unload = vec![];

        for captured in captured {
            let Some(inner) = captured.inner else {
                // a block destroyed again since capture is back in the
                // dirty set and still needs its deletion written
                if captured.wrote_delete && !self.is_pending(captured.block_id) {
                    self.destroyed.lock().remove(&captured.block_id);
                }
                continue;
            };
            let mut state = inner.state.lock();
            if captured.wrote_image {
                state.has_disk_base = true;
            }
            if state.modifications != captured.modifications {
                // changed while we were writing; the publish re-marked it
                continue;
            }
            if captured.wrote_image && !state.deleted {
                state.disk_token = tokens.get(&captured.block_id).cloned();
            }
            #[cfg(feature = "for-internal-testing-only")]
            if !state.writeback.is_clean() && !state.deleted {
                cache.event_verifier.mark(captured.block_id, State::Clean, "flush");
            }
            state.writeback = Default::default();

            if std::mem::take(&mut state.unload_on_flush) {
                to_unload.push(captured.block_id);
            }
        }

        self.flushes.fetch_add(1, Ordering::Release);
        drop(flush_guard);

        for block_id in to_unload {
            cache.try_unload(block_id);
        }

        Ok(writes)
    }

    fn capture(
        &self,
        cache: &CacheInner,
        ids: &BTreeSet<BlockId>,
    ) -> (Vec<BlockWrite>, Vec<Captured>) {
        let mut writes = vec![];
        let mut captured = vec![];

        let page_map = cache.page_map.lock();
        for &block_id in ids {
            let Some(inner) = page_map.get(&block_id) else {
                // a clean block that was unloaded has nothing to write
                if self.is_destroyed(block_id) {
                    writes.push(BlockWrite::Delete { block_id });
                    captured.push(Captured {
                        block_id,
                        inner: None,
                        modifications: 0,
                        wrote_image: false,
                        wrote_delete: true,
                    });
                }
                continue;
            };

            let state = inner.state.lock();
            let mut wrote_image = false;
            let mut wrote_delete = false;

            if state.deleted {
                writes.push(BlockWrite::Delete { block_id });
                wrote_delete = true;
            } else if let Some(data) = state.data.clone() {
                let local = state.writeback;
                let patch_bytes = cache.patches.bytes_for(block_id);
                wrote_image = local.needs_full_write
                    || (local.dirty
                        && (!state.has_disk_base
                            || patch_bytes
                                > cache.config.max_patch_bytes_per_block));

                if wrote_image {
                    writes.push(BlockWrite::Data {
                        block_id,
                        data,
                        recency: state.recency,
                    });
                    cache.patches.drop_through(block_id, state.patch_counter);
                } else if local.recency_dirty {
                    writes.push(BlockWrite::Recency {
                        block_id,
                        recency: state.recency,
                    });
                }
            }

            captured.push(Captured {
                block_id,
                inner: Some(inner.clone()),
                modifications: state.modifications,
                wrote_image,
                wrote_delete,
            });
        }

        (writes, captured)
    }

    fn restore(
        &self,
        cache: &CacheInner,
        ids: BTreeSet<BlockId>,
        captured: &[Captured],
    ) {
        for captured in captured {
            if let (Some(inner), true) = (&captured.inner, captured.wrote_image) {
                inner.state.lock().writeback.needs_full_write = true;
            }
        }
        cache.patches.mark_changed();
        self.dirty.lock().extend(ids);
    }
}
