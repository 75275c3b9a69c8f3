use std::fmt;
use std::sync::Arc;

#[cfg(feature = "for-internal-testing-only")]
use crate::event_verifier::State;
use crate::inner_buf::InnerBuf;
use crate::patch::PatchEntry;
use crate::transaction::lock_mode;
use crate::{Access, BlockId, Patch, Recency, SnapshotVersion, Transaction};

/// A handle on one acquired block.
///
/// Reads see the data resolved at acquisition. Writes go to a private copy
/// that is published when the handle is released, either explicitly with
/// [`Buf::release`] or when it is dropped. Small changes should go through
/// [`Buf::set_data`], [`Buf::move_data`] or [`Buf::apply_patch`] so that
/// writeback can persist them through the patch log instead of rewriting
/// the whole block.
pub struct Buf<'t> {
    txn: &'t Transaction,
    inner: Arc<InnerBuf>,
    access: Access,
    holds_lock: bool,
    data: Arc<Vec<u8>>,
    /// The snapshot `data` came from, whose data refcount we hold.
    snapshot_key: Option<SnapshotVersion>,
    major_write: bool,
    patches: Vec<Patch>,
    deleted: bool,
    new_recency: Option<Recency>,
    ensure_flush: bool,
    released: bool,
}

impl fmt::Debug for Buf<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buf")
            .field("block_id", &self.inner.block_id)
            .field("access", &self.access)
            .field("holds_lock", &self.holds_lock)
            .field("snapshot_key", &self.snapshot_key)
            .field("major_write", &self.major_write)
            .field("pending_patches", &self.patches.len())
            .field("deleted", &self.deleted)
            .finish()
    }
}

impl Drop for Buf<'_> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl<'t> Buf<'t> {
    pub(crate) fn new(
        txn: &'t Transaction,
        inner: Arc<InnerBuf>,
        access: Access,
        holds_lock: bool,
        data: Arc<Vec<u8>>,
        snapshot_key: Option<SnapshotVersion>,
    ) -> Buf<'t> {
        Buf {
            txn,
            inner,
            access,
            holds_lock,
            data,
            snapshot_key,
            major_write: false,
            patches: vec![],
            deleted: false,
            new_recency: None,
            ensure_flush: false,
            released: false,
        }
    }

    /// The block this handle is on.
    pub fn block_id(&self) -> BlockId {
        self.inner.block_id
    }

    /// The mode the block was acquired in.
    pub fn access(&self) -> Access {
        self.access
    }

    /// The block's recency, including a `touch_recency` on this handle.
    pub fn recency(&self) -> Recency {
        match self.new_recency {
            Some(recency) => recency,
            None => self.inner.state.lock().recency,
        }
    }

    /// The block's contents.
    pub fn get_data_read(&self) -> &[u8] {
        &self.data
    }

    #[track_caller]
    fn assert_writable(&self, operation: &str) {
        assert_eq!(
            self.access,
            Access::Write,
            "{} on block {} requires write access",
            operation,
            self.inner.block_id
        );
        assert!(!self.deleted, "{} on deleted block {}", operation, self.inner.block_id);
    }

    /// Mutable contents, for rewrites too large to express as patches. The
    /// next flush writes the whole block.
    pub fn get_data_major_write(&mut self) -> &mut [u8] {
        self.assert_writable("get_data_major_write");
        self.major_write = true;
        // a whole-block write subsumes anything patched so far
        self.patches.clear();
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    /// Apply `patch` and record it for the patch log.
    ///
    /// # Panics
    ///
    /// Panics without write access or if the patch reaches past the end of
    /// the block.
    pub fn apply_patch(&mut self, patch: Patch) {
        self.assert_writable("apply_patch");
        assert!(
            patch.fits(self.data.len()),
            "{:?} does not fit block {} of {} bytes",
            patch,
            self.inner.block_id,
            self.data.len()
        );
        patch.apply_to(Arc::make_mut(&mut self.data).as_mut_slice());
        if !self.major_write {
            self.patches.push(patch);
        }
    }

    /// Copy `src` to offset `dest`.
    pub fn set_data(&mut self, dest: usize, src: &[u8]) {
        self.apply_patch(Patch::set_data(dest, src));
    }

    /// Move `n` bytes from offset `src` to offset `dest`.
    pub fn move_data(&mut self, dest: usize, src: usize, n: usize) {
        self.apply_patch(Patch::move_data(dest, src, n));
    }

    /// Delete the block when this handle is released.
    pub fn mark_deleted(&mut self) {
        self.assert_writable("mark_deleted");
        self.deleted = true;
    }

    /// Set the block's recency. `Recency::INVALID` leaves it alone.
    pub fn touch_recency(&mut self, recency: Recency) {
        self.assert_writable("touch_recency");
        if recency.is_valid() {
            self.new_recency = Some(recency);
        }
    }

    /// Make the next flush write the whole block.
    pub fn ensure_flush(&mut self) {
        self.assert_writable("ensure_flush");
        self.ensure_flush = true;
    }

    /// Publish any changes and give the block back.
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
            self.inner.lock.unlock(lock_mode(self.access));
        }

        let cache = self.txn.cache();
        if let Some(key) = self.snapshot_key.take() {
            cache.release_snapshot_data(&self.inner, key);
        }
        cache.unpin(&self.inner);
    }

    fn publish(&mut self) {
        let cache = self.txn.cache();
        let block_id = self.inner.block_id;
        let modified = self.major_write || !self.patches.is_empty() || self.deleted;

        let txn_recency = self.txn.recency();
        let recency = self.new_recency.or(if modified && txn_recency.is_valid() {
            Some(txn_recency)
        } else {
            None
        });

        let mut state = self.inner.state.lock();
        // a skipped read's zeroes become the contents even if unwritten
        let mut changed = std::mem::take(&mut state.unpublished);

        if modified {
            let version = self.txn.write_version();
            let snapshotted = state.snapshot_if_needed(version, &cache.versions.lock());
            if snapshotted {
                log::trace!("snapshotted block {} before {:?}", block_id, version);
                cache.note_snapshot_taken(block_id);
            }
            state.data = Some(self.data.clone());
            state.disk_token = None;
            changed = true;
        }

        if self.major_write {
            state.patch_counter += 1;
            state.writeback.dirty = true;
            state.writeback.needs_full_write = true;
        } else if !self.patches.is_empty() {
            let mut entries = Vec::with_capacity(self.patches.len());
            for patch in self.patches.drain(..) {
                state.patch_counter += 1;
                entries.push(PatchEntry { block_id, counter: state.patch_counter, patch });
            }
            cache.patches.append(entries);
            state.writeback.dirty = true;
        }

        if let Some(recency) = recency {
            if recency != state.recency {
                state.recency = recency;
                state.writeback.recency_dirty = true;
                changed = true;
            }
        }

        if self.ensure_flush {
            state.writeback.dirty = true;
            state.writeback.needs_full_write = true;
            changed = true;
        }

        if self.deleted {
            state.deleted = true;
            cache.patches.drop_block(block_id);
        }

        if !changed {
            return;
        }
        // writeback compares this to notice changes made while it wrote
        state.modifications += 1;

        #[cfg(feature = "for-internal-testing-only")]
        if self.deleted {
            cache.event_verifier.mark(block_id, State::Deleted, "publish");
        } else {
            cache.event_verifier.mark(block_id, State::Dirty, "publish");
        }

        drop(state);
        cache.writeback.mark_dirty(block_id);
    }
}
