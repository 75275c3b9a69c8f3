use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::patch::PatchEntry;
use crate::{BlockId, Error, Result};

const FRAME_HEADER_LEN: usize = 4 + 8;

/// Patches applied since each block's on-disk image was last written.
///
/// A block's true contents are its on-disk image with these patches
/// replayed in counter order. The whole store is encoded into the patch log
/// on every flush, so blocks that only received small patches never need
/// their full image rewritten.
#[derive(Debug, Default)]
pub(crate) struct PatchStore {
    patches: Mutex<BTreeMap<BlockId, Vec<PatchEntry>>>,
    /// Set whenever the store differs from the last encoded log.
    changed: AtomicBool,
}

impl PatchStore {
    pub fn append(&self, entries: Vec<PatchEntry>) {
        if entries.is_empty() {
            return;
        }
        let mut patches = self.patches.lock();
        for entry in entries {
            let list = patches.entry(entry.block_id).or_default();
            debug_assert!(
                list.last().map_or(true, |last| last.counter < entry.counter),
                "patch counters must increase"
            );
            list.push(entry);
        }
        self.changed.store(true, Ordering::Release);
    }

    /// The patches to replay on top of `block_id`'s on-disk image.
    pub fn patches_for(&self, block_id: BlockId) -> Vec<PatchEntry> {
        self.patches.lock().get(&block_id).cloned().unwrap_or_default()
    }

    pub fn last_counter(&self, block_id: BlockId) -> Option<u64> {
        self.patches
            .lock()
            .get(&block_id)
            .and_then(|list| list.last())
            .map(|entry| entry.counter)
    }

    pub fn bytes_for(&self, block_id: BlockId) -> usize {
        self.patches.lock().get(&block_id).map_or(0, |list| {
            list.iter().map(|entry| entry.patch.serialized_size()).sum()
        })
    }

    /// Forget patches that are part of an image written at
    /// `through_counter`.
    pub fn drop_through(&self, block_id: BlockId, through_counter: u64) {
        let mut patches = self.patches.lock();
        if let Some(list) = patches.get_mut(&block_id) {
            let before = list.len();
            list.retain(|entry| entry.counter > through_counter);
            if list.len() != before {
                self.changed.store(true, Ordering::Release);
            }
            if list.is_empty() {
                patches.remove(&block_id);
            }
        }
    }

    pub fn drop_block(&self, block_id: BlockId) {
        if self.patches.lock().remove(&block_id).is_some() {
            self.changed.store(true, Ordering::Release);
        }
    }

    /// Whether the store changed since the last call.
    pub fn take_changed(&self) -> bool {
        self.changed.swap(false, Ordering::AcqRel)
    }

    /// Force the next flush to rewrite the log.
    pub fn mark_changed(&self) {
        self.changed.store(true, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.patches.lock().values().map(Vec::len).sum()
    }

    /// Encode the whole store as a crc-framed, zstd-compressed patch log.
    pub fn encode(&self, zstd_compression_level: i32) -> Result<Vec<u8>> {
        let entries: Vec<PatchEntry> =
            self.patches.lock().values().flatten().cloned().collect();

        let serialized = bincode::serialize(&entries).map_err(|e| {
            Error::ReportableBug(format!("failed to serialize patch log: {e}"))
        })?;
        let compressed =
            zstd::stream::encode_all(&serialized[..], zstd_compression_level)?;

        let crc = crc32fast::hash(&compressed);
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + compressed.len());
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(&(compressed.len() as u64).to_le_bytes());
        frame.extend_from_slice(&compressed);

        Ok(frame)
    }

    /// Rebuild a store from an encoded patch log.
    pub fn decode(frame: &[u8]) -> Result<PatchStore> {
        let corrupt = |detail: String| Error::Corruption { block_id: 0, detail };

        if frame.len() < FRAME_HEADER_LEN {
            return Err(corrupt(format!(
                "patch log of {} bytes is shorter than its header",
                frame.len()
            )));
        }

        let mut crc_bytes = [0; 4];
        crc_bytes.copy_from_slice(&frame[..4]);
        let mut len_bytes = [0; 8];
        len_bytes.copy_from_slice(&frame[4..FRAME_HEADER_LEN]);

        let expected_crc = u32::from_le_bytes(crc_bytes);
        let len = u64::from_le_bytes(len_bytes) as usize;
        let payload = &frame[FRAME_HEADER_LEN..];

        if payload.len() != len {
            return Err(corrupt(format!(
                "patch log frame says {} bytes but {} follow the header",
                len,
                payload.len()
            )));
        }

        let actual_crc = crc32fast::hash(payload);
        if actual_crc != expected_crc {
            return Err(corrupt(format!(
                "patch log crc mismatch: expected {:x}, found {:x}",
                expected_crc, actual_crc
            )));
        }

        let serialized = zstd::stream::decode_all(payload).map_err(|e| {
            if e.kind() == io::ErrorKind::InvalidData {
                corrupt(format!("failed to decompress patch log: {e}"))
            } else {
                Error::Io(e)
            }
        })?;

        let entries: Vec<PatchEntry> = bincode::deserialize(&serialized)
            .map_err(|e| corrupt(format!("failed to decode patch log: {e}")))?;

        let store = PatchStore::default();
        store.append(entries);
        store.take_changed();
        Ok(store)
    }
}
