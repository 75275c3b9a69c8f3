use serde::{Deserialize, Serialize};

use crate::BlockId;

/// An incremental change to a block's bytes.
///
/// Applying patches instead of rewriting whole blocks lets writeback persist
/// small changes through the compact patch log, and lets anything that
/// replays the log reproduce exactly the change that was made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Patch {
    /// Overwrite `bytes.len()` bytes starting at `dest`.
    SetData {
        /// Offset of the first overwritten byte.
        dest: u32,
        /// The new contents.
        bytes: Vec<u8>,
    },
    /// Copy `n` bytes from `src` to `dest`. The ranges may overlap.
    MoveData {
        /// Offset of the first destination byte.
        dest: u32,
        /// Offset of the first source byte.
        src: u32,
        /// Number of bytes moved.
        n: u32,
    },
}

impl Patch {
    /// A patch overwriting the bytes at `dest` with `bytes`.
    pub fn set_data(dest: usize, bytes: &[u8]) -> Patch {
        Patch::SetData { dest: to_u32(dest), bytes: bytes.to_vec() }
    }

    /// A patch moving `n` bytes from `src` to `dest`.
    pub fn move_data(dest: usize, src: usize, n: usize) -> Patch {
        Patch::MoveData { dest: to_u32(dest), src: to_u32(src), n: to_u32(n) }
    }

    /// One past the highest offset this patch touches.
    pub fn end(&self) -> usize {
        match self {
            Patch::SetData { dest, bytes } => *dest as usize + bytes.len(),
            Patch::MoveData { dest, src, n } => {
                (*dest.max(src) as usize) + *n as usize
            }
        }
    }

    /// Whether this patch stays inside a block of `block_size` bytes.
    pub fn fits(&self, block_size: usize) -> bool {
        self.end() <= block_size
    }

    /// Roughly how many bytes this patch takes in the patch log.
    pub fn serialized_size(&self) -> usize {
        match self {
            Patch::SetData { bytes, .. } => 8 + bytes.len(),
            Patch::MoveData { .. } => 16,
        }
    }

    /// Apply this patch to `data`.
    ///
    /// # Panics
    ///
    /// Panics if the patch reaches past the end of `data`.
    pub fn apply_to(&self, data: &mut [u8]) {
        assert!(
            self.fits(data.len()),
            "patch {:?} does not fit in a block of {} bytes",
            self,
            data.len()
        );
        match self {
            Patch::SetData { dest, bytes } => {
                let dest = *dest as usize;
                data[dest..dest + bytes.len()].copy_from_slice(bytes);
            }
            Patch::MoveData { dest, src, n } => {
                let src = *src as usize;
                data.copy_within(src..src + *n as usize, *dest as usize);
            }
        }
    }
}

fn to_u32(offset: usize) -> u32 {
    u32::try_from(offset).expect("patch offsets must fit in a u32")
}

/// A patch as recorded for one block, numbered by the block's patch
/// counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PatchEntry {
    pub block_id: BlockId,
    pub counter: u64,
    pub patch: Patch,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_data_matches_direct_overwrite() {
        let mut patched = vec![7_u8; 64];
        let mut direct = patched.clone();

        Patch::set_data(10, b"0123456789").apply_to(&mut patched);
        direct[10..20].copy_from_slice(b"0123456789");

        assert_eq!(patched, direct);
    }

    #[test]
    fn move_data_handles_overlap() {
        let mut data: Vec<u8> = (0..16).collect();
        Patch::move_data(2, 0, 8).apply_to(&mut data);
        assert_eq!(&data[..10], &[0, 1, 0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn bounds() {
        assert!(Patch::set_data(60, &[0; 4]).fits(64));
        assert!(!Patch::set_data(61, &[0; 4]).fits(64));
        assert!(!Patch::move_data(0, 60, 8).fits(64));
    }

    #[test]
    #[should_panic(expected = "does not fit")]
    fn out_of_range_patch_panics() {
        let mut data = vec![0_u8; 8];
        Patch::set_data(6, b"abc").apply_to(&mut data);
    }
}
