#![forbid(unsafe_code)]
//! The ISFS engine: volume registry, superblock selection, path
//! resolution, and the decrypting cluster-chain read path.
//!
//! Control flow enters through [`VolumeRegistry::mount`], then per
//! operation through [`VolumeRegistry::stat`], [`VolumeRegistry::open`]
//! (yielding a [`FileHandle`]), and [`VolumeRegistry::diropen`] (yielding
//! a [`DirHandle`]). Everything is synchronous and runs to completion;
//! collaborators may block indefinitely and the engine does not care.

mod handle;
mod registry;
mod resolve;

pub use handle::{DirHandle, FileHandle, Whence};
pub use registry::{
    DEFAULT_VOLUME_NAMES, RegistryOptions, VolumeRegistry, VolumeStatus,
};

use isfs_block::BlockSource;
use isfs_error::{IsfsError, Result};
use isfs_types::{ECC_BUFFER_SIZE, PAGE_SIZE, PageNumber};

/// What to do when a page's ECC is beyond repair.
///
/// The original firmware logs and keeps going, accepting potentially
/// corrupted output — the right trade-off for a last-resort recovery
/// tool. Stricter hosts can surface it as a hard read error instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EccPolicy {
    /// Log uncorrectable pages and return the data as read.
    #[default]
    BestEffort,
    /// Fail the operation with [`IsfsError::EccUncorrectable`].
    Strict,
}

/// Read `count` pages starting at `start` into `out`, running ECC
/// correction per page when the source carries spare data.
///
/// `out` must be exactly `count * PAGE_SIZE` bytes.
pub(crate) fn read_corrected_pages(
    source: &dyn BlockSource,
    policy: EccPolicy,
    start: PageNumber,
    count: usize,
    out: &mut [u8],
) -> Result<()> {
    debug_assert_eq!(out.len(), count * PAGE_SIZE);
    let mut spare = [0u8; ECC_BUFFER_SIZE];
    for i in 0..count {
        let page = PageNumber(start.0 + i as u32);
        let data = &mut out[i * PAGE_SIZE..(i + 1) * PAGE_SIZE];
        source.read_page(page, data, &mut spare)?;
        if !source.has_spare() {
            continue;
        }
        let outcome = isfs_ecc::correct_page(page, data, &spare)
            .map_err(|err| IsfsError::Format(err.to_string()))?;
        if outcome.is_uncorrectable() && policy == EccPolicy::Strict {
            return Err(IsfsError::EccUncorrectable {
                page: u64::from(page.0),
            });
        }
        // BestEffort: isfs-ecc already logged the stats; proceed with the
        // data as read.
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use isfs_block::MemoryBlockSource;

    #[test]
    fn test_read_corrected_pages_skips_ecc_without_spare() {
        let pages = vec![vec![0xAA; PAGE_SIZE], vec![0xBB; PAGE_SIZE]];
        let source = MemoryBlockSource::from_pages(pages);
        let mut out = vec![0u8; 2 * PAGE_SIZE];
        read_corrected_pages(&source, EccPolicy::Strict, PageNumber(0), 2, &mut out)
            .expect("read");
        assert_eq!(&out[..PAGE_SIZE], &vec![0xAA; PAGE_SIZE][..]);
        assert_eq!(&out[PAGE_SIZE..], &vec![0xBB; PAGE_SIZE][..]);
    }

    #[test]
    fn test_read_corrected_pages_strict_surfaces_uncorrectable() {
        // A spare whose stored half disagrees with the computed half in a
        // way no single-bit flip explains.
        let data = vec![0x55u8; PAGE_SIZE];
        let mut spare = isfs_ecc::build_spare(&data).expect("spare");
        spare[isfs_types::SPARE_ECC_STORED_OFFSET] ^= 0xFF;

        let source = MemoryBlockSource::from_pages_with_spares(vec![(data, spare)]);
        let mut out = vec![0u8; PAGE_SIZE];

        let err = read_corrected_pages(&source, EccPolicy::Strict, PageNumber(0), 1, &mut out)
            .expect_err("strict must fail");
        assert!(matches!(err, IsfsError::EccUncorrectable { page: 0 }));

        read_corrected_pages(&source, EccPolicy::BestEffort, PageNumber(0), 1, &mut out)
            .expect("best-effort proceeds");
    }
}
