//! File and directory handles: the cluster-chain read path and the
//! sibling-chain directory iterator.
//!
//! A cluster group is 8 consecutive raw pages (16 KiB) and is the unit of
//! both FAT chaining and decryption. Group contents are AES-128-CBC under
//! the volume key with a zero IV reset per group; there is no cross-group
//! chaining, so any group decrypts independently and any prefix of a
//! group decrypts without the rest.

use crate::registry::MountedVolume;
use crate::{EccPolicy, read_corrected_pages};
use isfs_crypto::CryptoEngine;
use isfs_error::{IsfsError, Result};
use isfs_ondisk::FstEntry;
use isfs_types::{AES_BLOCK_SIZE, CLUSTER_BYTES, ClusterIndex, EntryIndex, PAGE_SIZE};
use std::sync::Arc;

const ZERO_IV: [u8; AES_BLOCK_SIZE] = [0; AES_BLOCK_SIZE];

/// Seek origin, mirroring the host's SEEK_SET/SEEK_CUR/SEEK_END.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

fn chain_corrupt(volume: &str, cluster: ClusterIndex, detail: &str) -> IsfsError {
    IsfsError::Corruption {
        page: u64::from(cluster.first_page().0),
        detail: format!("{volume}: {detail}"),
    }
}

/// An open file: a resolved entry plus a byte-offset/cluster cursor.
///
/// The handle pins the mount snapshot it was opened against; dropping it
/// closes the file.
pub struct FileHandle {
    volume: Arc<MountedVolume>,
    crypto: Arc<dyn CryptoEngine>,
    policy: EccPolicy,
    entry: FstEntry,
    offset: u64,
    cluster: ClusterIndex,
}

impl FileHandle {
    pub(crate) fn new(
        volume: Arc<MountedVolume>,
        crypto: Arc<dyn CryptoEngine>,
        policy: EccPolicy,
        entry: FstEntry,
    ) -> Self {
        let cluster = entry.first_cluster();
        Self {
            volume,
            crypto,
            policy,
            entry,
            offset: 0,
            cluster,
        }
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        u64::from(self.entry.size)
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn entry(&self) -> &FstEntry {
        &self.entry
    }

    /// Move the cursor. The absolute target must land in `[0, size]` for
    /// every origin; the owning cluster group is re-derived by walking
    /// the FAT forward from the file's first group — seeking is O(n) in
    /// the target offset, never cached.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64> {
        let size = self.size();
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => i64::try_from(self.offset).unwrap_or(i64::MAX),
            Whence::End => i64::try_from(size).unwrap_or(i64::MAX),
        };
        let target = base.checked_add(offset).ok_or(IsfsError::SeekOutOfRange {
            pos: i64::MAX,
            size,
        })?;
        if target < 0 || target as u64 > size {
            return Err(IsfsError::SeekOutOfRange { pos: target, size });
        }
        let target = target as u64;

        let mut cluster = self.entry.first_cluster();
        let mut hops = target / CLUSTER_BYTES as u64;
        while hops > 0 {
            if cluster.is_sentinel() {
                // Walking exactly to EOF on a group boundary steps past
                // the last group; that cursor is only ever used if a read
                // actually happens, which EOF prevents.
                if target == size {
                    break;
                }
                return Err(chain_corrupt(
                    &self.volume.name,
                    cluster,
                    "cluster chain ends before the seek target",
                ));
            }
            cluster = self
                .volume
                .superblock
                .fat_next(cluster)
                .map_err(|err| chain_corrupt(&self.volume.name, cluster, &err.to_string()))?;
            hops -= 1;
        }

        self.offset = target;
        self.cluster = cluster;
        Ok(target)
    }

    /// Read up to `buf.len()` bytes at the cursor. Returns the byte count
    /// actually copied: `min(requested, size - offset)`, 0 at EOF. Never
    /// reads past end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = self.size() - self.offset;
        let want = usize::try_from(remaining.min(buf.len() as u64))
            .map_err(|_| IsfsError::Format("read length overflows usize".to_owned()))?;
        if want == 0 {
            return Ok(0);
        }

        let mut copied = 0usize;
        let mut group_buf = vec![0u8; CLUSTER_BYTES];
        while copied < want {
            if self.cluster.is_sentinel() {
                return Err(chain_corrupt(
                    &self.volume.name,
                    self.cluster,
                    "cluster chain ends before end of file",
                ));
            }

            let pos = (self.offset % CLUSTER_BYTES as u64) as usize;
            let copy = (CLUSTER_BYTES - pos).min(want - copied);
            // Enough whole pages from the group start to cover the slice;
            // CBC with a per-group zero IV makes the prefix sufficient.
            let pages = (pos + copy).div_ceil(PAGE_SIZE);
            let group = &mut group_buf[..pages * PAGE_SIZE];

            read_corrected_pages(
                self.volume.source.as_ref(),
                self.policy,
                self.cluster.first_page(),
                pages,
                group,
            )?;
            self.crypto.decrypt(&self.volume.keys.aes, &ZERO_IV, group)?;

            buf[copied..copied + copy].copy_from_slice(&group[pos..pos + copy]);
            self.offset += copy as u64;
            copied += copy;

            if pos + copy >= CLUSTER_BYTES {
                self.cluster = self
                    .volume
                    .superblock
                    .fat_next(self.cluster)
                    .map_err(|err| chain_corrupt(&self.volume.name, self.cluster, &err.to_string()))?;
            }
        }
        Ok(copied)
    }

    /// Read the remainder of the file from the cursor.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let remaining = usize::try_from(self.size() - self.offset)
            .map_err(|_| IsfsError::Format("file size overflows usize".to_owned()))?;
        let mut out = vec![0u8; remaining];
        let got = self.read(&mut out)?;
        out.truncate(got);
        Ok(out)
    }

    /// Handles are transient; dropping closes them. Provided for
    /// symmetry with the device-table surface.
    pub fn close(self) {}
}

/// A directory listing: the child sibling chain of a resolved directory,
/// restartable, exhausted when the cursor hits the sentinel.
pub struct DirHandle {
    volume: Arc<MountedVolume>,
    dir: FstEntry,
    cursor: Option<EntryIndex>,
    visited: usize,
}

impl DirHandle {
    pub(crate) fn new(volume: Arc<MountedVolume>, dir: FstEntry) -> Self {
        let cursor = dir.first_child();
        Self {
            volume,
            dir,
            cursor,
            visited: 0,
        }
    }

    #[must_use]
    pub fn entry(&self) -> &FstEntry {
        &self.dir
    }

    /// Yield the next child, or `None` once the chain is exhausted.
    pub fn read(&mut self) -> Result<Option<FstEntry>> {
        let Some(index) = self.cursor else {
            return Ok(None);
        };
        if self.visited >= self.volume.superblock.entry_capacity() {
            return Err(IsfsError::Corruption {
                page: u64::from(self.volume.slot.0),
                detail: format!(
                    "{}: directory sibling chain exceeds table capacity",
                    self.volume.name
                ),
            });
        }
        self.visited += 1;

        let entry = self
            .volume
            .superblock
            .entry(index)
            .map_err(|err| IsfsError::Corruption {
                page: u64::from(self.volume.slot.0),
                detail: format!("{}: {err}", self.volume.name),
            })?;
        self.cursor = entry.next_sibling();
        Ok(Some(entry))
    }

    /// Restart the listing from the first child.
    pub fn reset(&mut self) {
        self.cursor = self.dir.first_child();
        self.visited = 0;
    }

    /// Handles are transient; dropping closes them.
    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use isfs_block::MemoryBlockSource;
    use isfs_crypto::VolumeKeys;
    use isfs_ondisk::Superblock;
    use isfs_types::{
        FST_ENTRY_SIZE, PageNumber, SUPER_FST_OFFSET, SUPER_MAGIC_V1, SUPER_REGION_BYTES,
        SUPER_SCAN_START,
    };

    fn volume_with_entries(entries: &[(&str, u8, u16, u16)]) -> Arc<MountedVolume> {
        let mut region = vec![0u8; SUPER_REGION_BYTES];
        region[..4].copy_from_slice(&SUPER_MAGIC_V1);
        for (slot, (name, mode, sub, sib)) in entries.iter().enumerate() {
            let at = SUPER_FST_OFFSET + slot * FST_ENTRY_SIZE;
            region[at..at + name.len()].copy_from_slice(name.as_bytes());
            region[at + 0x0C] = *mode;
            region[at + 0x0E..at + 0x10].copy_from_slice(&sub.to_be_bytes());
            region[at + 0x10..at + 0x12].copy_from_slice(&sib.to_be_bytes());
        }
        Arc::new(MountedVolume {
            name: "slc".to_owned(),
            source: Arc::new(MemoryBlockSource::from_pages(Vec::new())),
            superblock: Superblock::new(region).expect("superblock"),
            keys: VolumeKeys {
                aes: [0; 16],
                hmac: [0; 20],
            },
            slot: PageNumber(SUPER_SCAN_START),
        })
    }

    #[test]
    fn test_dir_sibling_cycle_reports_the_volume() {
        // Root whose only child chains to itself.
        let volume = volume_with_entries(&[("", 2, 1, 0xFFFF), ("loop", 2, 0xFFFF, 1)]);
        let root = volume.superblock.entry(EntryIndex::ROOT).expect("root");
        let mut dir = DirHandle::new(volume, root);

        let budget = dir.volume.superblock.entry_capacity();
        let mut last = Ok(None);
        for _ in 0..=budget {
            last = dir.read();
            if last.is_err() {
                break;
            }
        }
        match last {
            Err(IsfsError::Corruption { detail, .. }) => {
                assert!(detail.contains("slc"), "detail was {detail:?}");
            }
            other => panic!("expected corruption, got {other:?}"),
        }
    }
}
