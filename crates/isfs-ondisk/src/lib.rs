#![forbid(unsafe_code)]
//! On-disk format parsing for the ISFS superblock region.
//!
//! Pure parsing crate — no I/O, no side effects. Parses byte slices into
//! typed structures for superblock probing (magic, version, generation),
//! the FAT (u16 next-cluster pointers), and the FST (flat array of
//! fixed-size entries forming a sibling/child tree rooted at index 0).
//!
//! All multi-byte metadata fields are big-endian as stored by the I/O
//! processor; only the MBR redirect fields (`isfs-block`) are
//! little-endian.

use isfs_types::{
    CHAIN_SENTINEL, ClusterIndex, EntryIndex, FAT_CAPACITY, FST_CAPACITY, FST_ENTRY_SIZE,
    FST_NAME_LEN, FormatVersion, Generation, ParseError, SUPER_FAT_OFFSET, SUPER_FST_OFFSET,
    SUPER_GENERATION_OFFSET, SUPER_REGION_BYTES, ensure_slice, read_be_u16, read_be_u32,
    read_fixed, trim_nul_padded,
};
use serde::{Deserialize, Serialize};

// ── Superblock probing ──────────────────────────────────────────────────────

/// Result of probing one candidate superblock page during the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperblockInfo {
    pub version: FormatVersion,
    pub generation: Generation,
}

impl SuperblockInfo {
    /// Probe the first page of a candidate slot.
    ///
    /// # Errors
    ///
    /// `InvalidMagic` for unrecognized candidates (the scan skips these),
    /// `InsufficientData` if the page is truncated.
    pub fn probe(page: &[u8]) -> Result<Self, ParseError> {
        let magic: [u8; 4] = read_fixed(page, 0)?;
        let version =
            FormatVersion::from_magic(magic).ok_or(ParseError::InvalidMagic { actual: magic })?;
        let generation = Generation(read_be_u32(page, SUPER_GENERATION_OFFSET)?);
        Ok(Self {
            version,
            generation,
        })
    }
}

// ── FST entries ─────────────────────────────────────────────────────────────

/// Node type from the low two mode bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Unused,
    File,
    Directory,
    /// Mode bits 0b11 — not produced by any known formatter.
    Invalid,
}

/// One parsed FST node (0x20 bytes on disk, packed).
///
/// `sub` is the first cluster for files and the first child entry for
/// directories; `sib` is the next sibling in the same directory. A value
/// of 0xFFFF in either is a chain terminator, never a valid index.
/// `x1`/`x3` are reserved fields carried through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FstEntry {
    pub name: [u8; FST_NAME_LEN],
    pub mode: u8,
    pub attr: u8,
    pub sub: u16,
    pub sib: u16,
    pub size: u32,
    pub x1: u16,
    pub uid: u16,
    pub gid: u16,
    pub x3: u32,
}

impl FstEntry {
    /// Parse one entry at `offset` in `data`.
    pub fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        let raw = ensure_slice(data, offset, FST_ENTRY_SIZE)?;
        Ok(Self {
            name: read_fixed(raw, 0x00)?,
            mode: raw[0x0C],
            attr: raw[0x0D],
            sub: read_be_u16(raw, 0x0E)?,
            sib: read_be_u16(raw, 0x10)?,
            size: read_be_u32(raw, 0x12)?,
            x1: read_be_u16(raw, 0x16)?,
            uid: read_be_u16(raw, 0x18)?,
            gid: read_be_u16(raw, 0x1A)?,
            x3: read_be_u32(raw, 0x1C)?,
        })
    }

    #[must_use]
    pub fn kind(self) -> EntryKind {
        match self.mode & 3 {
            0 => EntryKind::Unused,
            1 => EntryKind::File,
            2 => EntryKind::Directory,
            _ => EntryKind::Invalid,
        }
    }

    #[must_use]
    pub fn is_file(self) -> bool {
        self.kind() == EntryKind::File
    }

    #[must_use]
    pub fn is_dir(self) -> bool {
        self.kind() == EntryKind::Directory
    }

    /// Name bounded to exactly [`FST_NAME_LEN`] bytes, NUL-trimmed.
    #[must_use]
    pub fn name_str(self) -> String {
        trim_nul_padded(&self.name)
    }

    /// First child for directories, chain terminator aware.
    #[must_use]
    pub fn first_child(self) -> Option<EntryIndex> {
        (self.sub != CHAIN_SENTINEL).then_some(EntryIndex(self.sub))
    }

    /// Next sibling in the same directory.
    #[must_use]
    pub fn next_sibling(self) -> Option<EntryIndex> {
        (self.sib != CHAIN_SENTINEL).then_some(EntryIndex(self.sib))
    }

    /// First cluster group for files.
    #[must_use]
    pub fn first_cluster(self) -> ClusterIndex {
        ClusterIndex(self.sub)
    }

    /// `ls`-style mode line: type char plus three owner/group/other `rw`
    /// pairs decoded from the top mode bits.
    #[must_use]
    pub fn mode_string(self) -> String {
        const TYPE: [char; 4] = ['?', '-', 'd', '?'];
        let mut out = String::with_capacity(7);
        out.push(TYPE[usize::from(self.mode & 3)]);
        let mut mode = self.mode;
        for _ in 0..3 {
            out.push(if mode & 0x40 != 0 { 'r' } else { '-' });
            out.push(if mode & 0x80 != 0 { 'w' } else { '-' });
            mode <<= 2;
        }
        out
    }
}

// ── Superblock region ───────────────────────────────────────────────────────

/// An immutable, in-memory copy of one 0x80-page superblock region.
///
/// Holds the FAT and FST for a mounted volume. A fresh mount may select a
/// different candidate slot, but a loaded region is never mutated.
#[derive(Debug, Clone)]
pub struct Superblock {
    region: Vec<u8>,
    info: SuperblockInfo,
}

impl Superblock {
    /// Take ownership of a fully read region and validate its header.
    pub fn new(region: Vec<u8>) -> Result<Self, ParseError> {
        if region.len() != SUPER_REGION_BYTES {
            return Err(ParseError::InsufficientData {
                needed: SUPER_REGION_BYTES,
                offset: 0,
                actual: region.len(),
            });
        }
        let info = SuperblockInfo::probe(&region)?;
        Ok(Self { region, info })
    }

    #[must_use]
    pub fn version(&self) -> FormatVersion {
        self.info.version
    }

    #[must_use]
    pub fn generation(&self) -> Generation {
        self.info.generation
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.region
    }

    /// Follow one FAT hop. The slot index is bounds-checked against the
    /// FAT capacity; 0xFFFF in the slot terminates the chain.
    pub fn fat_next(&self, cluster: ClusterIndex) -> Result<ClusterIndex, ParseError> {
        let slot = usize::from(cluster.0);
        if slot >= FAT_CAPACITY {
            return Err(ParseError::InvalidField {
                field: "fat_index",
                reason: "cluster index beyond FAT capacity",
            });
        }
        let next = read_be_u16(&self.region, SUPER_FAT_OFFSET + slot * 2)?;
        Ok(ClusterIndex(next))
    }

    /// Parse the FST entry at `index`. Sentinel indices are a caller bug
    /// and report as out-of-range rather than dereferencing.
    pub fn entry(&self, index: EntryIndex) -> Result<FstEntry, ParseError> {
        let slot = usize::from(index.0);
        if slot >= FST_CAPACITY {
            return Err(ParseError::InvalidField {
                field: "fst_index",
                reason: "entry index beyond FST capacity",
            });
        }
        FstEntry::parse(&self.region, SUPER_FST_OFFSET + slot * FST_ENTRY_SIZE)
    }

    /// Upper bound used by traversal cycle guards.
    #[must_use]
    pub fn entry_capacity(&self) -> usize {
        FST_CAPACITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isfs_types::{SUPER_MAGIC_V0, SUPER_MAGIC_V1};

    fn entry_bytes(name: &str, mode: u8, sub: u16, sib: u16, size: u32) -> [u8; FST_ENTRY_SIZE] {
        let mut raw = [0u8; FST_ENTRY_SIZE];
        raw[..name.len()].copy_from_slice(name.as_bytes());
        raw[0x0C] = mode;
        raw[0x0E..0x10].copy_from_slice(&sub.to_be_bytes());
        raw[0x10..0x12].copy_from_slice(&sib.to_be_bytes());
        raw[0x12..0x16].copy_from_slice(&size.to_be_bytes());
        raw
    }

    #[test]
    fn test_probe_versions() {
        let mut page = vec![0u8; 2048];
        page[..4].copy_from_slice(&SUPER_MAGIC_V0);
        page[4..8].copy_from_slice(&9u32.to_be_bytes());
        let info = SuperblockInfo::probe(&page).expect("probe v0");
        assert_eq!(info.version, FormatVersion::V0);
        assert_eq!(info.generation, Generation(9));

        page[..4].copy_from_slice(&SUPER_MAGIC_V1);
        assert_eq!(
            SuperblockInfo::probe(&page).expect("probe v1").version,
            FormatVersion::V1
        );

        page[..4].copy_from_slice(b"JUNK");
        assert!(matches!(
            SuperblockInfo::probe(&page),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_entry_parse_roundtrip() {
        let raw = entry_bytes("fw.img", 0x41, 0x0005, 0xFFFF, 0x1234);
        let entry = FstEntry::parse(&raw, 0).expect("parse");
        assert_eq!(entry.name_str(), "fw.img");
        assert_eq!(entry.kind(), EntryKind::File);
        assert_eq!(entry.first_cluster(), ClusterIndex(5));
        assert_eq!(entry.next_sibling(), None);
        assert_eq!(entry.size, 0x1234);
    }

    #[test]
    fn test_entry_name_not_nul_terminated() {
        let raw = entry_bytes("exactly12chr", 2, 0xFFFF, 0xFFFF, 0);
        let entry = FstEntry::parse(&raw, 0).expect("parse");
        assert_eq!(entry.name_str(), "exactly12chr");
        assert_eq!(entry.kind(), EntryKind::Directory);
        assert_eq!(entry.first_child(), None);
    }

    #[test]
    fn test_mode_string() {
        // Directory, owner rw.
        let raw = entry_bytes("sys", 0x42 | 0x80, 0xFFFF, 0xFFFF, 0);
        let entry = FstEntry::parse(&raw, 0).expect("parse");
        assert_eq!(entry.mode_string(), "drw----");
        assert_eq!(entry.mode_string().len(), 7);
    }

    #[test]
    fn test_superblock_region_accessors() {
        let mut region = vec![0u8; SUPER_REGION_BYTES];
        region[..4].copy_from_slice(&SUPER_MAGIC_V1);
        region[4..8].copy_from_slice(&7u32.to_be_bytes());
        // FAT slot 2 -> 3, slot 3 -> end of chain.
        region[SUPER_FAT_OFFSET + 4..SUPER_FAT_OFFSET + 6].copy_from_slice(&3u16.to_be_bytes());
        region[SUPER_FAT_OFFSET + 6..SUPER_FAT_OFFSET + 8]
            .copy_from_slice(&0xFFFFu16.to_be_bytes());
        // Root entry.
        let root = entry_bytes("", 2, 1, 0xFFFF, 0);
        region[SUPER_FST_OFFSET..SUPER_FST_OFFSET + FST_ENTRY_SIZE].copy_from_slice(&root);

        let sb = Superblock::new(region).expect("superblock");
        assert_eq!(sb.generation(), Generation(7));
        assert_eq!(sb.fat_next(ClusterIndex(2)).expect("fat"), ClusterIndex(3));
        assert!(sb.fat_next(ClusterIndex(3)).expect("fat").is_sentinel());
        assert!(sb.fat_next(ClusterIndex::SENTINEL).is_err());
        assert!(sb.entry(EntryIndex::ROOT).expect("root").is_dir());
        assert!(sb.entry(EntryIndex::SENTINEL).is_err());
    }

    #[test]
    fn test_superblock_rejects_short_region() {
        assert!(Superblock::new(vec![0u8; 2048]).is_err());
    }
}
