#![forbid(unsafe_code)]
//! Shared newtypes, on-disk constants, and byte-parsing helpers for the
//! ISFS engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raw flash page size in bytes.
pub const PAGE_SIZE: usize = 2048;
/// Out-of-band spare area per page.
pub const PAGE_SPARE_SIZE: usize = 64;
/// Spare area plus the appended computed-ECC codewords.
pub const ECC_BUFFER_SIZE: usize = PAGE_SPARE_SIZE + 16;
/// Offset of the stored ECC codewords inside the spare buffer.
pub const SPARE_ECC_STORED_OFFSET: usize = 0x30;
/// Offset of the freshly computed ECC codewords inside the spare buffer.
pub const SPARE_ECC_CALC_OFFSET: usize = 0x40;

/// ECC sub-page granularity: one 4-byte codeword per 512 data bytes.
pub const SUBPAGE_SIZE: usize = 512;
pub const SUBPAGES_PER_PAGE: usize = PAGE_SIZE / SUBPAGE_SIZE;
pub const ECC_CODEWORD_SIZE: usize = 4;

/// Pages per cluster group, the unit of decryption and FAT chaining.
pub const CLUSTER_PAGES: usize = 8;
/// Bytes per cluster group (16 KiB).
pub const CLUSTER_BYTES: usize = CLUSTER_PAGES * PAGE_SIZE;

/// Number of pages in one flash bank.
pub const NAND_MAX_PAGE: u32 = 0x40000;

/// First page of the superblock scan window.
pub const SUPER_SCAN_START: u32 = 0x3F800;
/// One past the last page of the scan window.
pub const SUPER_SCAN_END: u32 = NAND_MAX_PAGE;
/// Pages per superblock slot; also the scan stride.
pub const SUPER_REGION_PAGES: u32 = 0x80;
/// Size of one in-memory superblock region.
pub const SUPER_REGION_BYTES: usize = SUPER_REGION_PAGES as usize * PAGE_SIZE;

/// Superblock magic for format version 0.
pub const SUPER_MAGIC_V0: [u8; 4] = *b"SFFS";
/// Superblock magic for format version 1.
pub const SUPER_MAGIC_V1: [u8; 4] = *b"SFS!";
/// Offset of the generation counter within the superblock.
pub const SUPER_GENERATION_OFFSET: usize = 0x04;
/// Offset of the FAT within the superblock region.
pub const SUPER_FAT_OFFSET: usize = 0x0C;
/// Offset of the FST within the superblock region.
pub const SUPER_FST_OFFSET: usize = 0x10000 + 0x0C;

/// Number of u16 FAT slots that fit between the FAT and the FST.
pub const FAT_CAPACITY: usize = (SUPER_FST_OFFSET - SUPER_FAT_OFFSET) / 2;
/// Number of FST entries that fit in the rest of the region.
pub const FST_CAPACITY: usize = (SUPER_REGION_BYTES - SUPER_FST_OFFSET) / FST_ENTRY_SIZE;

/// On-disk size of one FST entry.
pub const FST_ENTRY_SIZE: usize = 0x20;
/// Fixed name field width; names are NOT guaranteed NUL-terminated.
pub const FST_NAME_LEN: usize = 12;

/// Chain terminator for both `sub`/`sib` entry indices and FAT slots.
pub const CHAIN_SENTINEL: u16 = 0xFFFF;

pub const AES_KEY_SIZE: usize = 16;
pub const AES_BLOCK_SIZE: usize = 16;
pub const HMAC_KEY_SIZE: usize = 20;

/// Sector size of the external medium redirected banks live on.
pub const SECTOR_SIZE: usize = 512;
/// Offset of the fourth MBR partition entry.
pub const MBR_PART4_OFFSET: usize = 0x1EE;
/// Partition type byte marking a raw-bank redirect.
pub const MBR_REDIRECT_TYPE: u8 = 0xAE;

/// Raw flash page index within one bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageNumber(pub u32);

impl PageNumber {
    /// Byte offset of this page in a spare-less (data-only) image.
    #[must_use]
    pub fn byte_offset(self) -> u64 {
        u64::from(self.0) * PAGE_SIZE as u64
    }
}

/// Cluster-group index; doubles as a FAT slot number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterIndex(pub u16);

impl ClusterIndex {
    pub const SENTINEL: Self = Self(CHAIN_SENTINEL);

    #[must_use]
    pub fn is_sentinel(self) -> bool {
        self.0 == CHAIN_SENTINEL
    }

    /// First raw page of this cluster group.
    #[must_use]
    pub fn first_page(self) -> PageNumber {
        PageNumber(u32::from(self.0) * CLUSTER_PAGES as u32)
    }
}

/// Index into the flat FST entry array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryIndex(pub u16);

impl EntryIndex {
    pub const ROOT: Self = Self(0);
    pub const SENTINEL: Self = Self(CHAIN_SENTINEL);

    #[must_use]
    pub fn is_sentinel(self) -> bool {
        self.0 == CHAIN_SENTINEL
    }
}

/// Superblock generation counter; higher wins at mount time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Generation(pub u32);

/// Index into the registry's fixed volume table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VolumeId(pub usize);

/// Superblock format version, keyed by magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormatVersion {
    /// `"SFFS"` — legacy key pair.
    V0,
    /// `"SFS!"` — current key pair.
    V1,
}

impl FormatVersion {
    /// Map a magic byte sequence to its version, if recognized.
    #[must_use]
    pub fn from_magic(magic: [u8; 4]) -> Option<Self> {
        match magic {
            SUPER_MAGIC_V0 => Some(Self::V0),
            SUPER_MAGIC_V1 => Some(Self::V1),
            _ => None,
        }
    }
}

impl std::fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V0 => write!(f, "0"),
            Self::V1 => write!(f, "1"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: {actual:02x?}")]
    InvalidMagic { actual: [u8; 4] },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

/// Bounds-checked subslice access.
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let end = offset
        .checked_add(len)
        .ok_or(ParseError::IntegerConversion { field: "offset" })?;
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

/// Read a big-endian u16 (the on-disk byte order for all ISFS metadata).
pub fn read_be_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Read a big-endian u32.
pub fn read_be_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Read a little-endian u32 (MBR partition fields only).
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Read a fixed-size byte array.
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Decode a fixed-width name field: bytes up to the first NUL (or the full
/// width — names are not guaranteed NUL-terminated), lossy UTF-8.
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
