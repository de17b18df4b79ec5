#![forbid(unsafe_code)]
//! Raw-page transport for the ISFS engine.
//!
//! Two layers. [`ByteDevice`] is fixed-offset byte I/O (pread semantics)
//! over a dump file or an in-memory buffer. [`BlockSource`] is the page
//! interface the engine consumes: a direct flash bank whose pages carry
//! out-of-band spare data, or a redirection to a partition on an external
//! medium whose pages are plain sectors with no spare. The command-level
//! NAND/SD protocol drivers live outside this crate; everything here is
//! already-captured bytes.

use isfs_error::{IsfsError, Result};
use isfs_types::{
    ECC_BUFFER_SIZE, MBR_PART4_OFFSET, MBR_REDIRECT_TYPE, NAND_MAX_PAGE, PAGE_SIZE,
    PAGE_SPARE_SIZE, PageNumber, SECTOR_SIZE, read_le_u32,
};
use std::collections::BTreeSet;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

// ── Byte devices ────────────────────────────────────────────────────────────

/// Byte-addressed device for fixed-offset reads (pread semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

/// File-backed byte device using `pread`-style I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and needs no shared seek
/// position. Opened read-only: the engine never writes.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }
}

/// In-memory byte device for fixtures.
#[derive(Debug, Clone)]
pub struct MemoryByteDevice {
    bytes: Arc<Vec<u8>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
        }
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.bytes.len() as u64)?;
        let start = usize::try_from(offset)
            .map_err(|_| IsfsError::Format("offset overflows usize".to_owned()))?;
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
        Ok(())
    }
}

fn check_range(offset: u64, len: usize, device_len: u64) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or_else(|| IsfsError::Format("read range overflows u64".to_owned()))?;
    if end > device_len {
        return Err(IsfsError::Format(format!(
            "read out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

// ── Block sources ───────────────────────────────────────────────────────────

/// Supplier of raw pages for one logical bank.
///
/// Calls block until the transfer completes; the engine issues them
/// strictly sequentially.
pub trait BlockSource: Send + Sync {
    /// Number of addressable pages.
    fn page_count(&self) -> u32;

    /// Whether pages carry spare/ECC data. Redirected media do not, and
    /// the engine skips ECC correction for them.
    fn has_spare(&self) -> bool;

    /// Read one page into `data` ([`PAGE_SIZE`] bytes). When
    /// [`has_spare`](Self::has_spare) is true, fill `spare`
    /// ([`ECC_BUFFER_SIZE`] bytes: stored codewords plus a freshly
    /// computed set); otherwise `spare` is left untouched.
    fn read_page(&self, page: PageNumber, data: &mut [u8], spare: &mut [u8]) -> Result<()>;
}

fn check_page_bufs(data: &[u8], spare: &[u8], with_spare: bool) -> Result<()> {
    if data.len() != PAGE_SIZE {
        return Err(IsfsError::Format(format!(
            "page buffer must be {PAGE_SIZE} bytes, got {}",
            data.len()
        )));
    }
    if with_spare && spare.len() != ECC_BUFFER_SIZE {
        return Err(IsfsError::Format(format!(
            "spare buffer must be {ECC_BUFFER_SIZE} bytes, got {}",
            spare.len()
        )));
    }
    Ok(())
}

fn check_page_number(page: PageNumber, count: u32) -> Result<()> {
    if page.0 >= count {
        return Err(IsfsError::Format(format!(
            "page {:#x} beyond bank end {:#x}",
            page.0, count
        )));
    }
    Ok(())
}

/// A flash-bank dump with interleaved out-of-band data: each page is
/// [`PAGE_SIZE`] data bytes followed by [`PAGE_SPARE_SIZE`] spare bytes
/// (the common 2112-byte-stride dump format). The computed half of the
/// spare buffer is synthesized in software, standing in for what the
/// flash controller appends on every hardware read.
#[derive(Clone)]
pub struct NandImageSource<D> {
    device: D,
    pages: u32,
}

const NAND_PAGE_STRIDE: u64 = (PAGE_SIZE + PAGE_SPARE_SIZE) as u64;

impl<D: ByteDevice> NandImageSource<D> {
    pub fn new(device: D) -> Result<Self> {
        let len = device.len_bytes();
        if len % NAND_PAGE_STRIDE != 0 {
            return Err(IsfsError::Format(format!(
                "NAND image length {len} is not a multiple of the {NAND_PAGE_STRIDE}-byte page stride"
            )));
        }
        let pages = u32::try_from(len / NAND_PAGE_STRIDE)
            .map_err(|_| IsfsError::Format("NAND image page count overflows u32".to_owned()))?;
        Ok(Self { device, pages })
    }
}

impl<D: ByteDevice> BlockSource for NandImageSource<D> {
    fn page_count(&self) -> u32 {
        self.pages
    }

    fn has_spare(&self) -> bool {
        true
    }

    fn read_page(&self, page: PageNumber, data: &mut [u8], spare: &mut [u8]) -> Result<()> {
        check_page_bufs(data, spare, true)?;
        check_page_number(page, self.pages)?;
        let base = u64::from(page.0) * NAND_PAGE_STRIDE;
        self.device.read_exact_at(base, data)?;
        self.device
            .read_exact_at(base + PAGE_SIZE as u64, &mut spare[..PAGE_SPARE_SIZE])?;
        spare[PAGE_SPARE_SIZE..].fill(0);
        isfs_ecc::refresh_calc_half(data, spare)
            .map_err(|err| IsfsError::Format(err.to_string()))?;
        Ok(())
    }
}

/// A spare-less dump: pages packed back to back with no out-of-band data.
/// ECC is skipped for these, as for redirected media.
#[derive(Clone)]
pub struct RawImageSource<D> {
    device: D,
    pages: u32,
}

impl<D: ByteDevice> RawImageSource<D> {
    pub fn new(device: D) -> Result<Self> {
        let len = device.len_bytes();
        if len % PAGE_SIZE as u64 != 0 {
            return Err(IsfsError::Format(format!(
                "raw image length {len} is not a multiple of the page size"
            )));
        }
        let pages = u32::try_from(len / PAGE_SIZE as u64)
            .map_err(|_| IsfsError::Format("raw image page count overflows u32".to_owned()))?;
        Ok(Self { device, pages })
    }
}

impl<D: ByteDevice> BlockSource for RawImageSource<D> {
    fn page_count(&self) -> u32 {
        self.pages
    }

    fn has_spare(&self) -> bool {
        false
    }

    fn read_page(&self, page: PageNumber, data: &mut [u8], _spare: &mut [u8]) -> Result<()> {
        check_page_bufs(data, _spare, false)?;
        check_page_number(page, self.pages)?;
        self.device.read_exact_at(page.byte_offset(), data)
    }
}

/// A bank redirected to a partition on an external medium.
///
/// The medium's MBR must hold a partition of type 0xAE in the fourth
/// slot; bank `index` starts `index` whole banks past that partition's
/// first sector. Redirected pages carry no spare data.
#[derive(Clone)]
pub struct RedirectedSource<D> {
    device: D,
    base_sector: u64,
}

fn pages_to_sectors(pages: u32) -> u64 {
    u64::from(pages) * (PAGE_SIZE / SECTOR_SIZE) as u64
}

impl<D: ByteDevice> RedirectedSource<D> {
    /// Probe the medium's MBR and bind to redirected bank `index`.
    pub fn probe(device: D, index: u8) -> Result<Self> {
        let mut mbr = vec![0u8; SECTOR_SIZE];
        device.read_exact_at(0, &mut mbr)?;
        let part4 = &mbr[MBR_PART4_OFFSET..MBR_PART4_OFFSET + 16];
        if part4[0x4] != MBR_REDIRECT_TYPE {
            return Err(IsfsError::Format(format!(
                "partition 4 type {:#04x} is not a bank redirect",
                part4[0x4]
            )));
        }
        let lba = u64::from(
            read_le_u32(part4, 0x8).map_err(|err| IsfsError::Format(err.to_string()))?,
        );
        let base_sector = lba + u64::from(index) * pages_to_sectors(NAND_MAX_PAGE);
        Ok(Self {
            device,
            base_sector,
        })
    }
}

impl<D: ByteDevice> BlockSource for RedirectedSource<D> {
    fn page_count(&self) -> u32 {
        NAND_MAX_PAGE
    }

    fn has_spare(&self) -> bool {
        false
    }

    fn read_page(&self, page: PageNumber, data: &mut [u8], _spare: &mut [u8]) -> Result<()> {
        check_page_bufs(data, _spare, false)?;
        check_page_number(page, NAND_MAX_PAGE)?;
        let offset = (self.base_sector + pages_to_sectors(page.0)) * SECTOR_SIZE as u64;
        self.device.read_exact_at(offset, data)
    }
}

/// In-memory page source with per-page fault injection, for tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlockSource {
    pages: Vec<Vec<u8>>,
    spares: Vec<Vec<u8>>,
    with_spare: bool,
    fail_pages: BTreeSet<u32>,
}

impl MemoryBlockSource {
    /// Build from data-only pages (no spare).
    #[must_use]
    pub fn from_pages(pages: Vec<Vec<u8>>) -> Self {
        Self {
            pages,
            spares: Vec::new(),
            with_spare: false,
            fail_pages: BTreeSet::new(),
        }
    }

    /// Build from (data, spare) pairs.
    #[must_use]
    pub fn from_pages_with_spares(pages: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        let (pages, spares) = pages.into_iter().unzip();
        Self {
            pages,
            spares,
            with_spare: true,
            fail_pages: BTreeSet::new(),
        }
    }

    /// Make reads of `page` fail with an I/O error.
    pub fn fail_page(&mut self, page: u32) {
        self.fail_pages.insert(page);
    }
}

impl BlockSource for MemoryBlockSource {
    fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    fn has_spare(&self) -> bool {
        self.with_spare
    }

    fn read_page(&self, page: PageNumber, data: &mut [u8], spare: &mut [u8]) -> Result<()> {
        check_page_bufs(data, spare, self.with_spare)?;
        check_page_number(page, self.page_count())?;
        if self.fail_pages.contains(&page.0) {
            return Err(IsfsError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("injected fault on page {:#x}", page.0),
            )));
        }
        data.copy_from_slice(&self.pages[page.0 as usize]);
        if self.with_spare {
            spare.copy_from_slice(&self.spares[page.0 as usize]);
        }
        Ok(())
    }
}
