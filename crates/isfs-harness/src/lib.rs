#![forbid(unsafe_code)]
//! Synthetic NAND-image fixtures for the ISFS engine test suites.
//!
//! [`ImageBuilder`] lays out a filesystem tree the way the on-disk format
//! does — superblock region at a scan-window slot, big-endian FAT and FST,
//! AES-128-CBC cluster groups under a zero IV, per-page spare bytes with
//! stored ECC codewords — and [`SparseNandSource`] serves the result as a
//! full-size bank without materializing half a gigabyte of blank pages.

use anyhow::{Context, Result, bail, ensure};
use isfs_block::BlockSource;
use isfs_crypto::{OtpKeySet, cbc_encrypt};
use isfs_error::IsfsError;
use isfs_types::{
    AES_BLOCK_SIZE, CHAIN_SENTINEL, CLUSTER_BYTES, CLUSTER_PAGES, ECC_BUFFER_SIZE, FAT_CAPACITY,
    FST_CAPACITY, FST_ENTRY_SIZE, FST_NAME_LEN, FormatVersion, NAND_MAX_PAGE, PAGE_SIZE,
    PAGE_SPARE_SIZE, PageNumber, SPARE_ECC_STORED_OFFSET, SUPER_FAT_OFFSET, SUPER_FST_OFFSET,
    SUPER_GENERATION_OFFSET, SUPER_MAGIC_V0, SUPER_MAGIC_V1, SUPER_REGION_BYTES,
    SUPER_REGION_PAGES, SUPER_SCAN_END, SUPER_SCAN_START,
};
use std::collections::{BTreeMap, BTreeSet};

/// Deterministic key set with four distinct keys, for fixtures only.
#[must_use]
pub fn test_keys() -> OtpKeySet {
    OtpKeySet {
        wii_nand_key: [0xA0; 16],
        wii_nand_hmac: [0xA1; 20],
        nand_key: [0xB0; 16],
        nand_hmac: [0xB1; 20],
    }
}

// ── Sparse bank ─────────────────────────────────────────────────────────────

/// A full-size flash bank stored sparsely. Absent pages read back as
/// erased (0xFF data, all-ones stored ECC, which the corrector skips as
/// unformatted). The computed ECC half is synthesized on every read, the
/// way the flash controller appends it in hardware — so corrupting stored
/// data after the fact produces a genuine ECC mismatch.
#[derive(Debug, Clone, Default)]
pub struct SparseNandSource {
    pages: BTreeMap<u32, (Vec<u8>, Vec<u8>)>,
    fail_pages: BTreeSet<u32>,
}

impl SparseNandSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install one page with its 64-byte out-of-band area.
    pub fn insert_page(&mut self, page: u32, data: Vec<u8>, oob: Vec<u8>) -> Result<()> {
        ensure!(data.len() == PAGE_SIZE, "page data must be {PAGE_SIZE} bytes");
        ensure!(oob.len() == PAGE_SPARE_SIZE, "OOB must be {PAGE_SPARE_SIZE} bytes");
        ensure!(page < NAND_MAX_PAGE, "page {page:#x} beyond bank end");
        self.pages.insert(page, (data, oob));
        Ok(())
    }

    /// Flip one stored data bit without touching the stored ECC: a
    /// single-bit read error the corrector can repair.
    pub fn corrupt_data_bit(&mut self, page: u32, byte: usize, bit: u8) -> Result<()> {
        let (data, _) = self
            .pages
            .get_mut(&page)
            .with_context(|| format!("page {page:#x} not present"))?;
        data[byte] ^= 1 << bit;
        Ok(())
    }

    /// Make reads of `page` fail with an I/O error.
    pub fn fail_page(&mut self, page: u32) {
        self.fail_pages.insert(page);
    }

    /// Combine two sparse banks. Page conflicts are a fixture bug.
    pub fn merge(mut self, other: Self) -> Result<Self> {
        for (page, contents) in other.pages {
            if self.pages.insert(page, contents).is_some() {
                bail!("page {page:#x} present in both banks");
            }
        }
        self.fail_pages.extend(other.fail_pages);
        Ok(self)
    }
}

impl BlockSource for SparseNandSource {
    fn page_count(&self) -> u32 {
        NAND_MAX_PAGE
    }

    fn has_spare(&self) -> bool {
        true
    }

    fn read_page(
        &self,
        page: PageNumber,
        data: &mut [u8],
        spare: &mut [u8],
    ) -> isfs_error::Result<()> {
        if data.len() != PAGE_SIZE || spare.len() != ECC_BUFFER_SIZE {
            return Err(IsfsError::Format("bad page/spare buffer size".to_owned()));
        }
        if page.0 >= NAND_MAX_PAGE {
            return Err(IsfsError::Format(format!(
                "page {:#x} beyond bank end",
                page.0
            )));
        }
        if self.fail_pages.contains(&page.0) {
            return Err(IsfsError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("injected fault on page {:#x}", page.0),
            )));
        }
        match self.pages.get(&page.0) {
            Some((stored, oob)) => {
                data.copy_from_slice(stored);
                spare[..PAGE_SPARE_SIZE].copy_from_slice(oob);
            }
            None => {
                data.fill(0xFF);
                spare[..PAGE_SPARE_SIZE].fill(0xFF);
            }
        }
        spare[PAGE_SPARE_SIZE..].fill(0);
        isfs_ecc::refresh_calc_half(data, spare)
            .map_err(|err| IsfsError::Format(err.to_string()))?;
        Ok(())
    }
}

fn oob_for(data: &[u8]) -> Result<Vec<u8>> {
    let mut oob = vec![0u8; PAGE_SPARE_SIZE];
    for sub in 0..4 {
        let codeword = isfs_ecc::compute_ecc(&data[sub * 512..(sub + 1) * 512])
            .map_err(|err| anyhow::anyhow!(err.to_string()))?;
        let at = SPARE_ECC_STORED_OFFSET + sub * 4;
        oob[at..at + 4].copy_from_slice(&codeword);
    }
    Ok(oob)
}

// ── Image builder ───────────────────────────────────────────────────────────

#[derive(Debug)]
enum NodeKind {
    Dir { children: Vec<usize> },
    File { data: Vec<u8> },
}

#[derive(Debug)]
struct Node {
    name: String,
    kind: NodeKind,
}

/// Builds one volume's worth of flash: a directory/file tree, its FAT
/// chains and encrypted cluster groups, and a superblock region at a
/// chosen scan-window slot.
pub struct ImageBuilder {
    keys: OtpKeySet,
    version: FormatVersion,
    generation: u32,
    slot_page: u32,
    next_cluster: u16,
    nodes: Vec<Node>,
}

impl ImageBuilder {
    #[must_use]
    pub fn new(keys: OtpKeySet) -> Self {
        Self {
            keys,
            version: FormatVersion::V1,
            generation: 1,
            slot_page: SUPER_SCAN_START,
            next_cluster: 1,
            nodes: vec![Node {
                name: String::new(),
                kind: NodeKind::Dir {
                    children: Vec::new(),
                },
            }],
        }
    }

    #[must_use]
    pub fn version(mut self, version: FormatVersion) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub fn generation(mut self, generation: u32) -> Self {
        self.generation = generation;
        self
    }

    /// Place the superblock at a specific scan-window slot.
    pub fn slot(mut self, page: u32) -> Result<Self> {
        ensure!(
            (SUPER_SCAN_START..SUPER_SCAN_END).contains(&page)
                && (page - SUPER_SCAN_START) % SUPER_REGION_PAGES == 0,
            "slot {page:#x} outside the scan window or misaligned"
        );
        self.slot_page = page;
        Ok(self)
    }

    /// First cluster index handed to file chains. Lets two merged images
    /// keep their data pages disjoint.
    pub fn first_cluster(mut self, cluster: u16) -> Result<Self> {
        ensure!(cluster > 0, "cluster 0 holds the boot pages");
        self.next_cluster = cluster;
        Ok(self)
    }

    fn ensure_dir(&mut self, path: &str) -> Result<usize> {
        let mut at = 0usize;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            ensure!(
                component.len() <= FST_NAME_LEN,
                "component {component:?} longer than {FST_NAME_LEN} bytes"
            );
            let existing = match &self.nodes[at].kind {
                NodeKind::Dir { children } => children
                    .iter()
                    .copied()
                    .find(|&child| self.nodes[child].name == component),
                NodeKind::File { .. } => bail!("{component:?} traverses a file"),
            };
            at = match existing {
                Some(child) => {
                    ensure!(
                        matches!(self.nodes[child].kind, NodeKind::Dir { .. }),
                        "path component {component:?} is a file"
                    );
                    child
                }
                None => {
                    let index = self.nodes.len();
                    self.nodes.push(Node {
                        name: component.to_owned(),
                        kind: NodeKind::Dir {
                            children: Vec::new(),
                        },
                    });
                    match &mut self.nodes[at].kind {
                        NodeKind::Dir { children } => children.push(index),
                        NodeKind::File { .. } => unreachable!(),
                    }
                    index
                }
            };
        }
        Ok(at)
    }

    /// Create a directory (and any missing parents).
    pub fn dir(mut self, path: &str) -> Result<Self> {
        self.ensure_dir(path)?;
        Ok(self)
    }

    /// Create a file with the given contents, creating parents as needed.
    pub fn file(mut self, path: &str, data: &[u8]) -> Result<Self> {
        let (parent, name) = match path.rfind('/') {
            Some(split) => (&path[..split], &path[split + 1..]),
            None => ("", path),
        };
        ensure!(!name.is_empty(), "file path {path:?} has no final component");
        ensure!(
            name.len() <= FST_NAME_LEN,
            "file name {name:?} longer than {FST_NAME_LEN} bytes"
        );
        let parent = self.ensure_dir(parent)?;
        let index = self.nodes.len();
        self.nodes.push(Node {
            name: name.to_owned(),
            kind: NodeKind::File {
                data: data.to_vec(),
            },
        });
        match &mut self.nodes[parent].kind {
            NodeKind::Dir { children } => children.push(index),
            NodeKind::File { .. } => unreachable!(),
        }
        Ok(self)
    }

    /// Serialize the tree into a sparse bank.
    pub fn build(self) -> Result<SparseNandSource> {
        ensure!(
            self.nodes.len() <= FST_CAPACITY,
            "{} entries exceed the FST capacity",
            self.nodes.len()
        );

        let aes = self.keys.keys_for(self.version).aes;
        let mut fat = vec![0u16; FAT_CAPACITY];
        let mut source = SparseNandSource::new();
        let mut next_cluster = self.next_cluster;

        // Keep data pages clear of the scan window.
        let cluster_limit = (SUPER_SCAN_START as usize / CLUSTER_PAGES) as u16;

        // FST slots in arena order: the builder inserts parents before
        // children, so the root is slot 0.
        let mut region = vec![0u8; SUPER_REGION_BYTES];
        let magic = match self.version {
            FormatVersion::V0 => SUPER_MAGIC_V0,
            FormatVersion::V1 => SUPER_MAGIC_V1,
        };
        region[..4].copy_from_slice(&magic);
        region[SUPER_GENERATION_OFFSET..SUPER_GENERATION_OFFSET + 4]
            .copy_from_slice(&self.generation.to_be_bytes());

        for (index, node) in self.nodes.iter().enumerate() {
            let (mode, sub, size) = match &node.kind {
                NodeKind::Dir { children } => {
                    let sub = children.first().map_or(CHAIN_SENTINEL, |&c| c as u16);
                    (0xC0 | 2u8, sub, 0u32)
                }
                NodeKind::File { data } => {
                    let sub = if data.is_empty() {
                        CHAIN_SENTINEL
                    } else {
                        let groups = data.len().div_ceil(CLUSTER_BYTES);
                        let first = next_cluster;
                        for group in 0..groups {
                            let cluster = next_cluster;
                            ensure!(
                                cluster < cluster_limit,
                                "cluster {cluster:#x} would collide with the scan window"
                            );
                            next_cluster += 1;
                            fat[usize::from(cluster)] = if group + 1 == groups {
                                CHAIN_SENTINEL
                            } else {
                                next_cluster
                            };

                            let start = group * CLUSTER_BYTES;
                            let end = (start + CLUSTER_BYTES).min(data.len());
                            let mut plain = vec![0u8; CLUSTER_BYTES];
                            plain[..end - start].copy_from_slice(&data[start..end]);
                            cbc_encrypt(&aes, &[0u8; AES_BLOCK_SIZE], &mut plain)
                                .map_err(|err| anyhow::anyhow!(err.to_string()))?;

                            let base = u32::from(cluster) * CLUSTER_PAGES as u32;
                            for (page, chunk) in plain.chunks(PAGE_SIZE).enumerate() {
                                let oob = oob_for(chunk)?;
                                source.insert_page(base + page as u32, chunk.to_vec(), oob)?;
                            }
                        }
                        first
                    };
                    (0xC0 | 1u8, sub, u32::try_from(data.len())?)
                }
            };

            // Sibling: the next entry in this node's parent's child list.
            let sib = self.sibling_of(index);

            let at = SUPER_FST_OFFSET + index * FST_ENTRY_SIZE;
            let entry = &mut region[at..at + FST_ENTRY_SIZE];
            entry[..node.name.len().min(FST_NAME_LEN)]
                .copy_from_slice(&node.name.as_bytes()[..node.name.len().min(FST_NAME_LEN)]);
            entry[0x0C] = mode;
            entry[0x0E..0x10].copy_from_slice(&sub.to_be_bytes());
            entry[0x10..0x12].copy_from_slice(&sib.to_be_bytes());
            entry[0x12..0x16].copy_from_slice(&size.to_be_bytes());
        }

        for (slotindex, next) in fat.iter().enumerate() {
            let at = SUPER_FAT_OFFSET + slotindex * 2;
            region[at..at + 2].copy_from_slice(&next.to_be_bytes());
        }

        for (page, chunk) in region.chunks(PAGE_SIZE).enumerate() {
            let oob = oob_for(chunk)?;
            source.insert_page(self.slot_page + page as u32, chunk.to_vec(), oob)?;
        }

        Ok(source)
    }

    fn sibling_of(&self, index: usize) -> u16 {
        for node in &self.nodes {
            if let NodeKind::Dir { children } = &node.kind {
                if let Some(at) = children.iter().position(|&c| c == index) {
                    return children
                        .get(at + 1)
                        .map_or(CHAIN_SENTINEL, |&next| next as u16);
                }
            }
        }
        CHAIN_SENTINEL
    }
}
