//! Volume table, superblock selection, and mount state.
//!
//! The registry owns the fixed set of volumes for the process lifetime.
//! Volumes are only ever mounted or unmounted, never created at runtime.
//! Mount state lives behind a per-volume `RwLock`: mounting writes, every
//! other operation reads, so a mount can never race a read of the same
//! volume. Mounted state is an immutable snapshot behind an `Arc`;
//! handles hold the snapshot, so an unmount invalidates future path
//! resolution without yanking buffers out from under an open file.

use crate::handle::{DirHandle, FileHandle};
use crate::resolve::resolve_path;
use crate::{EccPolicy, read_corrected_pages};
use isfs_block::BlockSource;
use isfs_crypto::{CryptoEngine, OtpKeySet, VolumeKeys};
use isfs_error::{IsfsError, Result};
use isfs_ondisk::{FstEntry, Superblock, SuperblockInfo};
use isfs_types::{
    FormatVersion, Generation, PAGE_SIZE, PageNumber, SUPER_REGION_BYTES, SUPER_REGION_PAGES,
    SUPER_SCAN_END, SUPER_SCAN_START, VolumeId,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The reference system's volume names, in table order. The `red*` pair
/// is redirected to an external medium.
pub const DEFAULT_VOLUME_NAMES: [&str; 4] = ["slc", "slccmpt", "redslc", "redslccmpt"];

/// Registry-wide knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryOptions {
    pub ecc_policy: EccPolicy,
}

/// Immutable state of a successfully mounted volume.
pub(crate) struct MountedVolume {
    pub(crate) name: String,
    pub(crate) source: Arc<dyn BlockSource>,
    pub(crate) superblock: Superblock,
    pub(crate) keys: VolumeKeys,
    pub(crate) slot: PageNumber,
}

struct Volume {
    name: String,
    source: Arc<dyn BlockSource>,
    state: RwLock<Option<Arc<MountedVolume>>>,
}

/// Snapshot of one volume's mount state, for inspection surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct VolumeStatus {
    pub name: String,
    pub mounted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<FormatVersion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<Generation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot_page: Option<u32>,
}

/// Owner of the fixed volume set; entry point for every engine operation.
pub struct VolumeRegistry {
    volumes: Vec<Volume>,
    keys: OtpKeySet,
    crypto: Arc<dyn CryptoEngine>,
    options: RegistryOptions,
}

impl VolumeRegistry {
    #[must_use]
    pub fn new(keys: OtpKeySet, crypto: Arc<dyn CryptoEngine>, options: RegistryOptions) -> Self {
        Self {
            volumes: Vec::new(),
            keys,
            crypto,
            options,
        }
    }

    /// Bind a volume name to a raw-bank source. Volumes are registered
    /// once at startup, before any mount.
    pub fn add_volume(&mut self, name: &str, source: Arc<dyn BlockSource>) -> VolumeId {
        self.volumes.push(Volume {
            name: name.to_owned(),
            source,
            state: RwLock::new(None),
        });
        VolumeId(self.volumes.len() - 1)
    }

    fn volume(&self, id: VolumeId) -> Result<&Volume> {
        self.volumes.get(id.0).ok_or_else(|| IsfsError::Format(format!(
            "volume id {} out of range",
            id.0
        )))
    }

    #[must_use]
    pub fn volume_count(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_mounted(&self, id: VolumeId) -> Result<bool> {
        Ok(self.volume(id)?.state.read().is_some())
    }

    pub fn status(&self, id: VolumeId) -> Result<VolumeStatus> {
        let volume = self.volume(id)?;
        let state = volume.state.read();
        Ok(match state.as_deref() {
            Some(mounted) => VolumeStatus {
                name: volume.name.clone(),
                mounted: true,
                version: Some(mounted.superblock.version()),
                generation: Some(mounted.superblock.generation()),
                slot_page: Some(mounted.slot.0),
            },
            None => VolumeStatus {
                name: volume.name.clone(),
                mounted: false,
                version: None,
                generation: None,
                slot_page: None,
            },
        })
    }

    /// Mount one volume: scan for the authoritative superblock, load the
    /// region, derive keys. Performs the full scan on every call, even if
    /// the volume is already mounted.
    pub fn mount(&self, id: VolumeId) -> Result<()> {
        let volume = self.volume(id)?;
        // Write lock for the whole scan: serializes against readers.
        let mut state = volume.state.write();

        let (slot, info) = self.scan_for_superblock(volume)?;
        debug!(
            volume = %volume.name,
            version = %info.version,
            page = format_args!("{:#x}", slot.0),
            generation = info.generation.0,
            "superblock candidate selected"
        );

        let mut region = vec![0u8; SUPER_REGION_BYTES];
        read_corrected_pages(
            volume.source.as_ref(),
            self.options.ecc_policy,
            slot,
            SUPER_REGION_PAGES as usize,
            &mut region,
        )?;
        let superblock = Superblock::new(region)
            .map_err(|err| IsfsError::Format(err.to_string()))?;
        let keys = self.keys.keys_for(superblock.version());

        info!(
            volume = %volume.name,
            version = %superblock.version(),
            generation = superblock.generation().0,
            "volume mounted"
        );
        *state = Some(Arc::new(MountedVolume {
            name: volume.name.clone(),
            source: Arc::clone(&volume.source),
            superblock,
            keys,
            slot,
        }));
        Ok(())
    }

    /// Mount every volume that is not already mounted. One volume's
    /// failure never blocks the others; per-volume results are returned
    /// for reporting.
    pub fn mount_all(&self) -> Vec<(VolumeId, Result<()>)> {
        let mut results = Vec::with_capacity(self.volumes.len());
        for index in 0..self.volumes.len() {
            let id = VolumeId(index);
            if self.is_mounted(id).unwrap_or(false) {
                results.push((id, Ok(())));
                continue;
            }
            let outcome = self.mount(id);
            if let Err(err) = &outcome {
                warn!(volume = %self.volumes[index].name, %err, "mount failed");
            }
            results.push((id, outcome));
        }
        results
    }

    /// Drop a volume's superblock buffer and key material.
    pub fn unmount(&self, id: VolumeId) -> Result<()> {
        let volume = self.volume(id)?;
        *volume.state.write() = None;
        Ok(())
    }

    pub fn unmount_all(&self) {
        for volume in &self.volumes {
            *volume.state.write() = None;
        }
    }

    /// Scan the fixed window for superblock candidates and pick the one
    /// with the highest generation. Equal generations keep the
    /// earliest-scanned candidate.
    fn scan_for_superblock(&self, volume: &Volume) -> Result<(PageNumber, SuperblockInfo)> {
        let mut page_buf = vec![0u8; PAGE_SIZE];
        let mut best: Option<(PageNumber, SuperblockInfo)> = None;

        let mut slot = SUPER_SCAN_START;
        while slot < SUPER_SCAN_END {
            let page = PageNumber(slot);
            read_corrected_pages(
                volume.source.as_ref(),
                self.options.ecc_policy,
                page,
                1,
                &mut page_buf,
            )?;

            if let Ok(info) = SuperblockInfo::probe(&page_buf) {
                let better = best
                    .as_ref()
                    .map_or(true, |(_, b)| info.generation.0 > b.generation.0);
                if better {
                    best = Some((page, info));
                }
            }

            slot += SUPER_REGION_PAGES;
        }

        best.ok_or_else(|| {
            warn!(volume = %volume.name, "no valid superblock in scan window");
            IsfsError::SuperblockNotFound {
                volume: volume.name.clone(),
            }
        })
    }

    /// Split `name:/rest` into a mounted volume and the remainder path
    /// (keeping its leading slash). Unknown names, missing `:/`, and
    /// unmounted volumes all fail the same way.
    pub fn path_to_volume<'p>(&self, path: &'p str) -> Result<(VolumeId, &'p str)> {
        let not_found = || IsfsError::VolumeNotFound {
            path: path.to_owned(),
        };
        let (name, rest) = path.split_once(':').ok_or_else(not_found)?;
        if !rest.starts_with('/') {
            return Err(not_found());
        }
        for (index, volume) in self.volumes.iter().enumerate() {
            if volume.name != name {
                continue;
            }
            if volume.state.read().is_none() {
                return Err(not_found());
            }
            return Ok((VolumeId(index), rest));
        }
        Err(not_found())
    }

    fn snapshot(&self, id: VolumeId) -> Result<Arc<MountedVolume>> {
        let volume = self.volume(id)?;
        let state = volume.state.read();
        state.as_ref().map(Arc::clone).ok_or_else(|| {
            IsfsError::VolumeNotFound {
                path: format!("{}:/", volume.name),
            }
        })
    }

    /// Resolve `path` and return its entry metadata.
    pub fn stat(&self, path: &str) -> Result<FstEntry> {
        let (id, rest) = self.path_to_volume(path)?;
        let mounted = self.snapshot(id)?;
        resolve_path(&mounted.superblock, rest)?
            .map(|(_, entry)| entry)
            .ok_or_else(|| IsfsError::PathNotFound {
                path: path.to_owned(),
            })
    }

    /// Open a file for reading. Rejects directories with `NotAFile`.
    pub fn open(&self, path: &str) -> Result<FileHandle> {
        let (id, rest) = self.path_to_volume(path)?;
        let mounted = self.snapshot(id)?;
        let (_, entry) =
            resolve_path(&mounted.superblock, rest)?.ok_or_else(|| IsfsError::PathNotFound {
                path: path.to_owned(),
            })?;
        if !entry.is_file() {
            return Err(IsfsError::NotAFile {
                path: path.to_owned(),
            });
        }
        Ok(FileHandle::new(
            mounted,
            Arc::clone(&self.crypto),
            self.options.ecc_policy,
            entry,
        ))
    }

    /// Open a directory listing. Rejects files with `NotADirectory`.
    /// An empty directory opens successfully and yields no entries.
    pub fn diropen(&self, path: &str) -> Result<DirHandle> {
        let (id, rest) = self.path_to_volume(path)?;
        let mounted = self.snapshot(id)?;
        let (_, entry) =
            resolve_path(&mounted.superblock, rest)?.ok_or_else(|| IsfsError::PathNotFound {
                path: path.to_owned(),
            })?;
        if !entry.is_dir() {
            return Err(IsfsError::NotADirectory {
                path: path.to_owned(),
            });
        }
        Ok(DirHandle::new(mounted, entry))
    }
}
