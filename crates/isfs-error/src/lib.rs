#![forbid(unsafe_code)]
//! Error types for the ISFS engine.
//!
//! Two-layer model: byte-level format violations are `ParseError`
//! (`isfs-types`); this crate defines the user-facing `IsfsError` returned
//! by mounts, path resolution, and the read path. `isfs-error` is
//! intentionally independent of `isfs-types` so the parsing layer never
//! needs to know about runtime errors; `isfs-core` converts at its
//! boundary.
//!
//! Every variant maps to exactly one POSIX errno via [`IsfsError::to_errno`]
//! for host adapters that expose the engine behind a file-I/O device table.
//! The match is exhaustive so a new variant is a compile error until its
//! errno is assigned.

use thiserror::Error;

/// Unified error type for all ISFS engine operations.
#[derive(Debug, Error)]
pub enum IsfsError {
    /// Underlying block-transport failure. Not retried by the engine;
    /// propagated immediately.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No recognized superblock candidate in the scan window.
    #[error("no valid superblock found on volume {volume}")]
    SuperblockNotFound { volume: String },

    /// Path prefix does not name a known volume, or names an unmounted one.
    #[error("no mounted volume for path {path:?}")]
    VolumeNotFound { path: String },

    /// Resolver reached the end of a sibling chain without a match.
    #[error("path not found: {path:?}")]
    PathNotFound { path: String },

    /// `open` on something that is not a file.
    #[error("not a file: {path:?}")]
    NotAFile { path: String },

    /// `diropen` on something that is not a directory.
    #[error("not a directory: {path:?}")]
    NotADirectory { path: String },

    /// Seek target outside `[0, size]`.
    #[error("seek out of range: position {pos} not in [0, {size}]")]
    SeekOutOfRange { pos: i64, size: u64 },

    /// An uncorrectable ECC error surfaced under the strict policy.
    #[error("uncorrectable ECC error on page {page:#x}")]
    EccUncorrectable { page: u64 },

    /// Malformed on-disk metadata: broken cluster chains, out-of-range
    /// indices, truncated structures.
    #[error("corrupt metadata at page {page:#x}: {detail}")]
    Corruption { page: u64, detail: String },

    /// Structurally invalid format detected before the volume is live.
    #[error("invalid on-disk format: {0}")]
    Format(String),
}

pub type Result<T> = std::result::Result<T, IsfsError>;

impl IsfsError {
    /// Map to a POSIX errno for device-table adapters.
    #[must_use]
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::Io(_) => 5,                      // EIO
            Self::SuperblockNotFound { .. } => 19, // ENODEV
            Self::VolumeNotFound { .. } => 19,     // ENODEV
            Self::PathNotFound { .. } => 2,        // ENOENT
            Self::NotAFile { .. } => 21,           // EISDIR
            Self::NotADirectory { .. } => 20,      // ENOTDIR
            Self::SeekOutOfRange { .. } => 22,     // EINVAL
            Self::EccUncorrectable { .. } => 5,    // EIO
            Self::Corruption { .. } => 5,          // EIO
            Self::Format(_) => 22,                 // EINVAL
        }
    }
}
