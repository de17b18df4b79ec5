//! End-to-end conformance over synthetic flash banks: superblock
//! selection, path resolution, decrypting reads, directory iteration,
//! and ECC policy behavior.

use isfs_core::{DEFAULT_VOLUME_NAMES, EccPolicy, RegistryOptions, VolumeRegistry, Whence};
use isfs_crypto::SoftAes128Cbc;
use isfs_error::IsfsError;
use isfs_harness::{ImageBuilder, SparseNandSource, test_keys};
use isfs_types::{
    CLUSTER_BYTES, FormatVersion, SUPER_REGION_PAGES, SUPER_SCAN_START, VolumeId,
};
use std::sync::Arc;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn registry_with(source: SparseNandSource, options: RegistryOptions) -> (VolumeRegistry, VolumeId) {
    let mut registry = VolumeRegistry::new(test_keys(), Arc::new(SoftAes128Cbc), options);
    let id = registry.add_volume("slc", Arc::new(source));
    (registry, id)
}

fn mount_single(source: SparseNandSource) -> (VolumeRegistry, VolumeId) {
    let (registry, id) = registry_with(source, RegistryOptions::default());
    registry.mount(id).expect("mount");
    (registry, id)
}

#[test]
fn test_highest_generation_wins_regardless_of_slot_order() {
    let older = ImageBuilder::new(test_keys())
        .generation(9)
        .file("boot.cfg", b"generation nine")
        .expect("file")
        .build()
        .expect("older");
    let newer = ImageBuilder::new(test_keys())
        .generation(13)
        .slot(SUPER_SCAN_START + 2 * SUPER_REGION_PAGES)
        .expect("slot")
        .first_cluster(0x100)
        .expect("cluster")
        .file("boot.cfg", b"generation thirteen")
        .expect("file")
        .build()
        .expect("newer");

    let (registry, id) = mount_single(older.merge(newer).expect("merge"));

    let status = registry.status(id).expect("status");
    assert!(status.mounted);
    assert_eq!(status.generation.map(|g| g.0), Some(13));
    assert_eq!(
        status.slot_page,
        Some(SUPER_SCAN_START + 2 * SUPER_REGION_PAGES)
    );

    let mut file = registry.open("slc:/boot.cfg").expect("open");
    assert_eq!(file.read_to_end().expect("read"), b"generation thirteen");
}

#[test]
fn test_equal_generations_keep_the_earliest_slot() {
    let first = ImageBuilder::new(test_keys())
        .generation(7)
        .file("which.txt", b"first slot")
        .expect("file")
        .build()
        .expect("first");
    let second = ImageBuilder::new(test_keys())
        .generation(7)
        .slot(SUPER_SCAN_START + SUPER_REGION_PAGES)
        .expect("slot")
        .first_cluster(0x100)
        .expect("cluster")
        .file("which.txt", b"second slot")
        .expect("file")
        .build()
        .expect("second");

    let (registry, id) = mount_single(first.merge(second).expect("merge"));
    assert_eq!(
        registry.status(id).expect("status").slot_page,
        Some(SUPER_SCAN_START)
    );
    let mut file = registry.open("slc:/which.txt").expect("open");
    assert_eq!(file.read_to_end().expect("read"), b"first slot");
}

#[test]
fn test_read_returns_exact_counts_and_advances() {
    let data = pattern(5000);
    let source = ImageBuilder::new(test_keys())
        .file("sys/config.dat", &data)
        .expect("file")
        .build()
        .expect("build");
    let (registry, _) = mount_single(source);

    let mut file = registry.open("slc:/sys/config.dat").expect("open");
    assert_eq!(file.size(), 5000);

    let mut buf = vec![0u8; 1024];
    assert_eq!(file.read(&mut buf).expect("read"), 1024);
    assert_eq!(buf, data[..1024]);
    assert_eq!(file.read(&mut buf).expect("read"), 1024);
    assert_eq!(buf, data[1024..2048]);

    // A request past end of file is clipped to what remains.
    let mut tail = vec![0u8; 8192];
    assert_eq!(file.read(&mut tail).expect("read"), 5000 - 2048);
    assert_eq!(&tail[..5000 - 2048], &data[2048..]);
    assert_eq!(file.read(&mut tail).expect("read"), 0);
}

#[test]
fn test_reads_are_idempotent_after_rewind() {
    let data = pattern(3000);
    let source = ImageBuilder::new(test_keys())
        .file("a.bin", &data)
        .expect("file")
        .build()
        .expect("build");
    let (registry, _) = mount_single(source);

    let mut file = registry.open("slc:/a.bin").expect("open");
    let once = file.read_to_end().expect("first pass");
    file.seek(0, Whence::Set).expect("rewind");
    let twice = file.read_to_end().expect("second pass");
    assert_eq!(once, data);
    assert_eq!(once, twice);
}

#[test]
fn test_multi_group_file_reads_across_chain() {
    // Three cluster groups: two full, one partial.
    let data = pattern(2 * CLUSTER_BYTES + 7000);
    let source = ImageBuilder::new(test_keys())
        .file("big.img", &data)
        .expect("file")
        .build()
        .expect("build");
    let (registry, _) = mount_single(source);

    let mut file = registry.open("slc:/big.img").expect("open");
    assert_eq!(file.read_to_end().expect("read"), data);

    // Seek exactly onto a group boundary, then read the remainder.
    let at = file.seek(CLUSTER_BYTES as i64, Whence::Set).expect("seek");
    assert_eq!(at, CLUSTER_BYTES as u64);
    assert_eq!(file.read_to_end().expect("tail"), data[CLUSTER_BYTES..]);

    // A read that straddles two groups in one call.
    file.seek(CLUSTER_BYTES as i64 - 100, Whence::Set).expect("seek");
    let mut straddle = vec![0u8; 200];
    assert_eq!(file.read(&mut straddle).expect("read"), 200);
    assert_eq!(straddle, data[CLUSTER_BYTES - 100..CLUSTER_BYTES + 100]);
}

#[test]
fn test_seek_bounds_and_end_of_file() {
    let data = pattern(CLUSTER_BYTES); // size on an exact group boundary
    let source = ImageBuilder::new(test_keys())
        .file("exact.bin", &data)
        .expect("file")
        .build()
        .expect("build");
    let (registry, _) = mount_single(source);
    let mut file = registry.open("slc:/exact.bin").expect("open");

    // Seeking to end of file is valid even when it lands on a boundary
    // past the final group; reading there yields nothing.
    assert_eq!(file.seek(0, Whence::End).expect("seek"), data.len() as u64);
    let mut buf = [0u8; 16];
    assert_eq!(file.read(&mut buf).expect("read"), 0);

    assert!(matches!(
        file.seek(1, Whence::End),
        Err(IsfsError::SeekOutOfRange { .. })
    ));
    assert!(matches!(
        file.seek(-1, Whence::Set),
        Err(IsfsError::SeekOutOfRange { .. })
    ));

    // A failed seek leaves the cursor alone.
    assert_eq!(file.offset(), data.len() as u64);
    file.seek(-10, Whence::Cur).expect("relative");
    assert_eq!(file.offset(), data.len() as u64 - 10);
}

#[test]
fn test_open_and_diropen_enforce_entry_kind() {
    let source = ImageBuilder::new(test_keys())
        .dir("sys")
        .expect("dir")
        .file("sys/config.dat", b"x")
        .expect("file")
        .build()
        .expect("build");
    let (registry, _) = mount_single(source);

    assert!(matches!(
        registry.open("slc:/sys"),
        Err(IsfsError::NotAFile { .. })
    ));
    assert!(matches!(
        registry.diropen("slc:/sys/config.dat"),
        Err(IsfsError::NotADirectory { .. })
    ));
    assert!(matches!(
        registry.stat("slc:/missing"),
        Err(IsfsError::PathNotFound { .. })
    ));
    assert!(matches!(
        registry.open("slc:/sys/config.dat/"),
        Err(IsfsError::PathNotFound { .. })
    ));
}

#[test]
fn test_directory_iteration_order_reset_and_exhaustion() {
    let source = ImageBuilder::new(test_keys())
        .file("sys/alpha", b"a")
        .expect("file")
        .file("sys/beta", b"b")
        .expect("file")
        .dir("sys/gamma")
        .expect("dir")
        .build()
        .expect("build");
    let (registry, _) = mount_single(source);

    let mut dir = registry.diropen("slc:/sys").expect("diropen");
    let mut names = Vec::new();
    while let Some(entry) = dir.read().expect("read") {
        names.push(entry.name_str());
    }
    assert_eq!(names, ["alpha", "beta", "gamma"]);
    assert!(dir.read().expect("read past end").is_none());

    dir.reset();
    assert_eq!(
        dir.read().expect("read").map(|e| e.name_str()).as_deref(),
        Some("alpha")
    );
}

#[test]
fn test_empty_directory_opens_and_yields_nothing() {
    let source = ImageBuilder::new(test_keys())
        .dir("tmp")
        .expect("dir")
        .build()
        .expect("build");
    let (registry, _) = mount_single(source);

    let mut dir = registry.diropen("slc:/tmp").expect("diropen");
    assert!(dir.read().expect("read").is_none());

    let root = registry.stat("slc:/").expect("stat root");
    assert!(root.is_dir());
    assert!(root.mode_string().starts_with('d'));
}

#[test]
fn test_empty_file_reads_zero_bytes() {
    let source = ImageBuilder::new(test_keys())
        .file("empty.bin", b"")
        .expect("file")
        .build()
        .expect("build");
    let (registry, _) = mount_single(source);

    let mut file = registry.open("slc:/empty.bin").expect("open");
    assert_eq!(file.size(), 0);
    assert!(file.read_to_end().expect("read").is_empty());
    assert!(file.entry().mode_string().starts_with('-'));
}

#[test]
fn test_unmount_invalidates_resolution_but_not_open_handles() {
    let data = pattern(1000);
    let source = ImageBuilder::new(test_keys())
        .file("keep.bin", &data)
        .expect("file")
        .build()
        .expect("build");
    let (registry, id) = mount_single(source);

    let mut file = registry.open("slc:/keep.bin").expect("open");
    registry.unmount(id).expect("unmount");

    assert!(matches!(
        registry.open("slc:/keep.bin"),
        Err(IsfsError::VolumeNotFound { .. })
    ));
    assert!(!registry.is_mounted(id).expect("is_mounted"));

    // The handle pinned the mount snapshot; its reads still work.
    assert_eq!(file.read_to_end().expect("read"), data);

    registry.mount(id).expect("remount");
    assert!(registry.is_mounted(id).expect("is_mounted"));
}

#[test]
fn test_path_syntax_and_unknown_volumes() {
    let source = ImageBuilder::new(test_keys()).build().expect("build");
    let (registry, _) = mount_single(source);

    for bad in ["slc", "slc:no-slash", "mlc:/file", ":/file"] {
        assert!(
            matches!(registry.stat(bad), Err(IsfsError::VolumeNotFound { .. })),
            "path {bad:?} must be rejected"
        );
    }
}

#[test]
fn test_version_zero_volumes_use_the_legacy_key_pair() {
    let data = pattern(600);
    let source = ImageBuilder::new(test_keys())
        .version(FormatVersion::V0)
        .file("legacy.bin", &data)
        .expect("file")
        .build()
        .expect("build");
    let (registry, id) = mount_single(source);

    assert_eq!(
        registry.status(id).expect("status").version,
        Some(FormatVersion::V0)
    );
    let mut file = registry.open("slc:/legacy.bin").expect("open");
    assert_eq!(file.read_to_end().expect("read"), data);
}

#[test]
fn test_single_bit_flips_are_repaired_on_the_read_path() {
    let data = pattern(2000);
    let mut source = ImageBuilder::new(test_keys())
        .file("flip.bin", &data)
        .expect("file")
        .build()
        .expect("build");
    // Cluster 1 starts at page 8; flip one ciphertext bit there.
    source.corrupt_data_bit(8, 300, 5).expect("corrupt");

    let (registry, id) = registry_with(
        source,
        RegistryOptions {
            ecc_policy: EccPolicy::Strict,
        },
    );
    registry.mount(id).expect("mount");
    let mut file = registry.open("slc:/flip.bin").expect("open");
    assert_eq!(file.read_to_end().expect("read"), data);
}

#[test]
fn test_double_bit_flips_fail_only_under_strict_policy() {
    let data = pattern(2000);
    let build = || {
        let mut source = ImageBuilder::new(test_keys())
            .file("dead.bin", &data)
            .expect("file")
            .build()
            .expect("build");
        // Two flips in the same 512-byte sub-page: beyond repair.
        source.corrupt_data_bit(8, 100, 1).expect("corrupt");
        source.corrupt_data_bit(8, 200, 6).expect("corrupt");
        source
    };

    let (strict, id) = registry_with(
        build(),
        RegistryOptions {
            ecc_policy: EccPolicy::Strict,
        },
    );
    strict.mount(id).expect("mount");
    let mut file = strict.open("slc:/dead.bin").expect("open");
    assert!(matches!(
        file.read_to_end(),
        Err(IsfsError::EccUncorrectable { page: 8 })
    ));

    // Best-effort reads through; the damaged group decrypts to garbage
    // but the operation completes with the full byte count.
    let (lenient, _) = mount_single(build());
    let mut file = lenient.open("slc:/dead.bin").expect("open");
    let got = file.read_to_end().expect("read");
    assert_eq!(got.len(), data.len());
    assert_ne!(got, data);
}

#[test]
fn test_device_faults_surface_as_io_errors() {
    let mut source = ImageBuilder::new(test_keys()).build().expect("build");
    source.fail_page(SUPER_SCAN_START);

    let (registry, id) = registry_with(source, RegistryOptions::default());
    assert!(matches!(registry.mount(id), Err(IsfsError::Io(_))));
}

#[test]
fn test_mount_all_reports_per_volume_outcomes() {
    let good = ImageBuilder::new(test_keys())
        .file("ok.bin", b"ok")
        .expect("file")
        .build()
        .expect("build");

    let mut registry = VolumeRegistry::new(
        test_keys(),
        Arc::new(SoftAes128Cbc),
        RegistryOptions::default(),
    );
    let good_id = registry.add_volume(DEFAULT_VOLUME_NAMES[0], Arc::new(good));
    // An erased bank holds no superblock.
    let bad_id = registry.add_volume(DEFAULT_VOLUME_NAMES[1], Arc::new(SparseNandSource::new()));

    let results = registry.mount_all();
    assert_eq!(results.len(), 2);
    assert!(results[0].1.is_ok());
    assert!(matches!(
        results[1].1,
        Err(IsfsError::SuperblockNotFound { .. })
    ));
    assert!(registry.is_mounted(good_id).expect("is_mounted"));
    assert!(!registry.is_mounted(bad_id).expect("is_mounted"));

    // Serializable status snapshot for the inspection surface.
    let rendered =
        serde_json::to_string(&registry.status(good_id).expect("status")).expect("json");
    assert!(rendered.contains("\"mounted\":true"));

    registry.unmount_all();
    assert!(!registry.is_mounted(good_id).expect("is_mounted"));
}
