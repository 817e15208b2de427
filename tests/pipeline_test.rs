use std::fs;
use std::path::{Path, PathBuf};

use fsapack::format::MAGIC_BLOCK;
use fsapack::options::ArchiveOptions;
use fsapack::{run_pack, run_unpack, CompressAlgo, PipelineError};
use tempfile::tempdir;

/// Deterministic incompressible bytes (splitmix64 stream).
fn noise(len: usize, mut seed: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        seed = seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = seed;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^= z >> 31;
        out.extend_from_slice(&z.to_le_bytes());
    }
    out.truncate(len);
    out
}

/// Small options tuned for tests: tiny blocks so every file spans several,
/// a small queue so backpressure actually engages.
fn test_options(algo: CompressAlgo) -> ArchiveOptions {
    ArchiveOptions {
        compress_algo: algo,
        block_size: 4096,
        jobs: 4,
        queue_blocks: 8,
        ..ArchiveOptions::default()
    }
}

/// Lay out a small tree with compressible, incompressible, empty and nested
/// files.  Names sort so traversal order is known.
fn build_tree(root: &Path) {
    fs::create_dir_all(root.join("sub")).unwrap();
    fs::write(root.join("aaa.txt"), b"hello archive\n".repeat(2000)).unwrap();
    fs::write(root.join("empty.dat"), b"").unwrap();
    fs::write(root.join("sub/nested.txt"), b"nested contents").unwrap();
    fs::write(root.join("zzz.bin"), noise(40_000, 11)).unwrap();
}

fn assert_file_eq(a: &Path, b: &Path) {
    assert_eq!(
        fs::read(a).unwrap(),
        fs::read(b).unwrap(),
        "mismatch between {} and {}",
        a.display(),
        b.display()
    );
}

fn assert_tree_restored(src: &Path, restored: &Path) {
    for rel in ["aaa.txt", "empty.dat", "sub/nested.txt", "zzz.bin"] {
        assert_file_eq(&src.join(rel), &restored.join(rel));
    }
}

#[test]
fn empty_archive_round_trip() {
    let work = tempdir().unwrap();
    let archive = work.path().join("empty.fsa");

    let stats = run_pack(test_options(CompressAlgo::Gzip), vec![], &archive).unwrap();
    assert_eq!(stats.regfiles, 0);
    assert_eq!(stats.err_regfiles, 0);

    // Framing overhead only: volume records, main header, footer.
    let size = fs::metadata(&archive).unwrap().len();
    assert!(size < 1024, "empty archive is {size} bytes");

    let dest = work.path().join("restore");
    let stats = run_unpack(ArchiveOptions::default(), &archive, &dest).unwrap();
    assert_eq!(stats.regfiles, 0);
    assert_eq!(fs::read_dir(&dest).unwrap().count(), 0);
}

#[test]
fn round_trip_every_available_codec() {
    for algo in [
        CompressAlgo::None,
        CompressAlgo::Lz4,
        CompressAlgo::Gzip,
        CompressAlgo::Zstd,
        CompressAlgo::Bzip2,
        CompressAlgo::Lzma,
    ] {
        let work = tempdir().unwrap();
        let src = work.path().join("tree");
        build_tree(&src);
        let archive = work.path().join("arch.fsa");

        let stats = run_pack(test_options(algo), vec![src.clone()], &archive).unwrap();
        assert_eq!(stats.regfiles, 4, "{}", algo.name());
        assert_eq!(stats.directories, 2, "{}", algo.name());
        assert_eq!(stats.err_regfiles, 0, "{}", algo.name());

        let dest = work.path().join("restore");
        let stats = run_unpack(ArchiveOptions::default(), &archive, &dest).unwrap();
        assert_eq!(stats.regfiles, 4, "{}", algo.name());
        assert_eq!(stats.err_regfiles, 0, "{}", algo.name());
        assert_eq!(stats.corrupt_blocks, 0, "{}", algo.name());
        assert_tree_restored(&src, &dest.join("tree"));
    }
}

#[test]
fn compressible_data_actually_shrinks_the_archive() {
    let work = tempdir().unwrap();
    let src = work.path().join("tree");
    fs::create_dir_all(&src).unwrap();
    let payload = b"all work and no play makes a dull archive\n".repeat(8000);
    fs::write(src.join("big.txt"), &payload).unwrap();
    let archive = work.path().join("arch.fsa");

    run_pack(test_options(CompressAlgo::Zstd), vec![src], &archive).unwrap();
    let archived = fs::metadata(&archive).unwrap().len();
    assert!(
        archived < payload.len() as u64 / 4,
        "archive is {archived} bytes for {} bytes of input",
        payload.len()
    );
}

#[test]
fn encrypted_round_trip_and_password_handling() {
    let work = tempdir().unwrap();
    let src = work.path().join("tree");
    build_tree(&src);
    let archive = work.path().join("arch.fsa");

    let opts = test_options(CompressAlgo::Zstd).with_password("correct-horse");
    run_pack(opts, vec![src.clone()], &archive).unwrap();

    // Right password: everything verifies.
    let dest = work.path().join("restore");
    let opts = ArchiveOptions::default().with_password("correct-horse");
    let stats = run_unpack(opts, &archive, &dest).unwrap();
    assert_eq!(stats.err_regfiles, 0);
    assert_tree_restored(&src, &dest.join("tree"));

    // No password at all: the archive announces encryption, restore refuses.
    let dest2 = work.path().join("restore2");
    let err = run_unpack(ArchiveOptions::default(), &archive, &dest2).unwrap_err();
    match err {
        PipelineError::Crypto(_) | PipelineError::Aborted => {}
        other => panic!("expected a missing-key failure, got {other}"),
    }

    // Wrong password: blocks decrypt to garbage, files fail verification
    // but the restore itself survives.
    let dest3 = work.path().join("restore3");
    let opts = ArchiveOptions::default().with_password("wrong-horse!");
    let stats = run_unpack(opts, &archive, &dest3).unwrap();
    assert!(stats.err_regfiles > 0, "wrong password must fail verification");
}

#[test]
fn corrupted_block_is_zero_filled_and_counted() {
    let work = tempdir().unwrap();
    let src = work.path().join("tree");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("aaa.txt"), b"intact file contents\n".repeat(300)).unwrap();
    fs::write(src.join("zzz.bin"), noise(20_000, 5)).unwrap();
    let archive = work.path().join("arch.fsa");

    run_pack(test_options(CompressAlgo::Gzip), vec![src.clone()], &archive).unwrap();

    // Flip one payload byte of the last data block (it belongs to zzz.bin,
    // the last file in traversal order).
    let mut bytes = fs::read(&archive).unwrap();
    let block_starts: Vec<usize> = bytes
        .windows(MAGIC_BLOCK.len())
        .enumerate()
        .filter(|(_, w)| *w == &MAGIC_BLOCK[..])
        .map(|(i, _)| i)
        .collect();
    assert!(block_starts.len() >= 4, "expected several blocks in the archive");
    let last = *block_starts.last().unwrap();
    let arsize = u64::from_le_bytes(bytes[last + 24..last + 32].try_into().unwrap());
    assert!(arsize > 17);
    bytes[last + 48 + 17] ^= 0x01;
    fs::write(&archive, &bytes).unwrap();

    let dest = work.path().join("restore");
    let stats = run_unpack(ArchiveOptions::default(), &archive, &dest).unwrap();
    assert_eq!(stats.corrupt_blocks, 1);
    assert_eq!(stats.err_regfiles, 1, "exactly the damaged file fails");
    assert_eq!(stats.regfiles, 1, "the other file restores clean");

    // The intact file matches byte for byte; the damaged one keeps its
    // length but not its contents.
    assert_file_eq(&src.join("aaa.txt"), &dest.join("tree/aaa.txt"));
    let damaged = fs::read(dest.join("tree/zzz.bin")).unwrap();
    assert_eq!(damaged.len(), 20_000);
    assert_ne!(damaged, fs::read(src.join("zzz.bin")).unwrap());
}

#[test]
fn multi_volume_archive_stitches_back_together() {
    let work = tempdir().unwrap();
    let src = work.path().join("tree");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("blob.bin"), noise(300_000, 3)).unwrap();
    let archive = work.path().join("arch.fsa");

    let opts = ArchiveOptions {
        compress_algo: CompressAlgo::None,
        block_size: 16 * 1024,
        volume_size: 64 * 1024,
        ..ArchiveOptions::default()
    };
    run_pack(opts, vec![src.clone()], &archive).unwrap();

    assert!(work.path().join("arch.f01").exists(), "expected a second volume");
    assert!(
        fs::metadata(&archive).unwrap().len() < 100 * 1024,
        "volume 0 must respect the split threshold"
    );

    let dest = work.path().join("restore");
    let stats = run_unpack(ArchiveOptions::default(), &archive, &dest).unwrap();
    assert_eq!(stats.err_regfiles, 0);
    assert_file_eq(&src.join("blob.bin"), &dest.join("tree/blob.bin"));
}

#[test]
fn many_small_blocks_with_narrow_queue_keep_order() {
    // A thousand 4-KiB blocks through 4 workers and a queue of 8: the
    // restored stream only reconstructs if the consumer saw every item in
    // enqueue order.
    let work = tempdir().unwrap();
    let src = work.path().join("tree");
    fs::create_dir_all(&src).unwrap();
    let payload = noise(1000 * 4096, 17);
    fs::write(src.join("large.bin"), &payload).unwrap();
    let archive = work.path().join("arch.fsa");

    run_pack(test_options(CompressAlgo::Lz4), vec![src.clone()], &archive).unwrap();

    let dest = work.path().join("restore");
    let mut opts = ArchiveOptions::default();
    opts.jobs = 4;
    opts.queue_blocks = 8;
    let stats = run_unpack(opts, &archive, &dest).unwrap();
    assert_eq!(stats.err_regfiles, 0);
    assert_file_eq(&src.join("large.bin"), &dest.join("tree/large.bin"));
}

#[cfg(unix)]
#[test]
fn links_survive_the_round_trip() {
    use std::os::unix::fs::MetadataExt;

    let work = tempdir().unwrap();
    let src = work.path().join("tree");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("aaa.txt"), b"link target contents").unwrap();
    fs::hard_link(src.join("aaa.txt"), src.join("bbb.txt")).unwrap();
    std::os::unix::fs::symlink("aaa.txt", src.join("ccc.lnk")).unwrap();
    let archive = work.path().join("arch.fsa");

    let stats = run_pack(test_options(CompressAlgo::Gzip), vec![src.clone()], &archive).unwrap();
    assert_eq!(stats.regfiles, 1);
    assert_eq!(stats.hardlinks, 1);
    assert_eq!(stats.symlinks, 1);

    let dest = work.path().join("restore");
    let stats = run_unpack(ArchiveOptions::default(), &archive, &dest).unwrap();
    assert_eq!(stats.hardlinks, 1);
    assert_eq!(stats.symlinks, 1);

    let restored = dest.join("tree");
    assert_file_eq(&src.join("aaa.txt"), &restored.join("bbb.txt"));
    assert_eq!(
        fs::metadata(restored.join("aaa.txt")).unwrap().ino(),
        fs::metadata(restored.join("bbb.txt")).unwrap().ino(),
        "hardlink must share the inode"
    );
    assert_eq!(
        fs::read_link(restored.join("ccc.lnk")).unwrap(),
        PathBuf::from("aaa.txt")
    );
}

#[cfg(unix)]
#[test]
fn fifos_are_recreated() {
    let work = tempdir().unwrap();
    let src = work.path().join("tree");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("file.txt"), b"plain").unwrap();

    let fifo = src.join("pipe");
    let cpath = std::ffi::CString::new(fifo.to_str().unwrap()).unwrap();
    assert_eq!(unsafe { libc::mkfifo(cpath.as_ptr(), 0o644) }, 0);

    let archive = work.path().join("arch.fsa");
    let stats = run_pack(test_options(CompressAlgo::Gzip), vec![src], &archive).unwrap();
    assert_eq!(stats.specials, 1);

    let dest = work.path().join("restore");
    let stats = run_unpack(ArchiveOptions::default(), &archive, &dest).unwrap();
    assert_eq!(stats.specials, 1);
    assert_eq!(stats.err_specials, 0);

    use std::os::unix::fs::FileTypeExt;
    let meta = fs::symlink_metadata(dest.join("tree/pipe")).unwrap();
    assert!(meta.file_type().is_fifo());
}
