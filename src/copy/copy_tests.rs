use super::*;
use crate::progress::Reporter;
use std::cell::Cell;
use tempfile::TempDir;

fn write_file(root: &Path, relative: &str, contents: &[u8]) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

fn engine() -> (CopyEngine, OperationContext) {
    let ctx = OperationContext::new();
    let (reporter, _status, _logs) = Reporter::channel();
    let engine = CopyEngine::new(ctx.clone(), reporter)
        .with_progress_interval(Duration::from_secs(0));
    (engine, ctx)
}

#[test]
fn test_enumerate_tree_totals() {
    let dir = TempDir::new().unwrap();
    write_file(dir.path(), "a.bin", &[1u8; 100]);
    write_file(dir.path(), "sub/b.bin", &[2u8; 250]);
    write_file(dir.path(), "sub/deep/c.bin", &[3u8; 5]);

    let manifest = enumerate_tree(dir.path()).unwrap();
    assert_eq!(manifest.files.len(), 3);
    assert_eq!(manifest.total_bytes, 355);
    assert!(manifest.oversized().is_none());
}

#[test]
fn test_copy_tree_preserves_contents_and_totals() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    write_file(src.path(), "boot/loader.cfg", b"default linux\n");
    write_file(src.path(), "imgs/big.bin", &vec![0xA5u8; CHUNK_SIZE * 2 + 17]);
    write_file(src.path(), "empty.txt", b"");

    let (engine, _ctx) = engine();
    let copied = engine
        .copy_tree(src.path(), dst.path(), |_, _| {})
        .unwrap();

    let expected = 14 + (CHUNK_SIZE as u64 * 2 + 17);
    assert_eq!(copied, expected);
    assert_eq!(
        fs::read(dst.path().join("boot/loader.cfg")).unwrap(),
        b"default linux\n"
    );
    assert_eq!(
        fs::read(dst.path().join("imgs/big.bin")).unwrap().len(),
        CHUNK_SIZE * 2 + 17
    );
    assert!(dst.path().join("empty.txt").exists());
}

#[test]
fn test_progress_is_monotonic_and_bounded() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    for i in 0..4 {
        write_file(
            src.path(),
            &format!("f{}.bin", i),
            &vec![i as u8; CHUNK_SIZE + 1],
        );
    }

    let (engine, _ctx) = engine();
    let mut seen = Vec::new();
    engine
        .copy_tree(src.path(), dst.path(), |fraction, _| seen.push(fraction))
        .unwrap();

    assert!(!seen.is_empty());
    assert_eq!(*seen.last().unwrap(), 1.0);
    for pair in seen.windows(2) {
        assert!(pair[1] >= pair[0], "progress went backwards: {:?}", pair);
    }
    assert!(seen.iter().all(|p| (0.0..=1.0).contains(p)));
}

#[test]
fn test_cancel_mid_copy_stops_within_one_chunk() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    // One file, many chunks.
    write_file(src.path(), "big.bin", &vec![0x5Au8; CHUNK_SIZE * 16]);

    let (engine, ctx) = engine();
    let chunks_seen = Cell::new(0u32);
    let result = engine.copy_tree(src.path(), dst.path(), |_, _| {
        chunks_seen.set(chunks_seen.get() + 1);
        if chunks_seen.get() == 4 {
            ctx.cancel();
        }
    });

    assert!(matches!(result, Err(FlashError::Cancelled)));
    let partial = fs::metadata(dst.path().join("big.bin")).unwrap().len();
    // Four chunks were acknowledged before the cancel; at most one more may
    // have been written before the checkpoint fired.
    assert!(partial <= (CHUNK_SIZE * 5) as u64, "wrote {} bytes", partial);
    assert!(partial >= (CHUNK_SIZE * 4) as u64);
}

#[test]
fn test_unwritable_destination_aborts_with_copy_failed() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    write_file(src.path(), "sub/b.bin", &[1u8; 10]);
    // A plain file where the destination needs a directory.
    fs::write(dst.path().join("sub"), b"in the way").unwrap();

    let (engine, _ctx) = engine();
    let err = engine
        .copy_tree(src.path(), dst.path(), |_, _| {})
        .unwrap_err();

    match err {
        FlashError::CopyFailed { file, .. } => {
            assert_eq!(file, PathBuf::from("sub/b.bin"));
        }
        other => panic!("expected CopyFailed, got {:?}", other),
    }
}

#[test]
fn test_empty_tree_reports_complete() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();

    let (engine, _ctx) = engine();
    let mut final_fraction = 0.0;
    let copied = engine
        .copy_tree(src.path(), dst.path(), |f, _| final_fraction = f)
        .unwrap();

    assert_eq!(copied, 0);
    assert_eq!(final_fraction, 1.0);
}
