use super::*;
use crate::progress::Reporter;
use std::cell::Cell;
use tempfile::TempDir;

fn writer() -> (RawWriter, OperationContext) {
    let ctx = OperationContext::new();
    let (reporter, _status, _logs) = Reporter::channel();
    let writer =
        RawWriter::new(ctx.clone(), reporter).with_progress_interval(Duration::from_secs(0));
    (writer, ctx)
}

#[test]
fn test_write_image_byte_for_byte() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("source.img");
    let device = dir.path().join("device");
    let payload: Vec<u8> = (0..RAW_CHUNK_SIZE * 2 + 123).map(|i| (i % 251) as u8).collect();
    std::fs::write(&image, &payload).unwrap();
    std::fs::write(&device, b"").unwrap();

    let (writer, _ctx) = writer();
    let missing_raw = dir.path().join("no-such-rdisk");
    let target = writer
        .write_image(&image, &missing_raw, &device, |_| {})
        .unwrap();

    // The raw node did not exist, so the buffered fallback carried the write.
    assert_eq!(target, RawTarget::Buffered);
    assert_eq!(std::fs::read(&device).unwrap(), payload);
}

#[test]
fn test_write_image_prefers_raw_node() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("source.img");
    let raw = dir.path().join("rdevice");
    let buffered = dir.path().join("device");
    std::fs::write(&image, vec![7u8; 4096]).unwrap();
    std::fs::write(&raw, b"").unwrap();
    std::fs::write(&buffered, b"").unwrap();

    let (writer, _ctx) = writer();
    let target = writer.write_image(&image, &raw, &buffered, |_| {}).unwrap();

    assert_eq!(target, RawTarget::Raw);
    assert_eq!(std::fs::read(&raw).unwrap().len(), 4096);
    assert_eq!(std::fs::read(&buffered).unwrap().len(), 0);
}

#[test]
fn test_progress_reaches_completion_monotonically() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("source.img");
    let device = dir.path().join("device");
    std::fs::write(&image, vec![1u8; RAW_CHUNK_SIZE * 3]).unwrap();
    std::fs::write(&device, b"").unwrap();

    let (writer, _ctx) = writer();
    let mut seen = Vec::new();
    writer
        .write_image(&image, &device, &device, |p| seen.push(p))
        .unwrap();

    assert_eq!(*seen.last().unwrap(), 1.0);
    for pair in seen.windows(2) {
        assert!(pair[1] >= pair[0]);
    }
    assert!(seen.iter().all(|p| (0.0..=1.0).contains(p)));
}

#[test]
fn test_cancel_mid_write_stops_within_one_chunk() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("source.img");
    let device = dir.path().join("device");
    std::fs::write(&image, vec![9u8; RAW_CHUNK_SIZE * 10]).unwrap();
    std::fs::write(&device, b"").unwrap();

    let (writer, ctx) = writer();
    let chunks = Cell::new(0u32);
    let result = writer.write_image(&image, &device, &device, |_| {
        chunks.set(chunks.get() + 1);
        if chunks.get() == 2 {
            ctx.cancel();
        }
    });

    assert!(matches!(result, Err(FlashError::Cancelled)));
    let partial = std::fs::metadata(&device).unwrap().len();
    assert!(partial <= (RAW_CHUNK_SIZE * 3) as u64);
    assert!(partial >= (RAW_CHUNK_SIZE * 2) as u64);
}

#[test]
fn test_missing_image_is_io_error() {
    let dir = TempDir::new().unwrap();
    let device = dir.path().join("device");
    std::fs::write(&device, b"").unwrap();

    let (writer, _ctx) = writer();
    let result = writer.write_image(
        &dir.path().join("missing.img"),
        &device,
        &device,
        |_| {},
    );
    assert!(matches!(result, Err(FlashError::IoError(_))));
}
