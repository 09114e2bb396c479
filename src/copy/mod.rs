//! Buffered, cancellable, progress-throttled file-tree copy.
//!
//! The tree is enumerated once up front so total bytes are known before the
//! first write; files are then copied in fixed-size chunks with explicit
//! read/write calls, which keeps progress reportable mid-file and lets a
//! cancellation land within one chunk of the request.

use crate::progress::{Reporter, Throttle};
use crate::{FlashError, FlashResult, OperationContext, FAT_MAX_FILE_SIZE};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

pub const CHUNK_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Path relative to the tree root.
    pub relative: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TreeManifest {
    pub files: Vec<FileEntry>,
    pub total_bytes: u64,
}

impl TreeManifest {
    /// Any file at or above the FAT file-size ceiling.
    pub fn oversized(&self) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.size >= FAT_MAX_FILE_SIZE)
    }
}

/// Flatten a source tree into a file list with sizes and a byte total.
///
/// Only files are listed; directories are created lazily at the destination
/// while copying.
pub fn enumerate_tree(root: &Path) -> FlashResult<TreeManifest> {
    let mut manifest = TreeManifest::default();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| FlashError::CopyFailed {
            file: e.path().map(Path::to_path_buf).unwrap_or_default(),
            detail: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let size = entry
            .metadata()
            .map_err(|e| FlashError::CopyFailed {
                file: entry.path().to_path_buf(),
                detail: e.to_string(),
            })?
            .len();
        let relative = entry
            .path()
            .strip_prefix(root)
            .expect("walkdir yields paths under its root")
            .to_path_buf();
        manifest.total_bytes += size;
        manifest.files.push(FileEntry { relative, size });
    }
    Ok(manifest)
}

pub struct CopyEngine {
    ctx: OperationContext,
    reporter: Reporter,
    progress_interval: Duration,
}

impl CopyEngine {
    pub fn new(ctx: OperationContext, reporter: Reporter) -> Self {
        Self {
            ctx,
            reporter,
            progress_interval: Duration::from_millis(250),
        }
    }

    /// Override the progress throttle interval (tests use zero).
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Copy a whole tree, reporting throttled progress through
    /// `on_progress(fraction, current_file)`.
    ///
    /// Returns the number of bytes copied, which equals the manifest total
    /// on success. The first file failure aborts the copy; partially
    /// written destination files stay in place, since the destination was
    /// freshly formatted and there is nothing meaningful to roll back to.
    pub fn copy_tree(
        &self,
        source_root: &Path,
        dest_root: &Path,
        mut on_progress: impl FnMut(f64, &Path),
    ) -> FlashResult<u64> {
        let manifest = enumerate_tree(source_root)?;
        self.reporter.info(format!(
            "Copying {} files ({} bytes)",
            manifest.files.len(),
            manifest.total_bytes
        ));

        let mut throttle = Throttle::new(self.progress_interval);
        let mut copied: u64 = 0;
        let total = manifest.total_bytes.max(1);

        for entry in &manifest.files {
            self.ctx.check()?;

            if entry.size >= FAT_MAX_FILE_SIZE {
                self.reporter.warn(format!(
                    "{} is {} bytes, beyond the FAT file-size limit; copying anyway",
                    entry.relative.display(),
                    entry.size
                ));
            }

            let source = source_root.join(&entry.relative);
            let dest = dest_root.join(&entry.relative);
            self.copy_file(&source, &dest, &entry.relative, &mut |file_copied| {
                let fraction = (copied + file_copied) as f64 / total as f64;
                if throttle.ready() {
                    on_progress(fraction.min(1.0), &entry.relative);
                }
            })?;
            copied += entry.size;
        }

        on_progress(1.0, Path::new(""));
        Ok(copied)
    }

    /// Chunked single-file copy with a mid-file progress callback.
    fn copy_file(
        &self,
        source: &Path,
        dest: &Path,
        relative: &Path,
        on_chunk: &mut dyn FnMut(u64),
    ) -> FlashResult<()> {
        let fail = |detail: String| FlashError::CopyFailed {
            file: relative.to_path_buf(),
            detail,
        };

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| fail(e.to_string()))?;
        }

        let mut reader = File::open(source).map_err(|e| fail(e.to_string()))?;
        let mut writer = File::create(dest).map_err(|e| fail(e.to_string()))?;

        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut written: u64 = 0;
        loop {
            self.ctx.check()?;
            let read = reader.read(&mut buffer).map_err(|e| fail(e.to_string()))?;
            if read == 0 {
                break;
            }
            writer
                .write_all(&buffer[..read])
                .map_err(|e| fail(e.to_string()))?;
            written += read as u64;
            on_chunk(written);
        }
        writer.flush().map_err(|e| fail(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod copy_tests;
