//! Raw image writing (DD mode).
//!
//! Streams a complete pre-built disk image byte-for-byte onto the device
//! node. The raw (unbuffered) node is preferred for throughput; when it
//! cannot be opened the buffered node is tried, and when direct access is
//! denied entirely the orchestrator falls back to a privileged `dd`
//! subprocess.

use crate::process::ProcessRunner;
use crate::progress::{Reporter, Throttle};
use crate::{FlashError, FlashResult, OperationContext};
use log::debug;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::time::Duration;

pub const RAW_CHUNK_SIZE: usize = 1024 * 1024;

/// Which node the write ended up using.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawTarget {
    Raw,
    Buffered,
}

pub struct RawWriter {
    ctx: OperationContext,
    reporter: Reporter,
    progress_interval: Duration,
}

impl RawWriter {
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

    /// Stream `image` onto the device, raw node first.
    ///
    /// Returns which node was written. `PermissionDenied` means neither
    /// node was openable by this user; the caller may escalate.
    pub fn write_image(
        &self,
        image: &Path,
        raw_node: &Path,
        buffered_node: &Path,
        mut on_progress: impl FnMut(f64),
    ) -> FlashResult<RawTarget> {
        let (device, target) = self.open_target(raw_node, buffered_node)?;
        let total = std::fs::metadata(image)?.len().max(1);
        let mut reader = File::open(image)?;
        let mut writer = device;

        let mut throttle = Throttle::new(self.progress_interval);
        let mut written: u64 = 0;
        let mut buffer = vec![0u8; RAW_CHUNK_SIZE];

        loop {
            self.ctx.check()?;
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            writer
                .write_all(&buffer[..read])
                .map_err(|e| FlashError::RawWriteFailed(e.to_string()))?;
            written += read as u64;
            if throttle.ready() {
                on_progress((written as f64 / total as f64).min(1.0));
            }
        }

        writer
            .sync_all()
            .map_err(|e| FlashError::RawWriteFailed(e.to_string()))?;
        on_progress(1.0);
        Ok(target)
    }

    fn open_target(
        &self,
        raw_node: &Path,
        buffered_node: &Path,
    ) -> FlashResult<(File, RawTarget)> {
        match OpenOptions::new().write(true).open(raw_node) {
            Ok(file) => return Ok((file, RawTarget::Raw)),
            Err(e) => {
                debug!("raw node {} not writable: {}", raw_node.display(), e);
                self.reporter
                    .info("raw device unavailable, using buffered node");
            }
        }
        match OpenOptions::new().write(true).open(buffered_node) {
            Ok(file) => Ok((file, RawTarget::Buffered)),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => Err(FlashError::PermissionDenied(
                format!("{} is not writable by this user", buffered_node.display()),
            )),
            Err(e) => Err(FlashError::RawWriteFailed(format!(
                "{}: {}",
                buffered_node.display(),
                e
            ))),
        }
    }
}

/// Last-resort raw write through a privileged `dd` subprocess.
///
/// Progress cannot be observed mid-write on this path; the consent prompt
/// and the transfer both happen inside one elevated invocation.
pub async fn privileged_dd(
    runner: &ProcessRunner,
    image: &Path,
    node: &Path,
) -> FlashResult<()> {
    let result = runner
        .run_privileged(
            "dd",
            &[
                &format!("if={}", image.display()),
                &format!("of={}", node.display()),
                "bs=1m",
            ],
            None,
        )
        .await?;
    if !result.success() {
        return Err(FlashError::RawWriteFailed(result.stderr_brief()));
    }
    Ok(())
}

#[cfg(test)]
#[path = "dd_tests.rs"]
mod dd_tests;
