// Allow uppercase acronyms for industry-standard terms like MBR, GPT, FAT
#![allow(clippy::upper_case_acronyms)]

pub mod boot;
pub mod copy;
pub mod dd;
pub mod device;
pub mod orchestrator;
pub mod persistence;
pub mod process;
pub mod progress;
pub mod retry;

// Re-export the pipeline entry points for convenience
pub use orchestrator::{FormatOrchestrator, Imager, ImagingHandle};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors surfaced by the imaging pipeline.
///
/// Structural failures (unmount, format, partition, raw write) abort the
/// pipeline; the subprocess stderr that triggered them travels in the
/// variant's detail string. Boot-installation problems are reported as log
/// warnings, never through this enum.
#[derive(Error, Debug)]
pub enum FlashError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to unmount device: {0}")]
    UnmountFailed(String),

    #[error("Format failed: {0}")]
    FormatFailed(String),

    #[error("Timed out waiting for the new partition to mount: {0}")]
    MountTimeout(String),

    #[error("Failed to mount source image: {0}")]
    IsoMountFailed(String),

    #[error("Failed to copy {}: {detail}", file.display())]
    CopyFailed { file: PathBuf, detail: String },

    #[error("File too large for a FAT filesystem: {}", .0.display())]
    OversizedFileForFat(PathBuf),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Insufficient free space for persistence: requested {requested} bytes, {available} available")]
    InsufficientSpace { requested: u64, available: u64 },

    #[error("Partition operation failed: {0}")]
    PartitionFailed(String),

    #[error("Failed to format persistence partition: {0}")]
    PersistenceFormatFailed(String),

    #[error("Raw write failed: {0}")]
    RawWriteFailed(String),

    #[error("Operation cancelled by user")]
    Cancelled,
}

pub type FlashResult<T> = Result<T, FlashError>;

/// A candidate target device, as reported by one enumeration pass.
///
/// The identifier is always the whole-disk form (`disk3`, never `disk3s1`);
/// every privileged operation on the disk is keyed off it. Snapshots are
/// immutable and become stale after any partitioning operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub identifier: String,
    pub name: String,
    pub removable: bool,
    pub size: u64,
    pub mount_point: Option<PathBuf>,
}

impl Device {
    /// Buffered block-device node for this disk.
    pub fn node(&self) -> PathBuf {
        PathBuf::from(format!("/dev/{}", self.identifier))
    }

    /// Raw (unbuffered) block-device node for this disk.
    pub fn raw_node(&self) -> PathBuf {
        PathBuf::from(format!("/dev/r{}", self.identifier))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImagingMode {
    /// Partition, format, copy files, install boot configuration.
    Standard,
    /// Write the source image byte-for-byte to the raw device.
    Dd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Filesystem {
    Fat32,
    ExFat,
    Hfs,
}

impl Filesystem {
    /// The filesystem name `diskutil eraseDisk` expects.
    pub fn diskutil_name(&self) -> &'static str {
        match self {
            Filesystem::Fat32 => "MS-DOS FAT32",
            Filesystem::ExFat => "ExFAT",
            Filesystem::Hfs => "JHFS+",
        }
    }

    /// FAT-family filesystems share the 2^32 - 1 byte file size ceiling.
    pub fn is_fat_family(&self) -> bool {
        matches!(self, Filesystem::Fat32)
    }

    /// Maximum volume label length accepted by the native format tools.
    pub fn max_label_len(&self) -> usize {
        match self {
            Filesystem::Fat32 | Filesystem::ExFat => 11,
            Filesystem::Hfs => 32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionScheme {
    MBR,
    GPT,
}

impl PartitionScheme {
    pub fn diskutil_name(&self) -> &'static str {
        match self {
            PartitionScheme::MBR => "MBR",
            PartitionScheme::GPT => "GPT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetFirmware {
    Bios,
    Uefi,
    Both,
}

/// Everything one imaging run needs to know, fixed at start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagingOptions {
    /// Whole-disk identifier of the target, e.g. `disk3`.
    pub device: String,
    pub image: PathBuf,
    pub mode: ImagingMode,
    pub filesystem: Filesystem,
    pub scheme: PartitionScheme,
    pub firmware: TargetFirmware,
    pub label: String,
    /// Requested persistence partition size in bytes; 0 disables it.
    pub persistence_bytes: u64,
    /// When false, the disk is zeroed before the erase call.
    pub quick_format: bool,
    pub bad_block_check: bool,
    pub bad_block_passes: u8,
    /// Also mark the partition active for Linux sources (old BIOSes).
    pub legacy_bios_fixups: bool,
}

impl Default for ImagingOptions {
    fn default() -> Self {
        Self {
            device: String::new(),
            image: PathBuf::new(),
            mode: ImagingMode::Standard,
            filesystem: Filesystem::Fat32,
            scheme: PartitionScheme::MBR,
            firmware: TargetFirmware::Both,
            label: "USBFORGE".to_string(),
            persistence_bytes: 0,
            quick_format: true,
            bad_block_check: false,
            bad_block_passes: 1,
            legacy_bios_fixups: false,
        }
    }
}

/// Largest file a FAT filesystem can hold.
pub const FAT_MAX_FILE_SIZE: u64 = u32::MAX as u64;

/// Current phase of an imaging operation.
///
/// Transitions are forward-only; `Completed`, `Failed` and `Cancelled` are
/// terminal. Progress values are bounded to [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Preparing,
    Unmounting,
    Formatting,
    CheckingBadBlocks { progress: f64 },
    MountingSource,
    Copying { progress: f64, current: String },
    InstallingBoot,
    CreatingPersistence,
    RawWriting { progress: f64 },
    Completed,
    Failed { reason: String },
    Cancelled,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Phase::Completed | Phase::Failed { .. } | Phase::Cancelled
        )
    }

    pub fn progress(&self) -> Option<f64> {
        match self {
            Phase::CheckingBadBlocks { progress }
            | Phase::Copying { progress, .. }
            | Phase::RawWriting { progress } => Some(*progress),
            Phase::Completed => Some(1.0),
            _ => None,
        }
    }
}

/// Per-operation cancellation and child-process bookkeeping.
///
/// One context is created per imaging run and threaded down the call chain;
/// there is no process-global state. `cancel()` trips the flag and signals
/// the in-flight child process, if any; the pipeline observes the flag at
/// every phase boundary and inside long-running loops.
#[derive(Clone, Default)]
pub struct OperationContext {
    inner: Arc<ContextInner>,
}

#[derive(Default)]
struct ContextInner {
    cancelled: AtomicBool,
    active_pid: Mutex<Option<i32>>,
}

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and terminate the active child process, if any.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let pid = self.inner.active_pid.lock().unwrap().take();
        if let Some(pid) = pid {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Cancellation checkpoint: errors with `FlashError::Cancelled` once the
    /// flag is set.
    pub fn check(&self) -> FlashResult<()> {
        if self.is_cancelled() {
            Err(FlashError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub(crate) fn register_child(&self, pid: i32) {
        *self.inner.active_pid.lock().unwrap() = Some(pid);
    }

    pub(crate) fn clear_child(&self) {
        self.inner.active_pid.lock().unwrap().take();
    }
}
