//! The imaging pipeline state machine.
//!
//! Drives one imaging operation from options to a terminal state:
//! Preparing -> Unmounting -> Formatting -> MountingSource -> Copying ->
//! InstallingBoot -> [CreatingPersistence] for standard mode, or
//! Preparing -> Unmounting -> RawWriting for DD mode. Cancellation is
//! observed at every phase boundary and inside the long-running loops; the
//! attached source image is detached on every exit path.

use crate::boot::{BootInspection, BootInstaller};
use crate::copy::{enumerate_tree, CopyEngine};
use crate::dd::{privileged_dd, RawWriter};
use crate::device::{candidate_suffixes, DeviceResolver};
use crate::persistence::PersistenceManager;
use crate::process::ProcessRunner;
use crate::progress::{LogReceiver, Reporter, StatusReceiver};
use crate::{
    Filesystem, FlashError, FlashResult, ImagingMode, ImagingOptions, OperationContext, Phase,
};
use log::debug;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Attempts and spacing for the post-format mount wait.
const MOUNT_WAIT_ATTEMPTS: u32 = 30;
const MOUNT_WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// Chunk size for the bad-block read scan.
const BAD_BLOCK_CHUNK: usize = 1024 * 1024;

/// Sanitize a requested volume label for the target filesystem.
///
/// Characters outside the legal alphabet (alphanumerics, underscore,
/// hyphen) are stripped, FAT-family labels are uppercased, and the result
/// is truncated to the filesystem's maximum. An empty result falls back to
/// a safe default.
pub fn sanitize_label(filesystem: Filesystem, requested: &str) -> String {
    let mut label: String = requested
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if filesystem.is_fat_family() {
        label = label.to_ascii_uppercase();
    }
    label.truncate(filesystem.max_label_len());
    if label.is_empty() {
        label = "UNTITLED".to_string();
    }
    label
}

/// Pre-flight scan for files a FAT target cannot hold.
///
/// Runs before any destructive step: recovery is free here and expensive
/// once formatting has begun.
pub fn preflight_fat_scan(source_root: &Path, filesystem: Filesystem) -> FlashResult<()> {
    if !filesystem.is_fat_family() {
        return Ok(());
    }
    let manifest = enumerate_tree(source_root)?;
    if let Some(oversized) = manifest.oversized() {
        return Err(FlashError::OversizedFileForFat(oversized.relative.clone()));
    }
    Ok(())
}

/// A mounted source image; detached by the orchestrator on every exit path.
struct SourceMount {
    mount_point: PathBuf,
}

pub struct FormatOrchestrator {
    options: ImagingOptions,
    ctx: OperationContext,
    runner: ProcessRunner,
    reporter: Reporter,
}

impl FormatOrchestrator {
    pub fn new(options: ImagingOptions, ctx: OperationContext, reporter: Reporter) -> Self {
        let runner = ProcessRunner::new(ctx.clone());
        Self {
            options,
            ctx,
            runner,
            reporter,
        }
    }

    /// Run the pipeline to a terminal state.
    pub async fn execute(&self) -> FlashResult<()> {
        let mut result = match self.options.mode {
            ImagingMode::Standard => self.run_standard().await,
            ImagingMode::Dd => self.run_dd().await,
        };

        // A cancellation request outranks whatever error it provoked (a
        // killed subprocess reports failure too).
        if result.is_err() && self.ctx.is_cancelled() {
            result = Err(FlashError::Cancelled);
        }

        match &result {
            Ok(()) => {
                self.reporter.info("Imaging completed");
                self.reporter.set_phase(Phase::Completed);
            }
            Err(FlashError::Cancelled) => {
                self.reporter.info("Imaging cancelled");
                self.reporter.set_phase(Phase::Cancelled);
            }
            Err(e) => {
                self.reporter.error(e.to_string());
                self.reporter.set_phase(Phase::Failed {
                    reason: e.to_string(),
                });
            }
        }
        result
    }

    async fn run_standard(&self) -> FlashResult<()> {
        self.reporter.set_phase(Phase::Preparing);

        // The source stays attached for the whole run; whatever happens
        // below, it is detached before we return.
        let source = self.attach_source().await?;
        let result = self.run_standard_inner(&source).await;
        self.detach_source(&source).await;
        result
    }

    async fn run_standard_inner(&self, source: &SourceMount) -> FlashResult<()> {
        let disk = &self.options.device;
        let source_root = source.mount_point.as_path();

        preflight_fat_scan(source_root, self.options.filesystem)?;
        self.ctx.check()?;

        self.reporter.set_phase(Phase::Unmounting);
        self.unmount_disk(disk).await?;

        if !self.options.quick_format {
            self.ctx.check()?;
            self.zero_disk(disk).await?;
        }

        if self.options.bad_block_check {
            self.ctx.check()?;
            self.scan_bad_blocks(disk).await?;
        }

        self.ctx.check()?;
        self.reporter.set_phase(Phase::Formatting);
        self.erase_disk(disk).await?;

        let resolver = DeviceResolver::new(&self.runner, self.ctx.clone());
        let (data_partition, dest_root) = resolver
            .wait_for_partition_mount(
                disk,
                candidate_suffixes(self.options.scheme),
                MOUNT_WAIT_ATTEMPTS,
                MOUNT_WAIT_INTERVAL,
            )
            .await?;
        self.reporter
            .info(format!("Data partition {} mounted at {}", data_partition, dest_root.display()));

        self.ctx.check()?;
        self.reporter.set_phase(Phase::MountingSource);
        let inspection = BootInspection::classify(source_root);
        self.reporter.info(format!(
            "Source image: windows={} linux={} efi={} bios={}",
            inspection.windows, inspection.linux, inspection.efi, inspection.bios
        ));

        self.reporter.set_phase(Phase::Copying {
            progress: 0.0,
            current: String::new(),
        });
        let engine = CopyEngine::new(self.ctx.clone(), self.reporter.clone());
        let reporter = self.reporter.clone();
        engine.copy_tree(source_root, &dest_root, |progress, current| {
            reporter.set_phase(Phase::Copying {
                progress,
                current: current.display().to_string(),
            });
        })?;

        self.ctx.check()?;
        self.reporter.set_phase(Phase::InstallingBoot);
        let installer = BootInstaller::new(&self.runner, self.ctx.clone(), self.reporter.clone());
        installer
            .install(
                source_root,
                &dest_root,
                disk,
                self.options.firmware,
                inspection,
                self.options.legacy_bios_fixups,
            )
            .await?;

        if self.options.persistence_bytes > 0 {
            self.ctx.check()?;
            self.reporter.set_phase(Phase::CreatingPersistence);
            let manager = PersistenceManager::new(
                &self.runner,
                &resolver,
                self.ctx.clone(),
                self.reporter.clone(),
            );
            manager
                .create(
                    disk,
                    &data_partition,
                    source_root,
                    self.options.persistence_bytes,
                )
                .await?;
        }

        Ok(())
    }

    async fn run_dd(&self) -> FlashResult<()> {
        let disk = &self.options.device;
        self.reporter.set_phase(Phase::Preparing);
        if !self.options.image.exists() {
            return Err(FlashError::IsoMountFailed(format!(
                "{} does not exist",
                self.options.image.display()
            )));
        }

        self.ctx.check()?;
        self.reporter.set_phase(Phase::Unmounting);
        self.unmount_disk(disk).await?;

        self.ctx.check()?;
        self.reporter.set_phase(Phase::RawWriting { progress: 0.0 });
        let raw_node = PathBuf::from(format!("/dev/r{}", disk));
        let buffered_node = PathBuf::from(format!("/dev/{}", disk));

        let writer = RawWriter::new(self.ctx.clone(), self.reporter.clone());
        let reporter = self.reporter.clone();
        let direct = writer.write_image(&self.options.image, &raw_node, &buffered_node, |p| {
            reporter.set_phase(Phase::RawWriting { progress: p });
        });

        match direct {
            Ok(target) => {
                debug!("raw write went through {:?} node", target);
                Ok(())
            }
            Err(FlashError::PermissionDenied(_)) => {
                self.reporter
                    .info("Device node not writable; escalating to a privileged dd");
                privileged_dd(&self.runner, &self.options.image, &raw_node).await
            }
            Err(e) => Err(e),
        }
    }

    /// Attach the source image read-only and return its mount point.
    async fn attach_source(&self) -> FlashResult<SourceMount> {
        let image = self.options.image.to_string_lossy().into_owned();
        let result = self
            .runner
            .run(
                "hdiutil",
                &["attach", "-nobrowse", "-readonly", "-noverify", &image],
                None,
            )
            .await?;
        if !result.success() {
            return Err(FlashError::IsoMountFailed(result.stderr_brief()));
        }

        // hdiutil reports one line per entry; the mount point is the
        // /Volumes path on the last of them.
        let mount_point = result
            .stdout
            .lines()
            .filter_map(|line| line.find("/Volumes/").map(|idx| line[idx..].trim().to_string()))
            .next_back()
            .map(PathBuf::from)
            .ok_or_else(|| {
                FlashError::IsoMountFailed("no mount point in hdiutil output".to_string())
            })?;

        self.reporter
            .info(format!("Source image attached at {}", mount_point.display()));
        Ok(SourceMount { mount_point })
    }

    /// Detach the source image; best-effort, runs on all exit paths.
    async fn detach_source(&self, source: &SourceMount) {
        let mount = source.mount_point.to_string_lossy().into_owned();
        match self.runner.run("hdiutil", &["detach", &mount], None).await {
            Ok(result) if !result.success() => {
                // One retry with force; a stuck detach is not fatal.
                let _ = self
                    .runner
                    .run("hdiutil", &["detach", "-force", &mount], None)
                    .await;
            }
            _ => {}
        }
    }

    /// Unmount all partitions of the disk. Idempotent: a disk with nothing
    /// mounted is not an error.
    async fn unmount_disk(&self, disk: &str) -> FlashResult<()> {
        let resolver = DeviceResolver::new(&self.runner, self.ctx.clone());
        let mounted = resolver.mounted_partitions(disk).await?;
        if mounted.is_empty() {
            debug!("{} has no mounted partitions", disk);
            return Ok(());
        }

        let node = format!("/dev/{}", disk);
        let result = self
            .runner
            .run("diskutil", &["unmountDisk", &node], None)
            .await?;
        if !result.success() {
            self.reporter.log_stderr(&result);
            return Err(FlashError::UnmountFailed(result.stderr_brief()));
        }
        Ok(())
    }

    /// Full-format zero pass over the whole disk.
    async fn zero_disk(&self, disk: &str) -> FlashResult<()> {
        self.reporter
            .info("Full format requested; zeroing the disk first (this is slow)");
        let node = format!("/dev/{}", disk);
        let result = self
            .runner
            .run_privileged("diskutil", &["zeroDisk", &node], None)
            .await?;
        if !result.success() {
            self.reporter.log_stderr(&result);
            return Err(FlashError::FormatFailed(result.stderr_brief()));
        }
        Ok(())
    }

    /// Erase and partition the disk in one call.
    async fn erase_disk(&self, disk: &str) -> FlashResult<()> {
        let label = sanitize_label(self.options.filesystem, &self.options.label);
        let node = format!("/dev/{}", disk);
        self.reporter.info(format!(
            "Formatting {} as {} ({}) with label {}",
            disk,
            self.options.filesystem.diskutil_name(),
            self.options.scheme.diskutil_name(),
            label
        ));

        let result = self
            .runner
            .run(
                "diskutil",
                &[
                    "eraseDisk",
                    self.options.filesystem.diskutil_name(),
                    &label,
                    self.options.scheme.diskutil_name(),
                    &node,
                ],
                None,
            )
            .await?;
        if !result.success() {
            self.reporter.log_stderr(&result);
            return Err(FlashError::FormatFailed(result.stderr_brief()));
        }
        Ok(())
    }

    /// Read scan over the raw device, one pass per configured count.
    /// Unreadable chunks are warnings; the scan never fails the pipeline.
    async fn scan_bad_blocks(&self, disk: &str) -> FlashResult<()> {
        use std::io::{Read, Seek, SeekFrom};

        self.reporter
            .set_phase(Phase::CheckingBadBlocks { progress: 0.0 });
        let raw = format!("/dev/r{}", disk);
        let file = std::fs::File::open(&raw)
            .or_else(|_| std::fs::File::open(format!("/dev/{}", disk)));
        let mut file = match file {
            Ok(f) => f,
            Err(e) => {
                self.reporter.warn(format!(
                    "bad-block check skipped: cannot open device ({})",
                    e
                ));
                return Ok(());
            }
        };

        // Block devices report zero length through metadata; ask diskutil.
        let info = self
            .runner
            .run("diskutil", &["info", &format!("/dev/{}", disk)], None)
            .await?;
        let disk_size = crate::device::extract_bytes_field(&info.stdout, "Disk Size").unwrap_or(0);

        let passes = self.options.bad_block_passes.max(1);
        let mut buffer = vec![0u8; BAD_BLOCK_CHUNK];
        let mut bad_chunks: u64 = 0;
        let mut throttle = crate::progress::Throttle::for_progress();

        for pass in 1..=passes {
            self.reporter
                .info(format!("Bad-block read scan, pass {}/{}", pass, passes));
            file.seek(SeekFrom::Start(0))?;
            let mut offset: u64 = 0;
            loop {
                self.ctx.check()?;
                match file.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(read) => offset += read as u64,
                    Err(e) => {
                        bad_chunks += 1;
                        self.reporter.warn(format!(
                            "unreadable region near byte {}: {}",
                            offset, e
                        ));
                        offset += BAD_BLOCK_CHUNK as u64;
                        if file.seek(SeekFrom::Start(offset)).is_err() {
                            break;
                        }
                    }
                }
                if disk_size > 0 && throttle.ready() {
                    let in_pass = (offset as f64 / disk_size as f64).min(1.0);
                    let progress = ((pass as f64 - 1.0) + in_pass) / passes as f64;
                    self.reporter.set_phase(Phase::CheckingBadBlocks {
                        progress: progress.min(1.0),
                    });
                }
            }
        }

        if bad_chunks > 0 {
            self.reporter.warn(format!(
                "bad-block scan found {} unreadable regions; the drive may be failing",
                bad_chunks
            ));
        }
        Ok(())
    }
}

/// Handle to a running imaging operation.
pub struct ImagingHandle {
    pub status: StatusReceiver,
    pub logs: LogReceiver,
    ctx: OperationContext,
    join: JoinHandle<FlashResult<()>>,
}

impl ImagingHandle {
    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.ctx.cancel();
    }

    /// Clone of the cancellation context, for signal handlers.
    pub fn context(&self) -> OperationContext {
        self.ctx.clone()
    }

    /// Wait for the terminal result.
    pub async fn wait(self) -> FlashResult<()> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(FlashError::IoError(std::io::Error::other(format!(
                "imaging task failed: {}",
                e
            )))),
        }
    }
}

pub struct Imager;

impl Imager {
    /// Start one imaging operation.
    ///
    /// Callable once per operation; callers serialize starts against the
    /// same device. The pipeline runs as a single spawned task; the handle
    /// exposes the status stream, the log stream and cancellation.
    pub fn start(options: ImagingOptions) -> ImagingHandle {
        let ctx = OperationContext::new();
        let (reporter, status, logs) = Reporter::channel();
        let orchestrator = FormatOrchestrator::new(options, ctx.clone(), reporter);

        let join = tokio::spawn(async move { orchestrator.execute().await });

        ImagingHandle {
            status,
            logs,
            ctx,
            join,
        }
    }
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod orchestrator_tests;
