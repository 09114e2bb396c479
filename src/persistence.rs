//! Persistence partition creation for live-Linux drives.
//!
//! Carves a second partition out of the freshly imaged data partition so a
//! live system can keep state across reboots. The distribution family picks
//! the label and marker-file convention; the free-space gate runs before
//! any partition-table mutation, so an oversized request costs nothing.

use crate::device::{extract_bytes_field, DeviceResolver};
use crate::process::ProcessRunner;
use crate::progress::Reporter;
use crate::{FlashError, FlashResult, OperationContext};
use log::debug;
use regex::Regex;
use std::fs;
use std::path::Path;

/// Host locations searched for a native ext4 formatter.
const MKFS_EXT4_PREFIXES: &[&str] = &[
    "/usr/local/sbin",
    "/usr/local/bin",
    "/opt/homebrew/sbin",
    "/opt/homebrew/bin",
    "/opt/local/sbin",
    "/usr/sbin",
    "/sbin",
];

const MKFS_EXT4_NAMES: &[&str] = &["mkfs.ext4", "mke2fs"];

/// Live-distribution families with distinct persistence conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistroFamily {
    /// casper-based (Ubuntu and derivatives): label convention only.
    Ubuntu,
    /// live-boot based (Debian): `persistence` label plus persistence.conf.
    Debian,
    /// LiveOS overlays (Fedora): label convention only.
    Fedora,
    /// archiso: union mount driven by a persistence.conf.
    Arch,
    Generic,
}

impl DistroFamily {
    /// Detect the family from marker paths in the mounted source image.
    pub fn detect(source_root: &Path) -> Self {
        if source_root.join("casper").is_dir() {
            return DistroFamily::Ubuntu;
        }
        if source_root.join("LiveOS").is_dir() {
            return DistroFamily::Fedora;
        }
        if source_root.join("arch").is_dir() {
            return DistroFamily::Arch;
        }
        if source_root.join("live").is_dir() {
            let disk_info = fs::read_to_string(source_root.join(".disk/info")).unwrap_or_default();
            if disk_info.to_lowercase().contains("debian") {
                return DistroFamily::Debian;
            }
            return DistroFamily::Generic;
        }
        DistroFamily::Generic
    }

    /// Partition label the distribution's init scripts look for.
    pub fn partition_label(&self) -> &'static str {
        match self {
            DistroFamily::Ubuntu => "casper-rw",
            DistroFamily::Fedora => "OVERLAY",
            DistroFamily::Debian | DistroFamily::Arch | DistroFamily::Generic => "persistence",
        }
    }

    /// Marker file required inside the partition, if the family uses one.
    pub fn marker(&self) -> Option<(&'static str, &'static str)> {
        match self {
            DistroFamily::Ubuntu | DistroFamily::Fedora => None,
            DistroFamily::Debian | DistroFamily::Arch | DistroFamily::Generic => {
                Some(("persistence.conf", "/ union\n"))
            }
        }
    }
}

/// Free-space gate, checked before any partition-table mutation.
pub(crate) fn ensure_fits(requested: u64, available: u64) -> FlashResult<()> {
    if requested > available {
        return Err(FlashError::InsufficientSpace {
            requested,
            available,
        });
    }
    Ok(())
}

pub struct PersistenceManager<'a> {
    runner: &'a ProcessRunner,
    resolver: &'a DeviceResolver<'a>,
    ctx: OperationContext,
    reporter: Reporter,
}

impl<'a> PersistenceManager<'a> {
    pub fn new(
        runner: &'a ProcessRunner,
        resolver: &'a DeviceResolver<'a>,
        ctx: OperationContext,
        reporter: Reporter,
    ) -> Self {
        Self {
            runner,
            resolver,
            ctx,
            reporter,
        }
    }

    /// Create and provision the persistence partition.
    ///
    /// Any step failure aborts persistence creation only; the imaged drive
    /// stays valid without it.
    pub async fn create(
        &self,
        disk: &str,
        data_partition: &str,
        source_root: &Path,
        size_bytes: u64,
    ) -> FlashResult<()> {
        let family = DistroFamily::detect(source_root);
        self.reporter.info(format!(
            "Creating {} byte persistence partition ({:?} conventions)",
            size_bytes, family
        ));

        let available = self.resolver.volume_free_space(data_partition).await?;
        ensure_fits(size_bytes, available)?;

        self.ctx.check()?;
        self.shrink_data_partition(data_partition, size_bytes).await?;

        self.ctx.check()?;
        let partition = self.add_partition(disk, data_partition, family, size_bytes).await?;

        self.ctx.check()?;
        self.format_partition(&partition, family).await?;

        self.write_marker(&partition, family).await?;
        self.reporter.info("Persistence partition ready");
        Ok(())
    }

    /// Shrink the data partition by the requested size, retrying once
    /// against the resize facility's reported limits.
    async fn shrink_data_partition(&self, partition: &str, shrink_by: u64) -> FlashResult<()> {
        let node = format!("/dev/{}", partition);
        let info = self.runner.run("diskutil", &["info", &node], None).await?;
        let current = extract_bytes_field(&info.stdout, "Volume Total Size")
            .or_else(|| extract_bytes_field(&info.stdout, "Disk Size"))
            .ok_or_else(|| {
                FlashError::PartitionFailed(format!("cannot size volume {}", partition))
            })?;
        let target = current.saturating_sub(shrink_by);

        let size_arg = format!("{}B", target);
        let result = self
            .runner
            .run_privileged("diskutil", &["resizeVolume", &node, &size_arg], None)
            .await?;
        if result.success() {
            return Ok(());
        }
        debug!("direct resize failed: {}", result.stderr_brief());

        // One retry, clamped to the minimum the facility reports.
        let limits = self
            .runner
            .run("diskutil", &["resizeVolume", &node, "limits"], None)
            .await?;
        let minimum = extract_bytes_field(&limits.stdout, "Minimum size")
            .or_else(|| extract_bytes_field(&limits.stdout, "Minimum"));
        let Some(minimum) = minimum else {
            self.reporter.log_stderr(&result);
            return Err(FlashError::PartitionFailed(result.stderr_brief()));
        };

        let clamped = target.max(minimum);
        let size_arg = format!("{}B", clamped);
        let retry = self
            .runner
            .run_privileged("diskutil", &["resizeVolume", &node, &size_arg], None)
            .await?;
        if !retry.success() {
            self.reporter.log_stderr(&retry);
            return Err(FlashError::PartitionFailed(retry.stderr_brief()));
        }
        Ok(())
    }

    /// Add the persistence partition in the freed space and return its
    /// identifier.
    async fn add_partition(
        &self,
        disk: &str,
        data_partition: &str,
        family: DistroFamily,
        size_bytes: u64,
    ) -> FlashResult<String> {
        let before = self.list_partitions(disk).await?;

        let node = format!("/dev/{}", data_partition);
        let size_arg = format!("{}B", size_bytes);
        let result = self
            .runner
            .run_privileged(
                "diskutil",
                &[
                    "addPartition",
                    &node,
                    "MS-DOS FAT32",
                    family.partition_label(),
                    &size_arg,
                ],
                None,
            )
            .await?;
        if !result.success() {
            self.reporter.log_stderr(&result);
            return Err(FlashError::PartitionFailed(result.stderr_brief()));
        }

        let after = self.list_partitions(disk).await?;
        after
            .into_iter()
            .find(|p| !before.contains(p))
            .ok_or_else(|| {
                FlashError::PartitionFailed("new partition did not appear in the table".to_string())
            })
    }

    async fn list_partitions(&self, disk: &str) -> FlashResult<Vec<String>> {
        let node = format!("/dev/{}", disk);
        let result = self.runner.run("diskutil", &["list", &node], None).await?;
        let re = Regex::new(&format!(r"\b({}s\d+)\b", regex::escape(disk))).expect("valid regex");
        let mut partitions: Vec<String> = re
            .captures_iter(&result.stdout)
            .map(|c| c.get(1).unwrap().as_str().to_string())
            .collect();
        partitions.sort();
        partitions.dedup();
        Ok(partitions)
    }

    /// Format the new partition, preferring a native ext4 formatter; fall
    /// back to the FAT32 filesystem `addPartition` already laid down.
    async fn format_partition(&self, partition: &str, family: DistroFamily) -> FlashResult<()> {
        let Some(mkfs) = find_mkfs_ext4() else {
            self.reporter.warn(
                "no ext4 formatter found on this host; persistence stays FAT32 \
                 (some distributions handle this poorly)",
            );
            return Ok(());
        };

        let node = format!("/dev/{}", partition);
        // mke2fs needs the volume unmounted.
        let _ = self
            .runner
            .run("diskutil", &["unmount", &node], None)
            .await?;

        let result = self
            .runner
            .run_privileged(
                &mkfs,
                &["-t", "ext4", "-L", family.partition_label(), &node],
                None,
            )
            .await?;
        if !result.success() {
            self.reporter.log_stderr(&result);
            return Err(FlashError::PersistenceFormatFailed(result.stderr_brief()));
        }
        self.reporter
            .info(format!("Formatted {} as ext4", partition));
        Ok(())
    }

    /// Mount the partition and drop the family marker file into it, when
    /// the family uses one.
    async fn write_marker(&self, partition: &str, family: DistroFamily) -> FlashResult<()> {
        let Some((name, contents)) = family.marker() else {
            return Ok(());
        };

        let node = format!("/dev/{}", partition);
        let _ = self.runner.run("diskutil", &["mount", &node], None).await?;
        match self.resolver.mount_point(partition).await? {
            Some(mount) => {
                fs::write(mount.join(name), contents)?;
                self.reporter.info(format!("Wrote {}", name));
            }
            None => {
                // An ext4 partition is not mountable on this host; the
                // first boot of the live system has to create the file.
                self.reporter.warn(format!(
                    "could not mount {} to write {}; persistence may need one manual step",
                    partition, name
                ));
            }
        }
        Ok(())
    }
}

fn find_mkfs_ext4() -> Option<String> {
    for prefix in MKFS_EXT4_PREFIXES {
        for name in MKFS_EXT4_NAMES {
            let candidate = Path::new(prefix).join(name);
            if candidate.exists() {
                return Some(candidate.to_string_lossy().into_owned());
            }
        }
    }
    None
}

#[cfg(test)]
#[path = "persistence_tests.rs"]
mod persistence_tests;
