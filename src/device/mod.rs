//! Device identity resolution and disk-info queries.
//!
//! Everything here shells out to `diskutil`, the macOS disk arbitration
//! front end. Identity handling is strict about the whole-disk form: a
//! volume resolves to `disk3s1` first, and the partition suffix is stripped
//! before the identifier is used for anything destructive.

pub mod scanner;

use crate::process::ProcessRunner;
use crate::retry::FixedInterval;
use crate::{FlashError, FlashResult, OperationContext, PartitionScheme};
use log::debug;
use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;

/// Issue an explicit `diskutil mount` kick after this many failed polls.
const MOUNT_KICK_AFTER: u32 = 3;

/// Extract the value of a `Key:   value` line from diskutil output.
pub(crate) fn extract_field(output: &str, field_name: &str) -> Option<String> {
    output
        .lines()
        .find(|line| line.trim_start().starts_with(field_name))?
        .split_once(':')
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Extract an exact byte count from a field like
/// `Disk Size:  15.5 GB (15476981760 Bytes) (exactly ...)`.
pub(crate) fn extract_bytes_field(output: &str, field_name: &str) -> Option<u64> {
    let value = extract_field(output, field_name)?;
    let re = Regex::new(r"\((\d+) Bytes\)").ok()?;
    re.captures(&value)?.get(1)?.as_str().parse().ok()
}

/// Strip a partition suffix from a BSD disk identifier.
///
/// `disk2s1` becomes `disk2`; a bare `disk2` passes through. Anything that
/// is not a BSD disk identifier yields `None`.
pub(crate) fn strip_partition_suffix(identifier: &str) -> Option<String> {
    let re = Regex::new(r"^(disk\d+)(s\d+)?$").ok()?;
    re.captures(identifier)
        .map(|caps| caps.get(1).unwrap().as_str().to_string())
}

/// Candidate partition indices for the data partition after an erase.
///
/// A GPT layout puts an EFI system partition at index 1, pushing the data
/// partition to index 2; MBR layouts put it first.
pub(crate) fn candidate_suffixes(scheme: PartitionScheme) -> &'static [u32] {
    match scheme {
        PartitionScheme::MBR => &[1, 2],
        PartitionScheme::GPT => &[2, 1, 3],
    }
}

pub struct DeviceResolver<'a> {
    runner: &'a ProcessRunner,
    ctx: OperationContext,
}

impl<'a> DeviceResolver<'a> {
    pub fn new(runner: &'a ProcessRunner, ctx: OperationContext) -> Self {
        Self { runner, ctx }
    }

    /// Map a mounted volume path to its whole-disk identifier.
    pub async fn resolve_whole_disk(&self, volume_path: &str) -> FlashResult<String> {
        let result = self
            .runner
            .run("diskutil", &["info", volume_path], None)
            .await?;
        if !result.success() {
            return Err(FlashError::DeviceNotFound(format!(
                "{}: {}",
                volume_path,
                result.stderr_brief()
            )));
        }

        let identifier = extract_field(&result.stdout, "Device Identifier")
            .ok_or_else(|| FlashError::DeviceNotFound(volume_path.to_string()))?;

        strip_partition_suffix(&identifier)
            .ok_or_else(|| FlashError::DeviceNotFound(identifier))
    }

    /// Current mount point of a partition, if any.
    pub async fn mount_point(&self, partition: &str) -> FlashResult<Option<PathBuf>> {
        let node = format!("/dev/{}", partition);
        let result = self.runner.run("diskutil", &["info", &node], None).await?;
        if !result.success() {
            return Ok(None);
        }
        Ok(extract_field(&result.stdout, "Mount Point").map(PathBuf::from))
    }

    /// Exact free space of a mounted volume in bytes.
    ///
    /// Prefers the precise `Volume Free Space` figure; when diskutil does
    /// not report one, falls back to half the volume size as a conservative
    /// estimate.
    pub async fn volume_free_space(&self, partition: &str) -> FlashResult<u64> {
        let node = format!("/dev/{}", partition);
        let result = self.runner.run("diskutil", &["info", &node], None).await?;
        if !result.success() {
            return Err(FlashError::DeviceNotFound(format!(
                "{}: {}",
                partition,
                result.stderr_brief()
            )));
        }

        if let Some(free) = extract_bytes_field(&result.stdout, "Volume Free Space") {
            return Ok(free);
        }
        if let Some(free) = extract_bytes_field(&result.stdout, "Container Free Space") {
            return Ok(free);
        }
        let total = extract_bytes_field(&result.stdout, "Volume Total Size")
            .or_else(|| extract_bytes_field(&result.stdout, "Disk Size"))
            .unwrap_or(0);
        debug!(
            "no free-space figure for {}, estimating half of {} bytes",
            partition, total
        );
        Ok(total / 2)
    }

    /// Partitions of a disk that currently appear in the mount table.
    /// A whole-disk mount (partitionless "superfloppy" media) counts too.
    pub async fn mounted_partitions(&self, disk: &str) -> FlashResult<Vec<String>> {
        let result = self.runner.run("mount", &[], None).await?;
        let whole = format!("/dev/{}", disk);
        let prefix = format!("/dev/{}s", disk);
        Ok(result
            .stdout
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .filter(|node| *node == whole || node.starts_with(&prefix))
            .map(|node| node.trim_start_matches("/dev/").to_string())
            .collect())
    }

    /// Wait for the data partition of a freshly erased disk to mount.
    ///
    /// Tries each candidate partition index in order on every poll, issuing
    /// an explicit `diskutil mount` after [`MOUNT_KICK_AFTER`] silent polls.
    /// Exhausting `max_attempts` is a [`FlashError::MountTimeout`].
    pub async fn wait_for_partition_mount(
        &self,
        disk: &str,
        candidates: &[u32],
        max_attempts: u32,
        interval: Duration,
    ) -> FlashResult<(String, PathBuf)> {
        let policy = FixedInterval::new(max_attempts, interval);
        let found = policy
            .poll_until(&self.ctx, |attempt| async move {
                for index in candidates {
                    let partition = format!("{}s{}", disk, index);
                    if let Some(path) = self.mount_point(&partition).await? {
                        return Ok(Some((partition, path)));
                    }
                }
                if attempt == MOUNT_KICK_AFTER {
                    for index in candidates {
                        let partition = format!("{}s{}", disk, index);
                        debug!("mount kick for {}", partition);
                        let _ = self
                            .runner
                            .run("diskutil", &["mount", &partition], None)
                            .await;
                    }
                }
                Ok(None)
            })
            .await?;

        found.ok_or_else(|| {
            FlashError::MountTimeout(format!(
                "{} after {} attempts",
                disk, max_attempts
            ))
        })
    }
}

#[cfg(test)]
mod resolver_tests;
