//! Candidate-device snapshots for the front end.
//!
//! One scan lists the external physical disks and resolves each one to a
//! [`Device`] snapshot. Scans are cheap but not free, so an in-flight guard
//! skips a cycle instead of stacking overlapping `diskutil` storms; callers
//! must also not scan while a structural operation is mutating a disk they
//! are about to report.

use super::{extract_bytes_field, extract_field};
use crate::process::ProcessRunner;
use crate::{Device, FlashResult, OperationContext};
use log::debug;
use regex::Regex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct DeviceScanner {
    runner: ProcessRunner,
    scanning: AtomicBool,
}

impl DeviceScanner {
    pub fn new() -> Self {
        Self {
            runner: ProcessRunner::new(OperationContext::new()),
            scanning: AtomicBool::new(false),
        }
    }

    /// Produce a fresh snapshot list, or `None` when a scan is already in
    /// flight.
    pub async fn try_scan(&self) -> FlashResult<Option<Vec<Device>>> {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("scan already in flight, skipping cycle");
            return Ok(None);
        }

        let result = self.scan_inner().await;
        self.scanning.store(false, Ordering::SeqCst);
        result.map(Some)
    }

    async fn scan_inner(&self) -> FlashResult<Vec<Device>> {
        let listing = self
            .runner
            .run("diskutil", &["list", "external", "physical"], None)
            .await?;

        let header = Regex::new(r"(?m)^/dev/(disk\d+)\s").expect("valid regex");
        let mut devices = Vec::new();
        for caps in header.captures_iter(&listing.stdout) {
            let identifier = caps.get(1).unwrap().as_str().to_string();
            match self.describe(&identifier).await {
                Ok(device) => devices.push(device),
                Err(e) => {
                    // A disk yanked mid-scan is not an error for the others.
                    debug!("skipping {}: {}", identifier, e);
                }
            }
        }
        Ok(devices)
    }

    async fn describe(&self, identifier: &str) -> FlashResult<Device> {
        let node = format!("/dev/{}", identifier);
        let info = self.runner.run("diskutil", &["info", &node], None).await?;
        let stdout = &info.stdout;

        let name = extract_field(stdout, "Device / Media Name")
            .or_else(|| extract_field(stdout, "Volume Name"))
            .unwrap_or_else(|| identifier.to_string());
        let size = extract_bytes_field(stdout, "Disk Size")
            .or_else(|| extract_bytes_field(stdout, "Total Size"))
            .unwrap_or(0);
        let removable = extract_field(stdout, "Removable Media")
            .map(|v| v.eq_ignore_ascii_case("removable"))
            .unwrap_or(false);
        let mount_point = extract_field(stdout, "Mount Point").map(PathBuf::from);

        Ok(Device {
            identifier: identifier.to_string(),
            name,
            removable,
            size,
            mount_point,
        })
    }
}

impl Default for DeviceScanner {
    fn default() -> Self {
        Self::new()
    }
}
