//! Source-image classification and boot-artifact installation.
//!
//! Classification is a pure function over marker-path probes; the result is
//! a tagged record consumed by the installers, never a pile of ad hoc
//! booleans. Installation is deliberately forgiving: a missing bootloader
//! binary degrades to a warning, because a drive that boots on one firmware
//! beats a failed run.

use crate::process::ProcessRunner;
use crate::progress::Reporter;
use crate::{FlashResult, OperationContext, TargetFirmware};
use std::fs;
use std::path::{Path, PathBuf};

/// Known locations of the Windows EFI loader inside an installer image.
const WINDOWS_EFI_LOADER_PATHS: &[&str] = &[
    "efi/boot/bootx64.efi",
    "EFI/BOOT/BOOTX64.EFI",
    "EFI/Boot/bootx64.efi",
    "bootmgr.efi",
];

/// Known locations of the Windows boot configuration data store.
const WINDOWS_BCD_PATHS: &[&str] = &["EFI/Microsoft/Boot/BCD", "boot/bcd"];

/// Install prefixes searched for the syslinux MBR bootstrap blob.
const SYSLINUX_MBR_PREFIXES: &[&str] = &[
    "/usr/local/share/syslinux",
    "/opt/homebrew/share/syslinux",
    "/opt/local/share/syslinux",
    "/usr/share/syslinux",
];

/// The MBR bootstrap code area is the first 440 bytes of the disk.
pub const MBR_BOOTSTRAP_SIZE: u64 = 440;

/// What the mounted source image looks like, by marker files.
///
/// The booleans are independent probes, not mutually exclusive: a dual-boot
/// image can be Windows-flavored and still carry syslinux.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BootInspection {
    pub windows: bool,
    pub linux: bool,
    pub efi: bool,
    pub bios: bool,
}

impl BootInspection {
    /// Classify a mounted source image by its marker paths.
    pub fn classify(root: &Path) -> Self {
        let has = |p: &str| root.join(p).exists();

        let windows = has("sources/install.wim")
            || has("sources/install.esd")
            || has("bootmgr")
            || has("bootmgr.efi");
        let linux = has("casper") || has("live") || has("isolinux") || has("syslinux");
        let efi = has("EFI") || has("efi");
        let bios = has("isolinux") || has("syslinux") || has("boot/grub") || has("bootmgr");

        Self {
            windows,
            linux,
            efi,
            bios,
        }
    }
}

/// Which installers to run for a requested firmware target.
pub(crate) fn select_targets(
    firmware: TargetFirmware,
    inspection: BootInspection,
) -> (bool, bool) {
    match firmware {
        TargetFirmware::Uefi => (true, false),
        TargetFirmware::Bios => (false, true),
        TargetFirmware::Both => (inspection.efi, inspection.bios),
    }
}

/// First existing path out of a candidate list, relative to `root`.
pub(crate) fn find_first(root: &Path, candidates: &[&str]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(|c| root.join(c))
        .find(|p| p.exists())
}

/// Copy the isolinux/syslinux tree to `dest/syslinux`, renaming
/// `isolinux.cfg` to `syslinux.cfg` when the latter is absent.
pub(crate) fn stage_syslinux_tree(source_dir: &Path, dest_root: &Path) -> std::io::Result<PathBuf> {
    let dest_dir = dest_root.join("syslinux");
    copy_dir_recursive(source_dir, &dest_dir)?;

    let syslinux_cfg = dest_dir.join("syslinux.cfg");
    let isolinux_cfg = dest_dir.join("isolinux.cfg");
    if !syslinux_cfg.exists() && isolinux_cfg.exists() {
        fs::copy(&isolinux_cfg, &syslinux_cfg)?;
    }
    Ok(dest_dir)
}

fn copy_dir_recursive(source: &Path, dest: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Collect every `.efi` payload under the source image's EFI directory.
pub(crate) fn discover_efi_binaries(source_root: &Path) -> Vec<PathBuf> {
    let efi_dir = ["EFI", "efi"]
        .iter()
        .map(|d| source_root.join(d))
        .find(|p| p.is_dir());
    let Some(efi_dir) = efi_dir else {
        return Vec::new();
    };

    walkdir::WalkDir::new(efi_dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .map(|x| x.eq_ignore_ascii_case("efi"))
                .unwrap_or(false)
        })
        .map(|e| e.path().to_path_buf())
        .collect()
}

pub struct BootInstaller<'a> {
    runner: &'a ProcessRunner,
    ctx: OperationContext,
    reporter: Reporter,
}

impl<'a> BootInstaller<'a> {
    pub fn new(runner: &'a ProcessRunner, ctx: OperationContext, reporter: Reporter) -> Self {
        Self {
            runner,
            ctx,
            reporter,
        }
    }

    /// Install boot configuration on the destination volume.
    ///
    /// `disk` is the whole-disk identifier of the target; `dest_root` is the
    /// mounted data partition. UEFI and BIOS installation run independently
    /// of each other.
    pub async fn install(
        &self,
        source_root: &Path,
        dest_root: &Path,
        disk: &str,
        firmware: TargetFirmware,
        inspection: BootInspection,
        legacy_bios_fixups: bool,
    ) -> FlashResult<()> {
        let (do_uefi, do_bios) = select_targets(firmware, inspection);

        if do_uefi {
            self.ctx.check()?;
            self.install_uefi(source_root, dest_root, inspection)?;
        }
        if do_bios {
            self.ctx.check()?;
            self.install_bios(source_root, dest_root, disk, inspection, legacy_bios_fixups)
                .await?;
        }
        if !do_uefi && !do_bios {
            self.reporter
                .warn("source image exposes no boot payload for the requested firmware");
        }
        Ok(())
    }

    fn install_uefi(
        &self,
        source_root: &Path,
        dest_root: &Path,
        inspection: BootInspection,
    ) -> FlashResult<()> {
        self.reporter.info("Installing UEFI boot files");
        let boot_dir = dest_root.join("EFI/BOOT");
        fs::create_dir_all(&boot_dir)?;

        if inspection.windows {
            match find_first(source_root, WINDOWS_EFI_LOADER_PATHS) {
                Some(loader) => {
                    fs::copy(&loader, boot_dir.join("bootx64.efi"))?;
                    self.reporter
                        .info(format!("EFI loader: {}", loader.display()));
                }
                None => self
                    .reporter
                    .warn("no Windows EFI loader found; UEFI boot will not work"),
            }
            if let Some(bcd) = find_first(source_root, WINDOWS_BCD_PATHS) {
                let bcd_dir = dest_root.join("EFI/Microsoft/Boot");
                fs::create_dir_all(&bcd_dir)?;
                fs::copy(&bcd, bcd_dir.join("BCD"))?;
            }
        } else {
            let binaries = discover_efi_binaries(source_root);
            if binaries.is_empty() {
                self.reporter
                    .warn("no EFI binaries found in source image; UEFI boot will not work");
                return Ok(());
            }
            for binary in &binaries {
                let name = binary.file_name().expect("efi files have names");
                fs::copy(binary, boot_dir.join(name))?;
            }
            // Firmware loads bootx64.efi by convention; fall back to the
            // shim or GRUB image when the image names it differently.
            let fallback_name = |n: &str| {
                binaries
                    .iter()
                    .find(|b| b.file_name().map(|f| f.eq_ignore_ascii_case(n)).unwrap_or(false))
            };
            if !boot_dir.join("bootx64.efi").exists() {
                if let Some(shim) = fallback_name("shimx64.efi").or_else(|| fallback_name("grubx64.efi")) {
                    fs::copy(shim, boot_dir.join("bootx64.efi"))?;
                } else {
                    self.reporter
                        .warn("no bootx64.efi, shimx64.efi or grubx64.efi in source image");
                }
            }
        }
        Ok(())
    }

    async fn install_bios(
        &self,
        source_root: &Path,
        dest_root: &Path,
        disk: &str,
        inspection: BootInspection,
        legacy_bios_fixups: bool,
    ) -> FlashResult<()> {
        self.reporter.info("Installing legacy BIOS boot files");

        if inspection.windows {
            let bootmgr = source_root.join("bootmgr");
            if bootmgr.exists() {
                fs::copy(&bootmgr, dest_root.join("bootmgr"))?;
            } else {
                self.reporter
                    .warn("bootmgr not found in source image; BIOS boot will not work");
            }
            self.mark_partition_active(disk).await?;
            return Ok(());
        }

        // Linux-style source: stage the syslinux tree and stamp the MBR.
        let loader_dir = ["isolinux", "syslinux"]
            .iter()
            .map(|d| source_root.join(d))
            .find(|p| p.is_dir());
        match loader_dir {
            Some(dir) => {
                stage_syslinux_tree(&dir, dest_root)?;
            }
            None => self
                .reporter
                .warn("no isolinux/syslinux directory in source image"),
        }

        self.write_mbr_bootstrap(disk).await?;

        if legacy_bios_fixups {
            self.mark_partition_active(disk).await?;
        }
        Ok(())
    }

    /// Flag partition 1 active through a scripted `fdisk -e` session:
    /// select partition 1, flag active, write, confirm, quit.
    async fn mark_partition_active(&self, disk: &str) -> FlashResult<()> {
        let node = format!("/dev/{}", disk);
        let script = "f 1\nwrite\ny\nquit\n";
        let result = self
            .runner
            .run_privileged("fdisk", &["-e", &node], Some(script))
            .await?;
        if !result.success() {
            self.reporter.warn(format!(
                "could not mark partition active: {}",
                result.stderr_brief()
            ));
        }
        Ok(())
    }

    /// Write the 440-byte syslinux bootstrap blob to the head of the disk.
    /// A missing blob is a warning: UEFI boot may still have been installed.
    async fn write_mbr_bootstrap(&self, disk: &str) -> FlashResult<()> {
        let blob = SYSLINUX_MBR_PREFIXES
            .iter()
            .map(|p| Path::new(p).join("mbr.bin"))
            .find(|p| p.exists());
        let Some(blob) = blob else {
            self.reporter.warn(
                "syslinux mbr.bin not found on this host; legacy BIOS boot will not work",
            );
            return Ok(());
        };

        let node = format!("/dev/{}", disk);
        let result = self
            .runner
            .run_privileged(
                "dd",
                &[
                    &format!("if={}", blob.display()),
                    &format!("of={}", node),
                    &format!("bs={}", MBR_BOOTSTRAP_SIZE),
                    "count=1",
                ],
                None,
            )
            .await?;
        if !result.success() {
            self.reporter.warn(format!(
                "MBR bootstrap write failed: {}",
                result.stderr_brief()
            ));
        } else {
            self.reporter.info("MBR bootstrap written");
        }
        Ok(())
    }
}
