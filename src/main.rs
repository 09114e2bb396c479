use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use usbforge::device::scanner::DeviceScanner;
use usbforge::progress::LogLevel;
use usbforge::{
    Device, Filesystem, FlashError, Imager, ImagingHandle, ImagingMode, ImagingOptions,
    PartitionScheme, Phase, TargetFirmware,
};

#[derive(Parser)]
#[command(name = "usbforge")]
#[command(about = "Create bootable USB drives from ISO and raw disk images")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List candidate target devices (external physical disks)
    List {
        /// Emit the device list as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create a bootable drive: partition, format, copy, install boot files
    Flash {
        /// Target device, e.g. disk3 or /dev/disk3
        device: String,

        /// Path to the source image (ISO or raw image)
        image: String,

        /// Filesystem for the data partition (fat32, exfat, hfs)
        #[arg(short, long, default_value = "fat32")]
        filesystem: String,

        /// Partition scheme (mbr, gpt)
        #[arg(short, long, default_value = "mbr")]
        scheme: String,

        /// Target firmware (bios, uefi, both)
        #[arg(long, default_value = "both")]
        firmware: String,

        /// Volume label
        #[arg(short, long, default_value = "USBFORGE")]
        label: String,

        /// Persistence partition size for live Linux, e.g. 4G (0 = off)
        #[arg(short, long, default_value = "0")]
        persistence: String,

        /// Zero the whole disk before formatting (slow)
        #[arg(long)]
        full_format: bool,

        /// Run a read scan for bad blocks before formatting
        #[arg(long)]
        check_bad_blocks: bool,

        /// Bad-block scan passes
        #[arg(long, default_value = "1")]
        bad_block_passes: u8,

        /// Apply legacy BIOS fixups (mark partition active for Linux too)
        #[arg(long)]
        legacy_bios_fixups: bool,

        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Write a raw image byte-for-byte to the device (DD mode)
    Dd {
        /// Target device, e.g. disk3 or /dev/disk3
        device: String,

        /// Path to the raw image
        image: String,

        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.debug {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    match cli.command {
        Commands::List { json } => list_devices(json).await,
        Commands::Flash {
            device,
            image,
            filesystem,
            scheme,
            firmware,
            label,
            persistence,
            full_format,
            check_bad_blocks,
            bad_block_passes,
            legacy_bios_fixups,
            yes,
        } => {
            let options = ImagingOptions {
                device: resolve_identifier(&device).await?,
                image: image.into(),
                mode: ImagingMode::Standard,
                filesystem: parse_filesystem(&filesystem)?,
                scheme: parse_scheme(&scheme)?,
                firmware: parse_firmware(&firmware)?,
                label,
                persistence_bytes: parse_size(&persistence)?,
                quick_format: !full_format,
                bad_block_check: check_bad_blocks,
                bad_block_passes,
                legacy_bios_fixups,
            };
            run_imaging(options, yes).await
        }
        Commands::Dd { device, image, yes } => {
            let options = ImagingOptions {
                device: resolve_identifier(&device).await?,
                image: image.into(),
                mode: ImagingMode::Dd,
                ..Default::default()
            };
            run_imaging(options, yes).await
        }
    }
}

async fn list_devices(json: bool) -> Result<()> {
    let scanner = DeviceScanner::new();
    let devices = scanner
        .try_scan()
        .await?
        .expect("no concurrent scan at startup");

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No external physical disks found.");
        return Ok(());
    }

    println!(
        "{:<10} {:<28} {:>10} {:<10} {}",
        "Device", "Name", "Size", "Removable", "Mounted at"
    );
    println!("{}", "-".repeat(80));
    for device in devices {
        println!(
            "{:<10} {:<28} {:>10} {:<10} {}",
            device.identifier,
            truncate(&device.name, 28),
            human_size(device.size),
            if device.removable { "yes" } else { "no" },
            device
                .mount_point
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn run_imaging(options: ImagingOptions, skip_confirmation: bool) -> Result<()> {
    let target = find_target(&options.device).await?;

    if !target.removable {
        eprintln!(
            "{} {} does not look removable; refusing.",
            style("Error:").red().bold(),
            target.identifier
        );
        std::process::exit(1);
    }

    if !skip_confirmation && !confirm(&target, &options)? {
        println!("Operation cancelled.");
        return Ok(());
    }

    if options.mode == ImagingMode::Dd && !is_root() {
        println!(
            "Note: direct device access may be denied without root; \
             an administrator prompt will appear if escalation is needed."
        );
    }

    let handle = Imager::start(options);
    install_signal_handler(&handle);
    drive_to_completion(handle).await
}

/// Resolve and sanity-check the chosen device against a fresh scan.
async fn find_target(identifier: &str) -> Result<Device> {
    let scanner = DeviceScanner::new();
    let devices = scanner
        .try_scan()
        .await?
        .expect("no concurrent scan at startup");
    devices
        .into_iter()
        .find(|d| d.identifier == identifier)
        .ok_or_else(|| anyhow!("device {} not found among external disks", identifier))
}

/// Accept `disk3`, `/dev/disk3` or a mounted volume path like
/// `/Volumes/MYUSB`; volume paths are resolved to their whole-disk
/// identifier.
async fn resolve_identifier(arg: &str) -> Result<String> {
    if arg.starts_with('/') && !arg.starts_with("/dev/") {
        let ctx = usbforge::OperationContext::new();
        let runner = usbforge::process::ProcessRunner::new(ctx.clone());
        let resolver = usbforge::device::DeviceResolver::new(&runner, ctx);
        return Ok(resolver.resolve_whole_disk(arg).await?);
    }
    Ok(normalize_device(arg))
}

fn confirm(target: &Device, options: &ImagingOptions) -> Result<bool> {
    println!(
        "\n{} ALL data on {} will be destroyed.",
        style("WARNING:").red().bold(),
        target.identifier
    );
    println!("  Device: {} ({})", target.name, human_size(target.size));
    println!("  Image:  {}", options.image.display());
    match options.mode {
        ImagingMode::Standard => println!(
            "  Layout: {:?} / {:?} / {:?}",
            options.filesystem, options.scheme, options.firmware
        ),
        ImagingMode::Dd => println!("  Mode:   raw byte-for-byte write"),
    }
    if options.persistence_bytes > 0 {
        println!("  Persistence: {}", human_size(options.persistence_bytes));
    }

    print!("\nType 'YES' to continue: ");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim() == "YES")
}

/// First SIGINT/SIGTERM cancels the operation; a second one exits hard.
fn install_signal_handler(handle: &ImagingHandle) {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let ctx = handle.context();
    std::thread::spawn(move || {
        let mut signals = Signals::new([SIGINT, SIGTERM]).expect("signal registration");
        let mut seen = 0;
        for _ in signals.forever() {
            seen += 1;
            if seen == 1 {
                eprintln!("\nCancelling (waiting for a safe stop point)...");
                ctx.cancel();
            } else {
                std::process::exit(130);
            }
        }
    });
}

async fn drive_to_completion(mut handle: ImagingHandle) -> Result<()> {
    let bar = ProgressBar::new(1000);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{bar:40.cyan/blue}] {percent:>3}% {msg}")
            .expect("valid template")
            .progress_chars("=> "),
    );

    let mut status = handle.status.clone();
    let mut logs_open = true;
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let phase = status.borrow_and_update().clone();
                render_phase(&bar, &phase);
                if phase.is_terminal() {
                    break;
                }
            }
            log = handle.logs.recv(), if logs_open => {
                match log {
                    Some(message) => {
                        let line = match message.level {
                            LogLevel::Warning => format!("{} {}", style("warning:").yellow(), message.message),
                            LogLevel::Error => format!("{} {}", style("error:").red(), message.message),
                            LogLevel::Info => message.message,
                        };
                        bar.println(line);
                    }
                    None => logs_open = false,
                }
            }
        }
    }
    // Flush any log lines that raced with the terminal phase.
    while let Ok(message) = handle.logs.try_recv() {
        bar.println(message.message);
    }
    bar.finish_and_clear();

    match handle.wait().await {
        Ok(()) => {
            println!("{} drive is ready.", style("Done:").green().bold());
            Ok(())
        }
        Err(FlashError::Cancelled) => {
            println!("{}", style("Cancelled.").yellow().bold());
            std::process::exit(130);
        }
        Err(e) => {
            eprintln!("{} {}", style("Failed:").red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn render_phase(bar: &ProgressBar, phase: &Phase) {
    let message = match phase {
        Phase::Idle => "waiting".to_string(),
        Phase::Preparing => "preparing".to_string(),
        Phase::Unmounting => "unmounting device".to_string(),
        Phase::Formatting => "formatting".to_string(),
        Phase::CheckingBadBlocks { .. } => "checking for bad blocks".to_string(),
        Phase::MountingSource => "reading source image".to_string(),
        Phase::Copying { current, .. } => format!("copying {}", current),
        Phase::InstallingBoot => "installing boot files".to_string(),
        Phase::CreatingPersistence => "creating persistence partition".to_string(),
        Phase::RawWriting { .. } => "writing raw image".to_string(),
        Phase::Completed => "done".to_string(),
        Phase::Failed { reason } => format!("failed: {}", reason),
        Phase::Cancelled => "cancelled".to_string(),
    };
    bar.set_message(message);
    if let Some(progress) = phase.progress() {
        bar.set_position((progress * 1000.0) as u64);
    }
}

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

fn normalize_device(device: &str) -> String {
    device.trim_start_matches("/dev/").to_string()
}

fn parse_filesystem(value: &str) -> Result<Filesystem> {
    match value.to_lowercase().as_str() {
        "fat32" | "fat" | "msdos" => Ok(Filesystem::Fat32),
        "exfat" => Ok(Filesystem::ExFat),
        "hfs" | "hfs+" | "jhfs+" => Ok(Filesystem::Hfs),
        _ => Err(anyhow!("unknown filesystem: {}", value)),
    }
}

fn parse_scheme(value: &str) -> Result<PartitionScheme> {
    match value.to_lowercase().as_str() {
        "mbr" => Ok(PartitionScheme::MBR),
        "gpt" => Ok(PartitionScheme::GPT),
        _ => Err(anyhow!("unknown partition scheme: {}", value)),
    }
}

fn parse_firmware(value: &str) -> Result<TargetFirmware> {
    match value.to_lowercase().as_str() {
        "bios" => Ok(TargetFirmware::Bios),
        "uefi" => Ok(TargetFirmware::Uefi),
        "both" => Ok(TargetFirmware::Both),
        _ => Err(anyhow!("unknown firmware target: {}", value)),
    }
}

/// Parse a size like `4G`, `512M`, `2048K` or a plain byte count.
fn parse_size(value: &str) -> Result<u64> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(0);
    }
    let (digits, multiplier) = match value.chars().last().unwrap().to_ascii_uppercase() {
        'K' => (&value[..value.len() - 1], 1024u64),
        'M' => (&value[..value.len() - 1], 1024 * 1024),
        'G' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        'T' => (&value[..value.len() - 1], 1024u64 * 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    let number: u64 = digits
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid size: {}", value))?;
    number
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow!("size out of range: {}", value))
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}{}", bytes, UNITS[unit])
    } else {
        format!("{:.1}{}", value, UNITS[unit])
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        format!("{}...", &text[..max.saturating_sub(3)])
    }
}
