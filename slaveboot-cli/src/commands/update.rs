//! Update the slave firmware from an image file.

use anyhow::{Context, Result, bail};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use slaveboot::protocol::transport;
use slaveboot::{FirmwareChunk, FirmwareDescriptor, ResultCode, SlaveMode};
use std::path::Path;

use super::open_updater;

/// Largest chunk that still fits a download command message.
const MAX_CHUNK_SIZE: usize = transport::MAX_PAYLOAD_LEN - 8;

/// Update command implementation.
pub(crate) fn run(
    cli: &crate::Cli,
    image_path: &Path,
    chunk_size: usize,
    skip_verify: bool,
    no_restart: bool,
) -> Result<()> {
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        bail!("Chunk size must be between 1 and {MAX_CHUNK_SIZE} bytes");
    }

    if !cli.quiet {
        eprintln!(
            "{} Loading firmware image {}",
            style("📦").cyan(),
            image_path.display()
        );
    }

    let image = std::fs::read(image_path)
        .with_context(|| format!("Failed to read image file {}", image_path.display()))?;
    let descriptor = FirmwareDescriptor::from_image(&image)
        .with_context(|| format!("No firmware descriptor in {}", image_path.display()))?;
    descriptor.validate()?;

    if !skip_verify {
        descriptor.verify_image_crc(&image)?;
        if !cli.quiet {
            eprintln!("{} Image CRC check passed", style("✓").green());
        }
    }

    if !cli.quiet {
        eprintln!(
            "{} {} firmware {} ({} bytes)",
            style("ℹ").blue(),
            descriptor.fw_type,
            style(descriptor.version()).cyan(),
            descriptor.size
        );
    }

    let mut updater = open_updater(cli)?;

    // Make sure the slave is in its bootloader
    if !cli.quiet {
        eprintln!("{} Waiting for slave bootloader...", style("⏳").yellow());
    }
    if updater.slave_mode()? != SlaveMode::Bootloader {
        updater
            .enter_bootloader()
            .context("Slave did not enter its bootloader")?;
    }
    if !cli.quiet {
        eprintln!("{} Slave bootloader is ready", style("✓").green());
    }

    check_result("prepare", updater.prepare_update(&descriptor)?)?;
    check_result("start", updater.start_update()?)?;

    // Download the firmware chunk by chunk
    let pb = if cli.quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(u64::from(descriptor.size));
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb
    };

    let data = &image[..descriptor.size as usize];
    for (i, chunk_data) in data.chunks(chunk_size).enumerate() {
        if slaveboot::is_interrupted_requested() {
            pb.abandon_with_message("interrupted");
            updater.finalize_update(false)?;
            bail!("Firmware update canceled");
        }

        let chunk = FirmwareChunk {
            offset: (i * chunk_size) as u32,
            data: chunk_data,
        };
        let result = updater.program_chunk(&chunk)?;
        if !result.is_accepted() {
            pb.abandon_with_message("failed");
            updater.finalize_update(false)?;
            bail!("Slave rejected firmware data at offset {}: {result:?}", chunk.offset);
        }
        pb.set_position(u64::from(updater.progress().0));
    }
    pb.finish_with_message("done");

    check_result("finalize", updater.finalize_update(true)?)?;

    if !cli.quiet {
        eprintln!("{} Firmware installed", style("✓").green());
    }

    if no_restart {
        if !cli.quiet {
            eprintln!("{} Slave left in its bootloader", style("ℹ").blue());
        }
    } else {
        if !cli.quiet {
            eprintln!("{} Restarting slave application", style("🔄").cyan());
        }
        updater.reset(false)?;
    }

    if !cli.quiet {
        eprintln!("\n{} Firmware update completed", style("🎉").green().bold());
    }

    Ok(())
}

/// Turn a rejection into an error, surface warnings, let OK pass.
fn check_result(step: &str, result: ResultCode) -> Result<()> {
    if !result.is_accepted() {
        bail!("Slave rejected the {step} command: {result:?}");
    }
    if result.is_warning() {
        eprintln!(
            "{} Slave accepted the {step} command with a warning: {result:?}",
            style("⚠").yellow()
        );
    }
    Ok(())
}
