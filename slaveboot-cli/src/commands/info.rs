//! Show information about a firmware image file.

use anyhow::{Context, Result};
use console::style;
use slaveboot::FirmwareDescriptor;
use std::path::Path;

/// Info command implementation.
pub(crate) fn run(image_path: &Path) -> Result<()> {
    let image = std::fs::read(image_path)
        .with_context(|| format!("Failed to read image file {}", image_path.display()))?;

    let descriptor = FirmwareDescriptor::from_image(&image)
        .with_context(|| format!("No firmware descriptor in {}", image_path.display()))?;

    eprintln!("{}", style("Firmware Image Information").bold().underlined());
    eprintln!("  Description: {}", style(&descriptor.description).cyan());
    eprintln!("  Type:        {}", descriptor.fw_type);
    eprintln!("  Revision:    {}", descriptor.version());
    eprintln!("  Project:     0x{:04X}", descriptor.project_id);
    eprintln!("  Variant:     0x{:04X}", descriptor.variant_id);
    eprintln!("  Start addr:  0x{:08X}", descriptor.start_addr);
    eprintln!("  Run addr:    0x{:08X}", descriptor.run_addr);
    eprintln!("  Size:        {} bytes", descriptor.size);
    eprintln!("  CRC32:       0x{:08X}", descriptor.crc32);
    if !descriptor.build_time.is_empty() {
        eprintln!("  Built:       {}", descriptor.build_time);
    }

    match descriptor.validate() {
        Ok(()) => eprintln!("  Valid:       {}", style("yes").green()),
        Err(e) => eprintln!("  Valid:       {} ({e})", style("no").red()),
    }
    match descriptor.verify_image_crc(&image) {
        Ok(()) => eprintln!("  CRC check:   {}", style("passed").green()),
        Err(e) => eprintln!("  CRC check:   {} ({e})", style("failed").red()),
    }

    Ok(())
}
