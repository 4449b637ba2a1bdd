//! Reset the slave board.

use anyhow::Result;
use console::style;

use super::open_updater;

/// Reset command implementation.
pub(crate) fn run(cli: &crate::Cli, bootloader: bool) -> Result<()> {
    let mut updater = open_updater(cli)?;

    let target = if bootloader {
        "bootloader"
    } else {
        "application"
    };
    eprintln!(
        "{} Resetting slave board into its {}...",
        style("🔄").cyan(),
        style(target).cyan()
    );

    updater.reset(bootloader)?;
    eprintln!("{} Reset request sent", style("✓").green());

    Ok(())
}
