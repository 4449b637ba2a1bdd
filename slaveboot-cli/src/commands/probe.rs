//! Probe which mode the slave board is currently in.

use anyhow::Result;
use console::style;
use slaveboot::SlaveMode;
use std::time::Duration;

use super::open_updater;

/// Probe command implementation.
pub(crate) fn run(cli: &crate::Cli) -> Result<()> {
    let mut updater = open_updater(cli)?;

    eprintln!("{} Probing slave board...", style("⏳").yellow());
    let mode = updater.slave_mode()?;

    match mode {
        SlaveMode::Application => {
            eprintln!(
                "{} Slave is running its {}",
                style("✓").green(),
                style("application").cyan()
            );
            if let Some((major, minor, patch)) = updater.app_version() {
                eprintln!("  Application version: {major}.{minor}.{patch}");
            }
        },
        SlaveMode::Bootloader => {
            eprintln!(
                "{} Slave is in its {}",
                style("✓").green(),
                style("bootloader").cyan()
            );
            let state = updater.bootloader_state(Duration::from_millis(200))?;
            eprintln!("  Bootloader state: {state:?}");
        },
        SlaveMode::Unknown => {
            eprintln!(
                "{} Slave does not answer on either protocol",
                style("✗").red()
            );
            std::process::exit(1);
        },
    }

    Ok(())
}
