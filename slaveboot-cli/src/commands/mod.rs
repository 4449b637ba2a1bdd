//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.

pub(crate) mod info;
pub(crate) mod ports;
pub(crate) mod probe;
pub(crate) mod reset;
pub(crate) mod update;

use anyhow::{Context, Result};
use slaveboot::{Commander, DataLink, NativePort, Transport, Updater};

/// Open the serial port and build an updater over it.
///
/// No runtime protocol stack runs on the host side, so the slave has to be
/// reachable on its bootloader protocol (it keeps listening for bootloader
/// frames even while the application runs).
pub(crate) fn open_updater(cli: &crate::Cli) -> Result<Updater<NativePort, slaveboot::NoRuntime>> {
    let port_name = crate::get_port(cli)?;
    let port = NativePort::open_simple(&port_name, cli.baud)
        .with_context(|| format!("Failed to open serial port {port_name}"))?;

    let commander = Commander::new(Transport::new(DataLink::new(port)));
    Ok(Updater::new(commander, slaveboot::NoRuntime))
}
