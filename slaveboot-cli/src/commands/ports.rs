//! List available serial ports.

use console::style;
use slaveboot::{NativePortEnumerator, PortEnumerator};

/// List ports command implementation.
pub(crate) fn run() {
    eprintln!("{}", style("Available serial ports:").bold().underlined());

    let ports = match NativePortEnumerator::list_ports() {
        Ok(ports) => ports,
        Err(e) => {
            eprintln!("  {} Failed to list ports: {e}", style("✗").red());
            return;
        },
    };

    if ports.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return;
    }

    for port in &ports {
        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{}{}",
            style("•").green(),
            style(&port.name).cyan(),
            vid_pid,
            product
        );
    }
}
