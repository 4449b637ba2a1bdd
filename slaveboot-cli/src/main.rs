//! slaveboot CLI - Command-line tool for updating slave MCU firmware.
//!
//! ## Features
//!
//! - Update slave firmware over the UART shared with the runtime protocol
//! - Inspect firmware image descriptors
//! - Probe which mode the slave board is in
//! - Reset the slave board into its application or bootloader
//! - List available serial ports

use anyhow::Result;
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::debug;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

mod commands;

/// slaveboot - firmware update tool for slave MCUs behind a shared UART.
///
/// Environment variables:
///   SLAVEBOOT_PORT   - Default serial port
///   SLAVEBOOT_BAUD   - Default baud rate (default: 115200)
#[derive(Parser)]
#[command(name = "slaveboot")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port to use.
    #[arg(short, long, global = true, env = "SLAVEBOOT_PORT")]
    port: Option<String>,

    /// Baud rate of the shared UART.
    #[arg(
        short,
        long,
        global = true,
        default_value = "115200",
        env = "SLAVEBOOT_BAUD"
    )]
    baud: u32,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Update the slave firmware from an image file.
    Update {
        /// Path to the firmware image file.
        image: PathBuf,

        /// Bytes of firmware data per download command.
        #[arg(long, default_value = "128")]
        chunk_size: usize,

        /// Skip CRC verification of the image file.
        #[arg(long)]
        skip_verify: bool,

        /// Leave the slave in its bootloader instead of restarting it.
        #[arg(long)]
        no_restart: bool,
    },

    /// Show information about a firmware image file.
    Info {
        /// Path to the firmware image file.
        image: PathBuf,
    },

    /// Probe which mode the slave board is currently in.
    Probe,

    /// Reset the slave board.
    Reset {
        /// Keep the slave in its bootloader after the reset.
        #[arg(long)]
        bootloader: bool,
    },

    /// List available serial ports.
    Ports,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "slaveboot v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    // Ctrl-C aborts long-running library loops gracefully
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&interrupted);
        ctrlc::set_handler(move || {
            flag.store(true, Ordering::Relaxed);
        })?;
    }
    slaveboot::set_interrupt_checker(move || interrupted.load(Ordering::Relaxed));

    match &cli.command {
        Commands::Update {
            image,
            chunk_size,
            skip_verify,
            no_restart,
        } => {
            commands::update::run(&cli, image, *chunk_size, *skip_verify, *no_restart)?;
        },
        Commands::Info { image } => {
            commands::info::run(image)?;
        },
        Commands::Probe => {
            commands::probe::run(&cli)?;
        },
        Commands::Reset { bootloader } => {
            commands::reset::run(&cli, *bootloader)?;
        },
        Commands::Ports => {
            commands::ports::run();
        },
    }

    Ok(())
}

/// Get the serial port name from CLI args.
fn get_port(cli: &Cli) -> Result<String> {
    cli.port
        .clone()
        .ok_or_else(|| anyhow::anyhow!("No serial port specified (use --port or SLAVEBOOT_PORT)"))
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_command_is_valid() {
        // Verifies that all derive macros produce a valid clap Command
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_update() {
        let cli = Cli::try_parse_from([
            "slaveboot",
            "--port",
            "/dev/ttyUSB0",
            "--baud",
            "57600",
            "update",
            "firmware.bin",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cli.baud, 57600);
        assert!(matches!(cli.command, Commands::Update { .. }));
    }

    #[test]
    fn test_cli_parse_update_with_all_options() {
        let cli = Cli::try_parse_from([
            "slaveboot",
            "update",
            "fw.bin",
            "--chunk-size",
            "64",
            "--skip-verify",
            "--no-restart",
        ])
        .unwrap();
        if let Commands::Update {
            image,
            chunk_size,
            skip_verify,
            no_restart,
        } = cli.command
        {
            assert_eq!(image.to_str().unwrap(), "fw.bin");
            assert_eq!(chunk_size, 64);
            assert!(skip_verify);
            assert!(no_restart);
        } else {
            panic!("Expected Update command");
        }
    }

    #[test]
    fn test_cli_parse_info() {
        let cli = Cli::try_parse_from(["slaveboot", "info", "firmware.bin"]).unwrap();
        assert!(matches!(cli.command, Commands::Info { .. }));
    }

    #[test]
    fn test_cli_parse_reset() {
        let cli = Cli::try_parse_from(["slaveboot", "reset", "--bootloader"]).unwrap();
        if let Commands::Reset { bootloader } = cli.command {
            assert!(bootloader);
        } else {
            panic!("Expected Reset command");
        }
    }

    #[test]
    fn test_cli_default_values() {
        let cli = Cli::try_parse_from(["slaveboot", "ports"]).unwrap();
        assert_eq!(cli.baud, 115200);
        assert!(!cli.quiet);
        assert_eq!(cli.verbose, 0);
        assert!(cli.port.is_none());
    }

    #[test]
    fn test_cli_missing_subcommand() {
        assert!(Cli::try_parse_from(["slaveboot"]).is_err());
    }

    #[test]
    fn test_get_port_requires_port() {
        let cli = Cli::try_parse_from(["slaveboot", "probe"]).unwrap();
        assert!(get_port(&cli).is_err());
    }
}
