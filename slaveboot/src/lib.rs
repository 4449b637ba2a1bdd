//! # slaveboot
//!
//! A library for updating the firmware of slave MCUs over a shared UART.
//!
//! The slave board is reached through the same serial line the runtime
//! protocol uses, so the bootloader protocol implemented here is framed in a
//! way that coexists with other traffic. The crate provides:
//!
//! - Data-link framing with byte stuffing and an LRC16 checksum
//! - A request/response transport with exchange IDs and retransmission
//! - The firmware-update command set of the slave bootloader
//! - Firmware image descriptor parsing and CRC32 verification
//! - An update orchestrator driving a whole session
//!
//! ## Example
//!
//! ```rust,no_run
//! use slaveboot::{
//!     Commander, DataLink, FirmwareChunk, FirmwareDescriptor, NativePort, Transport, Updater,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = std::fs::read("firmware.bin")?;
//!     let descriptor = FirmwareDescriptor::from_image(&image)?;
//!     descriptor.verify_image_crc(&image)?;
//!
//!     let port = NativePort::open_simple("/dev/ttyUSB0", 115200)?;
//!     let commander = Commander::new(Transport::new(DataLink::new(port)));
//!     let mut updater = Updater::new(commander, slaveboot::NoRuntime);
//!
//!     updater.enter_bootloader()?;
//!     updater.prepare_update(&descriptor)?;
//!     updater.start_update()?;
//!     for (i, data) in image[..descriptor.size as usize].chunks(128).enumerate() {
//!         let chunk = FirmwareChunk {
//!             offset: (i * 128) as u32,
//!             data,
//!         };
//!         updater.program_chunk(&chunk)?;
//!     }
//!     updater.finalize_update(true)?;
//!     updater.exit_bootloader()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};
use std::time::Duration;

pub mod error;
pub mod image;
pub mod port;
pub mod protocol;
pub mod updater;

#[cfg(test)]
pub(crate) mod testutil;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

/// Runtime link stub for setups where no runtime protocol shares the UART.
///
/// Probing and rebooting always fail, so mode detection falls through to the
/// bootloader protocol and the slave must already be in its bootloader (or be
/// power-cycled into it).
pub struct NoRuntime;

impl updater::RuntimeLink for NoRuntime {
    fn probe(&mut self, _timeout: Duration) -> bool {
        false
    }

    fn app_version(&mut self, _timeout: Duration) -> Option<(u8, u8, u8)> {
        None
    }

    fn request_reboot(&mut self, _timeout: Duration) -> bool {
        false
    }

    fn set_enabled(&mut self, _enabled: bool) {}
}

// Re-exports for convenience
pub use {
    error::{Error, Result},
    image::descriptor::{FirmwareDescriptor, FirmwareType},
    port::{NativePort, NativePortEnumerator, Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::{
        command::{BootloaderState, Commander, FirmwareChunk, FirmwareInfo, ResultCode},
        datalink::{DataLink, DeframeEvent, Deframer, encode_frame},
        transport::Transport,
    },
    updater::{RuntimeLink, SessionState, SlaveMode, Updater, UpdaterConfig},
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_checker_default_false() {
        test_set_interrupted(false);
        assert!(!is_interrupted_requested());
    }

    #[test]
    fn test_interrupt_checker_toggle_true_false() {
        test_set_interrupted(true);
        assert!(is_interrupted_requested());

        test_set_interrupted(false);
        assert!(!is_interrupted_requested());
    }
}
