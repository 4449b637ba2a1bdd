//! Bootloader protocol implementation.
//!
//! The protocol is layered: [`datalink`] frames bytes on the shared UART,
//! [`transport`] adds message kinds and exchange IDs, and [`command`] encodes
//! the firmware-update commands themselves. [`checksum`] holds the checksum
//! routines the layers and the image verification share.

pub mod checksum;
pub mod command;
pub mod datalink;
pub mod transport;

pub use command::{BootloaderState, Commander, FirmwareChunk, FirmwareInfo, ResultCode};
pub use datalink::{DataLink, DeframeEvent, Deframer};
pub use transport::Transport;
