//! Firmware image handling.

pub mod descriptor;

pub use descriptor::{FirmwareDescriptor, FirmwareType, DESC_LEN, DESC_OFFSET};
