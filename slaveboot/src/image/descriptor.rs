//! Firmware descriptor embedded in slave firmware images.
//!
//! Every slave firmware carries a 132-byte descriptor at a fixed offset that
//! identifies the firmware and protects it with a CRC32 over the whole image.
//! The descriptor is read before anything goes over the wire so obviously
//! broken images are rejected locally.

use byteorder::{LittleEndian, ReadBytesExt};
use std::fmt;
use std::io::Cursor;

use crate::error::{Error, Result};
use crate::protocol::checksum::crc32_continue;
use crate::protocol::command::FirmwareInfo;

/// Offset of the descriptor within a firmware image.
pub const DESC_OFFSET: usize = 0x200;

/// Length in bytes of the descriptor.
pub const DESC_LEN: usize = 132;

/// Recognizer value marking a valid descriptor.
pub const DESC_RECOGNIZER: u32 = 0xAA55_CC33;

/// Descriptor revision this implementation understands.
const DESC_REVISION: u8 = 1;

/// Project ID of the slave board family.
pub const PROJECT_ID: u16 = 0x0001;

/// Wildcard project ID accepted by every board.
pub const PROJECT_ID_ANY: u16 = 0xFFFF;

/// Offset of the CRC32 word within the descriptor.
const CRC_OFFSET: usize = 28;

/// Flash start address of the bootloader firmware.
const BL_START_ADDR: u32 = 0x0800_0000;

/// Maximum size of a bootloader firmware.
const BL_MAX_SIZE: u32 = 64 * 1024;

/// Flash start address of the application firmware.
const APP_START_ADDR: u32 = 0x0801_0000;

/// Maximum size of an application firmware.
const APP_MAX_SIZE: u32 = 512 * 1024;

/// Type of a slave firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FirmwareType {
    /// Bootloader firmware.
    Bootloader = 0,
    /// Application firmware.
    Application = 1,
}

impl fmt::Display for FirmwareType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bootloader => write!(f, "bootloader"),
            Self::Application => write!(f, "application"),
        }
    }
}

/// Firmware descriptor parsed from an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareDescriptor {
    /// Type of the firmware.
    pub fw_type: FirmwareType,
    /// Firmware major revision.
    pub major: u8,
    /// Firmware minor revision.
    pub minor: u8,
    /// Firmware patch revision.
    pub patch: u8,
    /// Build number of this revision.
    pub build_number: u32,
    /// Project ID the firmware is built for.
    pub project_id: u16,
    /// Hardware variant the firmware is built for.
    pub variant_id: u16,
    /// Flash address the firmware is linked at.
    pub start_addr: u32,
    /// Size in bytes of the firmware.
    pub size: u32,
    /// CRC32 of the whole firmware (the CRC word itself excluded).
    pub crc32: u32,
    /// Entry address of the firmware.
    pub run_addr: u32,
    /// Build timestamp string.
    pub build_time: String,
    /// Human-readable firmware description.
    pub description: String,
}

impl FirmwareDescriptor {
    /// Parse a descriptor from its 132-byte binary form.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < DESC_LEN {
            return Err(Error::Descriptor(format!(
                "descriptor truncated ({} of {DESC_LEN} bytes)",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);
        let recognizer = cursor.read_u32::<LittleEndian>()?;
        if recognizer != DESC_RECOGNIZER {
            return Err(Error::Descriptor(format!(
                "descriptor recognizer {recognizer:#010x} does not match {DESC_RECOGNIZER:#010x}"
            )));
        }
        let revision = cursor.read_u8()?;
        if revision != DESC_REVISION {
            return Err(Error::Descriptor(format!(
                "unsupported descriptor revision {revision}"
            )));
        }

        let fw_type = match cursor.read_u8()? {
            0 => FirmwareType::Bootloader,
            1 => FirmwareType::Application,
            other => {
                return Err(Error::Descriptor(format!("unknown firmware type {other}")));
            },
        };
        let major = cursor.read_u8()?;
        let minor = cursor.read_u8()?;
        let patch = cursor.read_u8()?;
        let build_number = u32::from(cursor.read_u8()?)
            | u32::from(cursor.read_u8()?) << 8
            | u32::from(cursor.read_u8()?) << 16;
        cursor.set_position(cursor.position() + 4); // reserved
        let project_id = cursor.read_u16::<LittleEndian>()?;
        let variant_id = cursor.read_u16::<LittleEndian>()?;
        let start_addr = cursor.read_u32::<LittleEndian>()?;
        let size = cursor.read_u32::<LittleEndian>()?;
        let crc32 = cursor.read_u32::<LittleEndian>()?;
        let run_addr = cursor.read_u32::<LittleEndian>()?;

        let build_time = nul_terminated(&data[36..68]);
        let description = nul_terminated(&data[68..132]);

        Ok(Self {
            fw_type,
            major,
            minor,
            patch,
            build_number,
            project_id,
            variant_id,
            start_addr,
            size,
            crc32,
            run_addr,
            build_time,
            description,
        })
    }

    /// Parse the descriptor out of a complete firmware image.
    pub fn from_image(image: &[u8]) -> Result<Self> {
        if image.len() < DESC_OFFSET + DESC_LEN {
            return Err(Error::Descriptor(format!(
                "image too small to contain a descriptor ({} bytes)",
                image.len()
            )));
        }
        Self::parse(&image[DESC_OFFSET..DESC_OFFSET + DESC_LEN])
    }

    /// Check the descriptor fields for consistency.
    pub fn validate(&self) -> Result<()> {
        let (start_addr, max_size) = match self.fw_type {
            FirmwareType::Bootloader => (BL_START_ADDR, BL_MAX_SIZE),
            FirmwareType::Application => (APP_START_ADDR, APP_MAX_SIZE),
        };
        if self.start_addr != start_addr {
            return Err(Error::Descriptor(format!(
                "{} firmware must start at {start_addr:#010x}, not {:#010x}",
                self.fw_type, self.start_addr
            )));
        }
        if self.size == 0 || self.size > max_size {
            return Err(Error::Descriptor(format!(
                "invalid {} firmware size {} (max {max_size})",
                self.fw_type, self.size
            )));
        }
        if self.project_id != PROJECT_ID && self.project_id != PROJECT_ID_ANY {
            return Err(Error::Descriptor(format!(
                "firmware is built for project {:#06x}, not {PROJECT_ID:#06x}",
                self.project_id
            )));
        }
        Ok(())
    }

    /// Verify the image data against the descriptor's CRC32.
    ///
    /// The checksum covers the descriptor's declared size with the CRC word
    /// itself skipped.
    pub fn verify_image_crc(&self, image: &[u8]) -> Result<()> {
        let size = self.size as usize;
        if image.len() < size {
            return Err(Error::Descriptor(format!(
                "image is {} bytes but the descriptor declares {size}",
                image.len()
            )));
        }

        let crc_word = DESC_OFFSET + CRC_OFFSET;
        let state = crc32_continue(0xFFFF_FFFF, &image[..crc_word]);
        let state = crc32_continue(state, &image[crc_word + 4..size]);
        let actual = state ^ 0xFFFF_FFFF;

        if actual != self.crc32 {
            return Err(Error::CrcMismatch {
                expected: self.crc32,
                actual,
            });
        }
        Ok(())
    }

    /// Firmware information to announce to the slave board.
    pub fn fw_info(&self) -> FirmwareInfo {
        FirmwareInfo {
            fw_type: self.fw_type as u8,
            project_id: self.project_id,
            variant_id: self.variant_id,
            major: self.major,
            minor: self.minor,
            patch: self.patch,
            size: self.size,
            crc32: self.crc32,
        }
    }

    /// Firmware revision as a display string.
    pub fn version(&self) -> String {
        format!(
            "{}.{}.{}+{}",
            self.major, self.minor, self.patch, self.build_number
        )
    }
}

fn nul_terminated(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}
