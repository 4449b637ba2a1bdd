//! Checksum routines used by the bootloader protocol.
//!
//! Two algorithms live here: the 16-bit LRC that protects each data-link
//! frame, and the CRC32 used to verify whole firmware images against the
//! checksum recorded in their descriptor.

/// Calculate the 16-bit LRC of a block of data.
///
/// The checksum is the one's complement of the wrapping byte sum. A frame is
/// checksummed with its checksum field zeroed, so the receiver recomputes the
/// sum the same way before comparing.
pub fn lrc16(data: &[u8]) -> u16 {
    let mut sum: u16 = 0;
    for &byte in data {
        sum = sum.wrapping_add(u16::from(byte));
    }
    !sum
}

/// Calculate CRC32 (IEEE 802.3, reflected) of a block of data.
///
/// This matches the checksum the firmware build embeds in the image
/// descriptor.
pub fn crc32(data: &[u8]) -> u32 {
    crc32_continue(0xFFFF_FFFF, data) ^ 0xFFFF_FFFF
}

/// Feed more data into a running CRC32 computation.
///
/// `state` is the raw register value (start from `0xFFFF_FFFF`); the caller
/// applies the final XOR. This allows checksumming an image in pieces so the
/// descriptor's own CRC word can be skipped.
pub fn crc32_continue(state: u32, data: &[u8]) -> u32 {
    let mut crc = state;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}
