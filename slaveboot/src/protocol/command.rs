//! Command layer of the bootloader protocol.
//!
//! Encodes firmware-update commands into transport messages:
//!
//! ```text
//! +-----+--------+----------------+
//! | CID | Status |      Data      |
//! +-----+--------+----------------+
//! | 1   | 1      |    variable    |
//! +-----+--------+----------------+
//! ```
//!
//! Requests carry status 0 and expect a response echoing the command ID with
//! an OK status and a single result-code byte. Posts (scan, reset) get no
//! response; the scan post is answered out-of-band by a notification
//! carrying the bootloader state, which callers pick up via
//! [`Commander::poll`] and [`Commander::take_bootloader_state`].

use byteorder::{LittleEndian, WriteBytesExt};
use log::{error, info, warn};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::transport::Transport;

/// Default timeout for a request message.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(200);

/// Timeout for the start command (the slave erases flash before answering).
const START_TIMEOUT: Duration = Duration::from_millis(4000);

/// Timeout for a download command (the slave writes flash before answering).
const DOWNLOAD_TIMEOUT: Duration = Duration::from_millis(1500);

/// Length in bytes of the command message header.
const MSG_HEADER_LEN: usize = 2;

/// Command IDs.
mod cid {
    /// Prepares the slave board for a firmware update.
    pub const FW_PREPARE: u8 = 0x00;
    /// Starts the firmware update on the slave board.
    pub const FW_START: u8 = 0x01;
    /// Downloads one chunk of firmware data to the slave board.
    pub const FW_DOWNLOAD: u8 = 0x02;
    /// Finalizes or cancels the firmware update on the slave board.
    pub const FW_FINALIZE: u8 = 0x03;
    /// Post asking the slave bootloader to announce its state.
    pub const SCAN_POST: u8 = 0x80;
    /// Post resetting the slave board.
    pub const DEV_RESET_POST: u8 = 0x81;
    /// Notification carrying the slave bootloader state.
    pub const SCAN_NOTIFY: u8 = 0xC0;
}

/// Exchange status codes.
mod status {
    /// Okay, no error occurred.
    pub const OK: u8 = 0x00;
}

/// Result code of firmware update operations.
///
/// Values below `0x80` indicate acceptance (possibly with a warning);
/// `0x80` and above are rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    /// The operation was successful.
    Ok = 0x00,
    /// The given firmware is older than the running firmware.
    WarnOlderVersion = 0x01,
    /// The given firmware has the same version as the running firmware.
    WarnSameVersion = 0x02,
    /// The variant ID of the given firmware does not match.
    WarnVariantMismatch = 0x03,
    /// The given firmware already exists on the slave board.
    WarnAlreadyExists = 0x04,
    /// Unknown error.
    ErrUnknown = 0x80,
    /// The given firmware is not compatible with the slave board.
    ErrNotCompatible = 0x81,
    /// The given firmware is too big.
    ErrSizeTooBig = 0x82,
    /// The given firmware was not accepted.
    ErrRejected = 0x83,
    /// The firmware update process has not been started yet.
    ErrUpdateNotStarted = 0x84,
    /// The previous firmware update process is not done yet.
    ErrUpdateNotDone = 0x85,
    /// The given firmware data is invalid.
    ErrInvalidData = 0x86,
    /// Validation of the downloaded firmware failed.
    ErrValidationFailed = 0x87,
    /// Too much time passed between two consecutive download chunks.
    ErrDownloadTimeout = 0x88,
    /// Installation of the bootloader firmware failed.
    ErrInstallBootloaderFailed = 0x89,
    /// The application firmware is corrupt and cannot be used.
    ErrAppCorrupt = 0x8A,
    /// Erasing flash failed before the download.
    ErrErasingFailed = 0x90,
    /// Writing flash failed during the download.
    ErrWritingFailed = 0x91,
}

impl ResultCode {
    /// Whether this code indicates acceptance (OK or a warning).
    pub fn is_accepted(self) -> bool {
        (self as u8) < 0x80
    }

    /// Whether this code is a warning (accepted, but worth surfacing).
    pub fn is_warning(self) -> bool {
        let code = self as u8;
        code > 0x00 && code < 0x80
    }
}

impl From<u8> for ResultCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Ok,
            0x01 => Self::WarnOlderVersion,
            0x02 => Self::WarnSameVersion,
            0x03 => Self::WarnVariantMismatch,
            0x04 => Self::WarnAlreadyExists,
            0x81 => Self::ErrNotCompatible,
            0x82 => Self::ErrSizeTooBig,
            0x83 => Self::ErrRejected,
            0x84 => Self::ErrUpdateNotStarted,
            0x85 => Self::ErrUpdateNotDone,
            0x86 => Self::ErrInvalidData,
            0x87 => Self::ErrValidationFailed,
            0x88 => Self::ErrDownloadTimeout,
            0x89 => Self::ErrInstallBootloaderFailed,
            0x8A => Self::ErrAppCorrupt,
            0x90 => Self::ErrErasingFailed,
            0x91 => Self::ErrWritingFailed,
            _ => Self::ErrUnknown,
        }
    }
}

/// State of the slave board while it runs the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BootloaderState {
    /// No valid state has been reported.
    Reserved = 0x00,
    /// The bootloader is waiting for a new firmware.
    Idle = 0x01,
    /// The bootloader is downloading firmware onto flash.
    Download = 0x02,
    /// A bootloader firmware is being installed.
    Installing = 0x03,
    /// A bootloader firmware has been installed.
    Installed = 0x04,
    /// The firmware update finished successfully.
    DoneOk = 0x05,
    /// The firmware update failed.
    DoneErr = 0x80,
}

impl From<u8> for BootloaderState {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Self::Idle,
            0x02 => Self::Download,
            0x03 => Self::Installing,
            0x04 => Self::Installed,
            0x05 => Self::DoneOk,
            0x80 => Self::DoneErr,
            _ => Self::Reserved,
        }
    }
}

/// Information of a slave firmware to be updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareInfo {
    /// Firmware type: 0 = bootloader, 1 = application.
    pub fw_type: u8,
    /// Project ID of the firmware.
    pub project_id: u16,
    /// Variant ID of the firmware.
    pub variant_id: u16,
    /// Firmware major revision.
    pub major: u8,
    /// Firmware minor revision.
    pub minor: u8,
    /// Firmware patch revision.
    pub patch: u8,
    /// Firmware size in bytes.
    pub size: u32,
    /// CRC32 of the whole firmware image (CRC word excluded).
    pub crc32: u32,
}

/// One chunk of firmware data to program.
#[derive(Debug, Clone, Copy)]
pub struct FirmwareChunk<'a> {
    /// Offset of this chunk in the firmware image.
    pub offset: u32,
    /// Firmware data of this chunk.
    pub data: &'a [u8],
}

/// Command channel to the slave bootloader.
pub struct Commander<P: Port> {
    transport: Transport<P>,
    bl_state: Option<BootloaderState>,
}

impl<P: Port> Commander<P> {
    /// Create a commander over the given transport channel.
    pub fn new(transport: Transport<P>) -> Self {
        Self {
            transport,
            bl_state: None,
        }
    }

    /// Access the underlying transport channel.
    pub fn transport_mut(&mut self) -> &mut Transport<P> {
        &mut self.transport
    }

    /// Pump the channel and absorb pending notifications.
    pub fn poll(&mut self) -> Result<()> {
        self.transport.poll()?;
        while let Some(notification) = self.transport.take_notification() {
            self.process_notification(&notification);
        }
        Ok(())
    }

    /// Take the most recently notified bootloader state, if any.
    pub fn take_bootloader_state(&mut self) -> Option<BootloaderState> {
        self.bl_state.take()
    }

    /// Ask the slave bootloader to announce its state.
    ///
    /// The answer arrives as a notification; pump with [`Commander::poll`]
    /// and read it via [`Commander::take_bootloader_state`].
    pub fn check_bootloader_state(&mut self) -> Result<()> {
        self.transport.send_post(&[cid::SCAN_POST, status::OK])
    }

    /// Reset the slave board.
    ///
    /// With `stay_in_bootloader` the slave reboots into its bootloader,
    /// otherwise it boots the application firmware.
    pub fn reset(&mut self, stay_in_bootloader: bool) -> Result<()> {
        let mode = if stay_in_bootloader { 0x00 } else { 0x01 };
        self.transport
            .send_post(&[cid::DEV_RESET_POST, status::OK, mode])
    }

    /// Prepare the slave board for a firmware update.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn prepare_update(&mut self, info: &FirmwareInfo) -> Result<ResultCode> {
        let mut data = Vec::with_capacity(17);
        data.push(info.fw_type);
        data.write_u16::<LittleEndian>(info.project_id).unwrap();
        data.write_u16::<LittleEndian>(info.variant_id).unwrap();
        data.push(info.major);
        data.push(info.minor);
        data.push(info.patch);
        data.write_u32::<LittleEndian>(info.size).unwrap();
        data.write_u32::<LittleEndian>(info.crc32).unwrap();

        self.result_request(cid::FW_PREPARE, &data, DEFAULT_TIMEOUT)
    }

    /// Start the firmware update on the slave board.
    pub fn start_update(&mut self) -> Result<ResultCode> {
        self.result_request(cid::FW_START, &[], START_TIMEOUT)
    }

    /// Download one chunk of firmware data to the slave board.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    #[allow(clippy::cast_possible_truncation)] // chunk size is bounded by the message size
    pub fn download_firmware(&mut self, chunk: &FirmwareChunk<'_>) -> Result<ResultCode> {
        let mut data = Vec::with_capacity(6 + chunk.data.len());
        data.write_u32::<LittleEndian>(chunk.offset).unwrap();
        data.write_u16::<LittleEndian>(chunk.data.len() as u16).unwrap();
        data.extend_from_slice(chunk.data);

        self.result_request(cid::FW_DOWNLOAD, &data, DOWNLOAD_TIMEOUT)
    }

    /// Finalize or cancel the firmware update on the slave board.
    pub fn finalize_update(&mut self, canceled: bool) -> Result<ResultCode> {
        let arg = if canceled { 0x00 } else { 0x01 };
        self.result_request(cid::FW_FINALIZE, &[arg], DEFAULT_TIMEOUT)
    }

    /// Send a request and decode the single result-code byte it returns.
    fn result_request(&mut self, command: u8, data: &[u8], timeout: Duration) -> Result<ResultCode> {
        let response = self.request(command, data, timeout)?;
        if response.len() != 1 {
            error!("Invalid response for request {command:#04x}");
            return Err(Error::InvalidResponse {
                command,
                status: status::OK,
                len: response.len() + MSG_HEADER_LEN,
            });
        }
        Ok(ResultCode::from(response[0]))
    }

    /// Send a request message and validate the response shape.
    ///
    /// Returns the response data with the command header stripped.
    fn request(&mut self, command: u8, data: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let mut msg = Vec::with_capacity(MSG_HEADER_LEN + data.len());
        msg.push(command);
        msg.push(status::OK);
        msg.extend_from_slice(data);

        let response = self.transport.send_request(&msg, timeout)?;
        if response.len() < MSG_HEADER_LEN || response[0] != command {
            error!(
                "Received invalid response of request {command:#04x} (response length = {}, CID = {:#04x})",
                response.len(),
                response.first().copied().unwrap_or(0)
            );
            return Err(Error::InvalidResponse {
                command,
                status: response.get(1).copied().unwrap_or(0),
                len: response.len(),
            });
        }
        if response[1] != status::OK {
            error!(
                "Request {command:#04x} failed. Error code: {:#04x}",
                response[1]
            );
            return Err(Error::InvalidResponse {
                command,
                status: response[1],
                len: response.len(),
            });
        }

        Ok(response[MSG_HEADER_LEN..].to_vec())
    }

    fn process_notification(&mut self, msg: &[u8]) {
        if msg.len() < MSG_HEADER_LEN {
            warn!("Dropping notification of invalid length {}", msg.len());
            return;
        }
        match msg[0] {
            cid::SCAN_NOTIFY => {
                if msg.len() - MSG_HEADER_LEN != 1 {
                    error!("Invalid scan notification received");
                    return;
                }
                let state = BootloaderState::from(msg[2]);
                info!("Slave bootloader reported state {state:?}");
                self.bl_state = Some(state);
            },
            other => {
                warn!("Ignoring notification with CID {other:#04x}");
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::datalink::{DataLink, encode_frame};
    use crate::testutil::MockPort;

    fn commander_with_port(port: MockPort) -> Commander<MockPort> {
        Commander::new(Transport::new(DataLink::new(port)))
    }

    /// Frame a response message for the given exchange ID.
    fn response(eid: u8, command: u8, status_byte: u8, data: &[u8]) -> Vec<u8> {
        let mut msg = vec![eid, 1, command, status_byte];
        msg.extend_from_slice(data);
        encode_frame(&msg).unwrap()
    }

    fn notify(eid: u8, data: &[u8]) -> Vec<u8> {
        let mut msg = vec![eid, 3];
        msg.extend_from_slice(data);
        encode_frame(&msg).unwrap()
    }

    #[test]
    fn test_prepare_update_encoding() {
        let mut port = MockPort::new();
        port.script_reply(&response(0, 0x00, 0x00, &[0x00]));

        let info = FirmwareInfo {
            fw_type: 1,
            project_id: 0x0001,
            variant_id: 0x0203,
            major: 2,
            minor: 5,
            patch: 9,
            size: 0x00012345,
            crc32: 0xDEADBEEF,
        };
        let mut commander = commander_with_port(port);
        let result = commander.prepare_update(&info).unwrap();
        assert_eq!(result, ResultCode::Ok);

        let writes = commander.transport_mut().link_mut().port_mut().writes();
        // Frame header (8) + transport header (2) precede the command message
        let msg = &writes[0][10..];
        assert_eq!(msg[0], 0x00); // CID
        assert_eq!(msg[1], 0x00); // status
        assert_eq!(msg[2], 1); // fw_type
        assert_eq!(&msg[3..5], &[0x01, 0x00]); // project ID, LE
        assert_eq!(&msg[5..7], &[0x03, 0x02]); // variant ID, LE
        assert_eq!(&msg[7..10], &[2, 5, 9]); // version
        assert_eq!(&msg[10..14], &[0x45, 0x23, 0x01, 0x00]); // size, LE
        assert_eq!(&msg[14..18], &[0xEF, 0xBE, 0xAD, 0xDE]); // CRC32, LE
    }

    #[test]
    fn test_download_encoding() {
        let mut port = MockPort::new();
        port.script_reply(&response(0, 0x02, 0x00, &[0x00]));

        let chunk = FirmwareChunk {
            offset: 0x00000480,
            data: &[0xAA, 0xBB, 0xCC],
        };
        let mut commander = commander_with_port(port);
        commander.download_firmware(&chunk).unwrap();

        let writes = commander.transport_mut().link_mut().port_mut().writes();
        let msg = &writes[0][10..];
        assert_eq!(msg[0], 0x02);
        assert_eq!(&msg[2..6], &[0x80, 0x04, 0x00, 0x00]); // offset, LE
        assert_eq!(&msg[6..8], &[0x03, 0x00]); // data length, LE
        assert_eq!(&msg[8..11], &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_finalize_and_cancel_argument() {
        let mut port = MockPort::new();
        port.script_reply(&response(0, 0x03, 0x00, &[0x00]));
        port.script_reply(&response(1, 0x03, 0x00, &[0x00]));

        let mut commander = commander_with_port(port);
        commander.finalize_update(true).unwrap();
        commander.finalize_update(false).unwrap();

        let writes = commander.transport_mut().link_mut().port_mut().writes();
        assert_eq!(writes[0][10..13], [0x03, 0x00, 0x00]); // canceled
        assert_eq!(writes[1][10..13], [0x03, 0x00, 0x01]); // finalized
    }

    #[test]
    fn test_reset_post_boot_mode_byte() {
        let mut commander = commander_with_port(MockPort::new());
        commander.reset(true).unwrap();
        commander.reset(false).unwrap();

        let writes = commander.transport_mut().link_mut().port_mut().writes();
        assert_eq!(writes[0][10..13], [0x81, 0x00, 0x00]); // stay in bootloader
        assert_eq!(writes[1][10..13], [0x81, 0x00, 0x01]); // boot application
    }

    #[test]
    fn test_response_cid_mismatch_is_error() {
        let mut port = MockPort::new();
        port.script_reply(&response(0, 0x55, 0x00, &[0x00]));

        let mut commander = commander_with_port(port);
        let result = commander.start_update();
        assert!(matches!(result, Err(Error::InvalidResponse { command: 0x01, .. })));
    }

    #[test]
    fn test_response_error_status_is_error() {
        let mut port = MockPort::new();
        port.script_reply(&response(0, 0x01, 0x84, &[]));

        let mut commander = commander_with_port(port);
        let result = commander.start_update();
        assert!(matches!(
            result,
            Err(Error::InvalidResponse {
                command: 0x01,
                status: 0x84,
                ..
            })
        ));
    }

    #[test]
    fn test_result_code_from_response() {
        let mut port = MockPort::new();
        port.script_reply(&response(0, 0x00, 0x00, &[0x02]));

        let info = FirmwareInfo {
            fw_type: 1,
            project_id: 1,
            variant_id: 0,
            major: 1,
            minor: 0,
            patch: 0,
            size: 64,
            crc32: 0,
        };
        let mut commander = commander_with_port(port);
        let result = commander.prepare_update(&info).unwrap();
        assert_eq!(result, ResultCode::WarnSameVersion);
        assert!(result.is_accepted());
        assert!(result.is_warning());
    }

    #[test]
    fn test_scan_notification_updates_state() {
        let mut port = MockPort::new();
        port.push_rx(&notify(1, &[0xC0, 0x00, 0x01]));

        let mut commander = commander_with_port(port);
        commander.check_bootloader_state().unwrap();
        commander.poll().unwrap();

        assert_eq!(commander.take_bootloader_state(), Some(BootloaderState::Idle));
        assert_eq!(commander.take_bootloader_state(), None);
    }

    #[test]
    fn test_malformed_scan_notification_ignored() {
        let mut port = MockPort::new();
        port.push_rx(&notify(1, &[0xC0, 0x00, 0x01, 0x02]));

        let mut commander = commander_with_port(port);
        commander.poll().unwrap();
        assert_eq!(commander.take_bootloader_state(), None);
    }

    #[test]
    fn test_result_code_classification() {
        assert!(ResultCode::Ok.is_accepted());
        assert!(!ResultCode::Ok.is_warning());
        assert!(!ResultCode::ErrRejected.is_accepted());
        assert_eq!(ResultCode::from(0x91), ResultCode::ErrWritingFailed);
        assert_eq!(ResultCode::from(0x7F), ResultCode::ErrUnknown);
    }
}
