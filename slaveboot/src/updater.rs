//! Firmware update orchestration.
//!
//! Drives a whole update session against the slave board: figuring out which
//! mode the slave is in, moving it in and out of the bootloader, and walking
//! the prepare/start/download/finalize sequence while tracking progress.
//!
//! The UART is shared with the runtime protocol, so the bootloader protocol
//! is only enabled while it is actually needed and the runtime link is
//! suspended for exactly that window.

use log::{info, warn};
use std::thread::sleep;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::image::FirmwareDescriptor;
use crate::port::Port;
use crate::protocol::command::{BootloaderState, Commander, FirmwareChunk, ResultCode};

/// Link to the runtime protocol sharing the UART.
///
/// The updater suspends the runtime link while the bootloader protocol is
/// active and uses it to probe and reboot the slave application.
pub trait RuntimeLink {
    /// Whether the slave application answers on the runtime protocol.
    fn probe(&mut self, timeout: Duration) -> bool;

    /// Version of the running slave application, if it answers.
    fn app_version(&mut self, timeout: Duration) -> Option<(u8, u8, u8)>;

    /// Ask the slave application to reboot. Returns whether it acknowledged.
    fn request_reboot(&mut self, timeout: Duration) -> bool;

    /// Suspend or resume the runtime protocol on the shared UART.
    fn set_enabled(&mut self, enabled: bool);
}

/// Mode the slave board was detected in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveMode {
    /// The slave bootloader answers on the bootloader protocol.
    Bootloader,
    /// The slave application answers on the runtime protocol.
    Application,
    /// The slave answers on neither protocol.
    Unknown,
}

/// State of the firmware update session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No update session is active.
    Idle,
    /// The slave accepted the firmware information.
    Ready,
    /// The slave accepted the start command and expects firmware data.
    Started,
}

/// Timing knobs of the update orchestration.
#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    /// Timeout for probing the slave application.
    pub probe_timeout: Duration,
    /// Delay between a reboot request and the bootloader answering.
    pub reboot_delay: Duration,
    /// How long to wait for the bootloader state when entering the bootloader.
    pub bl_state_timeout: Duration,
    /// How long to wait for the bootloader state when detecting the mode.
    pub mode_probe_timeout: Duration,
    /// Polling interval while waiting for a bootloader state.
    pub poll_interval: Duration,
    /// Interval between repeated scan posts while waiting.
    pub scan_interval: Duration,
    /// Settle time after resuming the runtime protocol.
    pub runtime_settle: Duration,
    /// Attempts at rebooting the slave into its bootloader.
    pub enter_retries: u32,
    /// Probes for the slave application after leaving the bootloader.
    pub exit_probes: u32,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_millis(100),
            reboot_delay: Duration::from_millis(250),
            bl_state_timeout: Duration::from_millis(200),
            mode_probe_timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(10),
            scan_interval: Duration::from_millis(100),
            runtime_settle: Duration::from_millis(100),
            enter_retries: 3,
            exit_probes: 10,
        }
    }
}

/// Firmware update orchestrator.
pub struct Updater<P: Port, R: RuntimeLink> {
    commander: Commander<P>,
    runtime: R,
    config: UpdaterConfig,
    session: SessionState,
    bl_enabled: bool,
    fw_size: u32,
    bytes_flashed: u32,
}

impl<P: Port, R: RuntimeLink> Updater<P, R> {
    /// Create an updater with default timing.
    pub fn new(commander: Commander<P>, runtime: R) -> Self {
        Self::with_config(commander, runtime, UpdaterConfig::default())
    }

    /// Create an updater with custom timing.
    pub fn with_config(commander: Commander<P>, runtime: R, config: UpdaterConfig) -> Self {
        Self {
            commander,
            runtime,
            config,
            session: SessionState::Idle,
            bl_enabled: false,
            fw_size: 0,
            bytes_flashed: 0,
        }
    }

    /// Access the underlying commander.
    pub fn commander_mut(&mut self) -> &mut Commander<P> {
        &mut self.commander
    }

    /// State of the current update session.
    pub fn session_state(&self) -> SessionState {
        self.session
    }

    /// Progress of the current session as (bytes flashed, firmware size).
    pub fn progress(&self) -> (u32, u32) {
        (self.bytes_flashed, self.fw_size)
    }

    /// Detect which mode the slave board is currently in.
    ///
    /// When the slave is found in its bootloader the bootloader protocol
    /// stays enabled so the session operations can follow immediately; in
    /// every other outcome the runtime protocol is left enabled.
    pub fn slave_mode(&mut self) -> Result<SlaveMode> {
        if self.runtime.probe(self.config.probe_timeout) {
            return Ok(SlaveMode::Application);
        }

        self.enable_bootloader_protocol(true);
        let state = match self.bootloader_state(self.config.mode_probe_timeout) {
            Ok(state) => state,
            Err(e) => {
                self.enable_bootloader_protocol(false);
                return Err(e);
            },
        };

        if state == BootloaderState::Reserved {
            self.enable_bootloader_protocol(false);
            Ok(SlaveMode::Unknown)
        } else {
            Ok(SlaveMode::Bootloader)
        }
    }

    /// Version of the running slave application, if it answers.
    pub fn app_version(&mut self) -> Option<(u8, u8, u8)> {
        self.runtime.app_version(self.config.probe_timeout)
    }

    /// Reboot the slave board into its bootloader.
    ///
    /// Leaves the bootloader protocol enabled on success and the runtime
    /// protocol enabled on failure.
    pub fn enter_bootloader(&mut self) -> Result<()> {
        for _ in 0..self.config.enter_retries {
            self.enable_bootloader_protocol(false);
            self.runtime.request_reboot(self.config.probe_timeout);
            sleep(self.config.reboot_delay);
            self.enable_bootloader_protocol(true);

            match self.bootloader_state(self.config.bl_state_timeout) {
                Ok(BootloaderState::Reserved) => warn!("Retry entering Bootloader"),
                Ok(_) => return Ok(()),
                Err(e) => {
                    self.enable_bootloader_protocol(false);
                    return Err(e);
                },
            }
        }

        self.enable_bootloader_protocol(false);
        Err(Error::Timeout("slave did not enter its bootloader".into()))
    }

    /// Reboot the slave board out of its bootloader into the application.
    pub fn exit_bootloader(&mut self) -> Result<()> {
        self.enable_bootloader_protocol(true);
        self.commander.reset(false)?;
        self.enable_bootloader_protocol(false);

        for _ in 0..self.config.exit_probes {
            if self.runtime.probe(self.config.probe_timeout) {
                return Ok(());
            }
        }
        Err(Error::Timeout("slave application did not come up".into()))
    }

    /// Reset the slave board, optionally keeping it in its bootloader.
    pub fn reset(&mut self, stay_in_bootloader: bool) -> Result<()> {
        self.enable_bootloader_protocol(true);
        self.commander.reset(stay_in_bootloader)?;
        if !stay_in_bootloader {
            self.enable_bootloader_protocol(false);
        }
        Ok(())
    }

    /// Announce a firmware to the slave board.
    ///
    /// The descriptor is validated locally first so broken images never go
    /// over the wire.
    pub fn prepare_update(&mut self, descriptor: &FirmwareDescriptor) -> Result<ResultCode> {
        descriptor.validate()?;

        if self.session == SessionState::Started {
            warn!("A firmware update is already in progress");
            return Ok(ResultCode::ErrUpdateNotDone);
        }

        info!("+ Firmware name: {}", descriptor.description);
        info!("+ Firmware revision: {}", descriptor.version());
        info!("+ Firmware size: {} bytes", descriptor.size);

        let result = self.commander.prepare_update(&descriptor.fw_info())?;
        if result.is_accepted() {
            self.session = SessionState::Ready;
            self.fw_size = descriptor.size;
        }
        Ok(result)
    }

    /// Start the firmware update on the slave board.
    pub fn start_update(&mut self) -> Result<ResultCode> {
        if self.session != SessionState::Ready {
            return Ok(ResultCode::ErrUpdateNotStarted);
        }

        let result = self.commander.start_update()?;
        if result == ResultCode::Ok {
            self.session = SessionState::Started;
            self.bytes_flashed = 0;
        }
        Ok(result)
    }

    /// Program one chunk of firmware data.
    #[allow(clippy::cast_possible_truncation)] // chunk length is message-bounded
    pub fn program_chunk(&mut self, chunk: &FirmwareChunk<'_>) -> Result<ResultCode> {
        if self.session != SessionState::Started {
            return Ok(ResultCode::ErrUpdateNotStarted);
        }

        let result = self.commander.download_firmware(chunk)?;
        if result == ResultCode::Ok {
            self.bytes_flashed += chunk.data.len() as u32;
        }
        Ok(result)
    }

    /// Finish the update session.
    ///
    /// With `finalized` the slave validates and activates the downloaded
    /// firmware; without it the update is canceled and the slave discards
    /// whatever arrived. The session returns to idle either way.
    pub fn finalize_update(&mut self, finalized: bool) -> Result<ResultCode> {
        if self.session != SessionState::Started {
            warn!("No firmware update in progress to finalize");
            self.session = SessionState::Idle;
            return Ok(ResultCode::ErrUpdateNotStarted);
        }
        self.session = SessionState::Idle;

        if !finalized {
            // Best effort; the slave times out and recovers on its own anyway
            let _ = self.commander.finalize_update(true);
            warn!("Firmware update aborted");
            return Ok(ResultCode::Ok);
        }

        self.commander.finalize_update(false)
    }

    /// Query the slave bootloader's state.
    ///
    /// Scans repeatedly until the bootloader announces itself or `timeout`
    /// expires; expiry yields [`BootloaderState::Reserved`].
    pub fn bootloader_state(&mut self, timeout: Duration) -> Result<BootloaderState> {
        // Drop any stale notification from a previous scan
        self.commander.poll()?;
        let _ = self.commander.take_bootloader_state();

        let deadline = Instant::now() + timeout;
        let mut next_scan = Instant::now();
        loop {
            if Instant::now() >= next_scan {
                self.commander.check_bootloader_state()?;
                next_scan = Instant::now() + self.config.scan_interval;
            }

            self.commander.poll()?;
            if let Some(state) = self.commander.take_bootloader_state() {
                return Ok(state);
            }

            if Instant::now() >= deadline {
                return Ok(BootloaderState::Reserved);
            }
            sleep(self.config.poll_interval);
        }
    }

    /// Switch the shared UART between the runtime and bootloader protocols.
    fn enable_bootloader_protocol(&mut self, enabled: bool) {
        if self.bl_enabled == enabled {
            return;
        }
        self.bl_enabled = enabled;

        if enabled {
            self.runtime.set_enabled(false);
        } else {
            self.runtime.set_enabled(true);
            // Give the slave time to switch its receiver back
            sleep(self.config.runtime_settle);
        }
    }
}
