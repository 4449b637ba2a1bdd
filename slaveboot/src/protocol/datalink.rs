//! Data-link layer of the bootloader protocol.
//!
//! Frames carry an opaque payload across the UART shared with the runtime
//! protocol:
//!
//! ```text
//! +------------------+------+-----+--------+-----------------+
//! |      Marker      | Type | Len | LRC16  |     Payload     |
//! +------------------+------+-----+--------+-----------------+
//! | AA 33 55 CC      | 1    | 1   | 2 (LE) |    variable     |
//! +------------------+------+-----+--------+-----------------+
//! ```
//!
//! `Len` counts the 8 header bytes plus the unstuffed payload. The checksum
//! is computed over the whole unstuffed frame with the checksum field set to
//! zero. Whenever the 4-byte marker happens to appear inside the frame body,
//! the sender inserts a single [`STUFF_BYTE`] right after it; stuff bytes are
//! excluded from both the length field and the checksum.
//!
//! The channel also has a raw mode in which framing is bypassed entirely and
//! bytes move unmodified, for talking to slave-side tools that speak their
//! own serial protocol.

use log::{debug, info, warn};
use std::io;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::checksum::lrc16;

/// Start-of-frame marker.
pub const FRAME_MARKER: [u8; 4] = [0xAA, 0x33, 0x55, 0xCC];

/// Byte inserted after any in-frame occurrence of the marker.
pub const STUFF_BYTE: u8 = 0xFF;

/// Length in bytes of the frame header (marker + type + len + checksum).
pub const FRAME_HEADER_LEN: usize = 8;

/// Maximum length in bytes of an unstuffed frame (the length field is a u8).
pub const MAX_FRAME_LEN: usize = 255;

/// Maximum number of stuff bytes allowed in one frame on the wire.
pub const MAX_STUFF_BYTES: usize = 32;

/// Maximum payload length a frame can carry.
///
/// Conservative bound: even if every marker occurrence in the payload needs a
/// stuff byte, the stuffed frame still fits the transmit buffer.
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - FRAME_HEADER_LEN - MAX_STUFF_BYTES;

/// Frame type for data frames (the only type currently defined).
const FRAME_TYPE_DATA: u8 = 0;

/// Timeout of a single poll read when draining the receive side.
const RECEIVE_TIMEOUT: Duration = Duration::from_millis(10);

/// Interval at which `transceive_raw` checks the receive buffer level.
const COMM_WINDOW: Duration = Duration::from_millis(30);

/// Encode a payload into a complete frame ready for transmission.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.is_empty() || payload.len() > MAX_PAYLOAD_LEN {
        return Err(Error::Frame(format!(
            "invalid payload length {} (1..={MAX_PAYLOAD_LEN})",
            payload.len()
        )));
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len() + MAX_STUFF_BYTES);
    frame.extend_from_slice(&FRAME_MARKER);
    frame.push(FRAME_TYPE_DATA);
    #[allow(clippy::cast_possible_truncation)] // bounded by MAX_PAYLOAD_LEN above
    frame.push((FRAME_HEADER_LEN + payload.len()) as u8);
    frame.extend_from_slice(&[0, 0]);

    // Checksum covers header and unstuffed payload, checksum field zeroed
    let mut unstuffed = frame.clone();
    unstuffed.extend_from_slice(payload);
    let cks = lrc16(&unstuffed);
    frame[6..8].copy_from_slice(&cks.to_le_bytes());

    // Copy the payload, inserting a stuff byte after each marker occurrence
    for (idx, &octet) in payload.iter().enumerate() {
        frame.push(octet);
        if idx >= 3 && payload[idx - 3..=idx] == FRAME_MARKER {
            frame.push(STUFF_BYTE);
        }
    }

    Ok(frame)
}

/// Outcome of feeding one received byte into the [`Deframer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeframeEvent {
    /// More bytes are needed.
    Pending,
    /// A complete frame was received; contains its payload.
    Frame(Vec<u8>),
    /// A complete frame was received but failed checksum validation.
    Discarded,
}

/// Byte-at-a-time frame decoder.
///
/// Feed it every byte read from the wire; it re-synchronizes on the frame
/// marker, strips stuff bytes, and validates checksums.
#[derive(Debug, Default)]
pub struct Deframer {
    buf: Vec<u8>,
    stuff_pending: bool,
}

impl Deframer {
    /// Create a new deframer waiting for a frame.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any partially received frame.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.stuff_pending = false;
    }

    /// Process one received byte.
    pub fn push(&mut self, octet: u8) -> DeframeEvent {
        // Runaway input without a valid frame: keep only the last 4 bytes so
        // a marker split across the truncation point still matches.
        if self.buf.len() >= MAX_FRAME_LEN {
            let tail_at = self.buf.len() - 4;
            self.buf.copy_within(tail_at.., 0);
            self.buf.truncate(4);
        }

        // Marker just appeared past the start of the buffer: either the next
        // byte is a stuff byte to drop, or a new frame begins here.
        if self.buf.len() > 4 && self.buf.ends_with(&FRAME_MARKER) && !self.stuff_pending {
            if octet == STUFF_BYTE {
                self.stuff_pending = true;
            } else {
                self.buf.clear();
                self.buf.extend_from_slice(&FRAME_MARKER);
                self.buf.push(octet);
            }
            return DeframeEvent::Pending;
        }

        self.buf.push(octet);
        self.stuff_pending = false;

        if self.buf.len() >= FRAME_HEADER_LEN && self.buf.len() == usize::from(self.buf[5]) {
            let stored = u16::from_le_bytes([self.buf[6], self.buf[7]]);
            self.buf[6] = 0;
            self.buf[7] = 0;
            if lrc16(&self.buf) == stored {
                let payload = self.buf.split_off(FRAME_HEADER_LEN);
                self.buf.clear();
                return DeframeEvent::Frame(payload);
            }
            warn!("Invalid frame checksum, discarding frame");
            self.reset();
            return DeframeEvent::Discarded;
        }

        DeframeEvent::Pending
    }
}

/// Data-link channel over a serial port.
///
/// Owns the port and a [`Deframer`]. While raw mode is enabled the framed
/// [`DataLink::send`] and [`DataLink::receive`] operations are rejected and
/// the `*_raw` operations must be used instead.
pub struct DataLink<P: Port> {
    port: P,
    deframer: Deframer,
    raw_mode: bool,
}

impl<P: Port> DataLink<P> {
    /// Create a data-link channel over the given port.
    pub fn new(port: P) -> Self {
        Self {
            port,
            deframer: Deframer::new(),
            raw_mode: false,
        }
    }

    /// Access the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the channel and return the port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Whether raw mode is currently enabled.
    pub fn is_raw_mode(&self) -> bool {
        self.raw_mode
    }

    /// Enable or disable raw mode.
    pub fn set_raw_mode(&mut self, enabled: bool) {
        if self.raw_mode != enabled {
            self.raw_mode = enabled;
            info!(
                "UART raw mode is {}",
                if enabled { "enabled" } else { "disabled" }
            );
        }
    }

    /// Frame a payload and transmit it.
    ///
    /// Rejected while raw mode is enabled.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        if self.raw_mode {
            return Err(Error::RawMode("cannot send frames in raw mode".into()));
        }
        let frame = encode_frame(payload)?;
        self.port.write_all_bytes(&frame)
    }

    /// Drain the receive side and return the payloads of all complete frames.
    ///
    /// Returns an empty vector when nothing (or only partial data) arrived
    /// within the poll window. Rejected while raw mode is enabled.
    pub fn receive(&mut self) -> Result<Vec<Vec<u8>>> {
        if self.raw_mode {
            return Err(Error::RawMode("cannot receive frames in raw mode".into()));
        }

        self.port.set_timeout(RECEIVE_TIMEOUT)?;
        let mut frames = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match self.port.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for &octet in &buf[..n] {
                        match self.deframer.push(octet) {
                            DeframeEvent::Frame(payload) => frames.push(payload),
                            DeframeEvent::Discarded => {
                                debug!("Dropped a corrupted frame");
                            },
                            DeframeEvent::Pending => {},
                        }
                    }
                },
                Err(e)
                    if e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    break;
                },
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(frames)
    }

    /// Send bytes unmodified over the channel.
    ///
    /// Only valid while raw mode is enabled.
    pub fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        if !self.raw_mode {
            return Err(Error::RawMode("raw mode is not enabled".into()));
        }
        self.port.write_all_bytes(data)
    }

    /// Receive up to `buf.len()` raw bytes, waiting at most `timeout`.
    ///
    /// Returns the number of bytes read (0 if the timeout expired with no
    /// data). Only valid while raw mode is enabled.
    pub fn receive_raw(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if !self.raw_mode {
            return Err(Error::RawMode("raw mode is not enabled".into()));
        }

        self.port.set_timeout(timeout)?;
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e)
                if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(0)
            },
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Flush the receive buffer, send raw bytes, and wait for a reply.
    ///
    /// Returns once `rx_len` bytes are buffered or `timeout` expires,
    /// whichever comes first; the reply may therefore be shorter than
    /// `rx_len`. Only valid while raw mode is enabled.
    pub fn transceive_raw(&mut self, tx: &[u8], rx_len: usize, timeout: Duration) -> Result<Vec<u8>> {
        if !self.raw_mode {
            return Err(Error::RawMode("raw mode is not enabled".into()));
        }

        self.port.clear_buffers()?;
        self.port.write_all_bytes(tx)?;

        let started = Instant::now();
        loop {
            std::thread::sleep(COMM_WINDOW);
            if self.port.bytes_to_read()? >= rx_len || started.elapsed() >= timeout {
                break;
            }
        }

        let mut data = vec![0u8; rx_len];
        self.port.set_timeout(RECEIVE_TIMEOUT)?;
        match self.port.read(&mut data) {
            Ok(n) => {
                data.truncate(n);
                Ok(data)
            },
            Err(e)
                if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(Vec::new())
            },
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockPort;

    fn deframe_all(deframer: &mut Deframer, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for &b in bytes {
            if let DeframeEvent::Frame(payload) = deframer.push(b) {
                frames.push(payload);
            }
        }
        frames
    }

    #[test]
    fn test_encode_frame_layout() {
        let frame = encode_frame(&[0x01, 0x02, 0x03]).unwrap();
        assert_eq!(&frame[0..4], &FRAME_MARKER);
        assert_eq!(frame[4], 0); // type
        assert_eq!(frame[5], 11); // header + 3 payload bytes
        assert_eq!(frame.len(), 11);

        // Checksum over the frame with its checksum field zeroed
        let mut zeroed = frame.clone();
        zeroed[6] = 0;
        zeroed[7] = 0;
        let cks = u16::from_le_bytes([frame[6], frame[7]]);
        assert_eq!(lrc16(&zeroed), cks);
    }

    #[test]
    fn test_encode_frame_rejects_bad_lengths() {
        assert!(encode_frame(&[]).is_err());
        assert!(encode_frame(&vec![0u8; MAX_PAYLOAD_LEN]).is_ok());
        assert!(encode_frame(&vec![0u8; MAX_PAYLOAD_LEN + 1]).is_err());
    }

    #[test]
    fn test_encode_frame_stuffs_embedded_marker() {
        let payload = [0x10, 0xAA, 0x33, 0x55, 0xCC, 0x20];
        let frame = encode_frame(&payload).unwrap();

        // Stuff byte inserted right after the marker, excluded from length
        assert_eq!(frame[5] as usize, FRAME_HEADER_LEN + payload.len());
        assert_eq!(frame.len(), FRAME_HEADER_LEN + payload.len() + 1);
        assert_eq!(frame[FRAME_HEADER_LEN + 5], STUFF_BYTE);
    }

    #[test]
    fn test_roundtrip_simple() {
        let payload = vec![0x42, 0x43, 0x44];
        let frame = encode_frame(&payload).unwrap();

        let mut deframer = Deframer::new();
        let frames = deframe_all(&mut deframer, &frame);
        assert_eq!(frames, vec![payload]);
    }

    #[test]
    fn test_roundtrip_payload_containing_marker() {
        // Marker bytes inside the payload, including one followed by 0xFF data
        let mut payload = vec![0x00];
        payload.extend_from_slice(&FRAME_MARKER);
        payload.push(0xFF);
        payload.extend_from_slice(&FRAME_MARKER);
        payload.push(0x55);
        let frame = encode_frame(&payload).unwrap();

        let mut deframer = Deframer::new();
        let frames = deframe_all(&mut deframer, &frame);
        assert_eq!(frames, vec![payload]);
    }

    #[test]
    fn test_roundtrip_max_payload() {
        let payload: Vec<u8> = (0..MAX_PAYLOAD_LEN as u32).map(|i| (i % 251) as u8).collect();
        let frame = encode_frame(&payload).unwrap();

        let mut deframer = Deframer::new();
        let frames = deframe_all(&mut deframer, &frame);
        assert_eq!(frames, vec![payload]);
    }

    #[test]
    fn test_single_bit_flip_discards_frame() {
        let mut frame = encode_frame(&[0x11, 0x22, 0x33]).unwrap();
        frame[9] ^= 0x01;

        let mut deframer = Deframer::new();
        let mut discarded = false;
        for &b in &frame {
            match deframer.push(b) {
                DeframeEvent::Frame(_) => panic!("corrupted frame must not be delivered"),
                DeframeEvent::Discarded => discarded = true,
                DeframeEvent::Pending => {},
            }
        }
        assert!(discarded);

        // The channel recovers: a following good frame is still delivered
        let good = encode_frame(&[0x77]).unwrap();
        let frames = deframe_all(&mut deframer, &good);
        assert_eq!(frames, vec![vec![0x77]]);
    }

    #[test]
    fn test_resync_after_leading_garbage() {
        let payload = vec![0xDE, 0xAD];
        let frame = encode_frame(&payload).unwrap();

        let mut bytes = vec![0x01, 0x02, 0x03];
        bytes.extend_from_slice(&frame);

        let mut deframer = Deframer::new();
        let frames = deframe_all(&mut deframer, &bytes);
        assert_eq!(frames, vec![payload]);
    }

    #[test]
    fn test_resync_after_buffer_overflow() {
        let payload = vec![0xBE, 0xEF];
        let frame = encode_frame(&payload).unwrap();

        // Way more garbage than the receive buffer can hold
        let mut bytes = vec![0x00; 700];
        bytes.extend_from_slice(&frame);

        let mut deframer = Deframer::new();
        let frames = deframe_all(&mut deframer, &bytes);
        assert_eq!(frames, vec![payload]);
    }

    #[test]
    fn test_two_back_to_back_frames() {
        let mut bytes = encode_frame(&[0x01]).unwrap();
        bytes.extend_from_slice(&encode_frame(&[0x02, 0x03]).unwrap());

        let mut deframer = Deframer::new();
        let frames = deframe_all(&mut deframer, &bytes);
        assert_eq!(frames, vec![vec![0x01], vec![0x02, 0x03]]);
    }

    #[test]
    fn test_datalink_send_receive() {
        let mut port = MockPort::new();
        port.push_rx(&encode_frame(&[0x0A, 0x0B]).unwrap());

        let mut link = DataLink::new(port);
        link.send(&[0x01, 0x02]).unwrap();

        let frames = link.receive().unwrap();
        assert_eq!(frames, vec![vec![0x0A, 0x0B]]);

        let written = link.port_mut().writes().concat();
        assert_eq!(written, encode_frame(&[0x01, 0x02]).unwrap());
    }

    #[test]
    fn test_raw_mode_gates_operations() {
        let mut link = DataLink::new(MockPort::new());
        assert!(link.send_raw(&[0x00]).is_err());

        link.set_raw_mode(true);
        assert!(link.send(&[0x00]).is_err());
        assert!(link.receive().is_err());
        link.send_raw(&[0x5A, 0xA5]).unwrap();
        assert_eq!(link.port_mut().writes().concat(), vec![0x5A, 0xA5]);
    }

    #[test]
    fn test_transceive_raw_returns_reply() {
        let mut port = MockPort::new();
        port.script_reply(&[0x10, 0x20, 0x30]);

        let mut link = DataLink::new(port);
        link.set_raw_mode(true);
        let reply = link
            .transceive_raw(&[0x01], 3, Duration::from_millis(200))
            .unwrap();
        assert_eq!(reply, vec![0x10, 0x20, 0x30]);
    }
}
