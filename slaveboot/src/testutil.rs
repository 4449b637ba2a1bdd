//! Test doubles shared across the protocol tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::Duration;

use crate::error::Result;
use crate::port::Port;

/// In-memory port for protocol tests.
///
/// Reads come from a byte queue filled with [`MockPort::push_rx`]; when the
/// queue is empty a read fails with `TimedOut`, like a real serial port.
/// Replies queued with [`MockPort::script_reply`] become readable one per
/// write, which lets request/response exchanges run without a device.
pub(crate) struct MockPort {
    read_buf: VecDeque<u8>,
    scripted: VecDeque<Vec<u8>>,
    writes: Vec<Vec<u8>>,
    read_error: Option<io::ErrorKind>,
    timeout: Duration,
    baud_rate: u32,
}

impl MockPort {
    pub(crate) fn new() -> Self {
        Self {
            read_buf: VecDeque::new(),
            scripted: VecDeque::new(),
            writes: Vec::new(),
            read_error: None,
            timeout: Duration::from_millis(10),
            baud_rate: 115_200,
        }
    }

    /// Make bytes immediately readable.
    pub(crate) fn push_rx(&mut self, data: &[u8]) {
        self.read_buf.extend(data);
    }

    /// Queue a reply that becomes readable after the next write.
    pub(crate) fn script_reply(&mut self, data: &[u8]) {
        self.scripted.push_back(data.to_vec());
    }

    /// Everything written so far, one entry per write call.
    pub(crate) fn writes(&self) -> &[Vec<u8>] {
        &self.writes
    }

    /// Make every read fail hard with the given error kind.
    pub(crate) fn fail_reads(&mut self, kind: io::ErrorKind) {
        self.read_error = Some(kind);
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(kind) = self.read_error {
            return Err(kind.into());
        }
        if self.read_buf.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(self.read_buf.len());
        for slot in &mut buf[..n] {
            *slot = self.read_buf.pop_front().ok_or(io::ErrorKind::TimedOut)?;
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writes.push(buf.to_vec());
        if let Some(reply) = self.scripted.pop_front() {
            self.read_buf.extend(reply);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.read_buf.clear();
        Ok(())
    }

    fn bytes_to_read(&mut self) -> Result<usize> {
        Ok(self.read_buf.len())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
