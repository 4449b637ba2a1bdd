//! Transport layer of the bootloader protocol.
//!
//! Adds message kinds and exchange IDs on top of the data-link frames:
//!
//! ```text
//! +-----+------+--------------------+
//! | EID | Type |      Payload       |
//! +-----+------+--------------------+
//! | 1   | 1    |     variable       |
//! +-----+------+--------------------+
//! ```
//!
//! Requests carry a fresh exchange ID and expect a response echoing it;
//! posts are fire-and-forget; notifications originate from the slave and are
//! de-duplicated by exchange ID (the slave repeats a notification until a
//! new one supersedes it). Everything is driven synchronously: callers pump
//! the channel with [`Transport::poll`] or implicitly from within
//! [`Transport::send_request`].

use log::{debug, warn};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::datalink::{self, DataLink};

/// Length in bytes of the transport message header.
const MSG_HEADER_LEN: usize = 2;

/// Maximum length in bytes of a transport message.
pub const MAX_MSG_LEN: usize = 247;

/// Maximum payload length of an outgoing transport message.
pub const MAX_PAYLOAD_LEN: usize = datalink::MAX_PAYLOAD_LEN - MSG_HEADER_LEN;

/// Number of send attempts for a request before giving up.
pub const REQUEST_ATTEMPTS: u32 = 3;

/// Transport message types.
mod msg_type {
    pub const REQUEST: u8 = 0;
    pub const RESPONSE: u8 = 1;
    pub const POST: u8 = 2;
    pub const NOTIFY: u8 = 3;
}

/// Transport channel over a data-link channel.
pub struct Transport<P: Port> {
    link: DataLink<P>,
    request_eid: u8,
    post_eid: u8,
    notify_eid: u8,
    response: Option<Vec<u8>>,
    notifications: VecDeque<Vec<u8>>,
}

impl<P: Port> Transport<P> {
    /// Create a transport channel over the given data-link channel.
    pub fn new(link: DataLink<P>) -> Self {
        Self {
            link,
            // Wrapping pre-increment before each send: first exchange ID is 0
            request_eid: 255,
            post_eid: 255,
            notify_eid: 0,
            response: None,
            notifications: VecDeque::new(),
        }
    }

    /// Access the underlying data-link channel.
    pub fn link_mut(&mut self) -> &mut DataLink<P> {
        &mut self.link
    }

    /// Send a request and wait for the matching response.
    ///
    /// The request is retransmitted with the same exchange ID up to
    /// [`REQUEST_ATTEMPTS`] times, waiting `timeout` for the response after
    /// each attempt. Responses with a different exchange ID are dropped.
    pub fn send_request(&mut self, payload: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        if payload.is_empty() || payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::Frame(format!(
                "invalid request length {} (1..={MAX_PAYLOAD_LEN})",
                payload.len()
            )));
        }

        self.request_eid = self.request_eid.wrapping_add(1);
        let mut msg = Vec::with_capacity(MSG_HEADER_LEN + payload.len());
        msg.push(self.request_eid);
        msg.push(msg_type::REQUEST);
        msg.extend_from_slice(payload);

        self.response = None;
        for attempt in 1..=REQUEST_ATTEMPTS {
            self.link.send(&msg)?;

            let deadline = Instant::now() + timeout;
            while Instant::now() < deadline {
                self.poll()?;
                if let Some(response) = self.response.take() {
                    return Ok(response);
                }
            }
            debug!(
                "No response to exchange {} (attempt {attempt}/{REQUEST_ATTEMPTS})",
                self.request_eid
            );
        }

        Err(Error::Timeout(format!(
            "no response to request (exchange ID {})",
            self.request_eid
        )))
    }

    /// Send a post message (no response expected).
    pub fn send_post(&mut self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() || payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::Frame(format!(
                "invalid post length {} (1..={MAX_PAYLOAD_LEN})",
                payload.len()
            )));
        }

        self.post_eid = self.post_eid.wrapping_add(1);
        let mut msg = Vec::with_capacity(MSG_HEADER_LEN + payload.len());
        msg.push(self.post_eid);
        msg.push(msg_type::POST);
        msg.extend_from_slice(payload);
        self.link.send(&msg)
    }

    /// Drain the data-link channel and dispatch every received message.
    pub fn poll(&mut self) -> Result<()> {
        for msg in self.link.receive()? {
            self.dispatch(&msg);
        }
        Ok(())
    }

    /// Take the oldest pending notification payload, if any.
    pub fn take_notification(&mut self) -> Option<Vec<u8>> {
        self.notifications.pop_front()
    }

    fn dispatch(&mut self, msg: &[u8]) {
        if msg.len() < MSG_HEADER_LEN || msg.len() > MAX_MSG_LEN {
            warn!("Dropping transport message of invalid length {}", msg.len());
            return;
        }
        let eid = msg[0];
        let payload = &msg[MSG_HEADER_LEN..];

        match msg[1] {
            msg_type::NOTIFY => {
                // Repeated notifications carry the same non-zero exchange ID
                if eid == 0 || eid != self.notify_eid {
                    self.notify_eid = eid;
                    self.notifications.push_back(payload.to_vec());
                }
            },
            msg_type::RESPONSE => {
                if self.response.is_none() && eid == self.request_eid {
                    self.response = Some(payload.to_vec());
                } else {
                    debug!("Dropping response with exchange ID {eid}");
                }
            },
            other => {
                debug!("Ignoring transport message of type {other}");
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::datalink::encode_frame;
    use crate::testutil::MockPort;

    fn transport_with_port(port: MockPort) -> Transport<MockPort> {
        Transport::new(DataLink::new(port))
    }

    fn message(eid: u8, mtype: u8, payload: &[u8]) -> Vec<u8> {
        let mut msg = vec![eid, mtype];
        msg.extend_from_slice(payload);
        encode_frame(&msg).unwrap()
    }

    #[test]
    fn test_request_gets_matching_response() {
        let mut port = MockPort::new();
        // First request uses exchange ID 0
        port.script_reply(&message(0, msg_type::RESPONSE, &[0xAB, 0xCD]));

        let mut transport = transport_with_port(port);
        let response = transport
            .send_request(&[0x01], Duration::from_millis(100))
            .unwrap();
        assert_eq!(response, vec![0xAB, 0xCD]);
        assert_eq!(transport.link_mut().port_mut().writes().len(), 1);
    }

    #[test]
    fn test_response_with_wrong_eid_is_dropped() {
        let mut port = MockPort::new();
        // Stale response from a previous exchange on every attempt
        port.script_reply(&message(7, msg_type::RESPONSE, &[0x00]));
        port.script_reply(&message(7, msg_type::RESPONSE, &[0x00]));
        port.script_reply(&message(7, msg_type::RESPONSE, &[0x00]));

        let mut transport = transport_with_port(port);
        let result = transport.send_request(&[0x01], Duration::from_millis(20));
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[test]
    fn test_request_retries_three_times_then_times_out() {
        let timeout = Duration::from_millis(30);
        let mut transport = transport_with_port(MockPort::new());

        let started = Instant::now();
        let result = transport.send_request(&[0x42], timeout);
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(Error::Timeout(_))));
        // One transmission per attempt, each waiting the full timeout
        assert_eq!(transport.link_mut().port_mut().writes().len(), 3);
        assert!(elapsed >= timeout * 3);
        assert!(elapsed < timeout * 3 + Duration::from_millis(200));
    }

    #[test]
    fn test_request_eids_increment() {
        let mut port = MockPort::new();
        port.script_reply(&message(0, msg_type::RESPONSE, &[0x01]));
        port.script_reply(&message(1, msg_type::RESPONSE, &[0x02]));

        let mut transport = transport_with_port(port);
        transport.send_request(&[0x01], Duration::from_millis(100)).unwrap();
        transport.send_request(&[0x01], Duration::from_millis(100)).unwrap();

        let writes = transport.link_mut().port_mut().writes();
        // Exchange ID is the first payload byte behind the 8-byte frame header
        assert_eq!(writes[0][8], 0);
        assert_eq!(writes[1][8], 1);
    }

    #[test]
    fn test_post_has_own_eid_sequence() {
        let mut transport = transport_with_port(MockPort::new());
        transport.send_post(&[0x80, 0x00]).unwrap();
        transport.send_post(&[0x80, 0x00]).unwrap();

        let writes = transport.link_mut().port_mut().writes();
        assert_eq!(writes[0][8], 0);
        assert_eq!(writes[0][9], msg_type::POST);
        assert_eq!(writes[1][8], 1);
    }

    #[test]
    fn test_notify_dedup() {
        let mut port = MockPort::new();
        port.push_rx(&message(5, msg_type::NOTIFY, &[0xC0, 0x00, 0x01]));
        port.push_rx(&message(5, msg_type::NOTIFY, &[0xC0, 0x00, 0x01]));
        port.push_rx(&message(6, msg_type::NOTIFY, &[0xC0, 0x00, 0x02]));

        let mut transport = transport_with_port(port);
        transport.poll().unwrap();

        assert_eq!(transport.take_notification(), Some(vec![0xC0, 0x00, 0x01]));
        assert_eq!(transport.take_notification(), Some(vec![0xC0, 0x00, 0x02]));
        assert_eq!(transport.take_notification(), None);
    }

    #[test]
    fn test_notify_eid_zero_always_accepted() {
        let mut port = MockPort::new();
        port.push_rx(&message(0, msg_type::NOTIFY, &[0x01]));
        port.push_rx(&message(0, msg_type::NOTIFY, &[0x02]));

        let mut transport = transport_with_port(port);
        transport.poll().unwrap();

        assert_eq!(transport.take_notification(), Some(vec![0x01]));
        assert_eq!(transport.take_notification(), Some(vec![0x02]));
    }

    #[test]
    fn test_request_length_bounds() {
        let mut transport = transport_with_port(MockPort::new());
        assert!(transport.send_request(&[], Duration::ZERO).is_err());
        let oversize = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert!(transport.send_request(&oversize, Duration::ZERO).is_err());
    }
}
