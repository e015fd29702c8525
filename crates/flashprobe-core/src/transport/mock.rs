//! Mock transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::endpoint::Endpoint;
use super::traits::{Transport, TransportError};
use crate::protocol::{Frame, Operation, Reply};

/// One scripted event on the receive side.
#[derive(Debug, Clone)]
enum Scripted {
    Frame(Frame),
    Data(Vec<u8>),
    Timeout,
    Disconnect,
}

/// Scripted transport: replies are queued up front, sends are captured.
///
/// Clones share the same queues, so a test can keep a handle after moving
/// the transport into a session.
#[derive(Clone)]
pub struct MockTransport {
    rx_queue: Arc<Mutex<VecDeque<Scripted>>>,
    sent: Arc<Mutex<Vec<Frame>>>,
    bulk_sent: Arc<Mutex<Vec<Vec<u8>>>>,
    connected: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            rx_queue: Arc::new(Mutex::new(VecDeque::new())),
            sent: Arc::new(Mutex::new(Vec::new())),
            bulk_sent: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(Mutex::new(true)),
        }
    }

    fn push(&self, item: Scripted) {
        self.rx_queue.lock().unwrap().push_back(item);
    }

    /// Queue a reply frame with no data phase.
    pub fn queue_reply(&self, reply: Reply) {
        self.push(Scripted::Frame(reply.encode()));
    }

    /// Queue a reply frame announcing `data`, followed by the data phase.
    pub fn queue_reply_with_data(&self, reply: Reply, data: &[u8]) {
        self.push(Scripted::Frame(reply.with_data_len(data.len() as u32).encode()));
        self.push(Scripted::Data(data.to_vec()));
    }

    /// Queue a raw frame, e.g. one echoing the wrong command.
    pub fn queue_frame(&self, frame: Frame) {
        self.push(Scripted::Frame(frame));
    }

    /// Next receive times out.
    pub fn queue_timeout(&self) {
        self.push(Scripted::Timeout);
    }

    /// Next receive reports the device gone.
    pub fn queue_disconnect(&self) {
        self.push(Scripted::Disconnect);
    }

    /// All frames sent so far.
    pub fn sent_frames(&self) -> Vec<Frame> {
        self.sent.lock().unwrap().clone()
    }

    /// Sent frames decoded back into operations.
    pub fn sent_operations(&self) -> Vec<Operation> {
        self.sent_frames()
            .iter()
            .filter_map(|f| Operation::from_frame(f).ok())
            .collect()
    }

    /// All host-to-device data phases sent so far.
    pub fn bulk_writes(&self) -> Vec<Vec<u8>> {
        self.bulk_sent.lock().unwrap().clone()
    }

    /// Replies still waiting to be consumed.
    pub fn pending_replies(&self) -> usize {
        self.rx_queue.lock().unwrap().len()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
        self.bulk_sent.lock().unwrap().clear();
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        *self.connected.lock().unwrap() = true;
    }

    fn check_connected(&self) -> Result<(), TransportError> {
        if *self.connected.lock().unwrap() {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }

    fn next(&self, timeout: Duration) -> Result<Scripted, TransportError> {
        self.check_connected()?;
        match self.rx_queue.lock().unwrap().pop_front() {
            None | Some(Scripted::Timeout) => Err(TransportError::timeout(timeout)),
            Some(Scripted::Disconnect) => {
                self.disconnect();
                Err(TransportError::Disconnected)
            }
            Some(item) => Ok(item),
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        self.check_connected()?;
        self.sent.lock().unwrap().push(*frame);
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<Frame, TransportError> {
        match self.next(timeout)? {
            Scripted::Frame(frame) => Ok(frame),
            _ => Err(TransportError::ReadFailed("expected a frame, got a data phase".into())),
        }
    }

    fn send_bulk(&self, data: &[u8]) -> Result<(), TransportError> {
        self.check_connected()?;
        self.bulk_sent.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    fn receive_bulk(&self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        match self.next(timeout)? {
            Scripted::Data(data) if data.len() == len => Ok(data),
            Scripted::Data(data) => Err(TransportError::ReadFailed(format!(
                "data phase of {} bytes, expected {}",
                data.len(),
                len
            ))),
            _ => Err(TransportError::ReadFailed("expected a data phase, got a frame".into())),
        }
    }

    fn close(&self) {
        self.disconnect();
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }

    fn endpoint(&self) -> Option<Endpoint> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;

    #[test]
    fn test_mock_reply_queue() {
        let mock = MockTransport::new();
        mock.queue_reply(Reply::ok(Command::Ping));
        mock.queue_reply_with_data(Reply::ok(Command::NorRead), &[0xAA; 16]);

        let frame = mock.receive(Duration::from_millis(10)).unwrap();
        assert_eq!(frame.command_id(), Command::Ping.id());

        let frame = mock.receive(Duration::from_millis(10)).unwrap();
        let reply = Reply::decode(&frame, Command::NorRead).unwrap();
        assert_eq!(reply.data_len, 16);
        assert_eq!(mock.receive_bulk(16, Duration::from_millis(10)).unwrap(), vec![0xAA; 16]);

        // Queue is empty now
        assert!(matches!(
            mock.receive(Duration::from_millis(10)),
            Err(TransportError::Timeout { timeout_ms: 10 })
        ));
    }

    #[test]
    fn test_mock_write_capture() {
        let mock = MockTransport::new();
        let handle = mock.clone();
        mock.send(&Operation::Ping.encode()).unwrap();
        mock.send_bulk(b"page").unwrap();

        assert_eq!(handle.sent_operations(), vec![Operation::Ping]);
        assert_eq!(handle.bulk_writes(), vec![b"page".to_vec()]);
    }

    #[test]
    fn test_mock_disconnect() {
        let mock = MockTransport::new();
        assert!(mock.is_connected());

        mock.queue_disconnect();
        assert!(matches!(
            mock.receive(Duration::from_millis(10)),
            Err(TransportError::Disconnected)
        ));
        assert!(!mock.is_connected());
        assert!(mock.send(&Operation::Ping.encode()).is_err());
    }
}
