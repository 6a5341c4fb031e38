//! Mock transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use super::traits::{Transport, TransportError, TransportKind};
use crate::protocol::Response;

/// Mock transport for unit testing the protocol engine.
///
/// Each queued chunk is returned by one `read` call (split if the caller's
/// buffer is smaller). Clones share the same queues, so a test can keep a
/// handle while the engine owns the boxed transport.
#[derive(Clone)]
pub struct MockTransport {
    /// Chunks returned on read.
    read_queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Whether the host is "connected".
    connected: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            read_queue: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(Mutex::new(true)),
        }
    }

    /// Queue raw bytes to be returned by a single read.
    pub fn queue_read(&self, bytes: &[u8]) {
        self.read_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(bytes.to_vec());
    }

    /// Queue a command line as one frame.
    pub fn queue_command(&self, command: &str) {
        self.queue_read(command.as_bytes());
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.write_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Captured writes parsed as responses; unparseable writes are skipped.
    pub fn responses(&self) -> Vec<Response> {
        self.get_writes()
            .iter()
            .filter_map(|w| Response::parse(w).ok())
            .collect()
    }

    /// Simulate host disconnect.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let mut queue = self.read_queue.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(mut chunk) = queue.pop_front() else {
            // Host hung up once the script of reads is exhausted
            return Ok(0);
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            queue.push_front(chunk.split_off(n));
        }
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.write_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(data.to_vec());
        Ok(data.len())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Loopback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_read_queue() {
        let mut mock = MockTransport::new();
        mock.queue_command("getvar:product");
        mock.queue_command("reboot");

        assert_eq!(mock.read_frame().unwrap(), b"getvar:product");
        assert_eq!(mock.read_frame().unwrap(), b"reboot");

        // Queue is empty now
        assert!(matches!(
            mock.read_frame(),
            Err(TransportError::Disconnected)
        ));
    }

    #[test]
    fn test_mock_splits_large_chunks() {
        let mut mock = MockTransport::new();
        mock.queue_read(&[7u8; 100]);

        let mut buf = [0u8; 64];
        assert_eq!(mock.read(&mut buf).unwrap(), 64);
        assert_eq!(mock.read(&mut buf).unwrap(), 36);
        assert_eq!(mock.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_mock_write_capture() {
        let mut mock = MockTransport::new();
        mock.write_all(b"OKAY").unwrap();
        mock.write_all(b"FAILnope").unwrap();

        let writes = mock.get_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], b"OKAY");

        let responses = mock.responses();
        assert!(responses[0].is_okay());
        assert_eq!(responses[1].text, "nope");
    }

    #[test]
    fn test_mock_disconnect() {
        let mut mock = MockTransport::new();
        assert!(mock.is_connected());

        mock.disconnect();
        assert!(!mock.is_connected());
        assert!(mock.write(b"test").is_err());
    }
}
