//! One host connection: framing, responses and the acknowledgement rule.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace, warn};

use super::state::ProtocolState;
use crate::error::ErrorKind;
use crate::events::{AgentEvent, AgentObserver};
use crate::protocol::{ProtocolError, Response, decode_frame};
use crate::transport::{Transport, TransportError, TransportKind};

#[derive(Error, Debug)]
pub enum ResponseError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ResponseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResponseError::Transport(e) => e.kind(),
            ResponseError::Protocol(e) => e.kind(),
        }
    }
}

pub struct Session {
    transport: Box<dyn Transport>,
    state: ProtocolState,
    observer: Arc<dyn AgentObserver>,
    last_ack: Option<bool>,
}

impl Session {
    pub fn new(transport: Box<dyn Transport>, observer: Arc<dyn AgentObserver>) -> Self {
        Self {
            transport,
            state: ProtocolState::Offline,
            observer,
            last_ack: None,
        }
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Whether the last acknowledgement was OKAY.
    pub fn last_ack(&self) -> Option<bool> {
        self.last_ack
    }

    pub fn goto(&mut self, to: ProtocolState) {
        if self.state == to {
            return;
        }
        trace!(from = %self.state, to = %to, "Protocol state");
        self.observer.on_event(&AgentEvent::StateChanged {
            from: self.state,
            to,
        });
        self.state = to;
    }

    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    /// Read and decode the next command frame.
    ///
    /// On success the session is in `Command` state.
    pub fn read_command(&mut self) -> Result<String, ResponseError> {
        let frame = match self.transport.read_frame() {
            Ok(frame) => frame,
            Err(e) => {
                self.goto(ProtocolState::Error);
                return Err(e.into());
            }
        };
        self.begin();
        Ok(decode_frame(&frame)?)
    }

    /// Start handling a new command.
    pub fn begin(&mut self) {
        self.last_ack = None;
        self.goto(ProtocolState::Command);
    }

    /// Encode and write one response frame.
    pub fn send(&mut self, response: &Response) -> Result<(), ResponseError> {
        let frame = response.encode()?;
        trace!(code = %response.code, text = %response.text, "Response");
        if let Err(e) = self.transport.write_all(&frame) {
            warn!(error = %e, "Response write failed");
            self.goto(ProtocolState::Error);
            return Err(e.into());
        }
        Ok(())
    }

    fn ack(&mut self, response: Response) -> Result<(), ResponseError> {
        if !self.state.accepts_ack() {
            debug!(state = %self.state, code = %response.code, "Acknowledgement dropped");
            return Ok(());
        }
        let ok = response.is_okay();
        self.send(&response)?;
        self.last_ack = Some(ok);
        self.goto(ProtocolState::Complete);
        Ok(())
    }

    pub fn okay(&mut self, text: &str) -> Result<(), ResponseError> {
        self.ack(Response::okay(text))
    }

    pub fn fail(&mut self, reason: &str) -> Result<(), ResponseError> {
        self.ack(Response::fail(reason))
    }

    /// Send an `INFO` line; only meaningful while a command is running.
    pub fn info(&mut self, text: &str) -> Result<(), ResponseError> {
        if !self.state.accepts_ack() {
            return Ok(());
        }
        self.send(&Response::info(text))
    }

    pub fn send_data(&mut self, len: u32) -> Result<(), ResponseError> {
        self.send(&Response::data(len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::protocol::ResponseCode;
    use crate::transport::MockTransport;

    fn session(mock: &MockTransport) -> Session {
        Session::new(Box::new(mock.clone()), Arc::new(NullObserver))
    }

    #[test]
    fn test_ack_outside_command_is_noop() {
        let mock = MockTransport::new();
        let mut s = session(&mock);
        s.okay("early").unwrap();
        assert!(mock.get_writes().is_empty());
        assert_eq!(s.state(), ProtocolState::Offline);
    }

    #[test]
    fn test_single_ack_per_command() {
        let mock = MockTransport::new();
        mock.queue_command("getvar:product");
        let mut s = session(&mock);
        assert_eq!(s.read_command().unwrap(), "getvar:product");
        s.info("first").unwrap();
        s.okay("value").unwrap();
        s.fail("late").unwrap();

        let responses = mock.responses();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].code, ResponseCode::Info);
        assert!(responses[1].is_okay());
        assert_eq!(s.state(), ProtocolState::Complete);
        assert_eq!(s.last_ack(), Some(true));
    }

    #[test]
    fn test_oversized_ack_keeps_command_state() {
        let mock = MockTransport::new();
        mock.queue_command("x");
        let mut s = session(&mock);
        s.read_command().unwrap();
        let err = s.fail(&"e".repeat(70)).unwrap_err();
        assert!(matches!(err, ResponseError::Protocol(ProtocolError::ResponseTooLong { .. })));
        assert_eq!(s.state(), ProtocolState::Command);
        assert!(mock.get_writes().is_empty());
    }

    #[test]
    fn test_empty_read_is_error_state() {
        let mock = MockTransport::new();
        let mut s = session(&mock);
        assert!(matches!(
            s.read_command(),
            Err(ResponseError::Transport(TransportError::Disconnected))
        ));
        assert_eq!(s.state(), ProtocolState::Error);
    }
}
