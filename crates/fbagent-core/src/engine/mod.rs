//! Protocol engine.
//!
//! Reads one command frame at a time, dispatches it through the registry
//! and makes sure every command ends with exactly one acknowledgement.
//! The download buffer is shared with the script worker behind a mutex.
//! A host connection holds it from connect to disconnect and a script holds
//! it for its whole run, so a `download:` and the `flash:` that follows can
//! never see a payload staged by the other side.

pub mod builtins;
pub mod session;
pub mod state;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::config::AgentConfig;
use crate::download::{DownloadBuffer, DownloadError};
use crate::error::ErrorKind;
use crate::events::{AgentEvent, AgentObserver, LogLevel};
use crate::flash::FlashError;
use crate::mbr::MbrError;
use crate::osip::OsipError;
use crate::power::PowerControl;
use crate::protocol::ProtocolError;
use crate::registry::{Registry, RegistryError};
use crate::sparse::SparseError;
use crate::storage::{StorageError, StorageProvider, VolumeTable};
use crate::transport::{Transport, TransportError, TransportHub};

pub use session::{ResponseError, Session};
pub use state::ProtocolState;

/// Pause before retrying transport discovery.
const REOPEN_BACKOFF: Duration = Duration::from_millis(100);

/// Collaborators available to every handler.
pub struct Services {
    pub config: AgentConfig,
    pub volumes: VolumeTable,
    pub storage: Arc<dyn StorageProvider>,
    pub power: Arc<dyn PowerControl>,
    pub observer: Arc<dyn AgentObserver>,
}

impl Services {
    pub fn emit(&self, event: AgentEvent) {
        self.observer.on_event(&event);
    }

    /// User-facing status line.
    pub fn message(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(AgentEvent::Message {
            level,
            message: message.into(),
        });
    }
}

/// Everything a command handler may touch.
pub struct CommandContext<'a> {
    pub session: &'a mut Session,
    pub download: &'a mut DownloadBuffer,
    pub registry: &'a Registry,
    pub services: &'a Services,
}

impl CommandContext<'_> {
    pub fn okay(&mut self, text: &str) -> Result<(), ResponseError> {
        self.session.okay(text)
    }

    pub fn fail(&mut self, reason: &str) -> Result<(), ResponseError> {
        self.session.fail(reason)
    }

    pub fn info(&mut self, text: &str) -> Result<(), ResponseError> {
        self.session.info(text)
    }
}

pub struct Engine {
    registry: Arc<Registry>,
    download: Arc<Mutex<DownloadBuffer>>,
    services: Arc<Services>,
}

impl Engine {
    pub fn new(
        registry: Arc<Registry>,
        download: Arc<Mutex<DownloadBuffer>>,
        services: Arc<Services>,
    ) -> Self {
        Self {
            registry,
            download,
            services,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Lock the shared download buffer.
    pub fn download(&self) -> MutexGuard<'_, DownloadBuffer> {
        self.download.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serve hosts forever, one connection at a time.
    pub fn serve(&self, hub: &mut TransportHub) -> ! {
        loop {
            if let Err(e) = self.serve_one(hub) {
                warn!(error = %e, "Waiting for a host failed");
                thread::sleep(REOPEN_BACKOFF);
            }
        }
    }

    /// Wait for one host and serve it until the link drops.
    pub fn serve_one(&self, hub: &mut TransportHub) -> Result<(), TransportError> {
        let transport = hub.wait()?;
        self.run_connection(transport);
        Ok(())
    }

    /// Handle commands on `transport` until it fails.
    #[instrument(skip_all, fields(transport = %transport.kind()))]
    pub fn run_connection(&self, transport: Box<dyn Transport>) {
        let kind = transport.kind();
        self.services.emit(AgentEvent::Connected { transport: kind });
        let mut session = Session::new(transport, self.services.observer.clone());
        let mut download = self.download();
        debug!("Download buffer held for the connection");

        loop {
            match session.read_command() {
                Ok(line) => self.execute(&mut session, &mut download, &line),
                Err(ResponseError::Transport(e)) => {
                    info!(error = %e, "Connection closed");
                    break;
                }
                Err(ResponseError::Protocol(e)) => {
                    warn!(error = %e, "Bad command frame");
                    if session.fail(&e.to_string()).is_err() {
                        let _ = session.fail(e.kind().label());
                    }
                }
            }
            if session.state() == ProtocolState::Error {
                break;
            }
        }

        self.services.emit(AgentEvent::Disconnected { transport: kind });
    }

    /// Run one command line against a download buffer the caller has locked
    /// through [`Engine::download`].
    pub fn execute(&self, session: &mut Session, download: &mut DownloadBuffer, line: &str) {
        self.services.emit(AgentEvent::Command {
            line: line.to_string(),
        });

        let Some(command) = self.registry.find_command(line) else {
            let err = ProtocolError::UnknownCommand(line.to_string());
            debug!(command = %line, "No matching prefix");
            let _ = session.fail(&err.to_string());
            self.report(session);
            return;
        };
        let arg = line.strip_prefix(command.prefix()).unwrap_or_default();

        let result = {
            let mut ctx = CommandContext {
                session: &mut *session,
                download: &mut *download,
                registry: &self.registry,
                services: &self.services,
            };
            (command.handler())(&mut ctx, arg)
        };

        if session.state() == ProtocolState::Error {
            return;
        }
        if let Err(e) = result {
            warn!(command = %line, error = %e, "Command failed");
            if let Err(send) = report_failure(session, &e) {
                debug!(error = %send, "Failure not reported");
            }
        }
        if session.state() == ProtocolState::Command {
            warn!(command = %line, "Handler did not acknowledge");
            let _ = session.fail("unknown reason");
        }
        self.report(session);
    }

    fn report(&self, session: &Session) {
        let ok = session.last_ack() == Some(true);
        self.services.emit(AgentEvent::CommandResult {
            ok,
            message: if ok { "OKAY" } else { "FAIL" }.to_string(),
        });
    }
}

fn report_failure(session: &mut Session, err: &anyhow::Error) -> Result<(), ResponseError> {
    match session.fail(&err.to_string()) {
        Err(ResponseError::Protocol(_)) => {
            session.fail(error_kind(err).unwrap_or(ErrorKind::Protocol).label())
        }
        other => other,
    }
}

/// Classify a handler error by the first typed error in its chain.
pub fn error_kind(err: &anyhow::Error) -> Option<ErrorKind> {
    err.chain().find_map(|cause| {
        if let Some(e) = cause.downcast_ref::<TransportError>() {
            Some(e.kind())
        } else if let Some(e) = cause.downcast_ref::<ProtocolError>() {
            Some(e.kind())
        } else if let Some(e) = cause.downcast_ref::<ResponseError>() {
            Some(e.kind())
        } else if let Some(e) = cause.downcast_ref::<DownloadError>() {
            Some(e.kind())
        } else if let Some(e) = cause.downcast_ref::<StorageError>() {
            Some(e.kind())
        } else if let Some(e) = cause.downcast_ref::<SparseError>() {
            Some(e.kind())
        } else if let Some(e) = cause.downcast_ref::<OsipError>() {
            Some(e.kind())
        } else if let Some(e) = cause.downcast_ref::<MbrError>() {
            Some(e.kind())
        } else if let Some(e) = cause.downcast_ref::<FlashError>() {
            Some(e.kind())
        } else {
            cause.downcast_ref::<RegistryError>().map(RegistryError::kind)
        }
    })
}
