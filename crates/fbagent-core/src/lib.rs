//! fbagent-core: a device-side fastboot flashing agent.
//!
//! The agent accepts fastboot commands from a host over USB FunctionFS or
//! TCP, buffers downloaded images, and writes them to eMMC volumes, OSIP
//! boot slots, or files.
//!
//! # Architecture
//!
//! - **Protocol**: command framing and bounded responses
//! - **Transport**: USB function endpoints, TCP, and a mock for tests
//! - **Download**: the shared scratch buffer with file spill-over
//! - **Registry**: commands, variables, flash and OEM handlers built up front
//! - **Engine**: the per-connection state machine and dispatcher
//! - **Flash**: image routing plus sparse and gzip decoding
//! - **OSIP** / **MBR**: the two supported disk layouts
//! - **Script**: unattended installs from a command file
//!
//! # Example
//!
//! ```no_run
//! use fbagent_core::{Agent, AgentConfig};
//!
//! let config = AgentConfig::load_from_file("/etc/fbagent.toml")?;
//! Agent::new(config)?.run();
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod agent;
pub mod commands;
pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod events;
pub mod flash;
pub mod mbr;
pub mod osip;
pub mod power;
pub mod protocol;
pub mod registry;
pub mod script;
pub mod sparse;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use agent::Agent;
pub use config::{AgentConfig, StorageLayout};
pub use download::{DownloadBuffer, DownloadPayload, Payload};
pub use engine::{CommandContext, Engine, ProtocolState, Services};
pub use error::ErrorKind;
pub use events::{AgentEvent, AgentObserver, LogLevel, TracingObserver};
pub use flash::{FlashContext, FlashError, FlashOutcome};
pub use power::RebootTarget;
pub use registry::{Plugin, Registry, RegistryBuilder};
pub use transport::{Transport, TransportError};
