//! Reboot control.

use std::fmt;
use std::process::Command;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result, bail};
use tracing::info;

/// Where the device should come back up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebootTarget {
    /// The main OS.
    System,
    /// Back into this agent.
    Bootloader,
    Recovery,
    /// Any other boot target understood by the platform.
    Other(String),
}

impl RebootTarget {
    pub fn from_arg(arg: &str) -> Self {
        match arg {
            "android" | "" => RebootTarget::System,
            "bootloader" | "fastboot" => RebootTarget::Bootloader,
            "recovery" => RebootTarget::Recovery,
            other => RebootTarget::Other(other.to_string()),
        }
    }

    pub fn as_arg(&self) -> &str {
        match self {
            RebootTarget::System => "android",
            RebootTarget::Bootloader => "bootloader",
            RebootTarget::Recovery => "recovery",
            RebootTarget::Other(s) => s,
        }
    }
}

impl fmt::Display for RebootTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_arg())
    }
}

pub trait PowerControl: Send + Sync {
    /// Flush filesystems and restart into `target`.
    fn reboot(&self, target: &RebootTarget) -> Result<()>;
}

/// Reboots the running system.
pub struct SystemPower;

impl PowerControl for SystemPower {
    fn reboot(&self, target: &RebootTarget) -> Result<()> {
        nix::unistd::sync();
        info!(target = %target, "Rebooting");
        let status = Command::new("reboot")
            .arg(target.as_arg())
            .status()
            .context("failed to run reboot")?;
        if !status.success() {
            bail!("reboot exited with {status}");
        }
        Ok(())
    }
}

/// Records reboot requests instead of acting on them.
#[derive(Default)]
pub struct RecordingPower {
    requests: Mutex<Vec<RebootTarget>>,
}

impl RecordingPower {
    pub fn requests(&self) -> Vec<RebootTarget> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PowerControl for RecordingPower {
    fn reboot(&self, target: &RebootTarget) -> Result<()> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(target.clone());
        Ok(())
    }
}
