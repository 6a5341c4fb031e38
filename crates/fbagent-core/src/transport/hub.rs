//! Multiplexed wait across the USB and TCP transports.
//!
//! USB is preferred. The TCP listener is only bound once no USB backend
//! could be opened, and from then on both are waited on together; a USB
//! function that shows up later is found by periodic rescans. A USB link is
//! handed out whole and reopened on the next wait after the connection is
//! dropped.

use std::net::TcpListener;
use std::os::fd::AsFd;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, warn};

use super::tcp::{TcpTransport, listen};
use super::traits::{Transport, TransportError};
use super::usb::UsbLink;
use crate::protocol::USB_RESCAN_MS;

/// Where the hub looks for each backend.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub usb_device_path: PathBuf,
    pub ffs_path: PathBuf,
    pub tcp_port: u16,
}

pub struct TransportHub {
    config: HubConfig,
    usb: Option<UsbLink>,
    tcp: Option<TcpListener>,
}

impl TransportHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            usb: None,
            tcp: None,
        }
    }

    fn reopen(&mut self) {
        if self.usb.is_none() {
            match UsbLink::open(&self.config.usb_device_path, &self.config.ffs_path) {
                Ok(link) => self.usb = Some(link),
                Err(e) => debug!(error = %e, "No USB transport"),
            }
        }
        if self.usb.is_none() && self.tcp.is_none() {
            match listen(self.config.tcp_port) {
                Ok(listener) => self.tcp = Some(listener),
                Err(e) => warn!(error = %e, "No TCP transport"),
            }
        }
    }

    /// Block until a host connection is readable and return it.
    ///
    /// While only the TCP listener is open, the USB backends are retried
    /// every [`USB_RESCAN_MS`] so a gadget configured later still gets
    /// picked up.
    pub fn wait(&mut self) -> Result<Box<dyn Transport>, TransportError> {
        loop {
            self.reopen();
            let (usb_ready, tcp_ready) = self.poll_ready()?;

            if usb_ready {
                if let Some(link) = self.usb.take() {
                    debug!(kind = %link.kind(), "USB transport readable");
                    return Ok(Box::new(link));
                }
            }
            if tcp_ready {
                if let Some(listener) = &self.tcp {
                    let conn = TcpTransport::accept(listener)?;
                    return Ok(Box::new(conn));
                }
            }
        }
    }

    /// Poll the open backends; `(false, false)` means rescan.
    fn poll_ready(&self) -> Result<(bool, bool), TransportError> {
        let mut fds = Vec::with_capacity(2);
        if let Some(usb) = &self.usb {
            fds.push(PollFd::new(usb.as_fd(), PollFlags::POLLIN));
        }
        if let Some(tcp) = &self.tcp {
            fds.push(PollFd::new(tcp.as_fd(), PollFlags::POLLIN));
        }
        if fds.is_empty() {
            return Err(TransportError::NotAvailable(
                "neither USB nor TCP could be opened".into(),
            ));
        }

        let timeout = if self.usb.is_some() {
            PollTimeout::NONE
        } else {
            PollTimeout::from(USB_RESCAN_MS)
        };
        let events = loop {
            match poll(&mut fds, timeout) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        };
        if events == 0 {
            return Ok((false, false));
        }

        let ready = |fd: &PollFd| {
            fd.revents().is_some_and(|r| {
                r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
            })
        };
        let usb_ready = self.usb.is_some() && ready(&fds[0]);
        let tcp_ready = match (&self.usb, &self.tcp) {
            (Some(_), Some(_)) => ready(&fds[1]),
            (None, Some(_)) => ready(&fds[0]),
            _ => false,
        };
        if !usb_ready && !tcp_ready {
            debug!("Spurious wakeup");
        }
        Ok((usb_ready, tcp_ready))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpStream;

    #[test]
    fn test_falls_back_to_tcp() {
        // Reserve a free port, then let the hub bind it
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut hub = TransportHub::new(HubConfig {
            usb_device_path: "/nonexistent/android_adb".into(),
            ffs_path: "/nonexistent/usb-ffs".into(),
            tcp_port: port,
        });

        let client = std::thread::spawn(move || {
            for _ in 0..50 {
                if let Ok(mut s) = TcpStream::connect(("127.0.0.1", port)) {
                    s.write_all(b"reboot").unwrap();
                    return;
                }
                std::thread::sleep(std::time::Duration::from_millis(20));
            }
        });

        let mut transport = hub.wait().unwrap();
        assert_eq!(transport.kind(), crate::transport::TransportKind::Tcp);
        assert_eq!(transport.read_frame().unwrap(), b"reboot");
        client.join().unwrap();
    }

    #[test]
    fn test_usb_found_after_tcp_fallback() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let node = std::env::temp_dir().join(format!("fbagent-hub-usb-{}", std::process::id()));
        let _ = std::fs::remove_file(&node);
        let mut hub = TransportHub::new(HubConfig {
            usb_device_path: node.clone(),
            ffs_path: "/nonexistent/usb-ffs".into(),
            tcp_port: port,
        });
        hub.reopen();
        assert!(hub.usb.is_none());
        assert!(hub.tcp.is_some());

        let creator = {
            let node = node.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(200));
                std::fs::write(&node, b"").unwrap();
            })
        };

        let transport = hub.wait().unwrap();
        assert_eq!(transport.kind(), crate::transport::TransportKind::UsbDevice);
        creator.join().unwrap();
        std::fs::remove_file(&node).unwrap();
    }
}
