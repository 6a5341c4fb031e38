//! TCP fallback transport.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};

use tracing::info;

use super::traits::{Transport, TransportError, TransportKind};

/// Bind the fallback listener on all interfaces.
pub fn listen(port: u16) -> Result<TcpListener, TransportError> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let listener = TcpListener::bind(addr).map_err(|e| TransportError::OpenFailed {
        path: addr.to_string(),
        message: e.to_string(),
    })?;
    info!(port, "Listening for fastboot over TCP");
    Ok(listener)
}

/// One accepted TCP connection.
pub struct TcpTransport {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TcpTransport {
    pub fn accept(listener: &TcpListener) -> Result<Self, TransportError> {
        let (stream, peer) = listener.accept()?;
        stream.set_nodelay(true)?;
        info!(peer = %peer, "TCP connection accepted");
        Ok(Self { stream, peer })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.stream
            .read(buf)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.stream
            .write(data)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_round_trip() {
        let listener = listen(0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            stream.write_all(b"getvar:product").unwrap();
            let mut resp = [0u8; 64];
            let n = stream.read(&mut resp).unwrap();
            resp[..n].to_vec()
        });

        let mut transport = TcpTransport::accept(&listener).unwrap();
        assert_eq!(transport.kind(), TransportKind::Tcp);
        assert_eq!(transport.read_frame().unwrap(), b"getvar:product");
        transport.write_all(b"OKAYdroidboot").unwrap();

        assert_eq!(client.join().unwrap(), b"OKAYdroidboot");
    }
}
