use crate::net::support::{FaultKind, NetError, NetResult};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

const RECV_BUFFER_SIZE: usize = 256 * 1024;

/// Resolves `host:port` to the first IPv4 address.
pub fn resolve(host: &str, port: u16) -> NetResult<SocketAddr> {
    let mut candidates = (host, port)
        .to_socket_addrs()
        .map_err(|_| NetError::Fatal(FaultKind::AddrParse))?;

    candidates
        .find(|addr| addr.is_ipv4())
        .ok_or(NetError::Fatal(FaultKind::AddrParse))
}

/// Non-blocking UDP endpoint. Receives return `Ok(None)` when no datagram
/// is pending; sends block (UDP sendto rarely does).
pub struct UdpEndpoint {
    socket: UdpSocket,
}

impl UdpEndpoint {
    fn setup(socket: Socket) -> NetResult<UdpSocket> {
        // Best effort; a smaller receive buffer only degrades burst capacity.
        drop(socket.set_recv_buffer_size(RECV_BUFFER_SIZE));
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    }

    /// Binds a listening endpoint on all interfaces.
    pub fn bind(port: u16) -> NetResult<UdpEndpoint> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        socket.bind(&addr.into())?;

        Ok(UdpEndpoint {
            socket: Self::setup(socket)?,
        })
    }

    /// Creates an ephemeral endpoint locked onto one remote peer.
    pub fn connect(remote: SocketAddr) -> NetResult<UdpEndpoint> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        let local: SocketAddr = ([0, 0, 0, 0], 0).into();
        socket.bind(&local.into())?;

        let endpoint = UdpEndpoint {
            socket: Self::setup(socket)?,
        };
        endpoint.socket.connect(remote)?;

        Ok(endpoint)
    }

    /// A second handle to the same OS socket, for per-peer encoders.
    pub fn try_clone(&self) -> NetResult<UdpEndpoint> {
        Ok(UdpEndpoint {
            socket: self.socket.try_clone()?,
        })
    }

    pub fn local_addr(&self) -> NetResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Sends to the connected peer.
    pub fn send(&self, buf: &[u8]) -> NetResult<usize> {
        Ok(self.socket.send(buf)?)
    }

    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> NetResult<usize> {
        Ok(self.socket.send_to(buf, addr)?)
    }

    /// One pending datagram, or `None` when the socket is drained.
    pub fn recv_from(&self, buf: &mut [u8]) -> NetResult<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((size, addr)) => Ok(Some((size, addr))),
            Err(err) => match NetError::from(err) {
                NetError::Wait => Ok(None),
                fatal => Err(fatal),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_localhost() {
        let addr = resolve("127.0.0.1", 5000).unwrap();
        assert_eq!(addr.port(), 5000);
        assert!(addr.is_ipv4());
    }

    #[test]
    fn test_resolve_garbage() {
        assert!(resolve("definitely-not-a-host.invalid.", 1).is_err());
    }

    #[test]
    fn test_loopback_roundtrip() {
        let server = UdpEndpoint::bind(0).unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = UdpEndpoint::connect(server_addr).unwrap();
        client.send(&[1, 2, 3]).unwrap();

        let mut buf = [0u8; 16];
        // Loopback delivery is asynchronous; poll briefly.
        let mut received = None;
        for _ in 0..100 {
            if let Some(result) = server.recv_from(&mut buf).unwrap() {
                received = Some(result);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        let (size, _from) = received.expect("datagram never arrived");
        assert_eq!(&buf[..size], &[1, 2, 3]);
    }

    #[test]
    fn test_empty_receive_is_none() {
        let socket = UdpEndpoint::bind(0).unwrap();
        let mut buf = [0u8; 16];
        assert!(socket.recv_from(&mut buf).unwrap().is_none());
    }
}
