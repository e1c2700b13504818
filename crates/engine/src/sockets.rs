//! Socket creation and option helpers shared by the client and the server
//! listeners.

use std::io;
use std::net::{SocketAddr, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

/// Create a UDP socket without binding it, so per-socket options (CPU
/// affinity, reuse flags) can be applied first.
pub fn create_udp_socket(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Options applied before bind. Listeners sharing one endpoint need the
/// reuse flags so the kernel balances datagrams across their sockets.
pub fn set_pre_bind_options(socket: &Socket, shared_endpoint: bool) -> io::Result<()> {
    if shared_endpoint {
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
    }
    Ok(())
}

/// Bind and convert into a std socket.
pub fn bind_udp_socket(socket: Socket, addr: SocketAddr) -> io::Result<UdpSocket> {
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Options applied after a connection is established. Nothing is needed on
/// this platform today; the hook stays so role code reads the same as the
/// listener path.
pub fn set_post_connect_options(_socket: &UdpSocket, _remote: SocketAddr) -> io::Result<()> {
    Ok(())
}

/// The ephemeral wildcard address matching `target`'s family.
pub fn ephemeral_bind_address(target: SocketAddr) -> SocketAddr {
    if target.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_bind_and_query() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = create_udp_socket(addr).unwrap();
        set_pre_bind_options(&socket, false).unwrap();
        let socket = bind_udp_socket(socket, addr).unwrap();

        let local = socket.local_addr().unwrap();
        assert_ne!(local.port(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn shared_endpoint_allows_two_binds() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let first = create_udp_socket(addr).unwrap();
        set_pre_bind_options(&first, true).unwrap();
        let first = bind_udp_socket(first, addr).unwrap();
        let bound = first.local_addr().unwrap();

        let second = create_udp_socket(bound).unwrap();
        set_pre_bind_options(&second, true).unwrap();
        let second = bind_udp_socket(second, bound).unwrap();
        assert_eq!(second.local_addr().unwrap(), bound);
    }

    #[test]
    fn ephemeral_address_matches_family() {
        let v4: SocketAddr = "10.0.0.1:9".parse().unwrap();
        assert!(ephemeral_bind_address(v4).is_ipv4());

        let v6: SocketAddr = "[2001:db8::1]:9".parse().unwrap();
        assert!(ephemeral_bind_address(v6).is_ipv6());
    }
}
