//! TCP listener setup with socket options `TcpListener::bind` doesn't expose.
//!
//! [`Server`](crate::Server) takes a ready-made [`tokio::net::TcpListener`],
//! so the usual `TcpListener::bind` is all a caller needs. This module exists
//! for the case where you're replacing a listener behind a reverse proxy or
//! running more than one process against the same port: [`bind_reuse`] sets
//! `SO_REUSEADDR` and, on unix, `SO_REUSEPORT` before binding, so a restart
//! doesn't hit "address already in use" and two processes can share a port
//! for load balancing.

use std::{io, net::SocketAddr};

use socket2::{Domain, Socket, Type};
use tokio::net::TcpListener;

/// Binds a TCP listener with `SO_REUSEADDR` (and, on unix, `SO_REUSEPORT`)
/// set before `bind()`, then hands it to tokio in non-blocking mode.
///
/// # Errors
/// Returns an error if the socket can't be created, configured, bound, or
/// put into listening/non-blocking mode.
pub fn bind_reuse(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, None)?;

    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;

    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;

    TcpListener::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_and_reports_local_addr() {
        let _guard = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .enter();

        let listener = bind_reuse("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_eq!(listener.local_addr().unwrap().ip(), "127.0.0.1".parse::<std::net::IpAddr>().unwrap());
    }

    #[test]
    fn two_listeners_can_share_a_port() {
        let _guard = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .enter();

        let first = bind_reuse("127.0.0.1:0".parse().unwrap()).unwrap();
        let port = first.local_addr().unwrap().port();

        #[cfg(unix)]
        {
            let second = bind_reuse(format!("127.0.0.1:{port}").parse().unwrap());
            assert!(second.is_ok());
        }
    }
}
