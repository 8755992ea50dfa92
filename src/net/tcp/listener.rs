use std::{
    io::{self, ErrorKind},
    net::{SocketAddr, ToSocketAddrs},
    ops::Deref,
    os::fd::{AsRawFd, RawFd},
};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use super::TcpStream;
use crate::hub::{EventKind, wait};

/// Listen backlog used by [`TcpListener::bind`].
pub const DEFAULT_BACKLOG: i32 = 511;

/// Creates a non-blocking listening socket for `addr`.
///
/// The address family follows `addr`. `SO_REUSEADDR` is set everywhere except
/// Windows.
pub fn listen(addr: impl ToSocketAddrs, backlog: i32) -> io::Result<TcpListener> {
    let addr = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no address to listen on"))?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    #[cfg(not(windows))]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    let listener = TcpListener::from_std(socket.into());
    debug!(addr = %listener.local_addr()?, backlog, "listening");
    Ok(listener)
}

#[derive(Debug)]
pub struct TcpListener {
    listener: mio::net::TcpListener,
}

impl TcpListener {
    /// Binds with [`DEFAULT_BACKLOG`].
    pub fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        listen(addr, DEFAULT_BACKLOG)
    }

    /// Wraps a listener that is already in non-blocking mode.
    pub fn from_std(listener: std::net::TcpListener) -> Self {
        Self {
            listener: mio::net::TcpListener::from_std(listener),
        }
    }

    /// Accepts a connection, suspending the fiber until one is pending.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => return Ok((TcpStream::from_mio(stream), addr)),
                Err(error) if error.kind() == ErrorKind::WouldBlock => {
                    wait(self.as_raw_fd(), EventKind::Readable).await?
                }
                Err(error) if error.kind() == ErrorKind::Interrupted => {}
                Err(error) => return Err(error),
            }
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl AsRawFd for TcpListener {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

impl Deref for TcpListener {
    type Target = mio::net::TcpListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;
    use crate::runtime::RuntimeBuilder;

    #[test]
    fn test_listen_picks_free_port() {
        let listener = listen("127.0.0.1:0", 16).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_listen_without_address_fails() {
        let none: &[SocketAddr] = &[];
        let err = listen(none, 16).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_accept_waits_for_client() {
        let handle = RuntimeBuilder::default().catch_interrupt(false).build().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = std::thread::spawn(move || {
            let mut stream = std::net::TcpStream::connect(addr).unwrap();
            stream.write_all(b"hi").unwrap();
            let mut buf = [0u8; 2];
            stream.read_exact(&mut buf).unwrap();
            buf
        });

        let peer = handle
            .block_on(async move {
                let (stream, peer) = listener.accept().await.unwrap();
                let mut buf = [0u8; 2];
                let n = stream.read(&mut buf).await.unwrap();
                stream.write_all(&buf[..n]).await.unwrap();
                peer
            })
            .unwrap();

        assert!(peer.ip().is_loopback());
        assert_eq!(&client.join().unwrap(), b"hi");
        assert_eq!(handle.hub().listener_count(), 0);
    }
}
