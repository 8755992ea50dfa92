use std::{
    io::{self, ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr},
    os::fd::{AsRawFd, RawFd},
};

use crate::hub::{EventKind, wait};

/// A connected TCP socket whose reads and writes suspend the calling fiber
/// instead of blocking the thread.
#[derive(Debug)]
pub struct TcpStream {
    stream: mio::net::TcpStream,
}

impl TcpStream {
    pub(crate) fn from_mio(stream: mio::net::TcpStream) -> Self {
        Self { stream }
    }

    /// Opens a connection to `addr`.
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = mio::net::TcpStream::connect(addr)?;
        loop {
            wait(stream.as_raw_fd(), EventKind::Writable).await?;
            if let Some(err) = stream.take_error()? {
                return Err(err);
            }
            match stream.peer_addr() {
                Ok(_) => return Ok(Self { stream }),
                Err(err) if err.kind() == ErrorKind::NotConnected => {}
                Err(err) => return Err(err),
            }
        }
    }

    /// Reads into `buf`. `Ok(0)` means the peer closed its side.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match (&self.stream).read(buf) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    wait(self.as_raw_fd(), EventKind::Readable).await?
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match (&self.stream).write(buf) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    wait(self.as_raw_fd(), EventKind::Writable).await?
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf).await? {
                0 => return Err(ErrorKind::WriteZero.into()),
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.stream.shutdown(how)
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.stream.set_nodelay(nodelay)
    }
}

impl AsRawFd for TcpStream {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}
