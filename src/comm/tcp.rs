//! TCP variant of the transport contract.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use crate::errors::CommError;

use super::{read_framed, wait_readable, Acceptor, AcceptorFactory, Connection, FrameBuffer};

/// Listening TCP endpoint.
///
/// With `try_subsequent_ports` set, a bind collision moves to the next port
/// until one is free; otherwise it fails with [`CommError::AlreadyInUse`].
pub struct TcpAcceptor {
    listener: Option<TcpListener>,
    host: String,
    port: u16,
}

impl TcpAcceptor {
    pub fn bind(host: &str, port: u16, try_subsequent_ports: bool) -> Result<Self, CommError> {
        let mut port = port;
        loop {
            match TcpListener::bind((host, port)) {
                Ok(listener) => {
                    let port = listener.local_addr()?.port();
                    return Ok(TcpAcceptor {
                        listener: Some(listener),
                        host: host.to_string(),
                        port,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AddrInUse => {
                    if !try_subsequent_ports {
                        return Err(CommError::AlreadyInUse);
                    }
                    port = port.checked_add(1).ok_or(CommError::AlreadyInUse)?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Acceptor for TcpAcceptor {
    fn type_tag(&self) -> &'static str {
        "tcp"
    }

    fn dial_instructions(&self) -> String {
        format!("{}_{}", self.host, self.port)
    }

    fn accept(
        &mut self,
        buf_size: usize,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn Connection>, CommError> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| CommError::Connection(ErrorKind::NotConnected.into()))?;
        wait_readable(listener.as_raw_fd(), timeout)?;
        let (stream, _addr) = listener.accept()?;
        Ok(Box::new(TcpConnection::new(stream, buf_size)))
    }

    fn close(&mut self) {
        self.listener.take();
    }
}

/// Binds a fresh ephemeral-port acceptor per subclient.
pub struct TcpAcceptorFactory {
    host: String,
}

impl TcpAcceptorFactory {
    /// `host` is both the bind address and the address advertised in dial
    /// instructions, so it must be reachable from the peer.
    pub fn new(host: &str) -> Self {
        TcpAcceptorFactory {
            host: host.to_string(),
        }
    }
}

impl AcceptorFactory for TcpAcceptorFactory {
    fn type_tag(&self) -> &'static str {
        "tcp"
    }

    fn make_acceptor(&self) -> Result<Box<dyn Acceptor>, CommError> {
        Ok(Box::new(TcpAcceptor::bind(&self.host, 0, false)?))
    }
}

pub struct TcpConnection {
    stream: TcpStream,
    frames: FrameBuffer,
    chunk: Vec<u8>,
}

impl TcpConnection {
    pub fn new(stream: TcpStream, buf_size: usize) -> Self {
        TcpConnection {
            stream,
            frames: FrameBuffer::new(),
            chunk: vec![0u8; buf_size.max(1)],
        }
    }

}

impl Connection for TcpConnection {
    fn read_line(&mut self) -> Result<String, CommError> {
        let (stream, frames, chunk) = (&mut self.stream, &mut self.frames, &mut self.chunk);
        read_framed(frames, chunk, |buf| stream.read(buf).map_err(CommError::from))
    }

    fn read_line_timeout(&mut self, timeout: Duration) -> Result<String, CommError> {
        let fd = self.stream.as_raw_fd();
        let (stream, frames, chunk) = (&mut self.stream, &mut self.frames, &mut self.chunk);
        read_framed(frames, chunk, |buf| {
            wait_readable(fd, Some(timeout))?;
            stream.read(buf).map_err(CommError::from)
        })
    }

    fn read_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, CommError> {
        wait_readable(self.stream.as_raw_fd(), Some(timeout))?;
        self.stream.read(buf).map_err(CommError::from)
    }

    fn write_line(&mut self, msg: &str) -> Result<(), CommError> {
        self.stream.write_all(msg.as_bytes())?;
        self.stream.write_all(b"\n")?;
        Ok(())
    }

    fn write_bytes(&mut self, buf: &[u8]) -> Result<(), CommError> {
        self.stream.write_all(buf)?;
        Ok(())
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Dial a TCP peer and wrap the stream in the framed connection.
pub fn dial_tcp(host: &str, port: u16, buf_size: usize) -> Result<Box<dyn Connection>, CommError> {
    let stream = TcpStream::connect((host, port))?;
    Ok(Box::new(TcpConnection::new(stream, buf_size)))
}
