//! Process-pipe variant of the transport contract.
//!
//! An acceptor owns two pipe pairs. The peer (usually a child process that
//! inherited the fds) reads from one and writes to the other; its dial
//! instructions are `"<peer-read-fd>_<peer-write-fd>"`. A connection
//! handshake consists of the peer writing the literal token `connect`;
//! anything else is a fatal protocol error.

use std::io::ErrorKind;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::errors::CommError;

use super::{read_framed, wait_readable, Acceptor, AcceptorFactory, Connection, FrameBuffer};

const HANDSHAKE: &[u8] = b"connect";

fn read_fd(fd: RawFd, buf: &mut [u8]) -> Result<usize, CommError> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err.into());
        }
    }
}

fn write_fd(fd: RawFd, mut buf: &[u8]) -> Result<(), CommError> {
    while !buf.is_empty() {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n > 0 {
            buf = &buf[n as usize..];
            continue;
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            if n == 0 {
                return Err(CommError::Connection(ErrorKind::WriteZero.into()));
            }
            return Err(err.into());
        }
    }
    Ok(())
}

fn new_pipe() -> Result<(RawFd, RawFd), CommError> {
    // No O_CLOEXEC: the peer ends must survive exec into the probe child.
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok((fds[0], fds[1]))
}

fn close_fd(fd: RawFd) {
    unsafe { libc::close(fd) };
}

/// One-shot pipe acceptor.
pub struct PipeAcceptor {
    /// Read end of the peer→local pipe.
    local_read: Option<RawFd>,
    /// Write end of the local→peer pipe.
    local_write: Option<RawFd>,
    /// Peer ends, published via dial instructions.
    peer_read: RawFd,
    peer_write: RawFd,
}

impl PipeAcceptor {
    pub fn new() -> Result<Self, CommError> {
        let (peer_read, local_write) = new_pipe()?;
        let (local_read, peer_write) = new_pipe()?;
        Ok(PipeAcceptor {
            local_read: Some(local_read),
            local_write: Some(local_write),
            peer_read,
            peer_write,
        })
    }

    /// The fds the peer dials with. After a child process inherits them the
    /// spawner must close them locally so EOF can propagate.
    pub fn peer_fds(&self) -> (RawFd, RawFd) {
        (self.peer_read, self.peer_write)
    }
}

impl Acceptor for PipeAcceptor {
    fn type_tag(&self) -> &'static str {
        "pipe"
    }

    fn dial_instructions(&self) -> String {
        format!("{}_{}", self.peer_read, self.peer_write)
    }

    fn accept(
        &mut self,
        buf_size: usize,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn Connection>, CommError> {
        let read_fd_num = self
            .local_read
            .take()
            .ok_or_else(|| CommError::Connection(ErrorKind::NotConnected.into()))?;
        let write_fd_num = self.local_write.take().expect("pipe ends taken together");

        let mut token = [0u8; HANDSHAKE.len()];
        let mut got = 0;
        while got < token.len() {
            if let Err(err) = wait_readable(read_fd_num, timeout) {
                close_fd(read_fd_num);
                close_fd(write_fd_num);
                return Err(err);
            }
            let n = match read_fd(read_fd_num, &mut token[got..]) {
                Ok(n) => n,
                Err(err) => {
                    close_fd(read_fd_num);
                    close_fd(write_fd_num);
                    return Err(err);
                }
            };
            if n == 0 {
                break;
            }
            got += n;
        }

        if &token[..got] != HANDSHAKE {
            close_fd(read_fd_num);
            close_fd(write_fd_num);
            return Err(CommError::Handshake);
        }

        Ok(Box::new(PipeConnection::new(
            read_fd_num,
            write_fd_num,
            buf_size,
        )))
    }

    fn close(&mut self) {
        if let Some(fd) = self.local_read.take() {
            close_fd(fd);
        }
        if let Some(fd) = self.local_write.take() {
            close_fd(fd);
        }
    }
}

impl Drop for PipeAcceptor {
    fn drop(&mut self) {
        Acceptor::close(self);
    }
}

pub struct PipeAcceptorFactory;

impl AcceptorFactory for PipeAcceptorFactory {
    fn type_tag(&self) -> &'static str {
        "pipe"
    }

    fn make_acceptor(&self) -> Result<Box<dyn Acceptor>, CommError> {
        Ok(Box::new(PipeAcceptor::new()?))
    }
}

pub struct PipeConnection {
    read_fd: Option<RawFd>,
    write_fd: Option<RawFd>,
    frames: FrameBuffer,
    chunk: Vec<u8>,
}

impl PipeConnection {
    pub fn new(read_fd: RawFd, write_fd: RawFd, buf_size: usize) -> Self {
        PipeConnection {
            read_fd: Some(read_fd),
            write_fd: Some(write_fd),
            frames: FrameBuffer::new(),
            chunk: vec![0u8; buf_size.max(1)],
        }
    }

    fn read_end(&self) -> Result<RawFd, CommError> {
        self.read_fd
            .ok_or_else(|| CommError::Connection(ErrorKind::NotConnected.into()))
    }

    fn write_end(&self) -> Result<RawFd, CommError> {
        self.write_fd
            .ok_or_else(|| CommError::Connection(ErrorKind::NotConnected.into()))
    }
}

impl Connection for PipeConnection {
    fn read_line(&mut self) -> Result<String, CommError> {
        let fd = self.read_end()?;
        read_framed(&mut self.frames, &mut self.chunk, |buf| read_fd(fd, buf))
    }

    fn read_line_timeout(&mut self, timeout: Duration) -> Result<String, CommError> {
        let fd = self.read_end()?;
        read_framed(&mut self.frames, &mut self.chunk, |buf| {
            wait_readable(fd, Some(timeout))?;
            read_fd(fd, buf)
        })
    }

    fn read_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, CommError> {
        let fd = self.read_end()?;
        wait_readable(fd, Some(timeout))?;
        read_fd(fd, buf)
    }

    fn write_line(&mut self, msg: &str) -> Result<(), CommError> {
        let fd = self.write_end()?;
        write_fd(fd, msg.as_bytes())?;
        write_fd(fd, b"\n")
    }

    fn write_bytes(&mut self, buf: &[u8]) -> Result<(), CommError> {
        write_fd(self.write_end()?, buf)
    }

    fn close(&mut self) {
        if let Some(fd) = self.read_fd.take() {
            close_fd(fd);
        }
        if let Some(fd) = self.write_fd.take() {
            close_fd(fd);
        }
    }
}

impl Drop for PipeConnection {
    fn drop(&mut self) {
        Connection::close(self);
    }
}

/// Dial a pipe acceptor from its published instructions (`"read_write"`),
/// performing the `connect` handshake.
pub fn dial_pipe(instructions: &str, buf_size: usize) -> Result<Box<dyn Connection>, CommError> {
    let (read_fd_num, write_fd_num) = parse_instructions(instructions)?;
    write_fd(write_fd_num, HANDSHAKE)?;
    Ok(Box::new(PipeConnection::new(
        read_fd_num,
        write_fd_num,
        buf_size,
    )))
}

/// Split `"read_write"` dial instructions into the two fd numbers.
pub fn parse_instructions(instructions: &str) -> Result<(RawFd, RawFd), CommError> {
    let parse = |s: Option<&str>| -> Option<RawFd> { s.and_then(|v| v.parse().ok()) };
    let mut parts = instructions.split('_');
    match (parse(parts.next()), parse(parts.next()), parts.next()) {
        (Some(r), Some(w), None) => Ok((r, w)),
        _ => Err(CommError::Handshake),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_handshake_and_frames() {
        let mut acceptor = PipeAcceptor::new().unwrap();
        let instructions = acceptor.dial_instructions();

        let peer = thread::spawn(move || {
            let mut conn = dial_pipe(&instructions, 64).unwrap();
            conn.write_line("1700000000000000000").unwrap();
            conn.read_line().unwrap()
        });

        let mut conn = acceptor.accept(64, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(conn.read_line().unwrap(), "1700000000000000000");
        conn.write_line("tstamp_ack").unwrap();
        assert_eq!(peer.join().unwrap(), "tstamp_ack");
    }

    #[test]
    fn test_rejects_bad_handshake() {
        let mut acceptor = PipeAcceptor::new().unwrap();
        let (_, peer_write) = acceptor.peer_fds();

        write_fd(peer_write, b"conquer").unwrap();
        let result = acceptor.accept(64, Some(Duration::from_secs(5)));
        assert!(matches!(result, Err(CommError::Handshake)));
    }

    #[test]
    fn test_rejects_truncated_handshake() {
        let mut acceptor = PipeAcceptor::new().unwrap();
        let (peer_read, peer_write) = acceptor.peer_fds();

        write_fd(peer_write, b"conn").unwrap();
        close_fd(peer_write);
        close_fd(peer_read);
        let result = acceptor.accept(64, Some(Duration::from_secs(5)));
        assert!(matches!(result, Err(CommError::Handshake)));
    }

    #[test]
    fn test_accept_timeout() {
        let mut acceptor = PipeAcceptor::new().unwrap();
        let result = acceptor.accept(64, Some(Duration::from_millis(50)));
        assert!(matches!(result, Err(CommError::Timeout)));
    }

    #[test]
    fn test_parse_instructions() {
        assert_eq!(parse_instructions("3_7").unwrap(), (3, 7));
        assert!(parse_instructions("3").is_err());
        assert!(parse_instructions("a_b").is_err());
        assert!(parse_instructions("1_2_3").is_err());
    }
}
