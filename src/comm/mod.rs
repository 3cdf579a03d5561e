//! Message-oriented transport between the session frontend, the ingest
//! server, and the profiler probes.
//!
//! Two concrete variants implement one contract: local process-pipe pairs
//! ([`pipe`]) and TCP sockets ([`tcp`]). Frames are newline-terminated UTF-8
//! byte strings with no escaping; callers guarantee no embedded `\n`. Raw
//! byte transfer is available for file payloads.

pub mod pipe;
pub mod tcp;

use std::collections::VecDeque;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use crate::errors::CommError;

pub use pipe::{dial_pipe, PipeAcceptor, PipeAcceptorFactory, PipeConnection};
pub use tcp::{dial_tcp, TcpAcceptor, TcpAcceptorFactory, TcpConnection};

/// Chunk size for file payload transfers.
pub const FILE_BUFFER_SIZE: usize = 64 * 1024;

/// A connected, message-oriented byte stream.
///
/// `read_line` returns one frame at a time; frames received together in a
/// single transfer are queued in FIFO order. A partial frame is retained
/// until its terminator arrives. On EOF with a nonempty retained prefix, the
/// prefix is returned as a final frame; a later read reports
/// [`CommError::Closed`].
pub trait Connection: Send {
    /// Read one newline-delimited frame, blocking until data or EOF.
    fn read_line(&mut self) -> Result<String, CommError>;

    /// Read one frame, giving up with [`CommError::Timeout`] after `timeout`.
    fn read_line_timeout(&mut self, timeout: Duration) -> Result<String, CommError>;

    /// Read raw bytes into `buf`. Returns the number of bytes read; 0 means
    /// EOF. Fails with [`CommError::Timeout`] if nothing arrives in time.
    fn read_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, CommError>;

    /// Write one frame. Either all of `msg` plus the terminator is sent or
    /// the call fails.
    fn write_line(&mut self, msg: &str) -> Result<(), CommError>;

    /// Write raw bytes, completely.
    fn write_bytes(&mut self, buf: &[u8]) -> Result<(), CommError>;

    /// Stream the contents of a file over the connection.
    fn send_file(&mut self, path: &Path) -> Result<(), CommError> {
        let mut file = File::open(path)?;
        let mut buf = vec![0u8; FILE_BUFFER_SIZE];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                return Ok(());
            }
            self.write_bytes(&buf[..n])?;
        }
    }

    fn close(&mut self);
}

/// Factory side of a transport: binds a local endpoint and accepts peers.
pub trait Acceptor: Send {
    /// `"tcp"` or `"pipe"`.
    fn type_tag(&self) -> &'static str;

    /// Textual address blob the peer uses to dial back
    /// (TCP: `host_port`; pipe: `read-fd_write-fd`).
    fn dial_instructions(&self) -> String;

    /// Accept one connection. `buf_size` sizes the framed-read buffer.
    fn accept(
        &mut self,
        buf_size: usize,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn Connection>, CommError>;

    fn close(&mut self);
}

/// Produces acceptors of a single variant. The ingest client uses one
/// factory for all of its subclient data acceptors so the peer gets a
/// uniform `<type> <inst> <inst> …` instruction frame.
pub trait AcceptorFactory: Send + Sync {
    fn type_tag(&self) -> &'static str;
    fn make_acceptor(&self) -> Result<Box<dyn Acceptor>, CommError>;
}

/// Reassembles newline-delimited frames from arbitrarily-chunked reads.
///
/// Invariant: the concatenation of popped frames with `\n` restored between
/// them, plus the retained partial, equals the bytes fed in.
#[derive(Default)]
pub struct FrameBuffer {
    partial: Vec<u8>,
    queued: VecDeque<String>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one received chunk, splitting out any complete frames.
    pub fn extend(&mut self, chunk: &[u8]) {
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.partial.extend_from_slice(&rest[..pos]);
            let frame = String::from_utf8_lossy(&self.partial).into_owned();
            self.partial.clear();
            self.queued.push_back(frame);
            rest = &rest[pos + 1..];
        }
        self.partial.extend_from_slice(rest);
    }

    /// Pop the oldest complete frame, if any.
    pub fn pop(&mut self) -> Option<String> {
        self.queued.pop_front()
    }

    /// On EOF, surface a nonempty retained prefix as the final frame.
    pub fn flush_eof(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let frame = String::from_utf8_lossy(&self.partial).into_owned();
        self.partial.clear();
        Some(frame)
    }
}

/// Shared `read_line` loop over a transport-specific receive function.
///
/// `recv` fills `chunk` and returns the byte count, 0 on EOF.
pub(crate) fn read_framed<F>(
    frames: &mut FrameBuffer,
    chunk: &mut [u8],
    mut recv: F,
) -> Result<String, CommError>
where
    F: FnMut(&mut [u8]) -> Result<usize, CommError>,
{
    loop {
        if let Some(frame) = frames.pop() {
            return Ok(frame);
        }
        let n = recv(chunk)?;
        if n == 0 {
            return match frames.flush_eof() {
                Some(frame) => Ok(frame),
                None => Err(CommError::Closed),
            };
        }
        frames.extend(&chunk[..n]);
    }
}

/// Block until `fd` is readable, honoring an optional deadline.
pub(crate) fn wait_readable(
    fd: std::os::unix::io::RawFd,
    timeout: Option<Duration>,
) -> Result<(), CommError> {
    let timeout_ms: libc::c_int = match timeout {
        Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
        None => -1,
    };
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret > 0 {
            return Ok(());
        }
        if ret == 0 {
            return Err(CommError::Timeout);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(CommError::Connection(err));
        }
    }
}
