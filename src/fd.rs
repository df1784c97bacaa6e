//! Descriptor wrapper (spec §4.2 / §3 "Descriptor"): a generic buffered I/O
//! handle used for the socket role (`mio::net::TcpStream`), the pipe roles
//! (`mio::net::UnixStream`, one end read-only, one write-only by usage), and
//! the file role (`std::fs::File`, always synchronously "ready").

use std::io::{self, Read, Write};
use std::time::Instant;

use crate::iobuf::InBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdState {
    Ready,
    Awaiting,
    Closed,
    Invalid,
}

/// A descriptor plus its read buffer and liveness bookkeeping. Generic over
/// the underlying transport so the same shape serves sockets, pipes, and
/// files; which methods are callable (`Read`/`Write`) is enforced by trait
/// bounds on `inner`, not by a runtime role tag.
pub struct BufferedIo<S> {
    pub inner: S,
    pub state: FdState,
    pub inbuf: InBuffer,
    pub last_activity: Instant,
}

impl<S> BufferedIo<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            state: FdState::Ready,
            inbuf: InBuffer::new(),
            last_activity: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

impl<S: Read> BufferedIo<S> {
    /// Drains the descriptor into `inbuf` up to EAGAIN/EOF/cap. Transitions
    /// `state` to `Closed` on EOF or a hard error; returns the number of
    /// bytes actually read this call.
    pub fn read_tick(&mut self) -> io::Result<usize> {
        let before = self.inbuf.len();
        match self.inbuf.fill_from(&mut self.inner) {
            Ok(true) => {
                self.state = FdState::Closed;
            }
            Ok(false) => {}
            Err(e) => {
                self.state = FdState::Closed;
                return Err(e);
            }
        }
        self.touch();
        Ok(self.inbuf.len() - before)
    }
}

impl<S: Write> BufferedIo<S> {
    /// Writes `data` directly (bypassing `BodyWriter`), used for one-shot
    /// sends like raw error bodies. Returns bytes written; 0 on would-block.
    pub fn write_as_string(&mut self, data: &[u8]) -> io::Result<usize> {
        match self.inner.write(data) {
            Ok(0) if !data.is_empty() => {
                self.state = FdState::Closed;
                Ok(0)
            }
            Ok(n) => {
                self.state = FdState::Ready;
                self.touch();
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.state = FdState::Awaiting;
                Ok(0)
            }
            Err(e) => {
                self.state = FdState::Closed;
                Err(e)
            }
        }
    }
}
