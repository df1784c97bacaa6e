//! Poller (spec §4.1): a thin level-triggered readiness wrapper over
//! `mio::Poll`. Ownership of registrations is strictly caller-driven — this
//! type never unregisters a descriptor on its own.

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyMask {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
    pub error: bool,
}

pub struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    pub fn new(capacity: usize) -> std::io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
        })
    }

    pub fn add<S: Source + ?Sized>(&self, source: &mut S, token: Token, interest: Interest) -> std::io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    pub fn modify<S: Source + ?Sized>(&self, source: &mut S, token: Token, interest: Interest) -> std::io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    pub fn remove<S: Source + ?Sized>(&self, source: &mut S) -> std::io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Blocks for at most `timeout_ms` (`None` = forever) and returns every
    /// ready descriptor with its event mask.
    pub fn wait(&mut self, timeout_ms: Option<u64>) -> std::io::Result<Vec<(Token, ReadyMask)>> {
        let timeout = timeout_ms.map(std::time::Duration::from_millis);
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => Ok(self
                .events
                .iter()
                .map(|e| {
                    (
                        e.token(),
                        ReadyMask {
                            readable: e.is_readable(),
                            writable: e.is_writable(),
                            hangup: e.is_read_closed() || e.is_write_closed(),
                            error: e.is_error(),
                        },
                    )
                })
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}
