//! Server (spec §4.8): owns the poller, the timer, the session manager, the
//! listening sockets, and the clients map. Dispatches poller events to the
//! right owner via a sum-typed `FdOwner` tag, replacing the source's two
//! dynamic callback-registry hashmaps.

use std::collections::HashMap;
use std::io::{ErrorKind, Read};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Interest, Token};

use proxy_log::{info, warn};

use crate::client::{Client, ClientState};
use crate::config::HttpRule;
use crate::http::response::ResponseKind;
use crate::http::session::SessionStore;
use crate::poller::Poller;
use crate::timer::{Timer, TimerCallback};

const HANG_CHECK_INTERVAL_MS: u64 = 1000;
const SIGNAL_TOKEN: Token = Token(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CgiRole {
    Stdin,
    Stdout,
}

/// Dispatch tag for a registered descriptor, replacing the source's
/// `readable_callbacks`/`writable_callbacks` maps with one sum type.
enum FdOwner {
    Listener,
    Client,
    CgiPipe(Token, CgiRole),
    Signal,
}

pub struct Server {
    poller: Poller,
    timer: Timer,
    sessions: SessionStore,
    http_rule: HttpRule,
    listeners: HashMap<Token, TcpListener>,
    clients: HashMap<Token, Client>,
    owners: HashMap<Token, FdOwner>,
    client_cgi_pipes: HashMap<Token, Vec<Token>>,
    signal_read: mio::net::UnixStream,
    next_token: usize,
    pub quit: bool,
}

impl Server {
    /// Builds the server and its listeners, returning the write end of the
    /// shutdown self-pipe — the caller hands its raw fd to the installed
    /// SIGINT/SIGTERM/SIGQUIT handler (see `main.rs`), since a signal handler
    /// can only touch a raw fd, never a Rust object behind a mutex or flag.
    pub fn new(http_rule: HttpRule, session_store_path: std::path::PathBuf) -> std::io::Result<(Self, StdUnixStream)> {
        let poller = Poller::new(1024)?;
        let mut listeners = HashMap::new();
        let mut owners = HashMap::new();
        let mut next_token = 1usize;

        for port in http_rule.ports() {
            let mut listener = TcpListener::bind(format!("0.0.0.0:{port}").parse().unwrap())?;
            let token = Token(next_token);
            next_token += 1;
            poller.add(&mut listener, token, Interest::READABLE)?;
            owners.insert(token, FdOwner::Listener);
            listeners.insert(token, listener);
            info!("listening on 0.0.0.0:{port}");
        }

        let (signal_read, signal_write) = StdUnixStream::pair()?;
        signal_read.set_nonblocking(true)?;
        signal_write.set_nonblocking(true)?;
        let mut signal_read = mio::net::UnixStream::from_std(signal_read);
        poller.add(&mut signal_read, SIGNAL_TOKEN, Interest::READABLE)?;
        owners.insert(SIGNAL_TOKEN, FdOwner::Signal);

        let server = Server {
            poller,
            timer: Timer::new(),
            sessions: SessionStore::new(session_store_path),
            http_rule,
            listeners,
            clients: HashMap::new(),
            owners,
            client_cgi_pipes: HashMap::new(),
            signal_read,
            next_token,
            quit: false,
        };
        Ok((server, signal_write))
    }

    fn alloc_token(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token += 1;
        t
    }

    /// Runs until `quit` is set by the installed signal handler.
    pub fn run(&mut self) -> std::io::Result<()> {
        while !self.quit {
            self.run_once()?;
        }
        Ok(())
    }

    /// One iteration of the event loop, per §4.8.
    pub fn run_once(&mut self) -> std::io::Result<()> {
        let timer_timeout = self.timer.next_timeout_ms();
        let timeout_ms = match timer_timeout {
            -1 => HANG_CHECK_INTERVAL_MS,
            n => (n as u64).min(HANG_CHECK_INTERVAL_MS),
        };

        let events = self.poller.wait(Some(timeout_ms))?;
        for (token, mask) in events {
            match self.owners.get(&token) {
                Some(FdOwner::Listener) => self.accept_all(token),
                Some(FdOwner::Client) => {
                    self.dispatch_client(token, mask.readable, mask.writable, mask.hangup || mask.error)
                }
                Some(FdOwner::CgiPipe(client_token, role)) => {
                    let client_token = *client_token;
                    let role = *role;
                    self.dispatch_cgi_pipe(client_token, role, mask.readable, mask.writable);
                }
                Some(FdOwner::Signal) => {
                    self.drain_signal_pipe();
                    info!("shutdown signal received");
                    self.quit = true;
                }
                None => {}
            }
        }

        for callback in self.timer.process_expired() {
            match callback {
                TimerCallback::HangCheck => self.check_hanging_connections(),
                TimerCallback::CgiTimeout(client_token) => self.force_cgi_timeout(client_token),
            }
        }

        self.check_hanging_connections();
        Ok(())
    }

    fn accept_all(&mut self, listener_token: Token) {
        loop {
            let accepted = match self.listeners.get(&listener_token) {
                Some(listener) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok((mut stream, addr)) => {
                    let port = self
                        .listeners
                        .get(&listener_token)
                        .and_then(|l| l.local_addr().ok())
                        .map(|a| a.port())
                        .unwrap_or(0);
                    let token = self.alloc_token();
                    if let Err(e) = self.poller.add(&mut stream, token, Interest::READABLE) {
                        warn!("failed to register accepted connection from {addr}: {e}");
                        continue;
                    }
                    let client = Client::new(stream, port);
                    self.owners.insert(token, FdOwner::Client);
                    self.clients.insert(token, client);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn dispatch_client(&mut self, token: Token, readable: bool, writable: bool, hangup: bool) {
        if hangup && !readable && !writable {
            self.untrack_client(token);
            return;
        }

        let mut needs_writable = false;
        let mut disconnect = false;
        let mut cgi_timer: Option<Duration> = None;

        if let Some(client) = self.clients.get_mut(&token) {
            if readable {
                let outcome = client.handle_read(&self.http_rule, &mut self.sessions);
                needs_writable |= outcome.needs_writable;
                disconnect |= outcome.disconnect;
                if let Some((delay, _)) = outcome.schedule_cgi_timeout {
                    cgi_timer = Some(delay);
                }
            }
            if writable && !disconnect {
                let outcome = client.handle_write();
                needs_writable |= outcome.needs_writable;
                disconnect |= outcome.disconnect;
                if outcome.cancel_cgi_timeout {
                    self.cleanup_cgi_pipes(token);
                }
            }
        }

        if let Some(delay) = cgi_timer {
            self.arm_cgi_fds(token, delay);
        }

        if disconnect {
            self.untrack_client(token);
            return;
        }

        if let Some(client) = self.clients.get_mut(&token) {
            let interest = if needs_writable || client.state == ClientState::SendingResponse {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            let _ = self.poller.modify(&mut client.socket.inner, token, interest);
        }
    }

    /// Registers a freshly-started CGI response's pipes with the poller and
    /// arms its timeout, per §4.7 startup.
    fn arm_cgi_fds(&mut self, client_token: Token, delay: Duration) {
        let Some(client) = self.clients.get_mut(&client_token) else {
            return;
        };
        let Some(ResponseKind::Cgi(cgi)) = &mut client.response else {
            return;
        };
        cgi.client_token = client_token;

        let mut pipe_tokens = Vec::new();
        if let Some(pipe) = cgi.stdin_pipe_mut() {
            let token = Token(self.next_token);
            self.next_token += 1;
            if self.poller.add(pipe, token, Interest::WRITABLE).is_ok() {
                self.owners.insert(token, FdOwner::CgiPipe(client_token, CgiRole::Stdin));
                pipe_tokens.push(token);
            }
        }
        {
            let token = Token(self.next_token);
            self.next_token += 1;
            if self.poller.add(cgi.stdout_pipe_mut(), token, Interest::READABLE).is_ok() {
                self.owners.insert(token, FdOwner::CgiPipe(client_token, CgiRole::Stdout));
                pipe_tokens.push(token);
            }
        }
        self.client_cgi_pipes.insert(client_token, pipe_tokens);
        self.timer.add_event(delay, TimerCallback::CgiTimeout(client_token), false);
    }

    fn cleanup_cgi_pipes(&mut self, client_token: Token) {
        if let Some(tokens) = self.client_cgi_pipes.remove(&client_token) {
            for token in tokens {
                self.owners.remove(&token);
            }
        }
    }

    fn dispatch_cgi_pipe(&mut self, client_token: Token, role: CgiRole, readable: bool, writable: bool) {
        let Some(client) = self.clients.get_mut(&client_token) else {
            return;
        };
        let Some(ResponseKind::Cgi(cgi)) = &mut client.response else {
            return;
        };
        match role {
            CgiRole::Stdin if writable => {
                let _ = cgi.on_stdin_writable();
            }
            CgiRole::Stdout if readable => {
                let _ = cgi.on_stdout_readable();
                let _ = self.poller.modify(&mut client.socket.inner, client_token, Interest::READABLE | Interest::WRITABLE);
            }
            _ => {}
        }
    }

    fn force_cgi_timeout(&mut self, client_token: Token) {
        if let Some(client) = self.clients.get_mut(&client_token) {
            if let Some(ResponseKind::Cgi(cgi)) = &mut client.response {
                cgi.force_timeout();
                let _ = self.poller.modify(&mut client.socket.inner, client_token, Interest::READABLE | Interest::WRITABLE);
            }
        }
        self.cleanup_cgi_pipes(client_token);
    }

    fn check_hanging_connections(&mut self) {
        let http_rule = &self.http_rule;
        let mut expired = Vec::new();
        for (token, client) in self.clients.iter() {
            let timeout = client.active_timeout(http_rule);
            if client.socket.last_activity.elapsed() > timeout {
                expired.push(*token);
            }
        }
        for token in expired {
            self.untrack_client(token);
        }
        self.sessions.sweep_expired();
    }

    fn untrack_client(&mut self, token: Token) {
        self.cleanup_cgi_pipes(token);
        if let Some(mut client) = self.clients.remove(&token) {
            if let Some(response) = &mut client.response {
                response.terminate();
            }
            let _ = self.poller.remove(&mut client.socket.inner);
        }
        self.owners.remove(&token);
    }

    fn drain_signal_pipe(&mut self) {
        let mut buf = [0u8; 16];
        while self.signal_read.read(&mut buf).map(|n| n > 0).unwrap_or(false) {}
    }
}
